//! RAII claim handles (§4.I): the result of successfully acquiring a
//! [`crate::semaphore::Semaphore`] slot or a [`crate::pool::ResourcePool`]
//! resource. Dropping a claim releases it exactly once, whether or not
//! the caller ever calls [`SemaphoreClaim::release`]/[`ResourceClaim::release`]
//! explicitly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use crate::error::Error;
use crate::pool::ResourcePool;
use crate::semaphore::Semaphore;

// `_sem_claim` only exists to tie a pool's optional admission-gate claim
// to the lifetime of the resource claim that required it: dropping one
// drops the other, automatically returning both to their owners.

/// A held semaphore slot. Releases on drop if [`release`](Self::release)
/// was not already called.
pub struct SemaphoreClaim {
    owner: Weak<Semaphore>,
    released: AtomicBool,
}

impl SemaphoreClaim {
    pub(crate) fn new(owner: Weak<Semaphore>) -> Self {
        Self {
            owner,
            released: AtomicBool::new(false),
        }
    }

    /// Release the claim early. Idempotent: a second call, or a drop
    /// after this call, is a no-op.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            let _ = Error::invalid_state("semaphore claim released more than once");
            return;
        }
        if let Some(semaphore) = self.owner.upgrade() {
            semaphore.unlock();
        }
    }
}

impl Drop for SemaphoreClaim {
    fn drop(&mut self) {
        self.release();
    }
}

/// A held resource from a [`ResourcePool`]. Releases the resource back
/// to the pool's free list on drop if not already released.
pub struct ResourceClaim<T: Send + 'static> {
    owner: Weak<ResourcePool<T>>,
    resource: Option<T>,
    released: AtomicBool,
    _sem_claim: Option<SemaphoreClaim>,
}

impl<T: Send + 'static> ResourceClaim<T> {
    pub(crate) fn new(
        owner: Weak<ResourcePool<T>>,
        resource: T,
        sem_claim: Option<SemaphoreClaim>,
    ) -> Self {
        Self {
            owner,
            resource: Some(resource),
            released: AtomicBool::new(false),
            _sem_claim: sem_claim,
        }
    }

    /// The held resource.
    pub fn get(&self) -> &T {
        #[allow(clippy::expect_used)]
        self.resource
            .as_ref()
            .expect("resource only taken on release, which consumes the claim's last use")
    }

    pub fn get_mut(&mut self) -> &mut T {
        #[allow(clippy::expect_used)]
        self.resource
            .as_mut()
            .expect("resource only taken on release, which consumes the claim's last use")
    }

    /// Release the resource back to the pool early. Idempotent.
    pub fn release(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            let _ = Error::invalid_state("resource claim released more than once");
            return;
        }
        if let (Some(pool), Some(resource)) = (self.owner.upgrade(), self.resource.take()) {
            pool.release(resource);
        }
    }
}

impl<T: Send + 'static> Drop for ResourceClaim<T> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semaphore::Semaphore;

    #[test]
    fn semaphore_claim_releases_once_on_drop() {
        let sem = Semaphore::new(1);
        let claim = sem.lock(0, None).unwrap();
        assert_eq!(sem.claims(), 1);
        claim.release();
        assert_eq!(sem.claims(), 0);
        drop(claim);
        assert_eq!(sem.claims(), 0);
    }

    #[test]
    fn semaphore_claim_releases_on_drop_without_explicit_call() {
        let sem = Semaphore::new(1);
        {
            let _claim = sem.lock(0, None).unwrap();
            assert_eq!(sem.claims(), 1);
        }
        assert_eq!(sem.claims(), 0);
    }
}
