//! Counting semaphore (§4.E), built by composition over a
//! [`TaskQueue`]-shaped dispatch surface rather than by inheriting one —
//! a semaphore's "workers" are claim-holders, not task runners, so it
//! keeps its own [`WaitQueue`] of waiting claimants and gates admission
//! by `max_claims` instead of by thread count.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::cancel::CancelToken;
use crate::claim::SemaphoreClaim;
use crate::completion::Completion;
use crate::error::{Error, Result};
use crate::idle::HostContext;
use crate::record::{OrderKey, Payload, TaskRecord};
use crate::wait_queue::WaitQueue;

/// A counting semaphore: up to `max_claims` callers may hold a claim at
/// once, ordered by priority and age when demand exceeds supply.
///
/// Unlike [`crate::task_queue::TaskQueue`], a semaphore never spawns OS
/// worker threads: `max_claims` already bounds concurrency, so a grant
/// is simply dispatched inline by whichever thread frees up a slot
/// (`unlock`, or a `Claim`'s drop).
pub struct Semaphore {
    queue: WaitQueue<TaskRecord>,
    max_claims: AtomicI64,
    claims: AtomicUsize,
    self_weak: Weak<Semaphore>,
}

impl Semaphore {
    /// `max_claims < 0` means unlimited concurrent claims (the semaphore
    /// degenerates into an ordering-only gate).
    pub fn new(max_claims: i64) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Semaphore>| {
            let shortage_weak = weak.clone();
            Semaphore {
                queue: WaitQueue::new().on_consumer_shortage(move || {
                    if let Some(owner) = shortage_weak.upgrade() {
                        owner.dispatch_headroom();
                    }
                }),
                max_claims: AtomicI64::new(max_claims),
                claims: AtomicUsize::new(0),
                self_weak: weak.clone(),
            }
        })
    }

    pub fn max_claims(&self) -> i64 {
        self.max_claims.load(Ordering::Acquire)
    }

    pub fn claims(&self) -> usize {
        self.claims.load(Ordering::Acquire)
    }

    pub fn length(&self) -> usize {
        self.queue.length()
    }

    /// Dispatch as many headroom slots as currently available, instead of
    /// spawning OS workers: each grant runs the next queued acquirer's
    /// continuation inline on whatever thread calls this (normally the
    /// releasing claim holder, via `Claim::release`, or the thread that
    /// just called `unlock`).
    fn dispatch_headroom(&self) {
        loop {
            let max = self.max_claims.load(Ordering::Acquire);
            let current = self.claims.load(Ordering::Acquire);
            if max >= 0 && current as i64 >= max {
                return;
            }
            if !self.process(0) {
                return;
            }
        }
    }

    /// Poll the queue once, atomically claiming a slot before running the
    /// dispatched record's payload. Returns `true` on a successful
    /// dispatch, `false` on timeout or an empty queue.
    #[tracing::instrument(skip(self))]
    pub fn process(&self, wait_micros: i64) -> bool {
        match self.queue.poll_timed(wait_micros) {
            None => false,
            Some(mut record) => {
                self.claims.fetch_add(1, Ordering::AcqRel);
                (record.payload)();
                true
            }
        }
    }

    /// Enqueue `task` for dispatch once a claim is available, wrapping
    /// it so `unlock` runs after it returns (success or failure).
    /// Fire-and-forget: the caller does not block, unlike [`lock`](Self::lock).
    /// Returns `false` without enqueuing if `cancel` is already cancelled.
    #[tracing::instrument(skip(self, cancel, task))]
    pub fn add(&self, priority: i64, cancel: Option<CancelToken>, mut task: Payload) -> bool {
        if let Some(token) = &cancel {
            if token.is_cancelled() {
                let _ = Error::invalid_state("submitted an already-cancelled token");
                return false;
            }
        }
        let weak = self.self_weak.clone();
        let payload: Payload = Box::new(move || {
            let requeue = task();
            if let Some(sem) = weak.upgrade() {
                sem.unlock();
            }
            requeue
        });
        let record = TaskRecord::new(priority, cancel.clone(), payload);
        let age = self.queue.offer(record);
        if let Some(token) = &cancel {
            let weak = self.self_weak.clone();
            token.connect(Box::new(move || {
                if let Some(sem) = weak.upgrade() {
                    sem.queue.remove_by_age(age);
                }
            }));
        }
        true
    }

    /// Release one claim and wake the next queued acquirer, if any and
    /// if headroom allows.
    #[tracing::instrument(skip(self))]
    pub fn unlock(&self) {
        loop {
            let current = self.claims.load(Ordering::Acquire);
            if current == 0 {
                let _ = Error::invalid_state("unlock called with zero outstanding claims");
                return;
            }
            if self
                .claims
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        self.dispatch_headroom();
    }

    /// Acquire a claim, blocking the calling thread until one is granted
    /// or `cancel` fires.
    #[tracing::instrument(skip(self, cancel))]
    pub fn lock(&self, priority: i64, cancel: Option<CancelToken>) -> Result<SemaphoreClaim> {
        if self.try_lock(priority) {
            return Ok(SemaphoreClaim::new(self.self_weak.clone()));
        }
        if let Some(token) = &cancel {
            token.raise_if_cancelled()?;
        }

        let pair = Arc::new((parking_lot::Mutex::new(None::<Result<()>>), parking_lot::Condvar::new()));
        if let Some(token) = &cancel {
            let pair = pair.clone();
            token.connect(Box::new(move || {
                let (slot, cvar) = &*pair;
                let mut guard = slot.lock();
                if guard.is_none() {
                    *guard = Some(Err(Error::Cancelled));
                    cvar.notify_all();
                }
            }));
        }
        let pair2 = pair.clone();
        let payload: Payload = Box::new(move || {
            let (slot, cvar) = &*pair2;
            let mut guard = slot.lock();
            if guard.is_none() {
                *guard = Some(Ok(()));
                cvar.notify_all();
            }
            false
        });
        let record = TaskRecord::new(priority, cancel.clone(), payload);
        let age = self.queue.offer(record);
        if let Some(token) = &cancel {
            let weak = self.self_weak.clone();
            token.connect(Box::new(move || {
                if let Some(sem) = weak.upgrade() {
                    sem.queue.remove_by_age(age);
                }
            }));
        }

        let (slot, cvar) = &*pair;
        let mut guard = slot.lock();
        while guard.is_none() {
            cvar.wait(&mut guard);
        }
        #[allow(clippy::unwrap_used)]
        guard.take().unwrap()?;
        Ok(SemaphoreClaim::new(self.self_weak.clone()))
    }

    /// Non-blocking acquire: succeeds only if a claim is immediately
    /// available.
    #[tracing::instrument(skip(self))]
    pub fn try_lock(&self, _priority: i64) -> bool {
        loop {
            let max = self.max_claims.load(Ordering::Acquire);
            let current = self.claims.load(Ordering::Acquire);
            if max >= 0 && current as i64 >= max {
                return false;
            }
            if self
                .claims
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Acquire a claim cooperatively, resuming on the caller's idle
    /// dispatch step once granted.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn lock_async(&self, priority: i64, cancel: Option<CancelToken>) -> Result<SemaphoreClaim> {
        if self.try_lock(priority) {
            return Ok(SemaphoreClaim::new(self.self_weak.clone()));
        }
        let completion = Arc::new(Completion::<()>::new());
        let host = HostContext::current();

        if let Some(token) = &cancel {
            let completion = completion.clone();
            token.connect(Box::new(move || {
                completion.fill(Err(Error::Cancelled));
            }));
        }

        let completion2 = completion.clone();
        let payload: Payload = Box::new(move || {
            let completion3 = completion2.clone();
            host.schedule(0, Box::new(move || {
                completion3.fill(Ok(()));
            }));
            false
        });
        let record = TaskRecord::new(priority, cancel.clone(), payload);
        let age = self.queue.offer(record);
        if let Some(token) = &cancel {
            let weak = self.self_weak.clone();
            token.connect(Box::new(move || {
                if let Some(sem) = weak.upgrade() {
                    sem.queue.remove_by_age(age);
                }
            }));
        }

        completion.wait().await?;
        Ok(SemaphoreClaim::new(self.self_weak.clone()))
    }

    pub fn peek(&self) -> Option<OrderKey> {
        self.queue.peek_timed(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_respects_max_claims() {
        let sem = Semaphore::new(2);
        assert!(sem.try_lock(0));
        assert!(sem.try_lock(0));
        assert!(!sem.try_lock(0));
        assert_eq!(sem.claims(), 2);
    }

    #[test]
    fn unlock_grants_next_waiter() {
        let sem = Semaphore::new(1);
        let first = sem.lock(0, None).unwrap();
        let sem2 = sem.clone();
        let handle = std::thread::spawn(move || sem2.lock(0, None));
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(first);
        let second = handle.join().unwrap();
        assert!(second.is_ok());
    }

    #[test]
    fn cancelled_waiter_returns_cancelled_error() {
        let sem = Semaphore::new(1);
        let _held = sem.lock(0, None).unwrap();
        let token = CancelToken::new();
        let sem2 = sem.clone();
        let token2 = token.clone();
        let handle = std::thread::spawn(move || sem2.lock(0, Some(token2)));
        std::thread::sleep(std::time::Duration::from_millis(20));
        token.cancel();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn lock_async_grants_when_available() {
        let sem = Semaphore::new(1);
        let claim = sem.lock_async(0, None).await.unwrap();
        assert_eq!(sem.claims(), 1);
        drop(claim);
    }

    proptest::proptest! {
        // I-2 (semaphore cap): for a Semaphore(k) under any interleaving
        // of acquire/release, 0 <= claims <= k at every instant.
        #[test]
        fn claims_stay_within_bound_under_any_op_sequence(
            max_claims in 1i64..8,
            acquire_first in proptest::collection::vec(proptest::bool::ANY, 0..128),
        ) {
            let sem = Semaphore::new(max_claims);
            let mut held: Vec<SemaphoreClaim> = Vec::new();
            for acquire in acquire_first {
                if acquire {
                    if sem.try_lock(0) {
                        held.push(SemaphoreClaim::new(sem.self_weak.clone()));
                    }
                } else if let Some(claim) = held.pop() {
                    drop(claim);
                }
                let claims = sem.claims() as i64;
                proptest::prop_assert!(claims >= 0);
                proptest::prop_assert!(claims <= max_claims);
            }
        }
    }
}
