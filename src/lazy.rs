//! Lazy singleton initializer (§4.G): a value computed at most once,
//! the first time any caller asks for it, gated by a `Semaphore(1)`
//! instead of a raw mutex so the double-checked-locking dance reuses
//! this crate's own priority-ordered admission rather than introducing
//! a second synchronization primitive.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::semaphore::Semaphore;
use crate::task_queue::TaskQueue;

enum Slot<T> {
    Empty,
    Ready(Arc<T>),
}

/// A value produced on first access by `factory` and cached for every
/// subsequent caller.
pub struct Lazy<T: Send + Sync + 'static> {
    slot: Arc<RwLock<Slot<T>>>,
    gate: Arc<Semaphore>,
    factory: Arc<dyn Fn() -> anyhow::Result<T> + Send + Sync>,
    task_queue: Arc<TaskQueue>,
}

impl<T: Send + Sync + 'static> Lazy<T> {
    /// A `Lazy` dispatching [`get_background`](Self::get_background) on
    /// the process-wide default task queue. See
    /// [`with_task_queue`](Self::with_task_queue) to inject a dedicated
    /// one.
    pub fn new(factory: impl Fn() -> anyhow::Result<T> + Send + Sync + 'static) -> Self {
        Self::with_task_queue(factory, TaskQueue::default_queue())
    }

    pub fn with_task_queue(
        factory: impl Fn() -> anyhow::Result<T> + Send + Sync + 'static,
        task_queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Slot::Empty)),
            gate: Semaphore::new(1),
            factory: Arc::new(factory),
            task_queue,
        }
    }

    /// True once the value has been produced.
    pub fn is_initialized(&self) -> bool {
        matches!(*self.slot.read(), Slot::Ready(_))
    }

    /// Return the cached value, running `factory` on first access.
    /// Concurrent callers block on the same initializer's single claim
    /// rather than racing the factory.
    #[tracing::instrument(skip(self))]
    pub fn get(&self) -> Result<Arc<T>> {
        if let Slot::Ready(value) = &*self.slot.read() {
            return Ok(value.clone());
        }
        let claim = self.gate.lock(0, None)?;
        if let Slot::Ready(value) = &*self.slot.read() {
            return Ok(value.clone());
        }
        let produced = Arc::new((self.factory)().map_err(Error::FactoryFailed)?);
        *self.slot.write() = Slot::Ready(produced.clone());
        drop(claim);
        Ok(produced)
    }

    /// Cooperative variant of [`get`](Self::get): suspends the caller on
    /// the host's idle step instead of blocking the thread while another
    /// caller is producing the value.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn get_async(&self, cancel: Option<CancelToken>) -> Result<Arc<T>> {
        if let Slot::Ready(value) = &*self.slot.read() {
            return Ok(value.clone());
        }
        let claim = self.gate.lock_async(0, cancel).await?;
        if let Slot::Ready(value) = &*self.slot.read() {
            return Ok(value.clone());
        }
        let produced = Arc::new((self.factory)().map_err(Error::FactoryFailed)?);
        *self.slot.write() = Slot::Ready(produced.clone());
        drop(claim);
        Ok(produced)
    }

    /// Background variant of [`get`](Self::get): the double-checked-lock
    /// and factory call run on a worker thread from the injected task
    /// queue, still gated by the same `Semaphore(1)` as every other
    /// entry point, so only one caller ever runs `factory`. The caller
    /// suspends on its host's idle step until the value is ready.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn get_background(&self, cancel: Option<CancelToken>) -> Result<Arc<T>> {
        if let Slot::Ready(value) = &*self.slot.read() {
            return Ok(value.clone());
        }
        let slot = self.slot.clone();
        let gate = self.gate.clone();
        let factory = self.factory.clone();
        self.task_queue
            .execute_background(0, cancel, move || {
                if let Slot::Ready(value) = &*slot.read() {
                    return Ok(value.clone());
                }
                let claim = gate.lock(0, None)?;
                if let Slot::Ready(value) = &*slot.read() {
                    return Ok(value.clone());
                }
                let produced = Arc::new(factory()?);
                *slot.write() = Slot::Ready(produced.clone());
                drop(claim);
                Ok(produced)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn factory_runs_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let lazy = Lazy::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
            Ok::<_, anyhow::Error>(42)
        });

        assert!(!lazy.is_initialized());
        assert_eq!(*lazy.get().unwrap(), 42);
        assert_eq!(*lazy.get().unwrap(), 42);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(lazy.is_initialized());
    }

    #[test]
    fn concurrent_get_runs_factory_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let lazy = Arc::new(Lazy::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
            std::thread::sleep(std::time::Duration::from_millis(10));
            Ok::<_, anyhow::Error>(7)
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lazy = lazy.clone();
                std::thread::spawn(move || *lazy.get().unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn factory_failure_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let lazy = Lazy::new(move || {
            let n = c.fetch_add(1, Ordering::Relaxed);
            if n == 0 {
                Err(anyhow::anyhow!("first attempt fails"))
            } else {
                Ok(9)
            }
        });
        assert!(lazy.get().is_err());
        assert_eq!(*lazy.get().unwrap(), 9);
    }
}
