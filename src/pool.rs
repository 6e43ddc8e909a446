//! Resource pool (§4.F): a LIFO free list of idle resources, a factory
//! invoked on a pool miss, and a background reaper that evicts
//! resources idle past `idle_timeout` down to `min_idle`. Unlike a
//! connector pool keyed by name with a generic semaphore for admission,
//! this one is monomorphic per resource type and uses this crate's own
//! [`Semaphore`] so admission ordering follows the same priority/age
//! rule as every other component here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::claim::ResourceClaim;
use crate::clock::{Clock, MonotonicClock};
use crate::completion::Completion;
use crate::error::{Error, Result};
use crate::idle::HostContext;
use crate::semaphore::Semaphore;
use crate::task_queue::TaskQueue;

/// Pool sizing and idle-reaping policy.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrently checked-out resources. `< 0` means
    /// unbounded (the pool never blocks `acquire`).
    pub max_size: i64,
    /// Idle resources below this count are never reaped regardless of
    /// age.
    pub min_idle: usize,
    /// How long an idle resource may sit in the free list before the
    /// reaper evicts it, once above `min_idle`.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: -1,
            min_idle: 0,
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub idle: usize,
    pub active: usize,
    pub created: u64,
    pub reused: u64,
    pub reaped: u64,
}

struct Idle<T> {
    resource: T,
    released_at_micros: u64,
}

struct Counters {
    created: u64,
    reused: u64,
    reaped: u64,
}

/// A pool of reusable `T` resources, created on demand by `factory` and
/// handed out as [`ResourceClaim`]s that return the resource to the
/// free list (or let it expire) on drop.
pub struct ResourcePool<T: Send + 'static> {
    factory: Box<dyn Fn() -> anyhow::Result<T> + Send + Sync>,
    config: PoolConfig,
    idle: Mutex<Vec<Idle<T>>>,
    active: AtomicUsize,
    counters: Mutex<Counters>,
    admission: Option<Arc<Semaphore>>,
    clock: Arc<dyn Clock>,
    task_queue: Arc<TaskQueue>,
    self_weak: Weak<ResourcePool<T>>,
}

impl<T: Send + 'static> ResourcePool<T> {
    /// A pool dispatching its `*_background` entry points on the
    /// process-wide default task queue. See [`with_task_queue`](Self::with_task_queue)
    /// to inject a dedicated one.
    pub fn new(
        config: PoolConfig,
        factory: impl Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::with_task_queue(config, factory, TaskQueue::default_queue())
    }

    pub fn with_task_queue(
        config: PoolConfig,
        factory: impl Fn() -> anyhow::Result<T> + Send + Sync + 'static,
        task_queue: Arc<TaskQueue>,
    ) -> Arc<Self> {
        let admission = if config.max_size >= 0 {
            Some(Semaphore::new(config.max_size))
        } else {
            None
        };
        let pool = Arc::new_cyclic(|weak| ResourcePool {
            factory: Box::new(factory),
            config: config.clone(),
            idle: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            counters: Mutex::new(Counters {
                created: 0,
                reused: 0,
                reaped: 0,
            }),
            admission,
            clock: Arc::new(MonotonicClock),
            task_queue,
            self_weak: weak.clone(),
        });
        Self::spawn_reaper(&pool);
        pool
    }

    pub fn stats(&self) -> PoolStats {
        let counters = self.counters.lock();
        PoolStats {
            idle: self.idle.lock().len(),
            active: self.active.load(Ordering::Acquire),
            created: counters.created,
            reused: counters.reused,
            reaped: counters.reaped,
        }
    }

    /// Acquire a resource, blocking the calling thread if the pool is at
    /// `max_size` and no slot is free.
    #[tracing::instrument(skip(self, cancel))]
    pub fn acquire(&self, priority: i64, cancel: Option<CancelToken>) -> Result<ResourceClaim<T>> {
        let sem_claim = match &self.admission {
            Some(sem) => Some(sem.lock(priority, cancel)?),
            None => None,
        };
        let resource = self.checkout()?;
        self.active.fetch_add(1, Ordering::AcqRel);
        Ok(ResourceClaim::new(self.self_weak.clone(), resource, sem_claim))
    }

    /// Acquire a resource without blocking. Fails with
    /// [`Error::WouldBlock`] if the pool is at capacity and no resource
    /// is idle; otherwise reuses an idle resource or creates one.
    #[tracing::instrument(skip(self))]
    pub fn try_acquire(&self) -> Result<ResourceClaim<T>> {
        let sem_claim = match &self.admission {
            Some(sem) => {
                if !sem.try_lock(0) {
                    return Err(Error::WouldBlock);
                }
                Some(crate::claim::SemaphoreClaim::new(Arc::downgrade(sem)))
            }
            None => None,
        };
        let resource = self.checkout()?;
        self.active.fetch_add(1, Ordering::AcqRel);
        Ok(ResourceClaim::new(self.self_weak.clone(), resource, sem_claim))
    }

    /// Cooperative variant of [`acquire`](Self::acquire): suspends the
    /// caller on the host's idle step instead of blocking the thread
    /// while admission is granted.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn acquire_async(
        &self,
        priority: i64,
        cancel: Option<CancelToken>,
    ) -> Result<ResourceClaim<T>> {
        let sem_claim = match &self.admission {
            Some(sem) => Some(sem.lock_async(priority, cancel).await?),
            None => None,
        };
        let resource = self.checkout()?;
        self.active.fetch_add(1, Ordering::AcqRel);
        Ok(ResourceClaim::new(self.self_weak.clone(), resource, sem_claim))
    }

    /// Cooperative variant of [`acquire`](Self::acquire): admission and
    /// the factory call both run on a worker thread from the injected
    /// task queue; resumption happens via an idle step on the caller's
    /// host context.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn acquire_background(
        &self,
        priority: i64,
        cancel: Option<CancelToken>,
    ) -> Result<ResourceClaim<T>> {
        let completion = Arc::new(Completion::<ResourceClaim<T>>::new());
        let host = HostContext::current();
        if let Some(token) = &cancel {
            let completion = completion.clone();
            token.connect(Box::new(move || {
                completion.fill(Err(Error::Cancelled));
            }));
        }
        let weak = self.self_weak.clone();
        let completion2 = completion.clone();
        let cancel2 = cancel.clone();
        self.task_queue.add(
            priority,
            cancel,
            Box::new(move || {
                if let Some(pool) = weak.upgrade() {
                    let result = pool.acquire(priority, cancel2.clone());
                    let completion3 = completion2.clone();
                    host.schedule(
                        priority,
                        Box::new(move || {
                            completion3.fill(result);
                        }),
                    );
                }
                false
            }),
        );
        completion.wait().await
    }

    /// Acquire a resource, call `f` with it, and release it unconditionally
    /// once `f` returns — success or failure.
    #[tracing::instrument(skip(self, cancel, f))]
    pub fn execute<F, R>(&self, priority: i64, cancel: Option<CancelToken>, f: F) -> Result<R>
    where
        F: FnOnce(&T) -> std::result::Result<R, anyhow::Error>,
    {
        let claim = self.acquire(priority, cancel)?;
        f(claim.get()).map_err(Error::CallbackFailed)
    }

    /// Cooperative variant of [`execute`](Self::execute): acquires via
    /// [`acquire_async`](Self::acquire_async), then calls `f` with the
    /// resource on the resumption.
    #[tracing::instrument(skip(self, cancel, f))]
    pub async fn execute_async<F, R>(
        &self,
        priority: i64,
        cancel: Option<CancelToken>,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(&T) -> std::result::Result<R, anyhow::Error> + Send + 'static,
        R: Send + 'static,
    {
        let claim = self.acquire_async(priority, cancel).await?;
        f(claim.get()).map_err(Error::CallbackFailed)
    }

    /// Cooperative variant of [`execute`](Self::execute): acquisition and
    /// `f` both run on a worker thread from the injected task queue;
    /// resumption happens via an idle step on the caller's host context.
    #[tracing::instrument(skip(self, cancel, f))]
    pub async fn execute_background<F, R>(
        &self,
        priority: i64,
        cancel: Option<CancelToken>,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(&T) -> std::result::Result<R, anyhow::Error> + Send + 'static,
        R: Send + 'static,
    {
        let completion = Arc::new(Completion::<R>::new());
        let host = HostContext::current();
        if let Some(token) = &cancel {
            let completion = completion.clone();
            token.connect(Box::new(move || {
                completion.fill(Err(Error::Cancelled));
            }));
        }
        let weak = self.self_weak.clone();
        let completion2 = completion.clone();
        let cancel2 = cancel.clone();
        let mut f = Some(f);
        self.task_queue.add(
            priority,
            cancel,
            Box::new(move || {
                if let Some(pool) = weak.upgrade() {
                    if let Some(f) = f.take() {
                        let result = pool
                            .acquire(priority, cancel2.clone())
                            .and_then(|claim| f(claim.get()).map_err(Error::CallbackFailed));
                        let completion3 = completion2.clone();
                        host.schedule(
                            priority,
                            Box::new(move || {
                                completion3.fill(result);
                            }),
                        );
                    }
                }
                false
            }),
        );
        completion.wait().await
    }

    fn checkout(&self) -> Result<T> {
        if let Some(Idle { resource, .. }) = self.idle.lock().pop() {
            self.counters.lock().reused += 1;
            return Ok(resource);
        }
        let resource = (self.factory)().map_err(Error::FactoryFailed)?;
        self.counters.lock().created += 1;
        Ok(resource)
    }

    /// Return a resource to the free list. Called by [`ResourceClaim`]'s
    /// drop/release, never directly by a caller holding a claim.
    pub(crate) fn release(&self, resource: T) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.idle.lock().push(Idle {
            resource,
            released_at_micros: self.clock.now_micros(),
        });
    }

    fn spawn_reaper(pool: &Arc<Self>) {
        let weak = Arc::downgrade(pool);
        let timeout_micros = pool.config.idle_timeout.as_micros() as u64;
        let min_idle = pool.config.min_idle;
        let spawn_result = std::thread::Builder::new()
            .name("taskloom-pool-reaper".to_string())
            .spawn(move || loop {
                std::thread::sleep(Duration::from_millis(500));
                let Some(pool) = weak.upgrade() else {
                    return;
                };
                let now = pool.clock.now_micros();
                let mut idle = pool.idle.lock();
                let mut removable = idle.len().saturating_sub(min_idle);
                let before = idle.len();
                if removable > 0 {
                    // Oldest releases sit at the front (acquire pops from
                    // the back, LIFO) so reap front-to-back.
                    idle.retain(|entry| {
                        if removable == 0 {
                            return true;
                        }
                        let expired = now.saturating_sub(entry.released_at_micros) >= timeout_micros;
                        if expired {
                            removable -= 1;
                        }
                        !expired
                    });
                }
                let reaped = (before - idle.len()) as u64;
                drop(idle);
                if reaped > 0 {
                    pool.counters.lock().reaped += reaped;
                }
            });
        if let Err(err) = spawn_result {
            tracing::error!(%err, "failed to spawn pool reaper thread");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_factory() -> (Arc<AtomicU32>, impl Fn() -> anyhow::Result<u32> + Send + Sync) {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        (counter, move || Ok(c.fetch_add(1, Ordering::Relaxed)))
    }

    #[test]
    fn acquire_creates_then_reuses() {
        let (created, factory) = counting_factory();
        let pool = ResourcePool::new(PoolConfig::default(), factory);

        let first = pool.acquire(0, None).unwrap();
        let value = *first.get();
        drop(first);
        assert_eq!(created.load(Ordering::Relaxed), 1);

        let second = pool.acquire(0, None).unwrap();
        assert_eq!(*second.get(), value);
        assert_eq!(created.load(Ordering::Relaxed), 1);
        assert_eq!(pool.stats().reused, 1);
    }

    #[test]
    fn try_acquire_fails_when_capped_and_empty() {
        let (_, factory) = counting_factory();
        let config = PoolConfig {
            max_size: 1,
            ..PoolConfig::default()
        };
        let pool = ResourcePool::new(config, factory);
        let _held = pool.acquire(0, None).unwrap();
        assert!(matches!(pool.try_acquire(), Err(Error::WouldBlock)));
    }

    #[test]
    fn factory_failure_propagates() {
        let pool: Arc<ResourcePool<u32>> =
            ResourcePool::new(PoolConfig::default(), || Err(anyhow::anyhow!("no resource")));
        assert!(matches!(pool.acquire(0, None), Err(Error::FactoryFailed(_))));
    }
}
