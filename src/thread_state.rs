//! Thread-management mix-in (§4.B).
//!
//! The source attaches this state to an object via a "private data"
//! mix-in; this crate reimplements it as ordinary composition — every
//! component that needs worker threads embeds a [`ThreadState`] by value
//! (§9 "private data mix-in pattern").

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

/// Anything [`ThreadState::spawn`] can start workers against: an owner
/// that knows how to service one unit of work for up to `wait_micros`,
/// and that exposes the [`ThreadState`] the spawned workers account
/// against.
///
/// Workers hold a strong `Arc<dyn Dispatch>` for their owner's lifetime
/// — the cyclic-ownership strategy from §9: a stray external drop of the
/// owner's last reference does not yank the rug out from under a worker
/// mid-`process`.
pub trait Dispatch: Send + Sync + 'static {
    fn process(&self, wait_micros: i64) -> bool;
    fn thread_state(&self) -> &ThreadState;
    fn worker_name(&self) -> String {
        "taskloom-worker".to_string()
    }
}

/// Per-owner worker-thread bookkeeping: how many threads exist, how many
/// are idle, and the policy governing how many more may be spawned.
pub struct ThreadState {
    max_threads: AtomicI64,
    max_idle_time: AtomicI64,
    num_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    managed: Mutex<HashSet<ThreadId>>,
    spawn_lock: Mutex<()>,
}

impl ThreadState {
    /// `max_threads < 0` means unlimited. `max_idle_time < 0` means
    /// workers never self-retire; `0` means they retire as soon as the
    /// queue is empty.
    pub fn new(max_threads: i64, max_idle_time: i64) -> Self {
        Self {
            max_threads: AtomicI64::new(max_threads),
            max_idle_time: AtomicI64::new(max_idle_time),
            num_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            managed: Mutex::new(HashSet::new()),
            spawn_lock: Mutex::new(()),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads.load(Ordering::Acquire)
    }

    pub fn idle_threads(&self) -> usize {
        self.idle_threads.load(Ordering::Acquire)
    }

    pub fn max_idle_time(&self) -> i64 {
        self.max_idle_time.load(Ordering::Acquire)
    }

    /// CAS-style: only raises the cap, and only when the current cap is
    /// positive (an already-unlimited or still-default cap is left
    /// alone). Matches the corrected intent behind the source's
    /// apparently swapped comparison (§9).
    pub fn increase_max_threads(&self, n: i64) {
        loop {
            let current = self.max_threads.load(Ordering::Acquire);
            if current <= 0 || n <= current {
                return;
            }
            if self
                .max_threads
                .compare_exchange(current, n, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Spawn up to `max_new` additional workers for `owner`, clamped so
    /// `spawn` never oversubscribes: already-idle workers are treated as
    /// already committed to servicing the queue, which prevents a
    /// thundering herd when a burst of `offer`s races a wake-up.
    pub fn spawn(owner: &Arc<dyn Dispatch>, max_new: i64) -> i64 {
        let ts = owner.thread_state();
        let _guard = ts.spawn_lock.lock();

        let capacity = {
            let cap = ts.max_threads.load(Ordering::Acquire);
            if cap < 0 {
                i64::MAX
            } else {
                cap
            }
        };
        let headroom = (capacity - ts.num_threads.load(Ordering::Acquire) as i64).max(0);
        let bounded = max_new.clamp(0, headroom);
        let new = bounded - ts.idle_threads.load(Ordering::Acquire) as i64;
        if new <= 0 {
            return 0;
        }
        let new = new as usize;

        ts.num_threads.fetch_add(new, Ordering::AcqRel);
        ts.idle_threads.fetch_add(new, Ordering::AcqRel);

        let max_idle_time = ts.max_idle_time.load(Ordering::Acquire);
        for _ in 0..new {
            let worker_owner = owner.clone();
            let name = owner.worker_name();
            let spawn_result = thread::Builder::new().name(name).spawn(move || {
                let id = thread::current().id();
                worker_owner.thread_state().managed.lock().insert(id);
                while worker_owner.process(max_idle_time) {}
                let ts = worker_owner.thread_state();
                ts.num_threads.fetch_sub(1, Ordering::AcqRel);
                ts.managed.lock().remove(&id);
            });
            if let Err(err) = spawn_result {
                tracing::error!(%err, "failed to spawn worker thread");
                ts.num_threads.fetch_sub(1, Ordering::AcqRel);
                ts.idle_threads.fetch_sub(1, Ordering::AcqRel);
            }
        }
        new as i64
    }

    /// Run `f`, accounting for idle-worker bookkeeping only when the
    /// calling thread is one of this owner's managed workers. External
    /// callers (e.g. the main thread driving `process` itself) run
    /// without accounting.
    pub fn run_task<R>(&self, f: impl FnOnce() -> R) -> R {
        let id = thread::current().id();
        let managed = self.managed.lock().contains(&id);
        if managed {
            self.idle_threads.fetch_sub(1, Ordering::AcqRel);
        }
        let result = f();
        if managed {
            self.idle_threads.fetch_add(1, Ordering::AcqRel);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::QueueItem;
    use crate::wait_queue::WaitQueue;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Item {
        age: u64,
    }
    impl QueueItem for Item {
        fn priority(&self) -> i64 {
            0
        }
        fn age(&self) -> u64 {
            self.age
        }
        fn set_age(&mut self, age: u64) {
            self.age = age;
        }
    }

    struct TestOwner {
        queue: WaitQueue<Item>,
        threads: ThreadState,
        processed: AtomicUsize,
    }

    impl Dispatch for TestOwner {
        fn process(&self, wait_micros: i64) -> bool {
            match self.queue.poll_timed(wait_micros) {
                Some(_) => {
                    self.threads.run_task(|| {
                        self.processed.fetch_add(1, Ordering::Relaxed);
                    });
                    true
                }
                None => false,
            }
        }
        fn thread_state(&self) -> &ThreadState {
            &self.threads
        }
    }

    #[test]
    fn spawn_respects_headroom_minus_idle() {
        let owner: Arc<dyn Dispatch> = Arc::new(TestOwner {
            queue: WaitQueue::new(),
            threads: ThreadState::new(2, 0),
            processed: AtomicUsize::new(0),
        });
        assert_eq!(ThreadState::spawn(&owner, 5), 2);
        // Idle workers are already committed: a second spawn(5) sees no
        // headroom because num_threads already equals the cap.
        assert_eq!(ThreadState::spawn(&owner, 5), 0);
    }

    #[test]
    fn workers_retire_when_idle_time_is_zero() {
        let owner: Arc<dyn Dispatch> = Arc::new(TestOwner {
            queue: WaitQueue::new(),
            threads: ThreadState::new(-1, 0),
            processed: AtomicUsize::new(0),
        });
        ThreadState::spawn(&owner, 1);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(owner.thread_state().num_threads(), 0);
    }

    #[test]
    fn increase_max_threads_only_raises() {
        let ts = ThreadState::new(2, 0);
        ts.increase_max_threads(1);
        assert_eq!(ts.max_threads.load(Ordering::Acquire), 2);
        ts.increase_max_threads(5);
        assert_eq!(ts.max_threads.load(Ordering::Acquire), 5);
    }

    #[test]
    fn increase_max_threads_ignores_unlimited() {
        let ts = ThreadState::new(-1, 0);
        ts.increase_max_threads(100);
        assert_eq!(ts.max_threads.load(Ordering::Acquire), -1);
    }
}
