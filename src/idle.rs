//! Idle-dispatch host contract (§6, GLOSSARY "idle dispatch" / "host
//! context").
//!
//! The core requires nothing more from its host than "a callable
//! `(priority, callback) -> cancellation_id` and a `remove(id)`
//! operation, run on the caller's thread between higher-priority host
//! events". [`ThreadIdleQueue`] is the reference implementation used by
//! every cooperative (`*_async`, `*_background`) entry point in this
//! crate when no host integration overrides it; a real GUI or game-loop
//! host installs its own [`IdleScheduler`] via [`HostContext::install`].

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use uuid::Uuid;

/// Opaque handle returned by [`IdleScheduler::schedule`], passed back to
/// [`IdleScheduler::remove`] to cancel a not-yet-run callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdleHandle(Uuid);

/// A host-provided single-threaded cooperative scheduler.
///
/// Implementations must run `callback` on the thread that called
/// `schedule`, never on another thread — that is what makes dispatch
/// "idle" rather than "background".
pub trait IdleScheduler: Send + Sync {
    /// Schedule `callback` to run at the given priority (smaller runs
    /// first, ties broken by submission order) on the next idle step.
    fn schedule(&self, priority: i64, callback: Box<dyn FnOnce() + Send>) -> IdleHandle;

    /// Remove a not-yet-run callback. A no-op if it already ran or never
    /// existed.
    fn remove(&self, handle: IdleHandle);
}

struct Entry {
    priority: i64,
    age: u64,
    handle: IdleHandle,
    callback: Box<dyn FnOnce() + Send>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.age == other.age
    }
}
impl Eq for Entry {}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the numerically smallest
        // priority (and, within a priority, the smallest age) pops first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.age.cmp(&self.age))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reference [`IdleScheduler`]: a priority/age-ordered queue of pending
/// callbacks, drained explicitly by the host loop via [`pump_one`] or
/// [`pump`](ThreadIdleQueue::pump).
///
/// This type is `!Send` by convention of use (bind one per host thread
/// via [`HostContext`]) but is internally synchronized so a worker
/// thread may still schedule onto it from afar; only *draining* must
/// happen on the owning thread.
pub struct ThreadIdleQueue {
    heap: parking_lot::Mutex<BinaryHeap<Entry>>,
    removed: dashmap::DashSet<IdleHandle>,
    next_age: AtomicU64,
}

impl Default for ThreadIdleQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadIdleQueue {
    pub fn new() -> Self {
        Self {
            heap: parking_lot::Mutex::new(BinaryHeap::new()),
            removed: dashmap::DashSet::new(),
            next_age: AtomicU64::new(0),
        }
    }

    /// Run the single highest-priority pending callback, if any. Returns
    /// `true` if a callback ran.
    pub fn pump_one(&self) -> bool {
        let entry = loop {
            let mut heap = self.heap.lock();
            match heap.pop() {
                None => return false,
                Some(e) => {
                    drop(heap);
                    if self.removed.remove(&e.handle).is_some() {
                        continue;
                    }
                    break e;
                }
            }
        };
        (entry.callback)();
        true
    }

    /// Run every pending callback present at the moment of the call.
    pub fn pump(&self) {
        while self.pump_one() {}
    }

    /// Number of callbacks awaiting a pump.
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdleScheduler for ThreadIdleQueue {
    fn schedule(&self, priority: i64, callback: Box<dyn FnOnce() + Send>) -> IdleHandle {
        let handle = IdleHandle(Uuid::new_v4());
        let age = self.next_age.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().push(Entry {
            priority,
            age,
            handle,
            callback,
        });
        handle
    }

    fn remove(&self, handle: IdleHandle) {
        self.removed.insert(handle);
    }
}

thread_local! {
    static HOST_CONTEXT: RefCell<Rc<dyn IdleSchedulerThreadLocal>> =
        RefCell::new(Rc::new(Arc::new(ThreadIdleQueue::new()) as Arc<dyn IdleScheduler>));
}

/// Bridges a thread-local [`ThreadIdleQueue`] (or a host-installed
/// override) behind an `Arc`-compatible handle, so async code can
/// capture "the caller's host context" at suspension time and resume on
/// it later regardless of which thread actually ran the work.
trait IdleSchedulerThreadLocal {
    fn as_scheduler(&self) -> Arc<dyn IdleScheduler>;
}

impl IdleSchedulerThreadLocal for Arc<dyn IdleScheduler> {
    fn as_scheduler(&self) -> Arc<dyn IdleScheduler> {
        self.clone()
    }
}

/// The per-thread binding to the idle dispatcher used for async
/// resumptions (GLOSSARY: "host context").
pub struct HostContext;

impl HostContext {
    /// The idle scheduler bound to the calling thread, creating a fresh
    /// [`ThreadIdleQueue`] the first time a thread asks.
    pub fn current() -> Arc<dyn IdleScheduler> {
        HOST_CONTEXT.with(|cell| cell.borrow().as_scheduler())
    }

    /// Bind a different scheduler to the calling thread — used by hosts
    /// that already have their own idle/cooperative step (a GUI
    /// framework's idle callback, a game loop).
    pub fn install(scheduler: Arc<dyn IdleScheduler>) {
        HOST_CONTEXT.with(|cell| *cell.borrow_mut() = Rc::new(scheduler));
    }
}
