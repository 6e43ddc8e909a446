//! Priority wait-queue (§3, §4.A).
//!
//! A blocking, multi-consumer queue ordered by `(priority, age)`
//! ascending, guarded by one mutex and one condition variable per §5's
//! shared-resource policy. Both [`crate::task_queue::TaskQueue`] and
//! [`crate::event::Event`] are built on an instance of this queue,
//! parameterized over the kind of item they enqueue — hence the generic
//! [`QueueItem`] bound instead of a concrete `TaskRecord` type.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::clock::{Clock, MonotonicClock};
use crate::record::{AgeCounter, OrderKey, QueueItem};

struct HeapEntry<T: QueueItem>(T);

impl<T: QueueItem> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.order_key() == other.0.order_key()
    }
}
impl<T: QueueItem> Eq for HeapEntry<T> {}
impl<T: QueueItem> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T: QueueItem> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the minimum
        // (priority, age) key to pop first.
        other.0.order_key().cmp(&self.0.order_key())
    }
}

struct State<T: QueueItem> {
    heap: BinaryHeap<HeapEntry<T>>,
}

/// A record's ordering key, returned by [`WaitQueue::peek_timed`] in
/// place of a borrowed reference — the head record's payload is not
/// `Clone` (it owns a boxed closure), so peeking surfaces only the
/// information a caller can act on without taking ownership.
pub type Peeked = OrderKey;

/// Priority-ordered blocking queue of [`QueueItem`]s.
pub struct WaitQueue<T: QueueItem> {
    state: Mutex<State<T>>,
    condvar: Condvar,
    waiting_threads: AtomicUsize,
    ages: AgeCounter,
    clock: Arc<dyn Clock>,
    on_consumer_shortage: Option<Box<dyn Fn() + Send + Sync>>,
}

impl<T: QueueItem> WaitQueue<T> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
            }),
            condvar: Condvar::new(),
            waiting_threads: AtomicUsize::new(0),
            ages: AgeCounter::default(),
            clock,
            on_consumer_shortage: None,
        }
    }

    /// Install a callback invoked whenever `offer` succeeds while no
    /// consumer is blocked in `poll_timed`/`peek_timed`.
    pub fn on_consumer_shortage(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_consumer_shortage = Some(Box::new(callback));
        self
    }

    /// Insert `item`, assigning it a fresh `age`, which is returned so a
    /// caller can later target this exact record with `remove_by_age`
    /// (cancellation uses this to retract a record before dispatch).
    pub fn offer(&self, mut item: T) -> u64 {
        let age = self.ages.next();
        item.set_age(age);
        let shortage = {
            let mut state = self.state.lock();
            state.heap.push(HeapEntry(item));
            let waiting = self.waiting_threads.load(AtomicOrdering::Acquire);
            if waiting > 0 {
                self.condvar.notify_one();
            }
            waiting == 0
        };
        if shortage {
            if let Some(cb) = &self.on_consumer_shortage {
                cb();
            }
        }
        age
    }

    /// Remove and return the minimum `(priority, age)` item, blocking up
    /// to `wait_micros` (negative = forever, zero = non-blocking,
    /// positive = bounded) for one to arrive.
    #[tracing::instrument(skip(self))]
    pub fn poll_timed(&self, wait_micros: i64) -> Option<T> {
        self.wait_for(wait_micros, |state| state.heap.pop().map(HeapEntry::into_inner))
    }

    /// Like [`poll_timed`](Self::poll_timed) but returns only the head
    /// item's ordering key without removing it.
    #[tracing::instrument(skip(self))]
    pub fn peek_timed(&self, wait_micros: i64) -> Option<Peeked> {
        self.wait_for(wait_micros, |state| state.heap.peek().map(|e| e.0.order_key()))
    }

    fn wait_for<R>(&self, wait_micros: i64, mut try_take: impl FnMut(&mut State<T>) -> Option<R>) -> Option<R> {
        let mut state = self.state.lock();
        if let Some(r) = try_take(&mut state) {
            return Some(r);
        }
        if wait_micros == 0 {
            return None;
        }
        let deadline = if wait_micros < 0 {
            None
        } else {
            Some(self.clock.now_micros() + wait_micros as u64)
        };

        self.waiting_threads.fetch_add(1, AtomicOrdering::AcqRel);
        // Spurious wake-ups are handled by re-checking `try_take` (and the
        // deadline) every time around this loop, under the same lock used
        // to guard the heap.
        let result = loop {
            if let Some(r) = try_take(&mut state) {
                break Some(r);
            }
            match deadline {
                None => {
                    self.condvar.wait(&mut state);
                }
                Some(d) => {
                    let now = self.clock.now_micros();
                    if now >= d {
                        break None;
                    }
                    self.condvar
                        .wait_for(&mut state, Duration::from_micros(d - now));
                }
            }
        };
        self.waiting_threads.fetch_sub(1, AtomicOrdering::AcqRel);
        result
    }

    /// Remove a specific record by `age`, used by cancellation. Returns
    /// the removed item if it was still present.
    pub fn remove_by_age(&self, age: u64) -> Option<T> {
        let mut state = self.state.lock();
        let items: Vec<HeapEntry<T>> = std::mem::take(&mut state.heap).into_vec();
        let mut removed = None;
        let mut heap = BinaryHeap::with_capacity(items.len());
        for entry in items {
            if removed.is_none() && entry.0.age() == age {
                removed = Some(entry.0);
            } else {
                heap.push(entry);
            }
        }
        state.heap = heap;
        removed
    }

    /// Remove every currently-queued item, in `(priority, age)` order.
    /// Used by [`crate::event::Event::trigger`] for broadcast dispatch,
    /// where every current subscriber must run, not just the head one.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let mut items: Vec<HeapEntry<T>> = std::mem::take(&mut state.heap).into_vec();
        drop(state);
        items.sort_by(|a, b| a.0.order_key().cmp(&b.0.order_key()));
        items.into_iter().map(HeapEntry::into_inner).collect()
    }

    pub fn length(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn waiting_threads(&self) -> usize {
        self.waiting_threads.load(AtomicOrdering::Acquire)
    }
}

impl<T: QueueItem> HeapEntry<T> {
    fn into_inner(self) -> T {
        self.0
    }
}

impl<T: QueueItem> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
