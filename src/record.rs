//! Task record (§3 "Task record", §4.B).
//!
//! A record is created by `add`, lives in exactly one [`crate::wait_queue::WaitQueue`]
//! at a time, and leaves it by dispatch, cancellation, or explicit removal.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crate::cancel::CancelToken;

/// Payload run by `process`: returns `true` to re-enqueue the record with
/// a fresh age, `false` to drop it.
pub type Payload = Box<dyn FnMut() -> bool + Send + 'static>;

/// A queued unit of work plus its ordering key and optional cancellation.
///
/// `priority`/`age` give the record a total order: smaller `priority`
/// wins, ties are broken by `age` (ascending, i.e. FIFO).
pub struct TaskRecord {
    pub priority: i64,
    pub age: u64,
    pub cancel: Option<CancelToken>,
    pub payload: Payload,
}

impl TaskRecord {
    pub fn new(priority: i64, cancel: Option<CancelToken>, payload: Payload) -> Self {
        Self {
            priority,
            age: 0,
            cancel,
            payload,
        }
    }
}

/// Per-queue monotonic sequence generator for `age`. No two records
/// enqueued through the same counter ever share an `age`.
#[derive(Default)]
pub struct AgeCounter(AtomicU64);

impl AgeCounter {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, AtomicOrdering::Relaxed)
    }
}

/// Ordering key used by the wait-queue's heap: `(priority, age)`
/// ascending, so the *minimum* key is the highest-priority, oldest
/// record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderKey {
    pub priority: i64,
    pub age: u64,
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.age.cmp(&other.age))
    }
}

impl From<&TaskRecord> for OrderKey {
    fn from(record: &TaskRecord) -> Self {
        OrderKey {
            priority: record.priority,
            age: record.age,
        }
    }
}

/// An item that can live in a [`crate::wait_queue::WaitQueue`]: it
/// carries a priority and an `age` tie-breaker assigned by the queue on
/// `offer`. [`crate::event::Event`] reuses `TaskRecord` and this same
/// trait for its own wait-queue, specialized to broadcast dispatch
/// (drain-all-on-trigger) instead of single-consumer dispatch, per §3's
/// "Event keeps its own copy of A".
pub trait QueueItem: Send {
    fn priority(&self) -> i64;
    fn age(&self) -> u64;
    fn set_age(&mut self, age: u64);

    fn order_key(&self) -> OrderKey {
        OrderKey {
            priority: self.priority(),
            age: self.age(),
        }
    }
}

impl QueueItem for TaskRecord {
    fn priority(&self) -> i64 {
        self.priority
    }
    fn age(&self) -> u64 {
        self.age
    }
    fn set_age(&mut self, age: u64) {
        self.age = age;
    }
}
