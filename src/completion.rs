//! A single-write, many-reader completion slot shared by the
//! cooperative `*_async`/`*_background` entry points on
//! [`crate::task_queue::TaskQueue`] and [`crate::event::Event`].
//!
//! Either the normal dispatch path or a racing cancellation can be the
//! one to fill the slot; whichever gets there first wins and the other
//! is a no-op, mirroring the check-register-check-await idiom already
//! used by [`crate::cancel::CancelToken::cancelled_async`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::Result;

pub struct Completion<T> {
    slot: Mutex<Option<Result<T>>>,
    notify: Notify,
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Fill the slot if empty. Returns `true` if this call was the one
    /// that filled it.
    pub fn fill(&self, value: Result<T>) -> bool {
        let mut guard = self.slot.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(value);
        drop(guard);
        self.notify.notify_waiters();
        true
    }

    pub async fn wait(self: Arc<Self>) -> Result<T> {
        loop {
            if let Some(v) = self.slot.lock().take() {
                return v;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            if let Some(v) = self.slot.lock().take() {
                return v;
            }
            notified.await;
        }
    }
}
