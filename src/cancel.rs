//! Cancellation-token abstraction (§6): a parent/child hierarchy backed
//! by `tokio::sync::Notify` for async waiters, generalized with an
//! explicit `connect`/`disconnect` callback registry for synchronous
//! hookups.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Identifier returned by [`CancelToken::connect`], passed back to
/// [`CancelToken::disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
    callbacks: Mutex<Vec<(u64, Option<Callback>)>>,
    next_id: AtomicU64,
}

/// A cooperative cancellation token.
///
/// Cloning a `CancelToken` shares the same underlying state — every
/// clone observes the same cancellation. Use [`CancelToken::child`] to
/// create a token that is cancelled whenever its parent is, but can also
/// be cancelled independently.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                callbacks: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// A token that is already cancelled.
    pub fn cancelled() -> Self {
        let token = Self::new();
        token.cancel();
        token
    }

    /// A child token: cancelling it does not cancel `self`, but
    /// cancelling `self` cancels every child transitively.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let weak_child = child.clone();
        // If the parent is already cancelled, propagate immediately
        // instead of registering a callback that would never fire.
        if self.is_cancelled() {
            weak_child.cancel();
            return child;
        }
        self.connect(Box::new(move || weak_child.cancel()));
        child
    }

    /// Register `callback` to run exactly once, the moment this token is
    /// cancelled (immediately, inline, if it is already cancelled).
    pub fn connect(&self, callback: Callback) -> ConnectionId {
        if self.inner.cancelled.load(Ordering::Acquire) {
            callback();
            return ConnectionId(u64::MAX);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut callbacks = self.inner.callbacks.lock();
        // Re-check under the lock: cancel() may have run between the
        // fast-path load above and taking the lock.
        if self.inner.cancelled.load(Ordering::Acquire) {
            drop(callbacks);
            callback();
            return ConnectionId(id);
        }
        callbacks.push((id, Some(callback)));
        ConnectionId(id)
    }

    /// Unregister a callback previously returned by [`connect`](Self::connect).
    /// A no-op if it already fired or never existed.
    pub fn disconnect(&self, id: ConnectionId) {
        let mut callbacks = self.inner.callbacks.lock();
        if let Some(slot) = callbacks.iter_mut().find(|(cid, _)| *cid == id.0) {
            slot.1 = None;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Returns [`Error::Cancelled`] if this token has fired.
    pub fn raise_if_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Cancel this token, running every connected callback exactly once.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.notify.notify_waiters();
        let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
        for (_, callback) in callbacks.into_iter() {
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    /// Suspend cooperatively until this token is cancelled.
    pub async fn cancelled_async(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}
