//! Event (§4.H): a priority-ordered multicast dispatcher. Subscribers
//! register with [`Event::add`]/[`Event::execute`]/[`Event::execute_async`]/
//! [`Event::execute_background`], one call per subscriber, and every
//! subscriber present at the moment of a [`Event::trigger`] runs, in
//! priority/age order, on the dispatch mode it asked for.
//!
//! This reuses [`crate::wait_queue::WaitQueue<TaskRecord>`] exactly as
//! [`crate::task_queue::TaskQueue`] does, but drains the whole queue on
//! trigger instead of popping one record per `process` call — broadcast
//! instead of single-consumer dispatch, per §3's "Event keeps its own
//! copy of [the priority wait-queue]".

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::completion::Completion;
use crate::error::{Error, Result};
use crate::idle::HostContext;
use crate::record::{Payload, TaskRecord};
use crate::task_queue::TaskQueue;
use crate::wait_queue::WaitQueue;

/// Multicast, priority-ordered event.
///
/// When `auto_reset` is `true` (the default), [`add`](Self::add)
/// subscribers are notified once per `trigger` and then unsubscribed —
/// call `add` again from inside the callback to keep listening. When
/// `false`, `add` subscribers keep receiving every subsequent trigger
/// until their `cancel` token fires.
pub struct Event<P: Clone + Send + 'static> {
    waiters: WaitQueue<TaskRecord>,
    auto_reset: bool,
    payload_slot: Mutex<Option<P>>,
    task_queue: Arc<TaskQueue>,
    self_weak: Weak<Event<P>>,
}

impl<P: Clone + Send + 'static> Event<P> {
    /// An `Event` dispatching [`execute_background`](Self::execute_background)
    /// mappers on the process-wide default task queue. See
    /// [`with_task_queue`](Self::with_task_queue) to inject a dedicated one.
    pub fn new(auto_reset: bool) -> Arc<Self> {
        Self::with_task_queue(auto_reset, TaskQueue::default_queue())
    }

    pub fn with_task_queue(auto_reset: bool, task_queue: Arc<TaskQueue>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Event {
            waiters: WaitQueue::new(),
            auto_reset,
            payload_slot: Mutex::new(None),
            task_queue,
            self_weak: weak.clone(),
        })
    }

    pub fn length(&self) -> usize {
        self.waiters.length()
    }

    fn connect_removal(&self, token: &CancelToken, age: u64) {
        let weak = self.self_weak.clone();
        token.connect(Box::new(move || {
            if let Some(event) = weak.upgrade() {
                event.waiters.remove_by_age(age);
            }
        }));
    }

    /// Register a subscriber run on the triggering thread. Returns
    /// `false` without subscribing if `cancel` is already cancelled.
    pub fn add(
        &self,
        priority: i64,
        cancel: Option<CancelToken>,
        mut callback: impl FnMut(P) + Send + 'static,
    ) -> bool {
        if let Some(token) = &cancel {
            if token.is_cancelled() {
                let _ = Error::invalid_state("submitted an already-cancelled token");
                return false;
            }
        }
        let slot = self.self_weak.clone();
        let auto_reset = self.auto_reset;
        let payload: Payload = Box::new(move || {
            if let Some(event) = slot.upgrade() {
                if let Some(p) = event.payload_slot.lock().clone() {
                    callback(p);
                }
            }
            !auto_reset
        });
        let record = TaskRecord::new(priority, cancel.clone(), payload);
        let age = self.waiters.offer(record);
        if let Some(token) = &cancel {
            self.connect_removal(token, age);
        }
        true
    }

    /// Run `f` exactly once, the next time this event triggers, on the
    /// calling thread — blocking it until that happens or `cancel`
    /// fires.
    #[tracing::instrument(skip(self, cancel, f))]
    pub fn execute<F, T>(&self, priority: i64, cancel: Option<CancelToken>, mut f: F) -> Result<T>
    where
        F: FnMut(P) -> std::result::Result<T, anyhow::Error> + Send + 'static,
        T: Send + 'static,
    {
        let pair = Arc::new((Mutex::new(None::<Result<T>>), parking_lot::Condvar::new()));
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
        let weak = self.self_weak.clone();
        let pair2 = pair.clone();
        let payload: Payload = Box::new(move || {
            if let Some(event) = weak.upgrade() {
                if let Some(p) = event.payload_slot.lock().clone() {
                    let result = f(p).map_err(Error::CallbackFailed);
                    let (slot, cvar) = &*pair2;
                    let mut guard = slot.lock();
                    if guard.is_none() {
                        *guard = Some(result);
                        cvar.notify_all();
                    }
                }
            }
            false
        });
        let age = self.waiters.offer(TaskRecord::new(priority, cancel.clone(), payload));
        if let Some(token) = &cancel {
            self.connect_removal(token, age);
        }

        let (slot, cvar) = &*pair;
        let mut guard = slot.lock();
        while guard.is_none() {
            cvar.wait(&mut guard);
        }
        #[allow(clippy::unwrap_used)]
        guard.take().unwrap()
    }

    /// Cooperative variant of [`execute`](Self::execute): suspends on
    /// the caller's idle dispatch step instead of blocking the thread.
    #[tracing::instrument(skip(self, cancel, f))]
    pub async fn execute_async<F, T>(
        &self,
        priority: i64,
        cancel: Option<CancelToken>,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut(P) -> std::result::Result<T, anyhow::Error> + Send + 'static,
        T: Send + 'static,
    {
        let completion = Arc::new(Completion::<T>::new());
        let host = HostContext::current();
        if let Some(token) = &cancel {
            let completion = completion.clone();
            token.connect(Box::new(move || {
                completion.fill(Err(Error::Cancelled));
            }));
        }
        let weak = self.self_weak.clone();
        let completion2 = completion.clone();
        let payload: Payload = Box::new(move || {
            if let Some(event) = weak.upgrade() {
                if let Some(p) = event.payload_slot.lock().clone() {
                    let completion3 = completion2.clone();
                    let result = f(p).map_err(Error::CallbackFailed);
                    host.schedule(
                        priority,
                        Box::new(move || {
                            completion3.fill(result);
                        }),
                    );
                }
            }
            false
        });
        let age = self.waiters.offer(TaskRecord::new(priority, cancel.clone(), payload));
        if let Some(token) = &cancel {
            self.connect_removal(token, age);
        }
        completion.wait().await
    }

    /// Cooperative variant whose mapper runs on a worker thread from the
    /// injected task queue instead of the thread that called
    /// [`trigger`](Self::trigger); resumption happens via an idle step,
    /// so neither the triggering thread nor any other subscriber
    /// dispatched in the same `trigger` call waits on this mapper.
    #[tracing::instrument(skip(self, cancel, f))]
    pub async fn execute_background<F, T>(
        &self,
        priority: i64,
        cancel: Option<CancelToken>,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut(P) -> std::result::Result<T, anyhow::Error> + Send + 'static,
        T: Send + 'static,
    {
        let completion = Arc::new(Completion::<T>::new());
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
        let payload: Payload = Box::new(move || {
            if let Some(event) = weak.upgrade() {
                if let Some(p) = event.payload_slot.lock().clone() {
                    if let Some(mapper) = f.take() {
                        let mut job = Some((mapper, p));
                        let host2 = host.clone();
                        let completion3 = completion2.clone();
                        event.task_queue.add(
                            priority,
                            cancel2.clone(),
                            Box::new(move || {
                                if let Some((mut mapper, p)) = job.take() {
                                    let result = mapper(p).map_err(Error::CallbackFailed);
                                    let completion4 = completion3.clone();
                                    host2.schedule(
                                        priority,
                                        Box::new(move || {
                                            completion4.fill(result);
                                        }),
                                    );
                                }
                                false
                            }),
                        );
                    }
                }
            }
            false
        });
        let age = self.waiters.offer(TaskRecord::new(priority, cancel.clone(), payload));
        if let Some(token) = &cancel {
            self.connect_removal(token, age);
        }
        completion.wait().await
    }

    /// Fire every current subscriber with `payload`, in priority/age
    /// order, on the calling thread. `execute_async`/`execute_background`
    /// subscribers only have their forwarding step run here; the actual
    /// user callback runs on whatever thread/step their mode specifies.
    #[tracing::instrument(skip(self, payload))]
    pub fn trigger(&self, payload: P) {
        *self.payload_slot.lock() = Some(payload);
        for mut record in self.waiters.drain() {
            let requeue = (record.payload)();
            if requeue {
                self.waiters.offer(record);
            }
        }
        *self.payload_slot.lock() = None;
    }
}
