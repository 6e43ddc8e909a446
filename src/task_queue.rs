//! TaskQueue (§4.C): the public dispatch surface every other coordination
//! object in this crate is built on.

use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancelToken;
use crate::completion::Completion;
use crate::error::{Error, Result};
use crate::idle::HostContext;
use crate::record::{Payload, TaskRecord};
use crate::thread_state::{Dispatch, ThreadState};
use crate::wait_queue::WaitQueue;

/// Priority-ordered, cancellable task dispatch surface. Owns one
/// [`WaitQueue`] of [`TaskRecord`]s and a [`ThreadState`] that spawns and
/// retires workers against it.
pub struct TaskQueue {
    queue: WaitQueue<TaskRecord>,
    threads: ThreadState,
    self_weak: Weak<TaskQueue>,
}

impl TaskQueue {
    /// Unbounded workers, never self-retire.
    pub fn new() -> Arc<Self> {
        Self::with_policy(-1, -1)
    }

    /// `max_threads < 0` means unlimited; `max_idle_time < 0` means
    /// workers never self-retire, `0` means they retire the moment the
    /// queue is empty, `> 0` bounds how long an idle worker waits before
    /// retiring.
    pub fn with_policy(max_threads: i64, max_idle_time: i64) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<TaskQueue>| {
            let shortage_weak = weak.clone();
            TaskQueue {
                queue: WaitQueue::new().on_consumer_shortage(move || {
                    if let Some(owner) = shortage_weak.upgrade() {
                        let dispatch = owner.as_dispatch();
                        ThreadState::spawn(&dispatch, 1);
                    }
                }),
                threads: ThreadState::new(max_threads, max_idle_time),
                self_weak: weak.clone(),
            }
        })
    }

    /// The process-wide default instance, lazily constructed and held by
    /// a weak back-reference so it can be reclaimed once no dependent
    /// holds it, and recreated on next access (§4.C, §9).
    pub fn default_queue() -> Arc<Self> {
        static SLOT: OnceLock<Mutex<Weak<TaskQueue>>> = OnceLock::new();
        let slot = SLOT.get_or_init(|| Mutex::new(Weak::new()));
        let mut guard = slot.lock();
        if let Some(existing) = guard.upgrade() {
            return existing;
        }
        let fresh = TaskQueue::new();
        *guard = Arc::downgrade(&fresh);
        fresh
    }

    #[allow(clippy::expect_used)]
    fn as_dispatch(&self) -> Arc<dyn Dispatch> {
        // Every &self call happens through some live Arc<TaskQueue> (the
        // only way to construct one), so this upgrade cannot fail.
        self.self_weak
            .upgrade()
            .expect("owning Arc<TaskQueue> is alive for any &self call")
    }

    pub fn length(&self) -> usize {
        self.queue.length()
    }

    pub fn thread_state(&self) -> &ThreadState {
        &self.threads
    }

    /// Increase the worker-count cap (only raises it, see §4.B).
    pub fn increase_max_threads(&self, n: i64) {
        self.threads.increase_max_threads(n);
    }

    /// Enqueue `payload` at `priority`. If `cancel` is already cancelled
    /// the record is never enqueued and this returns `false`; otherwise a
    /// cancellation callback is attached that removes the record from
    /// the queue if the token fires before dispatch.
    #[tracing::instrument(skip(self, cancel, payload))]
    pub fn add(&self, priority: i64, cancel: Option<CancelToken>, payload: Payload) -> bool {
        if let Some(token) = &cancel {
            if token.is_cancelled() {
                let _ = Error::invalid_state("submitted an already-cancelled token");
                return false;
            }
        }
        let record = TaskRecord::new(priority, cancel.clone(), payload);
        let age = self.queue.offer(record);
        if let Some(token) = &cancel {
            let weak = self.self_weak.clone();
            token.connect(Box::new(move || {
                if let Some(queue) = weak.upgrade() {
                    queue.queue.remove_by_age(age);
                }
            }));
        }
        ThreadState::spawn(&self.as_dispatch(), 1);
        true
    }

    /// Poll the queue once, running the dispatched record's payload
    /// on the calling thread. Returns `true` on a successful dispatch,
    /// `false` on timeout or an empty queue.
    #[tracing::instrument(skip(self))]
    pub fn process(&self, wait_micros: i64) -> bool {
        match self.queue.poll_timed(wait_micros) {
            None => false,
            Some(mut record) => {
                let requeue = self.threads.run_task(|| (record.payload)());
                if requeue {
                    self.queue.offer(record);
                }
                true
            }
        }
    }

    /// Run `f` on this queue and block the calling thread until it
    /// completes (successfully, with a callback failure, or because its
    /// `cancel` token fired before dispatch).
    ///
    /// Must not be called from the sole thread that also drives this
    /// queue's workers exclusively, or deadlock is possible (§4.C).
    #[tracing::instrument(skip(self, cancel, f))]
    pub fn execute<F, T>(&self, priority: i64, cancel: Option<CancelToken>, f: F) -> Result<T>
    where
        F: FnOnce() -> std::result::Result<T, anyhow::Error> + Send + 'static,
        T: Send + 'static,
    {
        let pair = Arc::new((Mutex::new(None::<Result<T>>), Condvar::new()));

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
        let mut f = Some(f);
        let payload: Payload = Box::new(move || {
            if let Some(f) = f.take() {
                let result = f().map_err(Error::CallbackFailed);
                let (slot, cvar) = &*pair2;
                let mut guard = slot.lock();
                if guard.is_none() {
                    *guard = Some(result);
                    cvar.notify_all();
                }
            }
            false
        });

        self.add(priority, cancel, payload);

        let (slot, cvar) = &*pair;
        let mut guard = slot.lock();
        while guard.is_none() {
            cvar.wait(&mut guard);
        }
        #[allow(clippy::unwrap_used)]
        guard.take().unwrap()
    }

    /// Suspend the caller cooperatively until `f` has run on an
    /// idle-dispatch step of the caller's host loop (§4.C).
    #[tracing::instrument(skip(self, cancel, f))]
    pub async fn execute_async<F, T>(
        &self,
        priority: i64,
        cancel: Option<CancelToken>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> std::result::Result<T, anyhow::Error> + Send + 'static,
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

        let completion2 = completion.clone();
        let mut f = Some(f);
        let payload: Payload = Box::new(move || {
            if let Some(f) = f.take() {
                let completion3 = completion2.clone();
                host.schedule(
                    priority,
                    Box::new(move || {
                        let result = f().map_err(Error::CallbackFailed);
                        completion3.fill(result);
                    }),
                );
            }
            false
        });

        self.add(priority, cancel, payload);
        completion.wait().await
    }

    /// Suspend the caller cooperatively until `f` has run on a worker
    /// thread; resumption happens via an idle callback on the caller's
    /// host loop (§4.C).
    #[tracing::instrument(skip(self, cancel, f))]
    pub async fn execute_background<F, T>(
        &self,
        priority: i64,
        cancel: Option<CancelToken>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> std::result::Result<T, anyhow::Error> + Send + 'static,
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

        let completion2 = completion.clone();
        let mut f = Some(f);
        let payload: Payload = Box::new(move || {
            if let Some(f) = f.take() {
                let result = f().map_err(Error::CallbackFailed);
                let completion3 = completion2.clone();
                host.schedule(
                    priority,
                    Box::new(move || {
                        completion3.fill(result);
                    }),
                );
            }
            false
        });

        self.add(priority, cancel, payload);
        completion.wait().await
    }
}

impl Dispatch for TaskQueue {
    fn process(&self, wait_micros: i64) -> bool {
        TaskQueue::process(self, wait_micros)
    }
    fn thread_state(&self) -> &ThreadState {
        &self.threads
    }
    fn worker_name(&self) -> String {
        "taskloom-task-queue".to_string()
    }
}
