//! `taskloom`: priority-ordered, cancellable task dispatch and the
//! coordination primitives built on it — a counting semaphore, a
//! resource pool, a lazy singleton initializer, and a multicast event —
//! all sharing one priority/age wait-queue and one cancellation token.
//!
//! Every blocking entry point has a cooperative (`*_async`) and, where
//! it makes sense, a background-dispatch (`*_background`) counterpart,
//! so the same coordination logic works whether the caller drives its
//! own OS thread or a single-threaded host loop (GLOSSARY: "idle
//! dispatch", [`idle::HostContext`]).

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod cancel;
pub mod claim;
pub mod clock;
mod completion;
pub mod error;
pub mod event;
pub mod idle;
pub mod lazy;
pub mod pool;
mod record;
pub mod semaphore;
pub mod task_queue;
pub mod thread_state;
mod wait_queue;

pub use cancel::{CancelToken, ConnectionId};
pub use claim::{ResourceClaim, SemaphoreClaim};
pub use clock::{Clock, MonotonicClock};
pub use error::{Error, Result};
pub use event::Event;
pub use idle::{HostContext, IdleHandle, IdleScheduler, ThreadIdleQueue};
pub use lazy::Lazy;
pub use pool::{PoolConfig, PoolStats, ResourcePool};
pub use record::{OrderKey, Payload};
pub use semaphore::Semaphore;
pub use task_queue::TaskQueue;
pub use thread_state::{Dispatch, ThreadState};
