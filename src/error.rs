//! Error taxonomy shared by every component in this crate.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds a caller of any component in this crate can observe.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation was cancelled before it produced a result.
    #[error("operation cancelled")]
    Cancelled,

    /// Returned only by the explicit non-blocking variants (`try_lock`,
    /// `try_poll`, `try_peek`).
    #[error("operation would block")]
    WouldBlock,

    /// A resource pool or `Lazy` factory failed to produce a value.
    #[error("factory failed")]
    FactoryFailed(#[source] anyhow::Error),

    /// Release of an already-released or never-acquired claim, unlock of a
    /// semaphore with zero claims, submission of an already-cancelled
    /// token. Logged at `tracing::error!` by the caller and otherwise a
    /// no-op where safe.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A user callback raised; the failure is captured on its task record
    /// and re-raised verbatim to the caller of the corresponding
    /// `execute*`.
    #[error("callback failed")]
    CallbackFailed(#[source] anyhow::Error),
}

impl Error {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(%msg, "invalid state");
        Error::InvalidState(msg)
    }
}
