//! Monotonic clock contract (§6).
//!
//! The core never reads the wall clock; every deadline and timestamp in
//! this crate is expressed in microseconds against an arbitrary monotonic
//! epoch fixed at first use.

use std::sync::OnceLock;
use std::time::Instant;

/// A source of monotonic microsecond timestamps.
///
/// Host integrations that already have their own monotonic clock (a game
/// loop's frame clock, a simulation clock in tests) can implement this
/// trait instead of using [`MonotonicClock`].
pub trait Clock: Send + Sync + 'static {
    /// Current time in microseconds since an unspecified, monotonically
    /// non-decreasing epoch.
    fn now_micros(&self) -> u64;
}

/// Default [`Clock`] backed by [`std::time::Instant`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

fn epoch() -> &'static Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now)
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> u64 {
        epoch().elapsed().as_micros() as u64
    }
}
