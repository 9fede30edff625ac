//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from the system clock. The state machines in this
//! crate never read time themselves; drivers obtain it from an
//! [`Environment`] and pass it in. Production uses the tokio clock, tests use
//! paused tokio time or a hand-driven instant.

use std::{
    fmt::Debug,
    ops::{Add, Sub},
    time::Duration,
};

/// Monotonic point in time usable by the state machines.
///
/// Blanket-implemented for anything with instant semantics, so both
/// `std::time::Instant` and `tokio::time::Instant` qualify.
pub trait Timestamp:
    Copy + Ord + Debug + Send + Sync + Sub<Output = Duration> + Add<Duration, Output = Self>
{
}

impl<T> Timestamp for T where
    T: Copy + Ord + Debug + Send + Sync + Sub<Output = Duration> + Add<Duration, Output = Self>
{
}

/// Abstract environment providing time and async sleeping.
///
/// # Invariants
///
/// - `now()` never goes backwards within one environment
pub trait Environment: Clone + Send + Sync + 'static {
    /// Instant type produced by this environment.
    type Instant: Timestamp;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code sleeps; the state machines take deadlines as data.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Sleeps until `deadline`, returning immediately if it has passed.
    fn sleep_until(
        &self,
        deadline: Self::Instant,
    ) -> impl std::future::Future<Output = ()> + Send {
        let now = self.now();
        let remaining = if deadline > now { deadline - now } else { Duration::ZERO };
        self.sleep(remaining)
    }
}
