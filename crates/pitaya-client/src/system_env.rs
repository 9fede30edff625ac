//! Production environment backed by the tokio clock.
//!
//! Uses `tokio::time::Instant` rather than `std::time::Instant` so that tests
//! running on a paused runtime (`start_paused = true`) drive connect timeouts,
//! reconnect backoff and call deadlines deterministically.

use std::time::Duration;

use pitaya_core::Environment;

/// Environment using the tokio clock and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn sleep_until(
        &self,
        deadline: Self::Instant,
    ) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep_until(deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn paused_clock_advances_with_sleep() {
        let env = SystemEnv::new();

        let start = env.now();
        env.sleep(Duration::from_secs(30)).await;

        assert_eq!(env.now() - start, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_until_past_deadline_returns() {
        let env = SystemEnv::new();
        let past = env.now();
        env.sleep(Duration::from_millis(5)).await;

        env.sleep_until(past).await;
        assert!(env.now() >= past);
    }
}
