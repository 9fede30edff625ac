//! Client configuration.
//!
//! Applied once at client init and immutable afterwards. Defaults follow the
//! reference client: TCP transport, reconnect enabled with unlimited retries,
//! exponential backoff from 2s capped at 30s, 30s connect timeout.

use std::time::Duration;

use crate::error::ConfigError;

/// Default time allowed for transport connect plus session handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for requests and notifies issued without one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default base reconnect delay.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Default reconnect delay cap.
pub const DEFAULT_RECONNECT_DELAY_MAX: Duration = Duration::from_secs(30);

/// Missed heartbeat intervals tolerated before the connection is dropped.
pub const DEFAULT_HEARTBEAT_TIMEOUT_FACTOR: u32 = 2;

/// Longest timeout or interval the state machines schedule.
///
/// Roughly thirty years. Call timeouts and server-announced heartbeat
/// intervals beyond it are clamped, so adding one to an instant cannot
/// overflow.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    /// Plain TCP
    #[default]
    Tcp,
    /// TLS over TCP with certificate pinning
    Tls,
}

/// Reconnect retry limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryLimit {
    /// Retry forever
    #[default]
    Always,
    /// Give up after this many retries
    Limited(u32),
}

impl RetryLimit {
    /// Whether `retries` already performed exhausts the limit.
    pub fn exhausted(self, retries: u32) -> bool {
        match self {
            Self::Always => false,
            Self::Limited(max) => retries >= max,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Transport used for every connection attempt
    pub transport: TransportKind,
    /// Queue events and call completions until `poll()` is called
    pub enable_polling: bool,
    /// Reconnect automatically after connect errors and connection loss
    pub enable_reconnect: bool,
    /// Reconnect retry limit
    pub reconnect_max_retries: RetryLimit,
    /// Delay before the first retry
    pub reconnect_delay: Duration,
    /// Upper bound on the retry delay
    pub reconnect_delay_max: Duration,
    /// Double the delay on every retry
    pub reconnect_exp_backoff: bool,
    /// Time allowed for transport connect plus session handshake
    pub connect_timeout: Duration,
    /// Deadline for calls issued without an explicit timeout
    pub default_request_timeout: Duration,
    /// Missed heartbeat intervals tolerated before dropping the connection
    pub heartbeat_timeout_factor: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Tcp,
            enable_polling: false,
            enable_reconnect: true,
            reconnect_max_retries: RetryLimit::Always,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            reconnect_delay_max: DEFAULT_RECONNECT_DELAY_MAX,
            reconnect_exp_backoff: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            default_request_timeout: DEFAULT_REQUEST_TIMEOUT,
            heartbeat_timeout_factor: DEFAULT_HEARTBEAT_TIMEOUT_FACTOR,
        }
    }
}

impl ClientConfig {
    /// Reject configurations the state machines cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "connect_timeout" });
        }
        if self.default_request_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "default_request_timeout" });
        }
        for (field, value) in [
            ("connect_timeout", self.connect_timeout),
            ("default_request_timeout", self.default_request_timeout),
            ("reconnect_delay_max", self.reconnect_delay_max),
        ] {
            if value > MAX_TIMEOUT {
                return Err(ConfigError::DurationTooLong { field, max: MAX_TIMEOUT });
            }
        }
        if self.enable_reconnect {
            if self.reconnect_delay.is_zero() {
                return Err(ConfigError::ZeroDuration { field: "reconnect_delay" });
            }
            if self.reconnect_delay_max < self.reconnect_delay {
                return Err(ConfigError::BackoffInverted {
                    base: self.reconnect_delay,
                    max: self.reconnect_delay_max,
                });
            }
        }
        if self.heartbeat_timeout_factor == 0 {
            return Err(ConfigError::HeartbeatFactor(self.heartbeat_timeout_factor));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1-based).
    pub fn reconnect_delay_for(&self, retry: u32) -> Duration {
        if !self.reconnect_exp_backoff {
            return self.reconnect_delay;
        }

        let shift = retry.saturating_sub(1).min(31);
        self.reconnect_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.reconnect_delay_max)
            .min(self.reconnect_delay_max)
    }
}
