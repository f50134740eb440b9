//! Retry, timeout and backoff policy for the session core.
//!
//! Every limit the Session Manager and the Read Loop Controller obey lives in
//! [`SessionPolicy`]. The defaults are the fixed values the instrument workflow was
//! tuned for; settings files may override individual fields under a `[policy]` table.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identification query used to validate a freshly opened handle.
pub const IDN_QUERY: &str = "*IDN?";

/// Measurement query written once per read cycle.
pub const READ_QUERY: &str = ":READ?";

/// Tunable limits of the connect and read state machines.
///
/// Durations are (de)serialized as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    /// Connect attempts before giving up.
    pub max_connect_attempts: u32,
    /// Pause between opening a handle and probing it.
    #[serde(with = "millis")]
    pub settle_delay: Duration,
    /// Upper bound on one whole validation probe.
    #[serde(with = "millis")]
    pub validation_budget: Duration,
    /// Per-call I/O timeout substituted on the handle while validating.
    #[serde(with = "millis")]
    pub validation_io_timeout: Duration,
    /// First connect backoff; doubles per failed attempt.
    #[serde(with = "millis")]
    pub connect_backoff_base: Duration,
    /// Connect backoff ceiling.
    #[serde(with = "millis")]
    pub connect_backoff_cap: Duration,
    /// Per-read timeout inside the measurement loop.
    #[serde(with = "millis")]
    pub read_timeout: Duration,
    /// Base of the read-failure backoff.
    #[serde(with = "millis")]
    pub read_backoff_base: Duration,
    /// Read-failure backoff ceiling.
    #[serde(with = "millis")]
    pub read_backoff_cap: Duration,
    /// Back-to-back read failures tolerated before the run is aborted.
    pub max_consecutive_errors: u32,
    /// Fixed pause between loop iterations.
    #[serde(with = "millis")]
    pub iteration_delay: Duration,
    /// Reconnects attempted by a single read before it fails.
    pub max_reconnects: u32,
    /// Wait between closing a stale handle and reopening.
    #[serde(with = "millis")]
    pub reconnect_delay: Duration,
    /// Settle time after a reconnect before the read is retried.
    #[serde(with = "millis")]
    pub reconnect_settle: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_connect_attempts: 10,
            settle_delay: Duration::from_millis(250),
            validation_budget: Duration::from_millis(5000),
            validation_io_timeout: Duration::from_millis(2000),
            connect_backoff_base: Duration::from_millis(1000),
            connect_backoff_cap: Duration::from_millis(5000),
            read_timeout: Duration::from_millis(1000),
            read_backoff_base: Duration::from_millis(100),
            read_backoff_cap: Duration::from_millis(5000),
            max_consecutive_errors: 5,
            iteration_delay: Duration::from_millis(10),
            max_reconnects: 3,
            reconnect_delay: Duration::from_millis(1000),
            reconnect_settle: Duration::from_millis(500),
        }
    }
}

impl SessionPolicy {
    /// Delay after failed connect attempt `attempt` (1-based).
    ///
    /// `min(base * 2^(attempt-1), cap)`
    pub fn connect_backoff(&self, attempt: u32) -> Duration {
        exponential(
            self.connect_backoff_base,
            attempt.saturating_sub(1),
            self.connect_backoff_cap,
        )
    }

    /// Delay after the `count`-th consecutive read failure.
    ///
    /// `min(base * 2^count, cap)`
    pub fn read_backoff(&self, count: u32) -> Duration {
        exponential(self.read_backoff_base, count, self.read_backoff_cap)
    }

    /// Reject budgets that would make a state machine do nothing.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connect_attempts == 0 {
            return Err("max_connect_attempts must be at least 1".into());
        }
        if self.max_consecutive_errors == 0 {
            return Err("max_consecutive_errors must be at least 1".into());
        }
        if self.read_timeout.is_zero() || self.validation_io_timeout.is_zero() {
            return Err("I/O timeouts must be non-zero".into());
        }
        if self.validation_budget < self.validation_io_timeout {
            return Err(format!(
                "validation_budget ({}ms) is shorter than validation_io_timeout ({}ms)",
                self.validation_budget.as_millis(),
                self.validation_io_timeout.as_millis()
            ));
        }
        Ok(())
    }
}

fn exponential(base: Duration, exponent: u32, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(cap, |d| d.min(cap))
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
