//! Poll policy for remote steps
//!
//! Replaces the per-script sleep and retry constants with one policy that can
//! be set in the target config, in a case file, or per step.
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct PollPolicy {
    /// Delay between two sentinel checks
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Wall-clock budget from dispatch until the sentinel must resolve
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Retries on connection-level failures
    pub max_retries: u32,
    /// Fixed wait before each retry
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(600),
            max_retries: 3,
            retry_backoff: Duration::from_secs(10),
        }
    }
}

/// Optional overrides layered on top of a `PollPolicy`
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
pub struct PollOverrides {
    #[serde(with = "humantime_serde", default)]
    pub interval: Option<Duration>,
    #[serde(with = "humantime_serde", default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(with = "humantime_serde", default)]
    pub retry_backoff: Option<Duration>,
}

impl PollPolicy {
    /// Returns a copy of this policy with every set override applied.
    pub fn with_overrides(&self, overrides: &PollOverrides) -> Self {
        Self {
            interval: overrides.interval.unwrap_or(self.interval),
            timeout: overrides.timeout.unwrap_or(self.timeout),
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
            retry_backoff: overrides.retry_backoff.unwrap_or(self.retry_backoff),
        }
    }
}
