//! Circuit-open duration calculation.
//!
//! Exponential growth: `base_delay * 2^failures`, capped at `max_delay`.

use std::time::Duration;

use crate::config::RouterConfig;

/// How long a provider's circuit stays open after repeated failures.
///
/// ```rust
/// # use switchboard::CircuitBackoff;
/// # use std::time::Duration;
/// let backoff = CircuitBackoff::new()
///     .base_delay(Duration::from_millis(100))
///     .max_delay(Duration::from_secs(5));
/// assert_eq!(backoff.open_duration(3), Duration::from_millis(800));
/// assert_eq!(backoff.open_duration(10), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBackoff {
    /// Multiplied by `2^failures`. Default: 1s.
    pub base_delay: Duration,
    /// Upper bound on the open duration. Default: 5 minutes.
    pub max_delay: Duration,
}

impl Default for CircuitBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl CircuitBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Open duration after `failures` consecutive failures.
    pub fn open_duration(&self, failures: u32) -> Duration {
        let delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(failures));
        delay.min(self.max_delay)
    }
}

impl From<&RouterConfig> for CircuitBackoff {
    fn from(config: &RouterConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.circuit_base_delay_ms),
            max_delay: Duration::from_millis(config.circuit_max_delay_ms),
        }
    }
}
