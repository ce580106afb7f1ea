//! Telemetry metric name constants.
//!
//! Centralised metric names for switchboard operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! The facade also keeps a small in-process view (see
//! [`Assistant::metrics()`](crate::Assistant::metrics)) so dashboards can read
//! a snapshot without an exporter. [`LatencyWindow`] backs the streaming
//! percentiles in that snapshot.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `switchboard_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `provider`: provider name as registered
//! - `tier`: cache tier: "l1", "l2" or "l3"
//! - `status`: outcome: "ok", "error" or "cancelled"
//! - `reason`: why a provider was penalised: "timeout", "rate_limited", "server_error", "transport"

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Total routed requests.
///
/// Labels: `provider`, `status`.
pub const REQUESTS_TOTAL: &str = "switchboard_requests_total";

/// Time from dispatch until the provider stream ends.
///
/// Labels: `provider`.
pub const REQUEST_DURATION_SECONDS: &str = "switchboard_request_duration_seconds";

/// Provider failures recorded by the health tracker.
///
/// Labels: `provider`, `reason`.
pub const PROVIDER_FAILURES_TOTAL: &str = "switchboard_provider_failures_total";

/// Circuit openings.
///
/// Labels: `provider`.
pub const CIRCUIT_OPENED_TOTAL: &str = "switchboard_circuit_opened_total";

/// Total cache hits.
///
/// Labels: `tier`.
pub const CACHE_HITS_TOTAL: &str = "switchboard_cache_hits_total";

/// Total cache misses.
///
/// Labels: `tier`.
pub const CACHE_MISSES_TOTAL: &str = "switchboard_cache_misses_total";

/// Cache tier errors swallowed by the facade.
///
/// Labels: `tier`.
pub const CACHE_ERRORS_TOTAL: &str = "switchboard_cache_errors_total";

/// Time from request start to the first emitted sentence.
pub const TIME_TO_FIRST_SENTENCE_SECONDS: &str = "switchboard_time_to_first_sentence_seconds";

/// Time from request start to stream completion.
pub const STREAM_COMPLETION_SECONDS: &str = "switchboard_stream_completion_seconds";

/// Submits rejected because no permit freed in time.
pub const EXECUTOR_SATURATED_TOTAL: &str = "switchboard_executor_saturated_total";

/// Sampled resident memory of the process, in bytes.
pub const PROCESS_MEMORY_BYTES: &str = "switchboard_process_memory_bytes";

/// Number of times the resource monitor throttled the executor.
pub const THROTTLE_EVENTS_TOTAL: &str = "switchboard_throttle_events_total";

/// Default number of samples retained by a [`LatencyWindow`].
pub const DEFAULT_LATENCY_SAMPLES: usize = 1_024;

/// Percentile summary of a latency window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyPercentiles {
    /// Number of samples the summary was computed from.
    pub samples: usize,
    pub p50: Duration,
    pub p90: Duration,
    pub p99: Duration,
}

/// Bounded ring of recent latency observations.
///
/// Oldest samples are dropped once `capacity` is reached, so percentiles
/// describe recent behaviour rather than the whole process lifetime.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: Mutex<VecDeque<Duration>>,
    capacity: usize,
}

impl LatencyWindow {
    /// Create a window holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_LATENCY_SAMPLES))),
            capacity: capacity.max(1),
        }
    }

    /// Record one observation.
    pub fn record(&self, latency: Duration) {
        let mut samples = self
            .samples
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(latency);
    }

    /// Nearest-rank percentiles over the current window.
    pub fn percentiles(&self) -> LatencyPercentiles {
        let mut sorted: Vec<Duration> = self
            .samples
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .copied()
            .collect();
        if sorted.is_empty() {
            return LatencyPercentiles::default();
        }
        sorted.sort_unstable();
        let rank = |p: f64| {
            let idx = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
            sorted[idx.clamp(1, sorted.len()) - 1]
        };
        LatencyPercentiles {
            samples: sorted.len(),
            p50: rank(50.0),
            p90: rank(90.0),
            p99: rank(99.0),
        }
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_SAMPLES)
    }
}
