//! Per-provider rate windows and circuit breakers.
//!
//! [`HealthTracker`] is the only owner of mutable provider state. It exposes
//! four operations: select a provider, record a dispatch, record a failure,
//! record a success. Each provider's state sits behind its own mutex and
//! every lock covers a single read-modify-write, so unrelated requests never
//! serialize on each other.
//!
//! # Rate window
//!
//! Fixed wall-clock windows: the window containing `now` starts at
//! `floor(now / window) * window`. Usage resets as soon as that boundary
//! moves, independent of request count.
//!
//! # Circuit breaker
//!
//! ```text
//!   closed ──(threshold consecutive failures)──► open until now + base·2^failures
//!     ▲                                              │
//!     │                                    (deadline passes)
//!     │                                              ▼
//!     └────────────(one success)───────────── selectable again
//! ```
//!
//! A failure after the deadline re-opens the circuit with a longer duration,
//! because `consecutive_failures` keeps counting until a success.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, warn};

use super::backoff::CircuitBackoff;
use super::registry::{ProviderRegistry, RateLimit, RegisteredProvider};
use crate::SwitchboardError;
use crate::clock::SharedClock;
use crate::telemetry;
use crate::types::TaskType;

#[derive(Debug, Default)]
struct ProviderState {
    requests_in_window: u32,
    window_start: i64,
    consecutive_failures: u32,
    circuit_open_until: Option<i64>,
    total_dispatched: u64,
    total_failures: u64,
}

impl ProviderState {
    /// Move to the window containing `now`, resetting usage on a new window.
    fn roll_window(&mut self, now: i64, limit: &RateLimit) {
        let window = (limit.window.as_millis() as i64).max(1);
        let start = now.div_euclid(window) * window;
        if start != self.window_start {
            self.window_start = start;
            self.requests_in_window = 0;
        }
    }

    fn circuit_open_at(&self, now: i64) -> bool {
        self.circuit_open_until.is_some_and(|until| now < until)
    }
}

/// Read-only view of one provider's health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub priority: u32,
    pub requests_in_window: u32,
    pub request_limit: u32,
    /// Epoch milliseconds.
    pub window_start: i64,
    pub consecutive_failures: u32,
    /// Epoch milliseconds; set once the circuit has opened.
    pub circuit_open_until: Option<i64>,
    /// Whether the circuit is open right now.
    pub circuit_open: bool,
    pub total_dispatched: u64,
    pub total_failures: u64,
}

/// Rate and health bookkeeping for every registered provider.
pub struct HealthTracker {
    registry: Arc<ProviderRegistry>,
    states: HashMap<String, Mutex<ProviderState>>,
    threshold: u32,
    backoff: CircuitBackoff,
    clock: SharedClock,
}

impl HealthTracker {
    /// Track every provider in `registry`.
    ///
    /// `threshold` consecutive failures open a provider's circuit.
    pub fn new(
        registry: Arc<ProviderRegistry>,
        threshold: u32,
        backoff: CircuitBackoff,
        clock: SharedClock,
    ) -> Self {
        let states = registry
            .iter()
            .map(|e| (e.name().to_owned(), Mutex::new(ProviderState::default())))
            .collect();
        Self {
            registry,
            states,
            threshold: threshold.max(1),
            backoff,
            clock,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    fn state(&self, name: &str) -> Option<MutexGuard<'_, ProviderState>> {
        self.states
            .get(name)
            .map(|m| m.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Best provider for `task` that is not excluded, not circuit-open and
    /// has quota left in its current window.
    ///
    /// `None` means nothing is available right now; callers must not spin
    /// on it.
    pub fn select_provider(
        &self,
        task: TaskType,
        exclude: &HashSet<String>,
    ) -> Option<RegisteredProvider> {
        self.pick(task, exclude, false)
    }

    /// Like [`select_provider`](Self::select_provider), but counts the
    /// dispatch against the chosen provider's window under the same lock
    /// that checked its quota.
    ///
    /// Concurrent callers can therefore never overshoot a rate limit.
    pub fn select_and_reserve(
        &self,
        task: TaskType,
        exclude: &HashSet<String>,
    ) -> Option<RegisteredProvider> {
        self.pick(task, exclude, true)
    }

    fn pick(
        &self,
        task: TaskType,
        exclude: &HashSet<String>,
        reserve: bool,
    ) -> Option<RegisteredProvider> {
        let now = self.clock.now_millis();
        for candidate in self.registry.candidates(task) {
            if exclude.contains(candidate.name()) {
                continue;
            }
            let Some(mut state) = self.state(candidate.name()) else {
                continue;
            };
            if state.circuit_open_at(now) {
                debug!(provider = candidate.name(), "skipping: circuit open");
                continue;
            }
            let limit = candidate.descriptor.rate_limit;
            state.roll_window(now, &limit);
            if state.requests_in_window >= limit.requests {
                debug!(provider = candidate.name(), "skipping: rate window exhausted");
                continue;
            }
            if reserve {
                state.requests_in_window += 1;
                state.total_dispatched += 1;
            }
            return Some(candidate.clone());
        }
        None
    }

    /// Count one request against the provider's current window.
    pub fn record_dispatch(&self, name: &str) {
        let Some(entry) = self.registry.get(name) else {
            return;
        };
        let now = self.clock.now_millis();
        if let Some(mut state) = self.state(name) {
            state.roll_window(now, &entry.descriptor.rate_limit);
            state.requests_in_window = state.requests_in_window.saturating_add(1);
            state.total_dispatched += 1;
        }
    }

    /// Record a provider-level failure, opening the circuit at the threshold.
    pub fn record_failure(&self, name: &str, error: &SwitchboardError) {
        let now = self.clock.now_millis();
        let Some(mut state) = self.state(name) else {
            return;
        };
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.total_failures += 1;
        metrics::counter!(telemetry::PROVIDER_FAILURES_TOTAL,
            "provider" => name.to_owned(),
            "reason" => failure_reason(error),
        )
        .increment(1);

        if state.consecutive_failures >= self.threshold {
            let open_for = self.backoff.open_duration(state.consecutive_failures);
            // A provider-supplied Retry-After can only lengthen the pause.
            let open_for = error.retry_after().map_or(open_for, |hint| hint.max(open_for));
            let until = now.saturating_add(open_for.as_millis() as i64);
            state.circuit_open_until = Some(until);
            metrics::counter!(telemetry::CIRCUIT_OPENED_TOTAL, "provider" => name.to_owned())
                .increment(1);
            warn!(
                provider = name,
                failures = state.consecutive_failures,
                open_ms = open_for.as_millis() as u64,
                error = %error,
                "circuit opened"
            );
        } else {
            warn!(
                provider = name,
                failures = state.consecutive_failures,
                error = %error,
                "provider failure recorded"
            );
        }
    }

    /// Reset the failure count and close the circuit.
    pub fn record_success(&self, name: &str) {
        if let Some(mut state) = self.state(name) {
            if state.consecutive_failures > 0 || state.circuit_open_until.is_some() {
                debug!(provider = name, "provider recovered, circuit closed");
            }
            state.consecutive_failures = 0;
            state.circuit_open_until = None;
        }
    }

    /// Health of one provider.
    pub fn health(&self, name: &str) -> Option<ProviderHealth> {
        let entry = self.registry.get(name)?;
        self.snapshot_of(entry, self.clock.now_millis())
    }

    /// Health of every provider, in candidate order.
    pub fn snapshot(&self) -> Vec<ProviderHealth> {
        let now = self.clock.now_millis();
        self.registry
            .iter()
            .filter_map(|entry| self.snapshot_of(entry, now))
            .collect()
    }

    fn snapshot_of(&self, entry: &RegisteredProvider, now: i64) -> Option<ProviderHealth> {
        let mut state = self.state(entry.name())?;
        state.roll_window(now, &entry.descriptor.rate_limit);
        Some(ProviderHealth {
            name: entry.name().to_owned(),
            priority: entry.descriptor.priority,
            requests_in_window: state.requests_in_window,
            request_limit: entry.descriptor.rate_limit.requests,
            window_start: state.window_start,
            consecutive_failures: state.consecutive_failures,
            circuit_open_until: state.circuit_open_until,
            circuit_open: state.circuit_open_at(now),
            total_dispatched: state.total_dispatched,
            total_failures: state.total_failures,
        })
    }
}

/// Metric label for a failure.
fn failure_reason(error: &SwitchboardError) -> &'static str {
    match error {
        SwitchboardError::ProviderTimeout { .. } => "timeout",
        SwitchboardError::ProviderRateLimited { .. } => "rate_limited",
        SwitchboardError::ProviderServerError { .. } => "server_error",
        _ => "transport",
    }
}
