//! Switchboard error types

use std::time::Duration;

/// Switchboard error types
#[derive(Debug, thiserror::Error)]
pub enum SwitchboardError {
    // Cache errors (recovered locally by the facade, never surfaced from `ask`)
    #[error("cache tier {tier} unavailable: {message}")]
    CacheTierUnavailable { tier: &'static str, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    // Provider errors (counted against provider health, trigger failover)
    #[error("provider {provider} rate limited, retry after {retry_after:?}")]
    ProviderRateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("provider {provider} timed out after {elapsed:?}")]
    ProviderTimeout { provider: String, elapsed: Duration },

    #[error("provider {provider} server error ({status}): {message}")]
    ProviderServerError {
        provider: String,
        status: u16,
        message: String,
    },

    /// Every candidate provider was excluded, circuit-open or out of quota.
    #[error("all providers unavailable after {attempts} attempt(s)")]
    AllProvidersUnavailable { attempts: usize },

    // Request lifecycle
    #[error("request cancelled")]
    RequestCancelled,

    /// Bounded executor could not grant a permit before the submit timeout.
    #[error("executor saturated: no permit within {waited:?}")]
    ExecutorSaturated { waited: Duration },

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    // Transport / data errors
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("empty response from provider")]
    EmptyResponse,

    // Configuration errors
    #[error("no provider registered")]
    NoProvider,

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SwitchboardError {
    /// Whether this error is a provider-level failure.
    ///
    /// Provider failures are recorded against the provider's health and make
    /// the router move on to the next candidate.
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            Self::ProviderRateLimited { .. }
                | Self::ProviderTimeout { .. }
                | Self::ProviderServerError { .. }
                | Self::Http(_)
                | Self::Stream(_)
                | Self::EmptyResponse
        )
    }

    /// Whether this error came from cancellation rather than a failure.
    ///
    /// Cancellation never penalises provider health and never writes cache.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::RequestCancelled)
    }

    /// Provider-supplied backoff hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ProviderRateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for SwitchboardError {
    fn from(err: rusqlite::Error) -> Self {
        SwitchboardError::Storage(err.to_string())
    }
}

impl From<r2d2::Error> for SwitchboardError {
    fn from(err: r2d2::Error) -> Self {
        SwitchboardError::Storage(err.to_string())
    }
}

/// Result type alias for Switchboard operations
pub type Result<T> = std::result::Result<T, SwitchboardError>;
