//! Provider registry.
//!
//! The `ProviderRegistry` stores providers together with their routing
//! descriptor (priority, capability tags, rate limit, timeout), sorted by
//! priority. Lower priority values are tried first; providers with equal
//! priority keep their registration order, so candidate order is fully
//! deterministic.
//!
//! The registry is immutable once built and shared behind an `Arc`. All
//! mutable per-provider state (rate window, circuit breaker) lives in the
//! [`HealthTracker`](super::HealthTracker).
//!
//! ```text
//! register(A, prio 1) ─┐
//! register(B, prio 2) ─┼─► candidates(Fast) ─► [A, C, B]   (C: prio 1, registered after A)
//! register(C, prio 1) ─┘
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::traits::ModelProvider;
use crate::config::ProviderConfig;
use crate::types::TaskType;
use crate::{Result, SwitchboardError};

/// Requests allowed per fixed wall-clock window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(requests: u32, window: Duration) -> Self {
        Self { requests, window }
    }

    /// No practical limit.
    pub fn unlimited() -> Self {
        Self {
            requests: u32::MAX,
            window: Duration::from_secs(60),
        }
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::new(60, Duration::from_secs(60))
    }
}

/// Routing metadata for one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDescriptor {
    pub name: String,
    /// Lower value = tried first.
    pub priority: u32,
    /// Capability tags, e.g. "fast", "complex-reasoning", "code".
    pub capabilities: Vec<String>,
    pub rate_limit: RateLimit,
    /// Per-provider timeout for connecting and producing the first token.
    /// `None` uses the router default.
    pub timeout: Option<Duration>,
}

impl ProviderDescriptor {
    /// Descriptor with default priority (100), no tags and the default rate limit.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 100,
            capabilities: Vec::new(),
            rate_limit: RateLimit::default(),
            timeout: None,
        }
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Add one capability tag.
    pub fn capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.push(tag.into());
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether this provider can serve a task type.
    ///
    /// [`TaskType::Default`] matches every provider.
    pub fn supports(&self, task: TaskType) -> bool {
        match task.capability_tag() {
            Some(tag) => self.capabilities.iter().any(|c| c.eq_ignore_ascii_case(tag)),
            None => true,
        }
    }

    /// Descriptor for a configured provider.
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            name: config.name.clone(),
            priority: config.priority,
            capabilities: config.capabilities.clone(),
            rate_limit: RateLimit::new(
                config.requests_per_window,
                Duration::from_secs(config.window_secs.max(1)),
            ),
            timeout: config.timeout_ms.map(Duration::from_millis),
        }
    }
}

/// A provider plus its descriptor.
#[derive(Clone)]
pub struct RegisteredProvider {
    pub descriptor: ProviderDescriptor,
    pub provider: Arc<dyn ModelProvider>,
}

impl RegisteredProvider {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

impl fmt::Debug for RegisteredProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredProvider")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Providers in candidate order.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    entries: Vec<RegisteredProvider>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider.
    ///
    /// Names must be unique and match [`ModelProvider::name`], since errors
    /// raised by the provider carry that name. Equal priorities keep
    /// registration order.
    pub fn register(
        &mut self,
        provider: Arc<dyn ModelProvider>,
        descriptor: ProviderDescriptor,
    ) -> Result<()> {
        if provider.name() != descriptor.name {
            return Err(SwitchboardError::Configuration(format!(
                "provider {} registered under name {}",
                provider.name(),
                descriptor.name
            )));
        }
        if self.get(&descriptor.name).is_some() {
            return Err(SwitchboardError::Configuration(format!(
                "provider {} registered twice",
                descriptor.name
            )));
        }
        // Insert after every entry with priority <= ours: stable by registration.
        let at = self
            .entries
            .partition_point(|e| e.descriptor.priority <= descriptor.priority);
        self.entries.insert(
            at,
            RegisteredProvider {
                descriptor,
                provider,
            },
        );
        Ok(())
    }

    /// Providers able to serve `task`, in the order they should be tried.
    pub fn candidates(&self, task: TaskType) -> impl Iterator<Item = &RegisteredProvider> {
        self.entries
            .iter()
            .filter(move |e| e.descriptor.supports(task))
    }

    /// All providers in candidate order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredProvider> {
        self.entries.iter()
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredProvider> {
        self.entries.iter().find(|e| e.descriptor.name == name)
    }

    /// Provider names in candidate order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
