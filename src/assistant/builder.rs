//! Builder for configuring assistant instances

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use super::{Assistant, Capabilities};
use crate::cache::{Cache, Embedder, PersistentTier};
use crate::clock::{self, SharedClock};
use crate::config::Config;
use crate::executor::{BoundedExecutor, MemoryProbe, ResourceMonitor};
use crate::providers::{HttpProvider, ModelProvider, ProviderDescriptor, ProviderRegistry};
use crate::router::Router;
use crate::streaming::StreamLatencies;
use crate::telemetry::DEFAULT_LATENCY_SAMPLES;
use crate::{Result, SwitchboardError};

/// Where the L2 tier comes from.
enum PersistentChoice {
    /// Open `cache.l2_path`.
    FromConfig,
    Provided(PersistentTier),
    Disabled,
}

/// Builder for configuring assistant instances.
pub struct AssistantBuilder {
    config: Config,
    clock: Option<SharedClock>,
    persistent: PersistentChoice,
    embedder: Option<Arc<dyn Embedder>>,
    memory_probe: Option<Arc<dyn MemoryProbe>>,
    resource_monitor: bool,
    providers: Vec<(Arc<dyn ModelProvider>, ProviderDescriptor)>,
}

impl AssistantBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            clock: None,
            persistent: PersistentChoice::FromConfig,
            embedder: None,
            memory_probe: None,
            resource_monitor: true,
            providers: Vec::new(),
        }
    }

    /// Use this configuration. `[[providers]]` entries become HTTP providers.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Time source for TTLs, rate windows and circuit timers (default: system clock).
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use an already-opened L2 tier instead of `cache.l2_path`.
    pub fn persistent_tier(mut self, tier: PersistentTier) -> Self {
        self.persistent = PersistentChoice::Provided(tier);
        self
    }

    /// Run with L1 and L3 only.
    pub fn without_persistent_cache(mut self) -> Self {
        self.persistent = PersistentChoice::Disabled;
        self
    }

    /// Embedder for the semantic tier (default: hashing embedder).
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Memory source for the resource monitor (default: process RSS).
    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory_probe = Some(probe);
        self
    }

    /// Do not sample memory or throttle the executor.
    pub fn without_resource_monitor(mut self) -> Self {
        self.resource_monitor = false;
        self
    }

    /// Register a provider in addition to those in the configuration.
    pub fn provider(
        mut self,
        provider: Arc<dyn ModelProvider>,
        descriptor: ProviderDescriptor,
    ) -> Self {
        self.providers.push((provider, descriptor));
        self
    }

    /// Build the assistant.
    ///
    /// Fails on an invalid configuration, a duplicate provider name, or when
    /// no provider is registered at all.
    pub fn build(self) -> Result<Assistant> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(clock::system);

        let mut registry = ProviderRegistry::new();
        for provider_config in &self.config.providers {
            let provider = HttpProvider::from_config(provider_config)?;
            registry.register(
                Arc::new(provider),
                ProviderDescriptor::from_config(provider_config),
            )?;
        }
        for (provider, descriptor) in self.providers {
            registry.register(provider, descriptor)?;
        }
        if registry.is_empty() {
            return Err(SwitchboardError::NoProvider);
        }

        let cache_config = self.config.cache.clone();
        let cache = match self.persistent {
            PersistentChoice::FromConfig => Cache::new(cache_config, clock.clone()),
            PersistentChoice::Provided(tier) => {
                Cache::with_persistent(cache_config, clock.clone(), Some(tier))
            }
            PersistentChoice::Disabled => Cache::with_persistent(cache_config, clock.clone(), None),
        };
        let cache = Arc::new(match self.embedder {
            Some(embedder) => cache.with_embedder(embedder),
            None => cache,
        });

        let executor = Arc::new(BoundedExecutor::from_config(&self.config.executor));
        let monitor = self.resource_monitor.then(|| {
            let monitor = match self.memory_probe {
                Some(probe) => {
                    ResourceMonitor::with_probe(executor.clone(), &self.config.executor, probe)
                }
                None => ResourceMonitor::new(executor.clone(), &self.config.executor),
            };
            Arc::new(monitor.with_compaction(cache.clone()))
        });

        let router = Router::new(Arc::new(registry), &self.config.router, clock);
        let fallback_response = self.config.router.fallback_response.clone();

        let capabilities = Capabilities {
            persistent_cache: cache.has_persistent_tier(),
            semantic_cache: cache.has_semantic_tier(),
            canned_fallback: fallback_response.is_some(),
            resource_monitor: monitor.is_some(),
        };
        info!(
            providers = ?router.registry().names(),
            ?capabilities,
            "assistant ready"
        );

        Ok(Assistant {
            cache,
            router: Arc::new(router),
            executor,
            monitor,
            latencies: Arc::new(StreamLatencies::new(DEFAULT_LATENCY_SAMPLES)),
            hints: RwLock::new(HashMap::new()),
            capabilities,
            min_sentence_chars: self.config.streaming.min_sentence_chars,
            sentence_buffer: self.config.router.stream_buffer.max(1),
            fallback_response,
        })
    }
}

impl Default for AssistantBuilder {
    fn default() -> Self {
        Self::new()
    }
}
