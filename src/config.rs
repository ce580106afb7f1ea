//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (explicit path; must exist)
//! 2. `~/.switchboard/config.toml` (user)
//! 3. `/etc/switchboard/config.toml` (system)
//!
//! When no file is found the defaults below apply. Every field has a serde
//! default, so a config file only needs the values it changes.
//!
//! ```toml
//! [cache]
//! l1_capacity = 2048
//! l2_path = "/var/lib/switchboard/cache.sqlite3"
//!
//! [cache.category_ttls]
//! weather = 1800
//! conversational = 0
//!
//! [[providers]]
//! name = "primary"
//! base_url = "https://api.example.com"
//! model = "large-1"
//! api_key_env = "PRIMARY_API_KEY"
//! priority = 1
//! capabilities = ["fast", "complex-reasoning"]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::types::Category;
use crate::{Result, SwitchboardError};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// Cache tier configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum entries held by the in-memory tier (default: 1,024).
    #[serde(default = "default_l1_capacity")]
    pub l1_capacity: u64,
    /// SQLite file backing the persistent tier.
    #[serde(default = "default_l2_path")]
    pub l2_path: PathBuf,
    /// Whether the semantic tier is consulted (default: true).
    #[serde(default = "default_true")]
    pub l3_enabled: bool,
    /// Cosine similarity needed for a semantic hit (default: 0.92).
    #[serde(default = "default_similarity_threshold")]
    pub l3_similarity_threshold: f32,
    /// Embeddings kept per category before the oldest are dropped (default: 4,096).
    #[serde(default = "default_l3_max_entries")]
    pub l3_max_entries_per_category: usize,
    /// Categories eligible for semantic lookup.
    #[serde(default = "default_semantic_categories")]
    pub semantic_categories: Vec<Category>,
    /// TTL in seconds per category; 0 disables caching for that category.
    #[serde(default = "default_category_ttls")]
    pub category_ttls: BTreeMap<Category, u64>,
    /// Per-tier lookup timeout in milliseconds (default: 250).
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
    /// Interval between persistent-tier sweeps in seconds (default: 300).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// How long expired rows stay on disk for stale fallback, in seconds (default: 86,400).
    #[serde(default = "default_stale_grace_secs")]
    pub stale_grace_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: default_l1_capacity(),
            l2_path: default_l2_path(),
            l3_enabled: true,
            l3_similarity_threshold: default_similarity_threshold(),
            l3_max_entries_per_category: default_l3_max_entries(),
            semantic_categories: default_semantic_categories(),
            category_ttls: default_category_ttls(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            stale_grace_secs: default_stale_grace_secs(),
        }
    }
}

impl CacheConfig {
    /// TTL for a category. Categories missing from the table are not cached.
    pub fn ttl_for(&self, category: Category) -> Duration {
        Duration::from_secs(self.category_ttls.get(&category).copied().unwrap_or(0))
    }

    /// Whether the semantic tier may answer for this category.
    pub fn is_semantic(&self, category: Category) -> bool {
        self.l3_enabled && self.semantic_categories.contains(&category)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stale_grace(&self) -> Duration {
        Duration::from_secs(self.stale_grace_secs)
    }
}

fn default_l1_capacity() -> u64 {
    1_024
}

fn default_l2_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("switchboard")
        .join("responses.sqlite3")
}

fn default_true() -> bool {
    true
}

fn default_similarity_threshold() -> f32 {
    0.92
}

fn default_l3_max_entries() -> usize {
    4_096
}

fn default_semantic_categories() -> Vec<Category> {
    vec![Category::StaticKnowledge, Category::Weather, Category::General]
}

fn default_category_ttls() -> BTreeMap<Category, u64> {
    BTreeMap::from([
        (Category::Weather, 30 * 60),
        (Category::News, 60 * 60),
        (Category::StaticKnowledge, 7 * 24 * 60 * 60),
        (Category::Conversational, 0),
        (Category::General, 24 * 60 * 60),
    ])
}

fn default_lookup_timeout_ms() -> u64 {
    250
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_stale_grace_secs() -> u64 {
    24 * 60 * 60
}

/// Router, health tracker and stream settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Default per-provider call timeout in milliseconds (default: 30,000).
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,
    /// Consecutive failures that open a provider's circuit (default: 3).
    #[serde(default = "default_circuit_threshold")]
    pub circuit_breaker_threshold: u32,
    /// Base circuit-open duration in milliseconds (default: 1,000).
    #[serde(default = "default_circuit_base_ms")]
    pub circuit_base_delay_ms: u64,
    /// Upper bound on circuit-open duration in milliseconds (default: 300,000).
    #[serde(default = "default_circuit_max_ms")]
    pub circuit_max_delay_ms: u64,
    /// Token buffer between provider and segmenter (default: 64).
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Canned answer used when no provider and no stale entry can answer.
    #[serde(default)]
    pub fallback_response: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            provider_timeout_ms: default_provider_timeout_ms(),
            circuit_breaker_threshold: default_circuit_threshold(),
            circuit_base_delay_ms: default_circuit_base_ms(),
            circuit_max_delay_ms: default_circuit_max_ms(),
            stream_buffer: default_stream_buffer(),
            fallback_response: None,
        }
    }
}

impl RouterConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }
}

fn default_provider_timeout_ms() -> u64 {
    30_000
}

fn default_circuit_threshold() -> u32 {
    3
}

fn default_circuit_base_ms() -> u64 {
    1_000
}

fn default_circuit_max_ms() -> u64 {
    300_000
}

fn default_stream_buffer() -> usize {
    64
}

/// Bounded executor and resource monitor settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum concurrently running tasks (default: 8).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    /// How long `submit` waits for a permit in milliseconds (default: 5,000).
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    /// Resident memory that triggers throttling, in MiB (default: 1,024).
    #[serde(default = "default_high_watermark")]
    pub memory_high_watermark_mb: u64,
    /// Resident memory below which throttling is lifted, in MiB (default: 768).
    #[serde(default = "default_low_watermark")]
    pub memory_low_watermark_mb: u64,
    /// Resource monitor sampling interval in milliseconds (default: 5,000).
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    /// Permits withheld while throttled (default: half of `max_concurrent_tasks`).
    #[serde(default)]
    pub throttle_permits: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent(),
            submit_timeout_ms: default_submit_timeout_ms(),
            memory_high_watermark_mb: default_high_watermark(),
            memory_low_watermark_mb: default_low_watermark(),
            monitor_interval_ms: default_monitor_interval_ms(),
            throttle_permits: None,
        }
    }
}

impl ExecutorConfig {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Permits withheld while memory is above the high watermark.
    pub fn effective_throttle_permits(&self) -> usize {
        self.throttle_permits
            .unwrap_or(self.max_concurrent_tasks / 2)
            .min(self.max_concurrent_tasks.saturating_sub(1))
    }
}

fn default_max_concurrent() -> usize {
    8
}

fn default_submit_timeout_ms() -> u64 {
    5_000
}

fn default_high_watermark() -> u64 {
    1_024
}

fn default_low_watermark() -> u64 {
    768
}

fn default_monitor_interval_ms() -> u64 {
    5_000
}

/// Sentence segmentation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    /// Sentences shorter than this (in chars, trimmed) are held back (default: 12).
    #[serde(default = "default_min_sentence_chars")]
    pub min_sentence_chars: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            min_sentence_chars: default_min_sentence_chars(),
        }
    }
}

fn default_min_sentence_chars() -> usize {
    12
}

/// One upstream provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Unique name; used in logs, metrics and health snapshots.
    pub name: String,
    /// Base URL of an OpenAI-compatible endpoint.
    pub base_url: String,
    /// Model identifier sent with every request.
    pub model: String,
    /// Environment variable holding the API key, if the endpoint needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Lower value = tried first (default: 100).
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Capability tags such as "fast", "complex-reasoning", "code".
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Requests allowed per rate window (default: 60).
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,
    /// Rate window length in seconds (default: 60).
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Overrides `router.provider_timeout_ms` for this provider.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ProviderConfig {
    /// API key read from `api_key_env`, if configured and set.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    }
}

fn default_priority() -> u32 {
    100
}

fn default_requests_per_window() -> u32 {
    60
}

fn default_window_secs() -> u64 {
    60
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided; missing file is an error)
    /// 2. `~/.switchboard/config.toml`
    /// 3. `/etc/switchboard/config.toml`
    ///
    /// Falls back to defaults when no file exists.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let Some(path) = Self::resolve_config_path(explicit_path)? else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(&path).map_err(|e| {
            SwitchboardError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        let config = Self::from_toml(&content).map_err(|e| match e {
            SwitchboardError::Configuration(msg) => {
                SwitchboardError::Configuration(format!("{path:?}: {msg}"))
            }
            other => other,
        })?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| {
            SwitchboardError::Configuration(format!("Failed to parse config: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        let threshold = self.cache.l3_similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(SwitchboardError::Configuration(format!(
                "l3_similarity_threshold must be within 0..=1, got {threshold}"
            )));
        }
        if self.cache.l1_capacity == 0 {
            return Err(SwitchboardError::Configuration(
                "l1_capacity must be greater than zero".to_string(),
            ));
        }
        if self.executor.max_concurrent_tasks == 0 {
            return Err(SwitchboardError::Configuration(
                "max_concurrent_tasks must be greater than zero".to_string(),
            ));
        }
        if self.executor.memory_low_watermark_mb > self.executor.memory_high_watermark_mb {
            return Err(SwitchboardError::Configuration(format!(
                "memory_low_watermark_mb ({}) exceeds memory_high_watermark_mb ({})",
                self.executor.memory_low_watermark_mb, self.executor.memory_high_watermark_mb
            )));
        }
        if self.router.circuit_breaker_threshold == 0 {
            return Err(SwitchboardError::Configuration(
                "circuit_breaker_threshold must be greater than zero".to_string(),
            ));
        }
        let mut names: Vec<&str> = self.providers.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(SwitchboardError::Configuration(format!(
                "duplicate provider name: {}",
                dup[0]
            )));
        }
        Ok(())
    }

    /// Resolve the config file path, `None` when no file exists.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(SwitchboardError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".switchboard").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/switchboard/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }
}
