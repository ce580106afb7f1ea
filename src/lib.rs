//! Switchboard - provider routing and multi-tier response cache
//!
//! This crate sits between an assistant's feature modules and the upstream
//! language-model providers. It decides which provider answers a request,
//! survives provider outages with a per-provider circuit breaker, streams
//! answers sentence by sentence, and avoids recomputation with a three-tier
//! cache (in-memory LRU, SQLite, semantic similarity).
//!
//! # Example
//!
//! ```rust,no_run
//! use futures_util::StreamExt;
//! use switchboard::{Assistant, Category, Config, TaskType};
//!
//! #[tokio::main]
//! async fn main() -> switchboard::Result<()> {
//!     let assistant = Assistant::from_config(Config::load(None)?)?;
//!
//!     let mut answer = assistant
//!         .ask("weather in Paris", TaskType::Fast, Category::Weather)
//!         .await?;
//!     while let Some(sentence) = answer.next().await {
//!         println!("{}", sentence?);
//!     }
//!     println!("cached: {}", answer.cache_hit);
//!     Ok(())
//! }
//! ```
//!
//! # Components
//!
//! - [`Cache`]: L1 → L2 → L3 lookup with write-through and per-category TTLs
//! - [`HealthTracker`]: rate windows and circuit breakers per provider
//! - [`Router`]: provider selection with failover before the first token
//! - [`Segmenter`]: sentence boundaries in a token stream
//! - [`BoundedExecutor`] / [`ResourceMonitor`]: bounded fan-out under memory pressure
//! - [`Assistant`]: the facade composing all of the above

pub mod assistant;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod providers;
pub mod router;
pub mod streaming;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use assistant::{
    AskResponse, Assistant, AssistantBuilder, Capabilities, MetricsSnapshot, PrefetchFuture,
    SentenceStream,
};
pub use cache::{
    Cache, CacheStats, CompactionReport, Embedder, HashingEmbedder, PersistentTier, TierStats,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use error::{Result, SwitchboardError};
pub use executor::{BoundedExecutor, CompactionHint, MemoryProbe, ResourceMonitor, ResourceUsage};
pub use providers::{
    CircuitBackoff, HealthTracker, HttpProvider, ModelProvider, ProviderDescriptor,
    ProviderHealth, ProviderRegistry, RateLimit,
};
pub use router::{ProbeOutcome, RoutedStream, Router};
pub use streaming::{Segmenter, StreamLatencies, StreamTimer, StreamingLatency};
pub use types::{
    CacheEntry, CacheLookup, CacheTier, Category, RoutingRequest, TaskType, TokenStream,
};
