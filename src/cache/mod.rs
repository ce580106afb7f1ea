//! Multi-tier response cache.
//!
//! Three independent tiers composed behind [`Cache`]:
//!
//! - [`memory::MemoryTier`] (L1): in-process LRU with per-entry TTL.
//! - [`persistent::PersistentTier`] (L2): SQLite table surviving restarts,
//!   lazy expiry plus a periodic sweep.
//! - [`semantic::SemanticTier`] (L3): embeddings of past queries pointing at
//!   L2 values, consulted only for similarity-eligible categories.
//!
//! Lookups go L1 → L2 → L3 → compute. A computed value is written through to
//! every tier. Each tier lookup is bounded by `lookup_timeout_ms`; errors
//! and timeouts in L2/L3 are logged, counted, and read as a miss, so a broken
//! tier slows requests down but never fails them.

pub mod key;
pub mod memory;
pub mod persistent;
pub mod semantic;

pub use key::{cache_key, normalize_query};
pub use memory::MemoryTier;
pub use persistent::PersistentTier;
pub use semantic::{
    EmbeddingRecord, Embedder, HashingEmbedder, SemanticMatch, SemanticTier, cosine_similarity,
};

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::Result;
use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::telemetry;
use crate::types::{CacheEntry, CacheLookup, CacheTier, Category};

/// Hit/miss/error counts for one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    /// Lookups that failed or timed out (also counted as misses).
    pub errors: u64,
}

/// Per-tier counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub memory: TierStats,
    pub persistent: TierStats,
    pub semantic: TierStats,
}

impl CacheStats {
    /// Counters for one tier.
    pub fn tier(&self, tier: CacheTier) -> TierStats {
        match tier {
            CacheTier::Memory => self.memory,
            CacheTier::Persistent => self.persistent,
            CacheTier::Semantic => self.semantic,
        }
    }
}

/// Entries reclaimed by [`Cache::compact`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub memory: usize,
    pub persistent: usize,
    pub semantic: usize,
}

#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl TierCounters {
    fn snapshot(&self) -> TierStats {
        TierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// The cache facade.
pub struct Cache {
    memory: MemoryTier,
    persistent: Option<PersistentTier>,
    semantic: Option<SemanticTier>,
    embedder: Arc<dyn Embedder>,
    config: CacheConfig,
    clock: SharedClock,
    counters: [TierCounters; 3],
}

impl Cache {
    /// Build all tiers from configuration.
    ///
    /// If the L2 database cannot be opened the cache runs without it and
    /// logs a warning.
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        let persistent = match PersistentTier::open(&config.l2_path, clock.clone()) {
            Ok(tier) => Some(tier),
            Err(e) => {
                warn!(path = ?config.l2_path, error = %e, "persistent cache tier unavailable");
                None
            }
        };
        Self::with_persistent(config, clock, persistent)
    }

    /// Build with an explicit (or no) L2 tier.
    pub fn with_persistent(
        config: CacheConfig,
        clock: SharedClock,
        persistent: Option<PersistentTier>,
    ) -> Self {
        let semantic = config.l3_enabled.then(|| {
            SemanticTier::new(
                config.l3_similarity_threshold,
                config.l3_max_entries_per_category,
                clock.clone(),
            )
        });
        Self {
            memory: MemoryTier::new(config.l1_capacity, clock.clone()),
            persistent,
            semantic,
            embedder: Arc::new(HashingEmbedder::default()),
            config,
            clock,
            counters: Default::default(),
        }
    }

    /// Replace the embedder used by the semantic tier.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether an L2 tier is attached.
    pub fn has_persistent_tier(&self) -> bool {
        self.persistent.is_some()
    }

    /// Whether the semantic tier is enabled.
    pub fn has_semantic_tier(&self) -> bool {
        self.semantic.is_some()
    }

    /// Whether values for `category` are cached at all.
    pub fn is_cacheable(&self, category: Category) -> bool {
        !self.config.ttl_for(category).is_zero()
    }

    /// Return the cached value for `query`, or compute and store it.
    ///
    /// `compute` runs at most once, only on a miss. Its error is returned
    /// unchanged and nothing is written.
    #[instrument(skip(self, query, compute), fields(category = %category))]
    pub async fn get_or_compute<F, Fut>(
        &self,
        query: &str,
        category: Category,
        compute: F,
    ) -> Result<CacheLookup>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        if let Some(hit) = self.lookup(query, category).await {
            return Ok(hit);
        }
        let value = compute().await?;
        self.put(query, category, &value).await;
        Ok(CacheLookup::computed(value))
    }

    /// Look a query up in L1, then L2, then L3.
    pub async fn lookup(&self, query: &str, category: Category) -> Option<CacheLookup> {
        if !self.is_cacheable(category) {
            self.record_miss(CacheTier::Memory);
            return None;
        }
        let key = cache_key(query, category);

        if let Some(entry) = self.memory.get(&key) {
            self.record_hit(CacheTier::Memory);
            debug!(tier = "l1", "cache hit");
            return Some(CacheLookup::hit(entry.value, CacheTier::Memory));
        }
        self.record_miss(CacheTier::Memory);

        if let Some(entry) = self.lookup_persistent(&key).await {
            // L1 holds its own copy of the row.
            self.memory.insert(CacheEntry::new(
                entry.key,
                entry.value.clone(),
                entry.category,
                entry.created_at,
                entry.ttl,
            ));
            debug!(tier = "l2", "cache hit");
            return Some(CacheLookup::hit(entry.value, CacheTier::Persistent));
        }

        if self.config.is_semantic(category)
            && let Some(value) = self.lookup_semantic(query, category).await
        {
            debug!(tier = "l3", "cache hit");
            return Some(CacheLookup::hit(value, CacheTier::Semantic));
        }

        None
    }

    async fn lookup_persistent(&self, key: &str) -> Option<CacheEntry> {
        let persistent = self.persistent.as_ref()?;
        match tokio::time::timeout(self.config.lookup_timeout(), persistent.get(key)).await {
            Ok(Ok(Some(entry))) => {
                self.record_hit(CacheTier::Persistent);
                Some(entry)
            }
            Ok(Ok(None)) => {
                self.record_miss(CacheTier::Persistent);
                None
            }
            Ok(Err(e)) => {
                self.record_error(CacheTier::Persistent, &e.to_string());
                None
            }
            Err(_) => {
                self.record_error(CacheTier::Persistent, "lookup timed out");
                None
            }
        }
    }

    async fn lookup_semantic(&self, query: &str, category: Category) -> Option<String> {
        let semantic = self.semantic.as_ref()?;
        let search = async {
            let vector = self.embedder.embed(query).await?;
            let Some(found) = semantic.search(category, &vector) else {
                return Ok(None);
            };
            let value = self.resolve_pointer(&found.source_key).await?;
            if value.is_none() {
                // Pointer outlived its value.
                semantic.remove(&found.source_key);
            }
            Ok::<_, crate::SwitchboardError>(value)
        };

        match tokio::time::timeout(self.config.lookup_timeout(), search).await {
            Ok(Ok(Some(value))) => {
                self.record_hit(CacheTier::Semantic);
                Some(value)
            }
            Ok(Ok(None)) => {
                self.record_miss(CacheTier::Semantic);
                None
            }
            Ok(Err(e)) => {
                self.record_error(CacheTier::Semantic, &e.to_string());
                None
            }
            Err(_) => {
                self.record_error(CacheTier::Semantic, "lookup timed out");
                None
            }
        }
    }

    async fn resolve_pointer(&self, source_key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.memory.get(source_key) {
            return Ok(Some(entry.value));
        }
        match &self.persistent {
            Some(persistent) => Ok(persistent.get(source_key).await?.map(|e| e.value)),
            None => Ok(None),
        }
    }

    /// Write a value through to every tier.
    ///
    /// Categories with a zero TTL are never written. Tier write failures are
    /// logged and otherwise ignored.
    pub async fn put(&self, query: &str, category: Category, value: &str) {
        let ttl = self.config.ttl_for(category);
        if ttl.is_zero() {
            return;
        }
        let key = cache_key(query, category);
        let entry = CacheEntry::new(key.clone(), value, category, self.clock.now_millis(), ttl);
        let expires_at = entry.expires_at();
        let created_at = entry.created_at;

        self.memory.insert(entry.clone());

        if let Some(persistent) = &self.persistent {
            match tokio::time::timeout(self.config.lookup_timeout(), persistent.put(entry)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.record_write_error(CacheTier::Persistent, &e.to_string()),
                Err(_) => self.record_write_error(CacheTier::Persistent, "write timed out"),
            }
        }

        if let Some(semantic) = &self.semantic
            && self.config.is_semantic(category)
        {
            match tokio::time::timeout(self.config.lookup_timeout(), self.embedder.embed(query))
                .await
            {
                Ok(Ok(vector)) => semantic.insert(
                    category,
                    EmbeddingRecord {
                        vector,
                        source_key: key,
                        created_at,
                        expires_at,
                    },
                ),
                Ok(Err(e)) => self.record_write_error(CacheTier::Semantic, &e.to_string()),
                Err(_) => self.record_write_error(CacheTier::Semantic, "embedding timed out"),
            }
        }
    }

    /// Expired value for `query`, used only as a last-resort fallback.
    ///
    /// Reads L2 regardless of TTL (rows stay on disk until the sweep's grace
    /// period passes). Never counted as a hit.
    pub async fn get_stale(&self, query: &str, category: Category) -> Option<CacheLookup> {
        let persistent = self.persistent.as_ref()?;
        let key = cache_key(query, category);
        match tokio::time::timeout(
            self.config.lookup_timeout(),
            persistent.get_including_expired(&key),
        )
        .await
        {
            Ok(Ok(entry)) => {
                entry.map(|e| CacheLookup::stale(e.value, CacheTier::Persistent))
            }
            Ok(Err(e)) => {
                warn!(tier = "l2", error = %e, "stale lookup failed");
                None
            }
            Err(_) => {
                warn!(tier = "l2", "stale lookup timed out");
                None
            }
        }
    }

    /// Remove a query's value from every tier.
    pub async fn invalidate(&self, query: &str, category: Category) {
        let key = cache_key(query, category);
        self.memory.invalidate(&key);
        if let Some(semantic) = &self.semantic {
            semantic.remove(&key);
        }
        if let Some(persistent) = &self.persistent {
            let persistent = persistent.clone();
            let result =
                tokio::task::spawn_blocking(move || persistent.delete_blocking(&key)).await;
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(tier = "l2", error = %e, "invalidate failed"),
                Err(e) => warn!(tier = "l2", error = %e, "invalidate task failed"),
            }
        }
    }

    /// Reclaim expired entries in every tier.
    ///
    /// L2 keeps expired rows for `stale_grace_secs` so stale fallback still
    /// works; only older rows are deleted.
    pub async fn compact(&self) -> CompactionReport {
        let mut report = CompactionReport {
            memory: self.memory.purge_expired(),
            ..Default::default()
        };
        if let Some(semantic) = &self.semantic {
            report.semantic = semantic.purge_expired();
        }
        if let Some(persistent) = &self.persistent {
            match persistent.sweep(self.config.stale_grace()).await {
                Ok(removed) => report.persistent = removed,
                Err(e) => warn!(tier = "l2", error = %e, "sweep failed"),
            }
        }
        debug!(?report, "cache compacted");
        report
    }

    /// Run [`compact`](Self::compact) every `interval` until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.compact().await;
            }
        })
    }

    /// Per-tier hit/miss counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory: self.counters[0].snapshot(),
            persistent: self.counters[1].snapshot(),
            semantic: self.counters[2].snapshot(),
        }
    }

    /// Entries resident in L1.
    pub fn memory_len(&self) -> u64 {
        self.memory.len()
    }

    fn counters(&self, tier: CacheTier) -> &TierCounters {
        match tier {
            CacheTier::Memory => &self.counters[0],
            CacheTier::Persistent => &self.counters[1],
            CacheTier::Semantic => &self.counters[2],
        }
    }

    fn record_hit(&self, tier: CacheTier) {
        self.counters(tier).hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_HITS_TOTAL, "tier" => tier.as_str()).increment(1);
    }

    fn record_miss(&self, tier: CacheTier) {
        self.counters(tier).misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "tier" => tier.as_str()).increment(1);
    }

    fn record_error(&self, tier: CacheTier, message: &str) {
        warn!(tier = tier.as_str(), error = message, "cache tier lookup failed, treating as miss");
        self.counters(tier).errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_ERRORS_TOTAL, "tier" => tier.as_str()).increment(1);
        self.record_miss(tier);
    }

    fn record_write_error(&self, tier: CacheTier, message: &str) {
        warn!(tier = tier.as_str(), error = message, "cache tier write failed");
        self.counters(tier).errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_ERRORS_TOTAL, "tier" => tier.as_str()).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::SwitchboardError;
    use crate::clock::ManualClock;

    const T0: i64 = 1_700_000_000_000;

    fn config() -> CacheConfig {
        CacheConfig {
            l1_capacity: 16,
            ..CacheConfig::default()
        }
    }

    fn cache_with_l2(config: CacheConfig) -> (Cache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let l2 = PersistentTier::in_memory(clock.clone()).unwrap();
        (Cache::with_persistent(config, clock.clone(), Some(l2)), clock)
    }

    /// Maps fixed queries to fixed vectors.
    struct TableEmbedder(HashMap<&'static str, Vec<f32>>);

    #[async_trait]
    impl Embedder for TableEmbedder {
        fn name(&self) -> &str {
            "table"
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.0
                .get(text)
                .cloned()
                .ok_or_else(|| SwitchboardError::Stream(format!("no vector for {text}")))
        }
    }

    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        fn name(&self) -> &str {
            "slow"
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![1.0])
        }
    }

    #[tokio::test]
    async fn second_call_hits_without_computing() {
        let (cache, _) = cache_with_l2(config());
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let compute = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok("Paris".to_string())
        };

        let first = cache
            .get_or_compute("capital of france", Category::StaticKnowledge, compute)
            .await
            .unwrap();
        assert!(!first.hit);
        let second = cache
            .get_or_compute("capital of france", Category::StaticKnowledge, compute)
            .await
            .unwrap();
        assert!(second.hit);
        assert_eq!(second.tier, Some(CacheTier::Memory));
        assert_eq!(second.value, "Paris");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_ttl_category_is_never_cached() {
        let (cache, _) = cache_with_l2(config());
        for _ in 0..2 {
            let lookup = cache
                .get_or_compute("how are you", Category::Conversational, || async {
                    Ok("fine".to_string())
                })
                .await
                .unwrap();
            assert!(!lookup.hit);
        }
        assert_eq!(cache.memory_len(), 0);
        assert!(cache.get_stale("how are you", Category::Conversational).await.is_none());
    }

    #[tokio::test]
    async fn compute_error_is_returned_and_nothing_written() {
        let (cache, _) = cache_with_l2(config());
        let err = cache
            .get_or_compute("q", Category::General, || async {
                Err(SwitchboardError::AllProvidersUnavailable { attempts: 2 })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::AllProvidersUnavailable { .. }));
        assert!(cache.lookup("q", Category::General).await.is_none());
    }

    #[tokio::test]
    async fn persistent_hit_is_promoted_to_memory() {
        let (cache, _) = cache_with_l2(config());
        cache.put("q", Category::General, "v").await;
        cache.memory.clear();

        let first = cache.lookup("q", Category::General).await.unwrap();
        assert_eq!(first.tier, Some(CacheTier::Persistent));
        let second = cache.lookup("q", Category::General).await.unwrap();
        assert_eq!(second.tier, Some(CacheTier::Memory));
        assert_eq!(cache.stats().persistent.hits, 1);
    }

    #[tokio::test]
    async fn semantic_hit_for_near_duplicate() {
        let embedder = TableEmbedder(HashMap::from([
            ("capital of france", vec![1.0, 0.0, 0.0]),
            ("france capital city", vec![0.99, 0.05, 0.0]),
            ("sourdough recipe", vec![0.0, 1.0, 0.0]),
        ]));
        let (cache, _) = cache_with_l2(config());
        let cache = cache.with_embedder(Arc::new(embedder));

        cache.put("capital of france", Category::StaticKnowledge, "Paris").await;

        let near = cache
            .lookup("france capital city", Category::StaticKnowledge)
            .await
            .unwrap();
        assert_eq!(near.tier, Some(CacheTier::Semantic));
        assert_eq!(near.value, "Paris");

        assert!(cache.lookup("sourdough recipe", Category::StaticKnowledge).await.is_none());
        assert_eq!(cache.stats().semantic.hits, 1);
        assert_eq!(cache.stats().semantic.misses, 1);
    }

    #[tokio::test]
    async fn non_semantic_category_skips_l3() {
        let (cache, _) = cache_with_l2(config());
        cache.put("headline today", Category::News, "x").await;
        assert!(cache.lookup("other headline", Category::News).await.is_none());
        assert_eq!(cache.stats().semantic, TierStats::default());
    }

    #[tokio::test]
    async fn embedder_error_reads_as_miss() {
        let (cache, _) = cache_with_l2(config());
        let cache = cache.with_embedder(Arc::new(TableEmbedder(HashMap::new())));
        let lookup = cache
            .get_or_compute("anything", Category::General, || async { Ok("v".into()) })
            .await
            .unwrap();
        assert!(!lookup.hit);
        assert!(cache.stats().semantic.errors >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tier_falls_through_on_timeout() {
        let clock = Arc::new(ManualClock::new(T0));
        let cache =
            Cache::with_persistent(config(), clock, None).with_embedder(Arc::new(SlowEmbedder));
        let lookup = cache
            .get_or_compute("q", Category::General, || async { Ok("computed".into()) })
            .await
            .unwrap();
        assert_eq!(lookup.value, "computed");
        assert!(cache.stats().semantic.errors >= 1);
    }

    #[tokio::test]
    async fn failing_persistent_tier_still_computes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let clock = Arc::new(ManualClock::new(T0));
        let l2 = PersistentTier::open(&path, clock.clone()).unwrap();
        let config = CacheConfig {
            l3_enabled: false,
            ..config()
        };
        let cache = Cache::with_persistent(config, clock, Some(l2));

        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE cache_entries")
            .unwrap();

        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let lookup = cache
            .get_or_compute("capital of peru", Category::StaticKnowledge, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("Lima".to_string())
            })
            .await
            .unwrap();
        assert!(!lookup.hit);
        assert_eq!(lookup.value, "Lima");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats().persistent;
        assert!(stats.errors >= 1);
        assert_eq!(stats.hits, 0);

        // L1 still took the write.
        let again = cache.lookup("capital of peru", Category::StaticKnowledge).await.unwrap();
        assert_eq!(again.tier, Some(CacheTier::Memory));
    }

    #[tokio::test]
    async fn blocked_persistent_tier_times_out_and_computes() {
        let clock = Arc::new(ManualClock::new(T0));
        let l2 = PersistentTier::in_memory(clock.clone()).unwrap();
        let config = CacheConfig {
            l3_enabled: false,
            lookup_timeout_ms: 50,
            ..config()
        };
        let cache = Cache::with_persistent(config, clock, Some(l2.clone()));

        // The in-memory pool has a single connection.
        let held = l2.conn().unwrap();
        let lookup = cache
            .get_or_compute("q", Category::General, || async { Ok("computed".into()) })
            .await
            .unwrap();
        assert!(!lookup.hit);
        assert_eq!(lookup.value, "computed");
        let stats = cache.stats().persistent;
        assert!(stats.errors >= 1);
        assert_eq!(stats.misses, 1);
        drop(held);
    }

    #[tokio::test]
    async fn ttl_boundary() {
        let (cache, clock) = cache_with_l2(config());
        cache.put("weather in paris", Category::Weather, "sunny").await;

        clock.advance(Duration::from_secs(30 * 60 - 1));
        assert!(cache.lookup("weather in paris", Category::Weather).await.is_some());

        clock.advance(Duration::from_secs(2));
        assert!(cache.lookup("weather in paris", Category::Weather).await.is_none());
    }

    #[tokio::test]
    async fn stale_value_survives_expiry_until_grace() {
        let (cache, clock) = cache_with_l2(CacheConfig {
            stale_grace_secs: 3_600,
            ..config()
        });
        cache.put("weather in paris", Category::Weather, "sunny").await;
        clock.advance(Duration::from_secs(31 * 60));

        assert!(cache.lookup("weather in paris", Category::Weather).await.is_none());
        let stale = cache.get_stale("weather in paris", Category::Weather).await.unwrap();
        assert!(stale.stale);
        assert!(!stale.hit);
        assert_eq!(stale.value, "sunny");

        clock.advance(Duration::from_secs(2 * 3_600));
        let report = cache.compact().await;
        assert_eq!(report.persistent, 1);
        assert!(cache.get_stale("weather in paris", Category::Weather).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_removes_from_every_tier() {
        let (cache, _) = cache_with_l2(config());
        cache.put("q", Category::General, "v").await;
        cache.invalidate("q", Category::General).await;
        assert!(cache.lookup("q", Category::General).await.is_none());
        assert!(cache.get_stale("q", Category::General).await.is_none());
    }

    #[tokio::test]
    async fn runs_without_persistent_tier() {
        let clock = Arc::new(ManualClock::new(T0));
        let cache = Cache::with_persistent(config(), clock, None);
        assert!(!cache.has_persistent_tier());
        cache.put("q", Category::General, "v").await;
        assert!(cache.lookup("q", Category::General).await.unwrap().hit);
    }
}
