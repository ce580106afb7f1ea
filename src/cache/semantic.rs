//! Embedding-similarity tier (L3).
//!
//! Stores only an embedding plus a pointer (`source_key`) to the value held by
//! the persistent tier. Lookups scan records of the query's category only;
//! the best record wins by highest cosine similarity, then most recent
//! creation. Anything below the threshold is a plain miss.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::Result;
use crate::cache::key::normalize_query;
use crate::clock::SharedClock;
use crate::types::Category;

/// Default dimensionality of [`HashingEmbedder`] vectors.
pub const DEFAULT_DIMENSIONS: usize = 256;

/// Turns a query into a fixed-dimension vector.
///
/// Implementations may call a remote embedding model; the facade bounds each
/// call with the tier lookup timeout.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embedder name for logging/debugging.
    fn name(&self) -> &str;

    /// Embed one query.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Offline embedder based on feature hashing.
///
/// Hashes word unigrams and character trigrams of the normalized query into
/// a fixed number of buckets and L2-normalizes the result. Near-duplicate
/// phrasings land close together without any model download.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(&self, feature: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        feature.hash(&mut hasher);
        (hasher.finish() % self.dimensions as u64) as usize
    }

    /// Synchronous embedding, exposed for callers that need no runtime.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let normalized = normalize_query(text);
        let mut vector = vec![0.0_f32; self.dimensions];

        for word in normalized.split(|c: char| !c.is_alphanumeric()) {
            if word.is_empty() {
                continue;
            }
            vector[self.bucket(word)] += 1.0;

            let padded: Vec<char> = format!(" {word} ").chars().collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                vector[self.bucket(&gram)] += 0.5;
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

/// Cosine similarity; 0.0 for mismatched dimensions or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0_f32, 0.0_f32, 0.0_f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// One indexed embedding.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub vector: Vec<f32>,
    /// Key of the value in the persistent tier.
    pub source_key: String,
    /// Epoch milliseconds.
    pub created_at: i64,
    /// Epoch milliseconds after which the pointed-to value is dead.
    pub expires_at: i64,
}

/// Best record found by [`SemanticTier::search`].
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticMatch {
    pub source_key: String,
    pub similarity: f32,
}

/// Per-category embedding index.
pub struct SemanticTier {
    index: DashMap<Category, Vec<EmbeddingRecord>>,
    threshold: f32,
    max_per_category: usize,
    clock: SharedClock,
}

impl SemanticTier {
    pub fn new(threshold: f32, max_per_category: usize, clock: SharedClock) -> Self {
        Self {
            index: DashMap::new(),
            threshold,
            max_per_category: max_per_category.max(1),
            clock,
        }
    }

    /// Similarity needed for a hit.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Index (or re-index) the embedding for `source_key`.
    ///
    /// When the category is full the oldest record is dropped.
    pub fn insert(&self, category: Category, record: EmbeddingRecord) {
        let mut records = self.index.entry(category).or_default();
        records.retain(|r| r.source_key != record.source_key);
        records.push(record);
        if records.len() > self.max_per_category {
            let oldest = records
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.created_at)
                .map(|(i, _)| i);
            if let Some(i) = oldest {
                records.swap_remove(i);
            }
        }
    }

    /// Nearest live record in `category` at or above the threshold.
    pub fn search(&self, category: Category, vector: &[f32]) -> Option<SemanticMatch> {
        let now = self.clock.now_millis();
        let records = self.index.get(&category)?;

        let best = records
            .iter()
            .filter(|r| now <= r.expires_at)
            .map(|r| (cosine_similarity(&r.vector, vector), r))
            .max_by(|(sim_a, a), (sim_b, b)| {
                sim_a
                    .total_cmp(sim_b)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            })?;

        let (similarity, record) = best;
        (similarity >= self.threshold).then(|| SemanticMatch {
            source_key: record.source_key.clone(),
            similarity,
        })
    }

    /// Drop the record pointing at `source_key`, in any category.
    pub fn remove(&self, source_key: &str) {
        for mut records in self.index.iter_mut() {
            records.retain(|r| r.source_key != source_key);
        }
    }

    /// Drop records whose values have expired. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;
        for mut records in self.index.iter_mut() {
            let before = records.len();
            records.retain(|r| now <= r.expires_at);
            removed += before - records.len();
        }
        removed
    }

    /// Total records across categories.
    pub fn len(&self) -> usize {
        self.index.iter().map(|records| records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::clock::{Clock, ManualClock};

    const T0: i64 = 1_700_000_000_000;

    fn tier(threshold: f32) -> (SemanticTier, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        (SemanticTier::new(threshold, 16, clock.clone()), clock)
    }

    fn record(key: &str, vector: Vec<f32>, created_at: i64) -> EmbeddingRecord {
        EmbeddingRecord {
            vector,
            source_key: key.into(),
            created_at,
            expires_at: created_at + 60_000,
        }
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn hashing_embedder_is_stable_and_normalized() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed_sync("What is the capital of France?");
        let b = embedder.embed_sync("what is the capital of france");
        assert_eq!(a.len(), DEFAULT_DIMENSIONS);
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashing_embedder_separates_unrelated_queries() {
        let embedder = HashingEmbedder::default();
        let a = embedder.embed_sync("capital of france");
        let b = embedder.embed_sync("how do I bake sourdough bread");
        assert!(cosine_similarity(&a, &b) < 0.5);
    }

    #[test]
    fn search_respects_threshold() {
        let (tier, _) = tier(0.92);
        tier.insert(Category::StaticKnowledge, record("k", vec![1.0, 0.0], T0));
        assert!(tier.search(Category::StaticKnowledge, &[1.0, 0.05]).is_some());
        assert!(tier.search(Category::StaticKnowledge, &[1.0, 1.0]).is_none());
    }

    #[test]
    fn search_is_scoped_to_category() {
        let (tier, _) = tier(0.5);
        tier.insert(Category::StaticKnowledge, record("k", vec![1.0, 0.0], T0));
        assert!(tier.search(Category::Weather, &[1.0, 0.0]).is_none());
    }

    #[test]
    fn ties_prefer_most_recent() {
        let (tier, _) = tier(0.5);
        tier.insert(Category::General, record("older", vec![1.0, 0.0], T0));
        tier.insert(Category::General, record("newer", vec![1.0, 0.0], T0 + 5));
        let hit = tier.search(Category::General, &[1.0, 0.0]).unwrap();
        assert_eq!(hit.source_key, "newer");
    }

    #[test]
    fn highest_similarity_wins_over_recency() {
        let (tier, _) = tier(0.5);
        tier.insert(Category::General, record("close", vec![1.0, 0.0], T0));
        tier.insert(Category::General, record("recent", vec![1.0, 0.6], T0 + 5));
        let hit = tier.search(Category::General, &[1.0, 0.0]).unwrap();
        assert_eq!(hit.source_key, "close");
    }

    #[test]
    fn expired_records_are_skipped_and_purged() {
        let (tier, clock) = tier(0.5);
        tier.insert(Category::General, record("k", vec![1.0, 0.0], T0));
        clock.advance(Duration::from_secs(61));
        assert!(tier.search(Category::General, &[1.0, 0.0]).is_none());
        assert_eq!(tier.purge_expired(), 1);
        assert!(tier.is_empty());
    }

    #[test]
    fn reinsert_replaces_and_capacity_drops_oldest() {
        let clock = Arc::new(ManualClock::new(T0));
        let tier = SemanticTier::new(0.99, 2, clock);
        tier.insert(Category::General, record("a", vec![1.0, 0.0], T0));
        tier.insert(Category::General, record("a", vec![0.0, 1.0], T0 + 1));
        assert_eq!(tier.len(), 1);
        tier.insert(Category::General, record("b", vec![1.0, 1.0], T0 + 2));
        tier.insert(Category::General, record("c", vec![1.0, -1.0], T0 + 3));
        assert_eq!(tier.len(), 2);
        // "a" was the oldest and is gone
        assert!(tier.search(Category::General, &[0.0, 1.0]).is_none());
        tier.remove("b");
        assert_eq!(tier.len(), 1);
    }
}
