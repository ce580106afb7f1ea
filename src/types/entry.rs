//! Cache entries and lookup results.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::Category;

/// Which cache tier produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CacheTier {
    /// In-process LRU.
    Memory,
    /// SQLite-backed store surviving restarts.
    Persistent,
    /// Embedding similarity index.
    Semantic,
}

impl CacheTier {
    /// All tiers in lookup order.
    pub const ALL: [CacheTier; 3] = [CacheTier::Memory, CacheTier::Persistent, CacheTier::Semantic];

    /// Short label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "l1",
            Self::Persistent => "l2",
            Self::Semantic => "l3",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cached response.
///
/// Each tier owns its own copy; an L1 entry is a cache of the L2 row, not a
/// view of it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Stable hash of normalized query + category.
    pub key: String,
    /// Response payload.
    pub value: String,
    /// Category the entry was written under.
    pub category: Category,
    /// Creation time, Unix epoch milliseconds.
    pub created_at: i64,
    /// Lifetime from `created_at`.
    pub ttl: Duration,
    /// Number of times this copy has been served.
    pub hit_count: u64,
}

impl CacheEntry {
    /// Create a fresh entry.
    pub fn new(
        key: impl Into<String>,
        value: impl Into<String>,
        category: Category,
        created_at: i64,
        ttl: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            category,
            created_at,
            ttl,
            hit_count: 0,
        }
    }

    /// Epoch millisecond after which the entry must not be served.
    pub fn expires_at(&self) -> i64 {
        self.created_at
            .saturating_add(self.ttl.as_millis().min(i64::MAX as u128) as i64)
    }

    /// An entry is expired once `now > created_at + ttl`.
    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        now_millis > self.expires_at()
    }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup {
    /// The cached or freshly computed value.
    pub value: String,
    /// `true` when served from a tier without running the compute function.
    pub hit: bool,
    /// Tier that served the hit, if any.
    pub tier: Option<CacheTier>,
    /// `true` when the value is past its TTL and served only as a fallback.
    pub stale: bool,
}

impl CacheLookup {
    pub(crate) fn hit(value: String, tier: CacheTier) -> Self {
        Self {
            value,
            hit: true,
            tier: Some(tier),
            stale: false,
        }
    }

    pub(crate) fn computed(value: String) -> Self {
        Self {
            value,
            hit: false,
            tier: None,
            stale: false,
        }
    }

    pub(crate) fn stale(value: String, tier: CacheTier) -> Self {
        Self {
            value,
            hit: false,
            tier: Some(tier),
            stale: true,
        }
    }
}
