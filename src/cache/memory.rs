//! In-process LRU tier (L1).
//!
//! Backed by moka with the strict LRU eviction policy so that capacity
//! pressure always removes the least-recently-used entry. Expiry is checked
//! against the shared [`Clock`](crate::clock::Clock) on every read: an
//! expired entry is purged and reported as a miss. moka's own per-entry
//! expiry mirrors the TTL so memory is reclaimed even for keys never read
//! again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;

use crate::clock::SharedClock;
use crate::types::CacheEntry;

/// Upper bound on moka's own expiry timer; the clock check still applies.
const MAX_RECLAIM_AFTER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Stored value: the entry plus a hit counter shared by all readers.
#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    hits: AtomicU64,
}

/// Reclaims slots after their TTL in real time.
struct SlotExpiry;

impl Expiry<String, Arc<Slot>> for SlotExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<Slot>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.entry.ttl.min(MAX_RECLAIM_AFTER))
    }
}

/// Least-recently-used in-memory tier with lazy TTL expiry.
pub struct MemoryTier {
    cache: Cache<String, Arc<Slot>>,
    clock: SharedClock,
}

impl MemoryTier {
    /// Create a tier holding at most `capacity` entries.
    pub fn new(capacity: u64, clock: SharedClock) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(SlotExpiry)
            .build();
        Self { cache, clock }
    }

    /// Look up a live entry, refreshing its recency.
    ///
    /// An expired entry is removed and `None` is returned.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let slot = self.cache.get(key)?;
        if slot.entry.is_expired_at(self.clock.now_millis()) {
            self.cache.invalidate(key);
            return None;
        }
        let hits = slot.hits.fetch_add(1, Ordering::Relaxed) + 1;
        let mut entry = slot.entry.clone();
        entry.hit_count = hits;
        Some(entry)
    }

    /// Insert (or overwrite) an entry; evicts the LRU entry when full.
    pub fn insert(&self, entry: CacheEntry) {
        let slot = Arc::new(Slot {
            hits: AtomicU64::new(entry.hit_count),
            entry,
        });
        self.cache.insert(slot.entry.key.clone(), slot);
        // Apply recency updates and capacity eviction now rather than lazily,
        // so the entry count and LRU order are exact after each write.
        self.cache.run_pending_tasks();
    }

    /// Remove one key.
    pub fn invalidate(&self, key: &str) {
        self.cache.invalidate(key);
    }

    /// Drop every entry whose TTL has passed. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let expired: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired_at(now))
            .map(|(key, _)| key)
            .collect();
        for key in &expired {
            self.cache.invalidate(key.as_str());
        }
        self.cache.run_pending_tasks();
        expired.len()
    }

    /// Whether a key is currently resident (does not touch recency).
    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    /// Number of resident entries.
    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    /// Whether the tier is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict everything.
    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }
}
