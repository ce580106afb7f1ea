//! SQLite-backed persistent tier (L2).
//!
//! One table, keyed by `key`, survives process restarts. TTL is enforced at
//! read time: an expired row reads as a miss but stays on disk until the
//! periodic sweep reclaims it, so the facade can still serve it as an
//! explicitly stale answer when every provider is down. Writes are
//! idempotent upserts.
//!
//! The connection pool is opened once and closed when the last handle is
//! dropped. All methods are blocking; the async wrappers run them on the
//! blocking thread pool so a slow disk never stalls unrelated requests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::clock::SharedClock;
use crate::types::{CacheEntry, Category};
use crate::{Result, SwitchboardError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key         TEXT PRIMARY KEY NOT NULL,
    value       BLOB NOT NULL,
    category    TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    ttl_seconds INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_entries_expiry
    ON cache_entries (created_at + ttl_seconds);
"#;

/// Maximum pooled connections for file-backed databases.
const MAX_POOL_SIZE: u32 = 8;

/// Row shape as stored.
type Row = (Vec<u8>, String, i64, i64);

/// Persistent tier handle. Cheap to clone.
#[derive(Clone)]
pub struct PersistentTier {
    pool: Arc<Pool<SqliteConnectionManager>>,
    clock: SharedClock,
}

impl PersistentTier {
    /// Open (creating if needed) the database file at `path`.
    pub fn open(path: impl AsRef<Path>, clock: SharedClock) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                SwitchboardError::Storage(format!("Failed to create {parent:?}: {e}"))
            })?;
        }
        let manager = SqliteConnectionManager::file(path).with_init(Self::configure_connection);
        let pool = Pool::builder()
            .max_size(MAX_POOL_SIZE)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)
            .map_err(|e| {
                SwitchboardError::Storage(format!("Failed to create connection pool: {e}"))
            })?;
        let tier = Self {
            pool: Arc::new(pool),
            clock,
        };
        tier.initialize()?;
        Ok(tier)
    }

    /// Open a private in-memory database (tests, or when no path is usable).
    pub fn in_memory(clock: SharedClock) -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        // A single connection: each in-memory connection is its own database.
        let pool = Pool::builder().max_size(1).build(manager).map_err(|e| {
            SwitchboardError::Storage(format!("Failed to create in-memory pool: {e}"))
        })?;
        let tier = Self {
            pool: Arc::new(pool),
            clock,
        };
        tier.initialize()?;
        Ok(tier)
    }

    fn configure_connection(conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
    }

    fn initialize(&self) -> Result<()> {
        self.conn()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| {
            SwitchboardError::Storage(format!("Failed to acquire database connection: {e}"))
        })
    }

    // ========================================================================
    // Blocking operations
    // ========================================================================

    /// Read a live entry; expired rows are a miss.
    pub fn get_blocking(&self, key: &str) -> Result<Option<CacheEntry>> {
        let now = self.clock.now_millis();
        Ok(self
            .read_row(key)?
            .filter(|entry| !entry.is_expired_at(now)))
    }

    /// Read an entry regardless of expiry.
    pub fn get_including_expired_blocking(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.read_row(key)
    }

    fn read_row(&self, key: &str) -> Result<Option<CacheEntry>> {
        let conn = self.conn()?;
        let row: Option<Row> = conn
            .query_row(
                "SELECT value, category, created_at, ttl_seconds
                 FROM cache_entries WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((value, category, created_at, ttl_seconds)) = row else {
            return Ok(None);
        };
        let category: Category = category.parse()?;
        let value = String::from_utf8(value)
            .map_err(|e| SwitchboardError::Storage(format!("non-UTF-8 value for {key}: {e}")))?;
        Ok(Some(CacheEntry::new(
            key,
            value,
            category,
            created_at.saturating_mul(1_000),
            Duration::from_secs(ttl_seconds.max(0) as u64),
        )))
    }

    /// Insert or replace an entry.
    pub fn put_blocking(&self, entry: &CacheEntry) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cache_entries (key, value, category, created_at, ttl_seconds)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                category = excluded.category,
                created_at = excluded.created_at,
                ttl_seconds = excluded.ttl_seconds",
            params![
                entry.key,
                entry.value.as_bytes(),
                entry.category.as_str(),
                entry.created_at.div_euclid(1_000),
                entry.ttl.as_secs().min(i64::MAX as u64) as i64,
            ],
        )?;
        Ok(())
    }

    /// Delete one key.
    pub fn delete_blocking(&self, key: &str) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    /// Delete rows that expired more than `grace` ago. Returns rows removed.
    pub fn sweep_blocking(&self, grace: Duration) -> Result<usize> {
        let cutoff = self.clock.now_secs() - grace.as_secs().min(i64::MAX as u64) as i64;
        let removed = self.conn()?.execute(
            "DELETE FROM cache_entries WHERE created_at + ttl_seconds < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            debug!(removed, "persistent tier sweep reclaimed rows");
        }
        Ok(removed)
    }

    /// Number of rows on disk, expired or not.
    pub fn len_blocking(&self) -> Result<u64> {
        let count: i64 =
            self.conn()?
                .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    // ========================================================================
    // Async wrappers (blocking pool)
    // ========================================================================

    async fn run_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&PersistentTier) -> Result<T> + Send + 'static,
    {
        let tier = self.clone();
        tokio::task::spawn_blocking(move || f(&tier))
            .await
            .map_err(|e| SwitchboardError::Storage(format!("blocking task failed: {e}")))?
    }

    /// Async [`get_blocking`](Self::get_blocking).
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let key = key.to_owned();
        self.run_blocking(move |tier| tier.get_blocking(&key)).await
    }

    /// Async [`get_including_expired_blocking`](Self::get_including_expired_blocking).
    pub async fn get_including_expired(&self, key: &str) -> Result<Option<CacheEntry>> {
        let key = key.to_owned();
        self.run_blocking(move |tier| tier.get_including_expired_blocking(&key))
            .await
    }

    /// Async [`put_blocking`](Self::put_blocking).
    pub async fn put(&self, entry: CacheEntry) -> Result<()> {
        self.run_blocking(move |tier| tier.put_blocking(&entry)).await
    }

    /// Async [`sweep_blocking`](Self::sweep_blocking).
    pub async fn sweep(&self, grace: Duration) -> Result<usize> {
        self.run_blocking(move |tier| tier.sweep_blocking(grace))
            .await
    }
}
