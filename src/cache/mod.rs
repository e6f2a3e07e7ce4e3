//! Attachment blob cache - byte-budgeted LRU over SQLite
//!
//! Holds both freshly captured blobs (still waiting for upload) and copies of
//! already-synced ones, so that display never needs the network when the
//! data is local. When the total size exceeds the budget, entries are
//! evicted least-recently-accessed first. Entries with a pending upload are
//! pinned: they may be the only copy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use crate::db::{Database, DbResult};

/// 64 MiB
pub const DEFAULT_BUDGET_BYTES: u64 = 64 * 1024 * 1024;

/// Blob cache backed by the `blob_cache` table
#[derive(Clone)]
pub struct BlobCache {
    db: Arc<Database>,
    budget_bytes: u64,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl BlobCache {
    pub fn new(db: Arc<Database>, budget_bytes: u64) -> Self {
        Self {
            db,
            budget_bytes,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Store a synced blob, then trim to budget
    pub fn insert(&self, content_id: &str, blob: &[u8]) -> DbResult<()> {
        self.store(content_id, blob, false)
    }

    /// Store a blob together with its pending-upload marker, atomically
    pub fn insert_pending(&self, content_id: &str, blob: &[u8]) -> DbResult<()> {
        self.store(content_id, blob, true)
    }

    fn store(&self, content_id: &str, blob: &[u8], pending: bool) -> DbResult<()> {
        let now = chrono::Utc::now().timestamp_millis();

        self.db.with_transaction(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO blob_cache (content_id, blob, size_bytes, last_access, access_seq)
                 VALUES (?1, ?2, ?3, ?4, (SELECT COALESCE(MAX(access_seq), 0) + 1 FROM blob_cache))",
                params![content_id, blob, blob.len() as i64, now],
            )?;
            if pending {
                tx.execute(
                    "INSERT OR IGNORE INTO pending_uploads (content_id, created_at) VALUES (?1, ?2)",
                    params![content_id, now],
                )?;
            }
            Ok(())
        })?;

        self.evict()?;
        Ok(())
    }

    /// Get a blob and mark it as most recently used
    pub fn get(&self, content_id: &str) -> DbResult<Option<Vec<u8>>> {
        let blob = self.db.with_transaction(|tx| {
            let blob: Option<Vec<u8>> = tx
                .query_row(
                    "SELECT blob FROM blob_cache WHERE content_id = ?1",
                    params![content_id],
                    |row| row.get(0),
                )
                .optional()?;

            if blob.is_some() {
                tx.execute(
                    "UPDATE blob_cache
                     SET last_access = ?2,
                         access_seq = (SELECT MAX(access_seq) + 1 FROM blob_cache)
                     WHERE content_id = ?1",
                    params![content_id, chrono::Utc::now().timestamp_millis()],
                )?;
            }
            Ok(blob)
        })?;

        let counter = if blob.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(blob)
    }

    /// Read a blob without touching recency or hit counters
    pub fn peek(&self, content_id: &str) -> DbResult<Option<Vec<u8>>> {
        let conn = self.db.get_conn()?;
        let blob = conn
            .query_row(
                "SELECT blob FROM blob_cache WHERE content_id = ?1",
                params![content_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob)
    }

    pub fn contains(&self, content_id: &str) -> DbResult<bool> {
        self.db.query_row(
            "SELECT COUNT(*) > 0 FROM blob_cache WHERE content_id = ?1",
            params![content_id],
            |row| row.get(0),
        )
    }

    pub fn remove(&self, content_id: &str) -> DbResult<bool> {
        let removed = self.db.execute(
            "DELETE FROM blob_cache WHERE content_id = ?1",
            params![content_id],
        )?;
        Ok(removed > 0)
    }

    /// Evict least recently used unpinned entries until under budget.
    /// Returns the number of evicted entries.
    pub fn evict(&self) -> DbResult<usize> {
        let budget = self.budget_bytes as i64;

        let evicted = self.db.with_transaction(|tx| {
            let mut total: i64 = tx.query_row(
                "SELECT COALESCE(SUM(size_bytes), 0) FROM blob_cache",
                [],
                |row| row.get(0),
            )?;

            let mut evicted = 0;
            while total > budget {
                let victim: Option<(String, i64)> = tx
                    .query_row(
                        "SELECT content_id, size_bytes FROM blob_cache
                         WHERE content_id NOT IN (SELECT content_id FROM pending_uploads)
                         ORDER BY access_seq ASC
                         LIMIT 1",
                        [],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                // Only pinned entries left
                let Some((content_id, size)) = victim else { break };

                tx.execute("DELETE FROM blob_cache WHERE content_id = ?1", params![content_id])?;
                total -= size;
                evicted += 1;
            }
            Ok(evicted)
        })?;

        if evicted > 0 {
            log::debug!("Blob cache: evicted {} entries to stay under {} bytes", evicted, budget);
        }
        Ok(evicted)
    }

    pub fn stats(&self) -> DbResult<CacheStats> {
        let (entry_count, total_bytes, pinned_bytes): (i64, i64, i64) = self.db.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(size_bytes), 0),
                COALESCE(SUM(CASE WHEN content_id IN (SELECT content_id FROM pending_uploads)
                                  THEN size_bytes ELSE 0 END), 0)
             FROM blob_cache",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_requests = hits + misses;
        let hit_rate = if total_requests > 0 {
            (hits as f64 / total_requests as f64) * 100.0
        } else {
            0.0
        };

        Ok(CacheStats {
            hits,
            misses,
            total_requests,
            hit_rate,
            entry_count: entry_count as u64,
            total_bytes: total_bytes as u64,
            pinned_bytes: pinned_bytes as u64,
            budget_bytes: self.budget_bytes,
        })
    }
}

/// Cache statistics
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,

    /// Cache hit rate (percentage)
    pub hit_rate: f64,

    pub entry_count: u64,
    pub total_bytes: u64,

    /// Bytes held by entries that are waiting for upload
    pub pinned_bytes: u64,

    pub budget_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(budget: u64) -> BlobCache {
        BlobCache::new(Arc::new(Database::in_memory().unwrap()), budget)
    }

    #[test]
    fn test_insert_and_get() {
        let cache = cache(DEFAULT_BUDGET_BYTES);
        cache.insert("a", b"hello").unwrap();

        assert_eq!(cache.get("a").unwrap().as_deref(), Some(&b"hello"[..]));
        assert!(cache.get("missing").unwrap().is_none());

        let stats = cache.stats().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_bytes, 5);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = cache(10);
        cache.insert("a", &[0; 4]).unwrap();
        cache.insert("b", &[0; 4]).unwrap();

        // touch "a" so "b" becomes the oldest
        cache.get("a").unwrap();
        cache.insert("c", &[0; 4]).unwrap();

        assert!(cache.contains("a").unwrap());
        assert!(!cache.contains("b").unwrap());
        assert!(cache.contains("c").unwrap());
        assert!(cache.stats().unwrap().total_bytes <= 10);
    }

    #[test]
    fn test_pending_entries_are_never_evicted() {
        let cache = cache(4);
        cache.insert_pending("p1", &[1; 3]).unwrap();
        cache.insert_pending("p2", &[2; 3]).unwrap();
        cache.insert("s1", &[3; 3]).unwrap();

        assert!(cache.contains("p1").unwrap());
        assert!(cache.contains("p2").unwrap());
        assert!(!cache.contains("s1").unwrap());

        let stats = cache.stats().unwrap();
        assert_eq!(stats.pinned_bytes, 6);
        assert_eq!(stats.entry_count, 2);
    }

    #[test]
    fn test_peek_does_not_count() {
        let cache = cache(DEFAULT_BUDGET_BYTES);
        cache.insert("a", b"x").unwrap();
        assert!(cache.peek("a").unwrap().is_some());
        assert_eq!(cache.stats().unwrap().total_requests, 0);
        assert!(cache.remove("a").unwrap());
        assert!(!cache.remove("a").unwrap());
    }
}
