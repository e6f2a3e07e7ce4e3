//! Attachment Offline Queue - durable upload queue for binary attachments
//!
//! Attachments are decoupled from record sync:
//! - `enqueue` stores the blob in the local cache and marks it pending, so it
//!   is displayable immediately and survives restarts
//! - `drain` uploads every pending blob; failures stay queued for the next
//!   drain (no backoff, driven by the same triggers as record sync)
//! - `fetch` serves from the cache, downloading and caching on a miss
//!
//! Transactions only hold content ids; deleting a transaction never deletes
//! its attachments synchronously.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::error::{SyncError, SyncResult};
use super::history::{HistoryManager, LogOutcome, SyncDirection};
use crate::cache::{BlobCache, CacheStats};
use crate::db::Database;

// ============================================================================
// Remote Seam
// ============================================================================

/// Binary store on the remote, addressed by caller-supplied content id
#[async_trait]
pub trait AttachmentRemote: Send + Sync {
    /// Returns the id the remote accepted the blob under
    async fn upload(&self, content_id: &str, blob: &[u8]) -> SyncResult<String>;

    async fn fetch(&self, content_id: &str) -> SyncResult<Vec<u8>>;

    async fn delete(&self, content_id: &str) -> SyncResult<()>;
}

// ============================================================================
// Data Types
// ============================================================================

/// A blob waiting for confirmed remote acceptance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpload {
    pub content_id: String,
    pub created_at: i64,
    pub attempts: i32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub uploaded: usize,
    pub failed: usize,
    /// Pending uploads whose blob was missing locally
    pub dropped: usize,
    /// Another drain was already running
    pub coalesced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: i64,
    /// Pending uploads that failed at least once
    pub retrying: i64,
    pub cache: CacheStats,
}

// ============================================================================
// Attachment Queue
// ============================================================================

pub struct AttachmentQueue {
    db: Arc<Database>,
    cache: BlobCache,
    remote: Arc<dyn AttachmentRemote>,
    history: Arc<HistoryManager>,
    draining: Mutex<()>,
}

impl AttachmentQueue {
    pub fn new(
        db: Arc<Database>,
        cache: BlobCache,
        remote: Arc<dyn AttachmentRemote>,
        history: Arc<HistoryManager>,
    ) -> Self {
        Self {
            db,
            cache,
            remote,
            history,
            draining: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &BlobCache {
        &self.cache
    }

    /// Capture a blob locally and queue it for upload. Returns its content id.
    pub fn enqueue(&self, blob: &[u8]) -> Result<String, QueueError> {
        if blob.is_empty() {
            return Err(QueueError::EmptyBlob);
        }

        let content_id = Uuid::new_v4().to_string();
        self.cache
            .insert_pending(&content_id, blob)
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        log::info!("Queued attachment {} ({} bytes)", content_id, blob.len());
        Ok(content_id)
    }

    pub fn pending(&self) -> Result<Vec<PendingUpload>, QueueError> {
        self.db
            .query(
                "SELECT content_id, created_at, attempts, last_error
                 FROM pending_uploads
                 ORDER BY created_at ASC, content_id ASC",
                [],
                |row| {
                    Ok(PendingUpload {
                        content_id: row.get(0)?,
                        created_at: row.get(1)?,
                        attempts: row.get(2)?,
                        last_error: row.get(3)?,
                    })
                },
            )
            .map_err(|e| QueueError::DatabaseError(e.to_string()))
    }

    pub fn is_pending(&self, content_id: &str) -> Result<bool, QueueError> {
        self.db
            .query_row(
                "SELECT COUNT(*) > 0 FROM pending_uploads WHERE content_id = ?1",
                params![content_id],
                |row| row.get(0),
            )
            .map_err(|e| QueueError::DatabaseError(e.to_string()))
    }

    /// Try to upload every pending blob once
    pub async fn drain(&self) -> Result<DrainReport, QueueError> {
        let Ok(_guard) = self.draining.try_lock() else {
            log::debug!("Attachment drain already running");
            return Ok(DrainReport {
                coalesced: true,
                ..Default::default()
            });
        };

        let mut report = DrainReport::default();

        for item in self.pending()? {
            let Some(blob) = self
                .cache
                .peek(&item.content_id)
                .map_err(|e| QueueError::DatabaseError(e.to_string()))?
            else {
                log::warn!("Attachment {} has no local blob, dropping from queue", item.content_id);
                self.remove_pending(&item.content_id)?;
                self.history.record_quietly(
                    SyncDirection::Attachment,
                    LogOutcome::Skipped,
                    &format!("{}: local copy missing", item.content_id),
                    None,
                );
                report.dropped += 1;
                continue;
            };

            match self.remote.upload(&item.content_id, &blob).await {
                Ok(accepted) => {
                    if accepted != item.content_id {
                        log::warn!("Remote accepted {} as {}", item.content_id, accepted);
                    }
                    self.remove_pending(&item.content_id)?;
                    self.history.record_quietly(
                        SyncDirection::Attachment,
                        LogOutcome::Success,
                        &format!("Uploaded {} ({} bytes)", item.content_id, blob.len()),
                        None,
                    );
                    report.uploaded += 1;
                }
                Err(e) => {
                    log::warn!("Attachment upload {} failed: {}", item.content_id, e);
                    self.db
                        .execute(
                            "UPDATE pending_uploads SET attempts = attempts + 1, last_error = ?2
                             WHERE content_id = ?1",
                            params![item.content_id, e.to_string()],
                        )
                        .map_err(|e| QueueError::DatabaseError(e.to_string()))?;
                    self.history.record_quietly(
                        SyncDirection::Attachment,
                        LogOutcome::Failed,
                        &format!("Upload of {} failed: {}", item.content_id, e),
                        Some(&e),
                    );
                    report.failed += 1;
                }
            }
        }

        // Uploaded blobs are no longer pinned
        if report.uploaded > 0 {
            self.cache
                .evict()
                .map_err(|e| QueueError::DatabaseError(e.to_string()))?;
        }

        Ok(report)
    }

    /// Return a blob from the cache, downloading it on a miss
    pub async fn fetch(&self, content_id: &str) -> Result<Vec<u8>, QueueError> {
        if let Some(blob) = self
            .cache
            .get(content_id)
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?
        {
            return Ok(blob);
        }

        let blob = self.remote.fetch(content_id).await?;
        if blob.is_empty() {
            return Err(QueueError::InvalidDownload(format!("{} is empty", content_id)));
        }

        self.cache
            .insert(content_id, &blob)
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;
        Ok(blob)
    }

    /// Delete an attachment everywhere. Blobs that never left the device are
    /// only removed locally.
    pub async fn delete(&self, content_id: &str) -> Result<(), QueueError> {
        if !self.is_pending(content_id)? {
            self.remote.delete(content_id).await?;
        }

        self.remove_pending(content_id)?;
        self.cache
            .remove(content_id)
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    pub fn get_stats(&self) -> Result<QueueStats, QueueError> {
        let (pending, retrying) = self
            .db
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(attempts > 0), 0) FROM pending_uploads",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        let cache = self
            .cache
            .stats()
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        Ok(QueueStats {
            pending,
            retrying,
            cache,
        })
    }

    fn remove_pending(&self, content_id: &str) -> Result<(), QueueError> {
        self.db
            .execute(
                "DELETE FROM pending_uploads WHERE content_id = ?1",
                params![content_id],
            )
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;
        Ok(())
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Attachment is empty")]
    EmptyBlob,

    #[error("Invalid download: {0}")]
    InvalidDownload(String),

    #[error(transparent)]
    Remote(#[from] SyncError),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeRemote {
        blobs: StdMutex<HashMap<String, Vec<u8>>>,
        offline: AtomicBool,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl AttachmentRemote for FakeRemote {
        async fn upload(&self, content_id: &str, blob: &[u8]) -> SyncResult<String> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(SyncError::NetworkFailure("offline".into()));
            }
            self.blobs.lock().unwrap().insert(content_id.to_string(), blob.to_vec());
            Ok(content_id.to_string())
        }

        async fn fetch(&self, content_id: &str) -> SyncResult<Vec<u8>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.blobs
                .lock()
                .unwrap()
                .get(content_id)
                .cloned()
                .ok_or_else(|| SyncError::malformed(content_id, "missing"))
        }

        async fn delete(&self, content_id: &str) -> SyncResult<()> {
            self.blobs.lock().unwrap().remove(content_id);
            Ok(())
        }
    }

    fn queue(budget: u64) -> (AttachmentQueue, Arc<FakeRemote>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let remote = Arc::new(FakeRemote::default());
        let history = Arc::new(HistoryManager::new(db.clone()).unwrap());
        let queue = AttachmentQueue::new(db.clone(), BlobCache::new(db, budget), remote.clone(), history);
        (queue, remote)
    }

    #[tokio::test]
    async fn test_enqueue_is_displayable_offline() {
        let (queue, remote) = queue(1024);
        remote.offline.store(true, Ordering::SeqCst);

        let id = queue.enqueue(b"receipt").unwrap();
        assert_eq!(queue.fetch(&id).await.unwrap(), b"receipt");
        assert_eq!(remote.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_upload_stays_queued() {
        let (queue, remote) = queue(1024);
        let id = queue.enqueue(b"receipt").unwrap();

        remote.offline.store(true, Ordering::SeqCst);
        let report = queue.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(queue.is_pending(&id).unwrap());
        assert_eq!(queue.pending().unwrap()[0].attempts, 1);

        remote.offline.store(false, Ordering::SeqCst);
        let report = queue.drain().await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert!(!queue.is_pending(&id).unwrap());
        assert_eq!(remote.blobs.lock().unwrap().get(&id).unwrap(), b"receipt");
    }

    #[tokio::test]
    async fn test_pending_blob_survives_eviction_until_uploaded() {
        let (queue, _remote) = queue(8);
        let id = queue.enqueue(&[7; 6]).unwrap();
        queue.cache().insert("other", &[1; 6]).unwrap();

        assert!(queue.cache().contains(&id).unwrap());
        assert!(!queue.cache().contains("other").unwrap());

        queue.drain().await.unwrap();
        queue.cache().insert("newer", &[2; 6]).unwrap();
        assert!(!queue.cache().contains(&id).unwrap());
    }

    #[tokio::test]
    async fn test_fetch_downloads_and_caches() {
        let (queue, remote) = queue(1024);
        remote.blobs.lock().unwrap().insert("r1".into(), b"remote".to_vec());

        assert_eq!(queue.fetch("r1").await.unwrap(), b"remote");
        assert_eq!(queue.fetch("r1").await.unwrap(), b"remote");
        assert_eq!(remote.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_download_is_not_cached() {
        let (queue, remote) = queue(1024);
        remote.blobs.lock().unwrap().insert("r1".into(), Vec::new());

        assert!(matches!(queue.fetch("r1").await, Err(QueueError::InvalidDownload(_))));
        assert!(!queue.cache().contains("r1").unwrap());
    }

    #[tokio::test]
    async fn test_delete_local_only_when_never_uploaded() {
        let (queue, remote) = queue(1024);
        remote.blobs.lock().unwrap().insert("r1".into(), b"remote".to_vec());
        let local = queue.enqueue(b"local").unwrap();

        queue.delete(&local).await.unwrap();
        queue.delete("r1").await.unwrap();

        assert!(!queue.cache().contains(&local).unwrap());
        assert!(queue.pending().unwrap().is_empty());
        assert!(remote.blobs.lock().unwrap().is_empty());
    }

    #[test]
    fn test_empty_blob_rejected() {
        let (queue, _remote) = queue(1024);
        assert!(matches!(queue.enqueue(b""), Err(QueueError::EmptyBlob)));
    }
}
