//! Structured backend adapter
//!
//! Talks to a server that stores individual rows. Pull is incremental from a
//! cursor persisted in settings; push sends every dirty record plus all
//! category groups, and the server applies each row under last-write-wins.

use std::sync::Arc;

use async_trait::async_trait;

use super::api::{PullResponse, PushResponse};
use super::error::SyncResult;
use super::manager::{PushStats, SyncAdapter};
use super::models::{CategoryGroup, SyncBatch};
use super::store::{MergeStats, RecordStore};

const CURSOR_KEY: &str = "structured_cursor";

/// Row-level remote, over HTTP or in-process
#[async_trait]
pub trait StructuredRemote: Send + Sync {
    async fn pull(&self, cursor: i64) -> SyncResult<PullResponse>;

    async fn push(&self, batch: &SyncBatch) -> SyncResult<PushResponse>;

    async fn version(&self) -> SyncResult<i64>;
}

/// Result of one incremental pull
#[derive(Debug, Clone)]
pub struct StructuredSnapshot {
    pub cursor: i64,
    pub version: i64,
    pub records: SyncBatch,
}

pub struct StructuredSyncAdapter {
    store: RecordStore,
    remote: Arc<dyn StructuredRemote>,
}

impl StructuredSyncAdapter {
    pub fn new(store: RecordStore, remote: Arc<dyn StructuredRemote>) -> Self {
        Self { store, remote }
    }

    pub fn cursor(&self) -> SyncResult<i64> {
        Ok(self.store.database().get_setting(CURSOR_KEY)?.unwrap_or(0))
    }

    fn set_cursor(&self, cursor: i64) -> SyncResult<()> {
        self.store.database().set_setting(CURSOR_KEY, &cursor)?;
        Ok(())
    }

    fn has_local_changes(&self, batch: &SyncBatch) -> SyncResult<bool> {
        let dirty_rows = batch.ledgers.len()
            + batch.categories.len()
            + batch.transactions.len()
            + usize::from(batch.settings.is_some());
        Ok(dirty_rows > 0 || !self.store.dirty::<CategoryGroup>()?.is_empty())
    }
}

#[async_trait]
impl SyncAdapter for StructuredSyncAdapter {
    type Snapshot = StructuredSnapshot;

    fn name(&self) -> &'static str {
        "structured"
    }

    async fn pull(&self) -> SyncResult<StructuredSnapshot> {
        let cursor = self.cursor()?;
        let response = self.remote.pull(cursor).await?;
        log::debug!(
            "Pulled {} rows from cursor {} (server version {})",
            response.batch.len(),
            cursor,
            response.version
        );

        Ok(StructuredSnapshot {
            cursor,
            version: response.version,
            records: response.batch,
        })
    }

    async fn merge(&self, snapshot: &StructuredSnapshot) -> SyncResult<MergeStats> {
        Ok(self.store.merge_batch(&snapshot.records)?)
    }

    async fn push(&self, snapshot: &StructuredSnapshot) -> SyncResult<PushStats> {
        let batch = self.store.pending_batch()?;

        if !self.has_local_changes(&batch)? {
            self.set_cursor(snapshot.version)?;
            return Ok(PushStats {
                observed_version: Some(snapshot.version.to_string()),
                ..PushStats::default()
            });
        }

        let response = self.remote.push(&batch).await?;
        self.store.mark_pushed(&batch)?;

        let cursor = next_cursor(snapshot.version, &response);
        self.set_cursor(cursor)?;

        Ok(PushStats {
            written: response.applied,
            skipped: batch.len().saturating_sub(response.applied),
            observed_version: Some(cursor.to_string()),
        })
    }

    async fn remote_version(&self) -> SyncResult<String> {
        Ok(self.remote.version().await?.to_string())
    }
}

/// Skip only past our own version bump. A push that applied nothing bumps
/// nothing, so any newer version belongs to another device whose rows must
/// still come down on the next pull.
fn next_cursor(pulled: i64, response: &PushResponse) -> i64 {
    if response.applied > 0 && response.version == pulled + 1 {
        response.version
    } else {
        pulled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sync::backend::{BackendSession, SyncBackend};
    use crate::sync::models::Ledger;

    fn adapter(backend: &Arc<SyncBackend>, token: &str) -> StructuredSyncAdapter {
        let store = RecordStore::new(Arc::new(Database::in_memory().unwrap()));
        let remote = BackendSession::new(backend.clone(), Some(token.to_string()));
        StructuredSyncAdapter::new(store, Arc::new(remote))
    }

    fn ledger(name: &str) -> Ledger {
        Ledger {
            name: name.to_string(),
            currency: "EUR".to_string(),
            sort_order: 0,
        }
    }

    #[tokio::test]
    async fn test_push_advances_cursor_past_own_write() {
        let backend = Arc::new(SyncBackend::new(Arc::new(Database::in_memory().unwrap())));
        let token = backend.create_account("a").unwrap();
        let adapter = adapter(&backend, &token);

        adapter.store.add_ledger(ledger("Home")).unwrap();

        let snapshot = adapter.pull().await.unwrap();
        assert_eq!(snapshot.version, 0);
        let pushed = adapter.push(&snapshot).await.unwrap();
        assert_eq!(pushed.written, 1);
        assert_eq!(adapter.cursor().unwrap(), 1);
        assert!(adapter.store.dirty::<Ledger>().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clean_store_does_not_push() {
        let backend = Arc::new(SyncBackend::new(Arc::new(Database::in_memory().unwrap())));
        let token = backend.create_account("a").unwrap();
        let adapter = adapter(&backend, &token);

        let snapshot = adapter.pull().await.unwrap();
        let pushed = adapter.push(&snapshot).await.unwrap();
        assert_eq!(pushed.written, 0);
        assert_eq!(pushed.observed_version.as_deref(), Some("0"));
        assert_eq!(adapter.remote_version().await.unwrap(), "0");
    }

    #[tokio::test]
    async fn test_concurrent_push_keeps_cursor_at_pulled_version() {
        let backend = Arc::new(SyncBackend::new(Arc::new(Database::in_memory().unwrap())));
        let token = backend.create_account("a").unwrap();
        let first = adapter(&backend, &token);
        let second = adapter(&backend, &token);

        first.store.add_ledger(ledger("Home")).unwrap();
        let snapshot = first.pull().await.unwrap();

        // another device writes between our pull and push
        second.store.add_ledger(ledger("Work")).unwrap();
        let other = second.pull().await.unwrap();
        second.push(&other).await.unwrap();

        first.push(&snapshot).await.unwrap();
        assert_eq!(first.cursor().unwrap(), 0);

        let next = first.pull().await.unwrap();
        assert!(next.records.ledgers.iter().any(|l| l.data.name == "Work"));
    }

    #[tokio::test]
    async fn test_replayed_push_does_not_skip_other_device_rows() {
        let backend = Arc::new(SyncBackend::new(Arc::new(Database::in_memory().unwrap())));
        let token = backend.create_account("a").unwrap();
        let first = adapter(&backend, &token);
        let second = adapter(&backend, &token);

        // The server applied our push but the response never arrived
        first.store.add_ledger(ledger("Home")).unwrap();
        let pending = first.store.pending_batch().unwrap();
        backend.push(Some(token.as_str()), &pending).unwrap();

        let snapshot = first.pull().await.unwrap();
        assert_eq!(snapshot.version, 1);

        second.store.add_ledger(ledger("Work")).unwrap();
        let other = second.pull().await.unwrap();
        second.push(&other).await.unwrap();

        // The retry applies nothing; version 2 is the other device's write
        let pushed = first.push(&snapshot).await.unwrap();
        assert_eq!(pushed.written, 0);
        assert_eq!(first.cursor().unwrap(), 1);
        assert_eq!(pushed.observed_version.as_deref(), Some("1"));

        let next = first.pull().await.unwrap();
        first.merge(&next).await.unwrap();
        let names: Vec<String> = first
            .store
            .live::<Ledger>()
            .unwrap()
            .into_iter()
            .map(|l| l.data.name)
            .collect();
        assert!(names.contains(&"Work".to_string()));
        assert!(names.contains(&"Home".to_string()));
    }

    #[test]
    fn test_next_cursor_rules() {
        let own = PushResponse { version: 5, applied: 2 };
        assert_eq!(next_cursor(4, &own), 5);

        let interleaved = PushResponse { version: 6, applied: 2 };
        assert_eq!(next_cursor(4, &interleaved), 4);

        let nothing_applied = PushResponse { version: 5, applied: 0 };
        assert_eq!(next_cursor(4, &nothing_applied), 4);
    }
}
