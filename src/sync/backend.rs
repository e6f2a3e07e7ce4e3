//! Reference structured backend
//!
//! Server side of the structured protocol, stored in the same SQLite schema
//! (`backend_*` tables). Each account has a monotonically increasing version;
//! every push that changes at least one row bumps it and stamps the changed
//! rows with the new version, so `pull(cursor)` is a range scan.
//!
//! Rows are upserted under last-write-wins: an incoming row replaces the
//! stored one when its `updatedAt` is newer, or equal with different content.
//! Replaying an identical batch changes nothing.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};

use super::api::{PullResponse, PushResponse};
use super::error::{SyncError, SyncResult};
use super::models::{RecordKind, SyncBatch};
use super::queue::AttachmentRemote;
use super::structured_adapter::StructuredRemote;
use crate::db::{Database, DbError, RecordRow};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl From<BackendError> for SyncError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unauthorized => SyncError::AuthFailure("bearer token rejected".to_string()),
            BackendError::NotFound(what) => SyncError::malformed(what, "not found on server"),
            BackendError::Database(e) => SyncError::NetworkFailure(format!("server storage: {}", e)),
            BackendError::InvalidPayload(reason) => SyncError::malformed("payload", reason),
        }
    }
}

pub struct SyncBackend {
    db: Arc<Database>,
}

impl SyncBackend {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Register an account and return its bearer token
    pub fn create_account(&self, account_id: &str) -> Result<String, BackendError> {
        let token = uuid::Uuid::new_v4().to_string();
        self.db.execute(
            "INSERT INTO backend_accounts (account_id, token, version) VALUES (?1, ?2, 0)",
            params![account_id, token],
        )?;
        log::info!("Created backend account {}", account_id);
        Ok(token)
    }

    /// Resolve a bearer token to its account
    fn authenticate(&self, token: Option<&str>) -> Result<String, BackendError> {
        let token = token.ok_or(BackendError::Unauthorized)?;
        let conn = self.db.get_conn()?;
        conn.query_row(
            "SELECT account_id FROM backend_accounts WHERE token = ?1",
            params![token],
            |row| row.get(0),
        )
        .optional()
        .map_err(DbError::from)?
        .ok_or(BackendError::Unauthorized)
    }

    pub fn version(&self, token: Option<&str>) -> Result<i64, BackendError> {
        let account = self.authenticate(token)?;
        Ok(self.db.query_row(
            "SELECT version FROM backend_accounts WHERE account_id = ?1",
            params![account],
            |row| row.get(0),
        )?)
    }

    /// Rows changed after `cursor` plus every category group
    pub fn pull(&self, token: Option<&str>, cursor: i64) -> Result<PullResponse, BackendError> {
        let account = self.authenticate(token)?;

        let (version, rows) = self.db.with_transaction(|tx| {
            let version: i64 = tx.query_row(
                "SELECT version FROM backend_accounts WHERE account_id = ?1",
                params![account],
                |row| row.get(0),
            )?;

            // A cursor from the future means the server was reset
            let cursor = if cursor > version { 0 } else { cursor };

            let mut stmt = tx.prepare(
                "SELECT kind, id, scope_id, updated_at, is_deleted, payload FROM backend_rows
                 WHERE account_id = ?1 AND (row_version > ?2 OR kind = ?3)
                 ORDER BY row_version, kind, id",
            )?;
            let rows = stmt
                .query_map(params![account, cursor, RecordKind::CategoryGroup.as_str()], |row| {
                    Ok(RecordRow {
                        kind: row.get(0)?,
                        id: row.get(1)?,
                        scope_id: row.get(2)?,
                        updated_at: row.get(3)?,
                        is_deleted: row.get(4)?,
                        payload: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok((version, rows))
        })?;

        let mut batch = SyncBatch::default();
        for row in &rows {
            batch
                .push_row(row)
                .map_err(|e| BackendError::InvalidPayload(format!("{}/{}: {}", row.kind, row.id, e)))?;
        }

        log::debug!("Backend pull for {} from cursor {}: {} rows", account, cursor, batch.len());
        Ok(PullResponse { version, batch })
    }

    /// Conditionally upsert every row of the batch
    pub fn push(&self, token: Option<&str>, batch: &SyncBatch) -> Result<PushResponse, BackendError> {
        let account = self.authenticate(token)?;
        let rows = batch
            .to_rows()
            .map_err(|e| BackendError::InvalidPayload(e.to_string()))?;

        let response = self.db.with_transaction(|tx| {
            let current: i64 = tx.query_row(
                "SELECT version FROM backend_accounts WHERE account_id = ?1",
                params![account],
                |row| row.get(0),
            )?;
            let next = current + 1;

            let mut applied = 0;
            for row in &rows {
                applied += tx.execute(
                    r#"
                    INSERT INTO backend_rows
                        (account_id, kind, id, scope_id, updated_at, is_deleted, payload, row_version)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    ON CONFLICT(account_id, kind, id) DO UPDATE SET
                        scope_id = excluded.scope_id,
                        updated_at = excluded.updated_at,
                        is_deleted = excluded.is_deleted,
                        payload = excluded.payload,
                        row_version = excluded.row_version
                    WHERE excluded.updated_at > backend_rows.updated_at
                       OR (excluded.updated_at = backend_rows.updated_at
                           AND (excluded.payload <> backend_rows.payload
                                OR excluded.is_deleted <> backend_rows.is_deleted
                                OR excluded.scope_id <> backend_rows.scope_id))
                    "#,
                    params![
                        account,
                        row.kind,
                        row.id,
                        row.scope_id,
                        row.updated_at,
                        row.is_deleted,
                        row.payload,
                        next
                    ],
                )?;
            }

            if applied == 0 {
                return Ok(PushResponse { version: current, applied });
            }

            tx.execute(
                "UPDATE backend_accounts SET version = ?2 WHERE account_id = ?1",
                params![account, next],
            )?;
            Ok(PushResponse { version: next, applied })
        })?;

        log::debug!(
            "Backend push for {}: {} of {} rows applied, version {}",
            account,
            response.applied,
            rows.len(),
            response.version
        );
        Ok(response)
    }

    pub fn put_attachment(&self, token: Option<&str>, content_id: &str, blob: &[u8]) -> Result<String, BackendError> {
        let account = self.authenticate(token)?;
        if blob.is_empty() {
            return Err(BackendError::InvalidPayload(format!("{}: empty blob", content_id)));
        }
        self.db.execute(
            "INSERT OR REPLACE INTO backend_attachments (account_id, content_id, blob) VALUES (?1, ?2, ?3)",
            params![account, content_id, blob],
        )?;
        Ok(content_id.to_string())
    }

    pub fn get_attachment(&self, token: Option<&str>, content_id: &str) -> Result<Vec<u8>, BackendError> {
        let account = self.authenticate(token)?;
        let conn = self.db.get_conn()?;
        conn.query_row(
            "SELECT blob FROM backend_attachments WHERE account_id = ?1 AND content_id = ?2",
            params![account, content_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(DbError::from)?
        .ok_or_else(|| BackendError::NotFound(format!("attachments/{}", content_id)))
    }

    pub fn delete_attachment(&self, token: Option<&str>, content_id: &str) -> Result<(), BackendError> {
        let account = self.authenticate(token)?;
        self.db.execute(
            "DELETE FROM backend_attachments WHERE account_id = ?1 AND content_id = ?2",
            params![account, content_id],
        )?;
        Ok(())
    }
}

/// In-process client handle bound to one bearer token
#[derive(Clone)]
pub struct BackendSession {
    backend: Arc<SyncBackend>,
    token: Option<String>,
}

impl BackendSession {
    pub fn new(backend: Arc<SyncBackend>, token: Option<String>) -> Self {
        Self { backend, token }
    }
}

#[async_trait]
impl StructuredRemote for BackendSession {
    async fn pull(&self, cursor: i64) -> SyncResult<PullResponse> {
        Ok(self.backend.pull(self.token.as_deref(), cursor)?)
    }

    async fn push(&self, batch: &SyncBatch) -> SyncResult<PushResponse> {
        Ok(self.backend.push(self.token.as_deref(), batch)?)
    }

    async fn version(&self) -> SyncResult<i64> {
        Ok(self.backend.version(self.token.as_deref())?)
    }
}

#[async_trait]
impl AttachmentRemote for BackendSession {
    async fn upload(&self, content_id: &str, blob: &[u8]) -> SyncResult<String> {
        Ok(self.backend.put_attachment(self.token.as_deref(), content_id, blob)?)
    }

    async fn fetch(&self, content_id: &str) -> SyncResult<Vec<u8>> {
        Ok(self.backend.get_attachment(self.token.as_deref(), content_id)?)
    }

    async fn delete(&self, content_id: &str) -> SyncResult<()> {
        Ok(self.backend.delete_attachment(self.token.as_deref(), content_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::{CategoryGroup, Ledger, SyncedRecord, Transaction, TransactionType};
    use chrono::NaiveDate;

    fn backend() -> (SyncBackend, String) {
        let backend = SyncBackend::new(Arc::new(Database::in_memory().unwrap()));
        let token = backend.create_account("alice").unwrap();
        (backend, token)
    }

    fn batch_with_transaction(amount: f64, updated_at: i64) -> SyncBatch {
        let mut tx = SyncedRecord::with_id(
            "t1",
            "s1",
            Transaction {
                amount,
                tx_type: TransactionType::Expense,
                date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                category_id: None,
                note: String::new(),
                attachment_ids: Vec::new(),
            },
        );
        tx.updated_at = updated_at;
        SyncBatch {
            transactions: vec![tx],
            ..Default::default()
        }
    }

    #[test]
    fn test_token_is_checked_first() {
        let (backend, _) = backend();
        assert!(matches!(backend.pull(None, 0), Err(BackendError::Unauthorized)));
        assert!(matches!(
            backend.push(Some("nope"), &SyncBatch::default()),
            Err(BackendError::Unauthorized)
        ));
    }

    #[test]
    fn test_push_bumps_version_and_pull_from_cursor() {
        let (backend, token) = backend();
        let token = Some(token.as_str());

        let pushed = backend.push(token, &batch_with_transaction(10.0, 100)).unwrap();
        assert_eq!(pushed.version, 1);
        assert_eq!(pushed.applied, 1);

        let all = backend.pull(token, 0).unwrap();
        assert_eq!(all.version, 1);
        assert_eq!(all.batch.transactions.len(), 1);

        let none = backend.pull(token, 1).unwrap();
        assert!(none.batch.is_empty());
    }

    #[test]
    fn test_identical_replay_is_noop() {
        let (backend, token) = backend();
        let token = Some(token.as_str());
        let batch = batch_with_transaction(10.0, 100);

        backend.push(token, &batch).unwrap();
        let replay = backend.push(token, &batch).unwrap();
        assert_eq!(replay.applied, 0);
        assert_eq!(replay.version, 1);
    }

    #[test]
    fn test_last_write_wins() {
        let (backend, token) = backend();
        let token = Some(token.as_str());

        backend.push(token, &batch_with_transaction(10.0, 200)).unwrap();

        // older write is ignored
        let stale = backend.push(token, &batch_with_transaction(99.0, 100)).unwrap();
        assert_eq!(stale.applied, 0);

        // equal timestamp, different content is applied
        let tie = backend.push(token, &batch_with_transaction(11.0, 200)).unwrap();
        assert_eq!(tie.applied, 1);

        let pulled = backend.pull(token, 0).unwrap();
        assert_eq!(pulled.batch.transactions[0].data.amount, 11.0);
    }

    #[test]
    fn test_groups_always_returned() {
        let (backend, token) = backend();
        let token = Some(token.as_str());

        let batch = SyncBatch {
            groups: vec![SyncedRecord::new("", CategoryGroup { name: "Daily".into(), sort_order: 0 })],
            ledgers: vec![SyncedRecord::new("", Ledger { name: "Home".into(), currency: "EUR".into(), sort_order: 0 })],
            ..Default::default()
        };
        let pushed = backend.push(token, &batch).unwrap();

        let pulled = backend.pull(token, pushed.version).unwrap();
        assert_eq!(pulled.batch.groups.len(), 1);
        assert!(pulled.batch.ledgers.is_empty());
    }

    #[test]
    fn test_accounts_are_isolated() {
        let (backend, alice) = backend();
        let bob = backend.create_account("bob").unwrap();

        backend.push(Some(&alice), &batch_with_transaction(10.0, 100)).unwrap();
        assert!(backend.pull(Some(&bob), 0).unwrap().batch.is_empty());
        assert_eq!(backend.version(Some(&bob)).unwrap(), 0);
    }

    #[test]
    fn test_attachments() {
        let (backend, token) = backend();
        let token = Some(token.as_str());

        assert_eq!(backend.put_attachment(token, "a1", b"png").unwrap(), "a1");
        assert_eq!(backend.get_attachment(token, "a1").unwrap(), b"png");
        backend.delete_attachment(token, "a1").unwrap();
        assert!(matches!(
            backend.get_attachment(token, "a1"),
            Err(BackendError::NotFound(_))
        ));
        assert!(backend.put_attachment(token, "a2", b"").is_err());
    }
}
