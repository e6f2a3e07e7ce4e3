//! Database module for Ledger Sync
//!
//! Provides SQLite storage for synchronized records, engine settings, the
//! attachment cache and the sync log. All record writes, whether they come
//! from the user or from a merge, go through [`Database::write_record`].

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// How a record write is applied to an existing row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// User mutation: always stored, row becomes dirty (pending push)
    Local,
    /// Remote record: stored only if strictly newer than the local row
    Merge,
}

/// A record row as stored in the `records` table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordRow {
    pub kind: String,
    pub id: String,
    pub scope_id: String,
    pub updated_at: i64,
    pub is_deleted: bool,
    /// Entity fields as JSON
    pub payload: String,
}

impl RecordRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            kind: row.get(0)?,
            id: row.get(1)?,
            scope_id: row.get(2)?,
            updated_at: row.get(3)?,
            is_deleted: row.get(4)?,
            payload: row.get(5)?,
        })
    }
}

const RECORD_COLUMNS: &str = "kind, id, scope_id, updated_at, is_deleted, payload";

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Create a new database connection pool backed by a file
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(2))
            .connection_timeout(std::time::Duration::from_secs(10))
            .test_on_check_out(false)
            .build(manager)?;

        let conn = pool.get()?;

        conn.execute_batch(r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA temp_store = MEMORY;
        "#)?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        Self::run_migrations(&conn)?;

        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every in-memory SQLite connection is its own database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder()
            .max_size(1)
            .min_idle(Some(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;

        let conn = pool.get()?;

        conn.execute_batch(r#"
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        "#)?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        Self::run_migrations(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // MIGRATIONS
    // =========================================================================

    fn run_migrations(conn: &Connection) -> DbResult<()> {
        // Migration 1: records written before push tracking have no dirty column
        let has_dirty: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('records') WHERE name = 'dirty'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_dirty {
            log::info!("Running migration: Adding dirty column to records");
            // Everything already stored is treated as unpushed
            conn.execute("ALTER TABLE records ADD COLUMN dirty INTEGER NOT NULL DEFAULT 1", [])?;
        }

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_records_dirty ON records(kind, dirty) WHERE dirty = 1",
            [],
        )?;

        Ok(())
    }

    // =========================================================================
    // RECORDS
    // =========================================================================

    /// Single write path for records. Returns whether the row was changed.
    ///
    /// `Local` writes never move `updated_at` backwards. `Merge` writes are
    /// applied atomically only when the incoming `updated_at` is strictly
    /// greater than the stored one; on a tie the local row is kept.
    pub fn write_record(&self, row: &RecordRow, mode: WriteMode) -> DbResult<bool> {
        let conn = self.get_conn()?;

        let changed = match mode {
            WriteMode::Local => conn.execute(
                r#"
                INSERT INTO records (kind, id, scope_id, updated_at, is_deleted, payload, dirty)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)
                ON CONFLICT(kind, id) DO UPDATE SET
                    scope_id = excluded.scope_id,
                    updated_at = MAX(records.updated_at, excluded.updated_at),
                    is_deleted = excluded.is_deleted,
                    payload = excluded.payload,
                    dirty = 1
                "#,
                params![row.kind, row.id, row.scope_id, row.updated_at, row.is_deleted, row.payload],
            )?,
            WriteMode::Merge => conn.execute(
                r#"
                INSERT INTO records (kind, id, scope_id, updated_at, is_deleted, payload, dirty)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
                ON CONFLICT(kind, id) DO UPDATE SET
                    scope_id = excluded.scope_id,
                    updated_at = excluded.updated_at,
                    is_deleted = excluded.is_deleted,
                    payload = excluded.payload,
                    dirty = 0
                WHERE excluded.updated_at > records.updated_at
                "#,
                params![row.kind, row.id, row.scope_id, row.updated_at, row.is_deleted, row.payload],
            )?,
        };

        Ok(changed > 0)
    }

    /// Get a single record
    pub fn get_record(&self, kind: &str, id: &str) -> DbResult<Option<RecordRow>> {
        let conn = self.get_conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM records WHERE kind = ?1 AND id = ?2", RECORD_COLUMNS),
                params![kind, id],
                RecordRow::from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// All records of a kind, tombstones included, ordered by id
    pub fn get_records(&self, kind: &str) -> DbResult<Vec<RecordRow>> {
        self.query(
            &format!("SELECT {} FROM records WHERE kind = ?1 ORDER BY id", RECORD_COLUMNS),
            params![kind],
            RecordRow::from_row,
        )
    }

    /// Records of a kind within one scope, ordered by id
    pub fn get_records_in_scope(&self, kind: &str, scope_id: &str) -> DbResult<Vec<RecordRow>> {
        self.query(
            &format!(
                "SELECT {} FROM records WHERE kind = ?1 AND scope_id = ?2 ORDER BY id",
                RECORD_COLUMNS
            ),
            params![kind, scope_id],
            RecordRow::from_row,
        )
    }

    /// Records changed locally since their last successful push
    pub fn get_dirty_records(&self, kind: &str) -> DbResult<Vec<RecordRow>> {
        self.query(
            &format!(
                "SELECT {} FROM records WHERE kind = ?1 AND dirty = 1 ORDER BY id",
                RECORD_COLUMNS
            ),
            params![kind],
            RecordRow::from_row,
        )
    }

    /// Clear the dirty flag, unless the row was modified again after `updated_at`
    pub fn mark_clean(&self, kind: &str, id: &str, updated_at: i64) -> DbResult<bool> {
        let changed = self.execute(
            "UPDATE records SET dirty = 0 WHERE kind = ?1 AND id = ?2 AND updated_at = ?3",
            params![kind, id, updated_at],
        )?;
        Ok(changed > 0)
    }

    /// Distinct scopes used by a record kind
    pub fn list_scopes(&self, kind: &str) -> DbResult<Vec<String>> {
        self.query(
            "SELECT DISTINCT scope_id FROM records WHERE kind = ?1 ORDER BY scope_id",
            params![kind],
            |row| row.get(0),
        )
    }

    // =========================================================================
    // REMOTE FILE MEMO
    // =========================================================================

    /// Content last downloaded for a remote file, with its version token
    pub fn get_remote_file(&self, name: &str) -> DbResult<Option<(String, Vec<u8>)>> {
        let conn = self.get_conn()?;
        let row = conn
            .query_row(
                "SELECT etag, content FROM remote_files WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Remember the content of a remote file at a given version token
    pub fn put_remote_file(&self, name: &str, etag: &str, content: &[u8]) -> DbResult<()> {
        self.execute(
            "INSERT OR REPLACE INTO remote_files (name, etag, content, fetched_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, etag, content, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }

    // =========================================================================
    // HELPER METHODS
    // =========================================================================

    /// Execute a SQL statement and return affected rows
    pub fn execute<P>(&self, sql: &str, params: P) -> DbResult<usize>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;

        let affected = conn.execute(sql, params)?;
        Ok(affected)
    }

    /// Execute an INSERT statement and return the last inserted row ID
    pub fn execute_insert<P>(&self, sql: &str, params: P) -> DbResult<i64>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;

        conn.execute(sql, params)?;
        Ok(conn.last_insert_rowid())
    }

    /// Query database and map results
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;

        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(DbError::from)
    }

    /// Query single row
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<T>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        conn.query_row(sql, params, f).map_err(DbError::from)
    }

    /// Run a closure inside a single SQLite transaction
    pub fn with_transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> DbResult<T>,
    {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

// ============================================================================
// Tests
// ============================================================================
