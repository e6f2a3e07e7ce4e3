//! Sync Log - user-visible record of every sync attempt
//!
//! Each pull, push, conflict retry, skipped file and attachment upload writes
//! one row (timestamp, direction, outcome, message), whether or not the
//! failure was later retried.

use crate::db::Database;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::SyncError;

// ============================================================================
// Types & Structures
// ============================================================================

/// Which part of the engine produced a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Pull,
    Push,
    Attachment,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Pull => "pull",
            SyncDirection::Push => "push",
            SyncDirection::Attachment => "attachment",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pull" => Ok(SyncDirection::Pull),
            "push" => Ok(SyncDirection::Push),
            "attachment" => Ok(SyncDirection::Attachment),
            _ => Err(format!("Invalid direction: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutcome {
    Success,
    Failed,
    Conflict,
    Skipped,
}

impl LogOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogOutcome::Success => "success",
            LogOutcome::Failed => "failed",
            LogOutcome::Conflict => "conflict",
            LogOutcome::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "success" => Ok(LogOutcome::Success),
            "failed" => Ok(LogOutcome::Failed),
            "conflict" => Ok(LogOutcome::Conflict),
            "skipped" => Ok(LogOutcome::Skipped),
            _ => Err(format!("Invalid outcome: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub id: i64,
    pub direction: SyncDirection,
    pub outcome: LogOutcome,
    pub message: String,
    pub error_kind: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total_entries: i64,
    pub failures: i64,
    pub conflicts: i64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

// ============================================================================
// History Manager
// ============================================================================

pub struct HistoryManager {
    db: Arc<Database>,
}

impl HistoryManager {
    pub fn new(db: Arc<Database>) -> Result<Self, HistoryError> {
        Ok(Self { db })
    }

    /// Append one entry to the sync log
    pub fn record(
        &self,
        direction: SyncDirection,
        outcome: LogOutcome,
        message: &str,
        error: Option<&SyncError>,
    ) -> Result<i64, HistoryError> {
        self.db
            .execute_insert(
                "INSERT INTO sync_log (direction, outcome, message, error_kind, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    direction.as_str(),
                    outcome.as_str(),
                    message,
                    error.map(SyncError::kind),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| HistoryError::DatabaseError(e.to_string()))
    }

    /// Record an entry, logging instead of failing when the store is unavailable
    pub fn record_quietly(
        &self,
        direction: SyncDirection,
        outcome: LogOutcome,
        message: &str,
        error: Option<&SyncError>,
    ) {
        if let Err(e) = self.record(direction, outcome, message, error) {
            log::warn!("Failed to write sync log entry: {}", e);
        }
    }

    /// Most recent entries first
    pub fn recent(&self, limit: u32) -> Result<Vec<SyncLogEntry>, HistoryError> {
        self.db
            .query(
                "SELECT id, direction, outcome, message, error_kind, created_at
                 FROM sync_log
                 ORDER BY id DESC
                 LIMIT ?1",
                rusqlite::params![limit],
                |row| {
                    Ok(SyncLogEntry {
                        id: row.get(0)?,
                        direction: SyncDirection::from_str(&row.get::<_, String>(1)?)
                            .map_err(|_| invalid_column(1, "direction"))?,
                        outcome: LogOutcome::from_str(&row.get::<_, String>(2)?)
                            .map_err(|_| invalid_column(2, "outcome"))?,
                        message: row.get(3)?,
                        error_kind: row.get(4)?,
                        created_at: parse_timestamp(&row.get::<_, String>(5)?)
                            .ok_or_else(|| invalid_column(5, "created_at"))?,
                    })
                },
            )
            .map_err(|e| HistoryError::DatabaseError(e.to_string()))
    }

    /// Delete entries older than `retention_days`
    pub fn enforce_retention_policy(&self, retention_days: i64) -> Result<usize, HistoryError> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);

        self.db
            .execute(
                "DELETE FROM sync_log WHERE created_at < ?1",
                rusqlite::params![cutoff.to_rfc3339()],
            )
            .map_err(|e| HistoryError::DatabaseError(e.to_string()))
    }

    pub fn get_stats(&self) -> Result<HistoryStats, HistoryError> {
        self.db
            .query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(outcome = 'failed'), 0),
                    COALESCE(SUM(outcome = 'conflict'), 0),
                    MAX(CASE WHEN outcome = 'success' THEN created_at END),
                    MAX(CASE WHEN outcome = 'failed' THEN created_at END)
                 FROM sync_log",
                [],
                |row| {
                    Ok(HistoryStats {
                        total_entries: row.get(0)?,
                        failures: row.get(1)?,
                        conflicts: row.get(2)?,
                        last_success: row
                            .get::<_, Option<String>>(3)?
                            .and_then(|s| parse_timestamp(&s)),
                        last_failure: row
                            .get::<_, Option<String>>(4)?
                            .and_then(|s| parse_timestamp(&s)),
                    })
                },
            )
            .map_err(|e| HistoryError::DatabaseError(e.to_string()))
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn invalid_column(idx: usize, name: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, name.to_string(), Type::Text)
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    DatabaseError(String),
}

// ============================================================================
// Tests
// ============================================================================
