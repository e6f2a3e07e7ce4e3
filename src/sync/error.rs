//! Sync Error Taxonomy
//!
//! Transport-level errors (`WebDavError`, `SyncApiError`, `DbError`) are
//! folded into [`SyncError`], which is what the orchestrator reasons about:
//! only [`SyncError::ConflictDetected`] restarts a cycle, everything else ends
//! the pass and is left for the next natural trigger.

use crate::db::DbError;

use super::api::SyncApiError;
use super::webdav::WebDavError;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    /// Remote unreachable or request timed out
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    /// Missing or rejected credential
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// Version-token precondition rejected a write
    #[error("Remote changed concurrently: {0}")]
    ConflictDetected(String),

    /// A remote file or response could not be decoded
    #[error("Malformed remote data in {file}: {reason}")]
    MalformedRemoteData { file: String, reason: String },

    /// Remote storage limit reached
    #[error("Remote quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Local store failure
    #[error("Local storage error: {0}")]
    Storage(String),

    #[error("Sync is disabled")]
    Disabled,
}

impl SyncError {
    pub fn malformed(file: impl Into<String>, reason: impl ToString) -> Self {
        SyncError::MalformedRemoteData {
            file: file.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the whole pull/merge/push cycle should be restarted
    pub fn is_retryable_conflict(&self) -> bool {
        matches!(self, SyncError::ConflictDetected(_))
    }

    /// Short stable name, stored with sync log entries
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::NetworkFailure(_) => "network_failure",
            SyncError::AuthFailure(_) => "auth_failure",
            SyncError::ConflictDetected(_) => "conflict_detected",
            SyncError::MalformedRemoteData { .. } => "malformed_remote_data",
            SyncError::QuotaExceeded(_) => "quota_exceeded",
            SyncError::Storage(_) => "storage",
            SyncError::Disabled => "disabled",
        }
    }
}

impl From<DbError> for SyncError {
    fn from(e: DbError) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<WebDavError> for SyncError {
    fn from(e: WebDavError) -> Self {
        match e {
            WebDavError::Http(e) => SyncError::NetworkFailure(e.to_string()),
            WebDavError::AuthFailed => SyncError::AuthFailure("WebDAV credentials rejected".to_string()),
            WebDavError::PreconditionFailed(path) => SyncError::ConflictDetected(path),
            WebDavError::InsufficientStorage(path) => SyncError::QuotaExceeded(path),
            WebDavError::NotFound(path) => SyncError::malformed(path, "resource disappeared"),
            WebDavError::XmlParse(reason) => SyncError::malformed("PROPFIND", reason),
            WebDavError::Server { status, message } => {
                SyncError::NetworkFailure(format!("server returned {}: {}", status, message))
            }
            WebDavError::InvalidUrl(reason) | WebDavError::InvalidRequest(reason) => {
                SyncError::NetworkFailure(reason)
            }
        }
    }
}

impl From<SyncApiError> for SyncError {
    fn from(e: SyncApiError) -> Self {
        match e {
            SyncApiError::Request(e) => SyncError::NetworkFailure(e.to_string()),
            SyncApiError::Unauthorized => SyncError::AuthFailure("missing bearer token".to_string()),
            SyncApiError::InvalidCredentials => SyncError::AuthFailure("bearer token rejected".to_string()),
            SyncApiError::Conflict(msg) => SyncError::ConflictDetected(msg),
            SyncApiError::QuotaExceeded => SyncError::QuotaExceeded("attachment store full".to_string()),
            SyncApiError::NotFound(what) => SyncError::malformed(what, "not found on server"),
            SyncApiError::InvalidResponse(reason) => SyncError::malformed("response", reason),
            SyncApiError::ServerError(msg) | SyncApiError::NetworkError(msg) => {
                SyncError::NetworkFailure(msg)
            }
        }
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SyncError::NetworkFailure("request timed out".to_string())
    }
}
