//! Sync Module - Local-first reconciliation of ledger data
//!
//! Every entity lives in the local store first and is reconciled in the
//! background with one remote:
//! - File backend: a WebDAV directory of JSON documents and per-year CSV shards
//! - Structured backend: a row-level REST server with a version counter
//!
//! Architecture:
//! - Change tracking: every record carries `updatedAt` and a tombstone flag
//! - Conflict resolution: last-write-wins per whole record, ties keep local
//! - Optimistic locking: file writes are conditioned on the ETag last read,
//!   and a rejected write restarts the whole pull/merge/push cycle
//! - Attachments: offline upload queue in front of a bounded blob cache

pub mod api;
pub mod backend;
pub mod error;
pub mod file_adapter;
pub mod history;
pub mod manager;
pub mod models;
pub mod queue;
pub mod scheduler;
pub mod shard;
pub mod store;
pub mod structured_adapter;
pub mod webdav;


// Re-export commonly used types
pub use api::{PullResponse, PushResponse, SyncApiClient, SyncApiError};
pub use backend::{BackendError, BackendSession, SyncBackend};
pub use error::{SyncError, SyncResult};
pub use file_adapter::{FileSnapshot, FileSyncAdapter};
pub use history::{HistoryError, HistoryManager, HistoryStats, LogOutcome, SyncDirection, SyncLogEntry};
pub use manager::{
    PassOutcome, PushStats, SyncAdapter, SyncManager, SyncOptions, SyncPhase, SyncReport, SyncStatus,
};
pub use models::{
    AppSettings, Category, CategoryGroup, Ledger, RecordKind, SyncBatch, SyncEntity, SyncedRecord,
    Transaction, TransactionType,
};
pub use queue::{AttachmentQueue, AttachmentRemote, DrainReport, QueueError, QueueStats};
pub use scheduler::{BackgroundScheduler, SchedulerCommand, SchedulerConfig, SchedulerError};
pub use store::{MergeStats, RecordStore};
pub use structured_adapter::{StructuredRemote, StructuredSyncAdapter};
pub use webdav::{RemoteFileStore, WebDavClient, WebDavCredentials, WebDavError};
