//! # Ledger Sync
//!
//! Offline-first synchronization engine for a personal ledger. Records are
//! written locally and reconciled in the background with a WebDAV file
//! store or a structured sync server.

pub mod cache;
pub mod config;
pub mod db;
pub mod sync;

use std::path::PathBuf;

/// Location of the local database in the platform data directory
pub fn default_database_path() -> std::io::Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "ledger-sync", "ledger-sync").ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "cannot determine data directory, is HOME set?",
        )
    })?;

    let data_dir = dirs.data_dir();
    std::fs::create_dir_all(data_dir)?;
    Ok(data_dir.join("ledger-sync.db"))
}
