//! Record Store - typed access to synchronized records
//!
//! Wraps [`Database`] so that user edits and merge results share the same
//! write path. Local writes notify subscribers (the scheduler's debounce);
//! merge writes do not.

use std::sync::Arc;

use tokio::sync::watch;

use crate::db::{Database, DbError, DbResult, WriteMode};

use super::models::{
    AppSettings, Category, CategoryGroup, Ledger, SettingsRecord, SyncBatch, SyncEntity,
    SyncedRecord, Transaction, SETTINGS_RECORD_ID,
};

/// Outcome of merging a remote batch into the local store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeStats {
    /// Remote records stored locally (new or strictly newer)
    pub applied: usize,
    /// Remote records ignored because the local copy won
    pub kept_local: usize,
    /// Files or responses that could not be decoded, with the reason
    pub skipped: Vec<String>,
}

#[derive(Clone)]
pub struct RecordStore {
    db: Arc<Database>,
    changes: Arc<watch::Sender<u64>>,
}

impl RecordStore {
    pub fn new(db: Arc<Database>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            db,
            changes: Arc::new(changes),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Receive a tick for every local mutation
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    // =========================================================================
    // Local mutations
    // =========================================================================

    /// Store a user edit. The caller is expected to have stamped it with
    /// `touch`, `update` or `tombstone`.
    pub fn save<T: SyncEntity>(&self, record: &SyncedRecord<T>) -> DbResult<()> {
        let row = record.to_row().map_err(|e| DbError::Serialization(e.to_string()))?;
        self.db.write_record(&row, WriteMode::Local)?;
        self.changes.send_modify(|n| *n = n.wrapping_add(1));
        Ok(())
    }

    /// Tombstone a record by id. Returns false when it does not exist.
    pub fn delete<T: SyncEntity>(&self, id: &str) -> DbResult<bool> {
        let Some(mut record) = self.get::<T>(id)? else {
            return Ok(false);
        };
        if !record.is_deleted {
            record.tombstone();
            self.save(&record)?;
        }
        Ok(true)
    }

    pub fn add_ledger(&self, ledger: Ledger) -> DbResult<SyncedRecord<Ledger>> {
        let record = SyncedRecord::new("", ledger);
        self.save(&record)?;
        Ok(record)
    }

    pub fn add_group(&self, scope_id: &str, group: CategoryGroup) -> DbResult<SyncedRecord<CategoryGroup>> {
        let record = SyncedRecord::new(scope_id, group);
        self.save(&record)?;
        Ok(record)
    }

    pub fn add_category(&self, scope_id: &str, category: Category) -> DbResult<SyncedRecord<Category>> {
        let record = SyncedRecord::new(scope_id, category);
        self.save(&record)?;
        Ok(record)
    }

    pub fn add_transaction(&self, scope_id: &str, tx: Transaction) -> DbResult<SyncedRecord<Transaction>> {
        let record = SyncedRecord::new(scope_id, tx);
        self.save(&record)?;
        Ok(record)
    }

    /// Edit the singleton settings record, creating it on first use
    pub fn update_settings(&self, f: impl FnOnce(&mut AppSettings)) -> DbResult<SettingsRecord> {
        let mut record = match self.settings()? {
            Some(record) => record,
            None => SyncedRecord::with_id(SETTINGS_RECORD_ID, "", AppSettings::default()),
        };
        record.update(f);
        self.save(&record)?;
        Ok(record)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get<T: SyncEntity>(&self, id: &str) -> DbResult<Option<SyncedRecord<T>>> {
        self.db
            .get_record(T::KIND.as_str(), id)?
            .map(|row| SyncedRecord::from_row(&row).map_err(|e| DbError::Serialization(e.to_string())))
            .transpose()
    }

    /// All records of a kind, tombstones included
    pub fn all<T: SyncEntity>(&self) -> DbResult<Vec<SyncedRecord<T>>> {
        decode_rows(self.db.get_records(T::KIND.as_str())?)
    }

    /// Live records of a kind, what the presentation layer shows
    pub fn live<T: SyncEntity>(&self) -> DbResult<Vec<SyncedRecord<T>>> {
        Ok(self.all::<T>()?.into_iter().filter(|r| !r.is_deleted).collect())
    }

    pub fn in_scope<T: SyncEntity>(&self, scope_id: &str) -> DbResult<Vec<SyncedRecord<T>>> {
        decode_rows(self.db.get_records_in_scope(T::KIND.as_str(), scope_id)?)
    }

    /// Records edited locally since their last acknowledged push
    pub fn dirty<T: SyncEntity>(&self) -> DbResult<Vec<SyncedRecord<T>>> {
        decode_rows(self.db.get_dirty_records(T::KIND.as_str())?)
    }

    pub fn scopes<T: SyncEntity>(&self) -> DbResult<Vec<String>> {
        self.db.list_scopes(T::KIND.as_str())
    }

    pub fn settings(&self) -> DbResult<Option<SettingsRecord>> {
        self.get::<AppSettings>(SETTINGS_RECORD_ID)
    }

    /// Full local state, tombstones included
    pub fn snapshot(&self) -> DbResult<SyncBatch> {
        Ok(SyncBatch {
            ledgers: self.all()?,
            categories: self.all()?,
            groups: self.all()?,
            transactions: self.all()?,
            settings: self.settings()?,
        })
    }

    /// Records pending push; groups are always included in full
    pub fn pending_batch(&self) -> DbResult<SyncBatch> {
        let settings = self.dirty::<AppSettings>()?.into_iter().next();
        Ok(SyncBatch {
            ledgers: self.dirty()?,
            categories: self.dirty()?,
            groups: self.all()?,
            transactions: self.dirty()?,
            settings,
        })
    }

    // =========================================================================
    // Merge
    // =========================================================================

    /// Apply one remote record through the shared write path
    pub fn merge<T: SyncEntity>(&self, record: &SyncedRecord<T>) -> DbResult<bool> {
        let row = record.to_row().map_err(|e| DbError::Serialization(e.to_string()))?;
        self.db.write_record(&row, WriteMode::Merge)
    }

    pub fn merge_batch(&self, batch: &SyncBatch) -> DbResult<MergeStats> {
        let mut stats = MergeStats::default();
        self.merge_all(&batch.ledgers, &mut stats)?;
        self.merge_all(&batch.groups, &mut stats)?;
        self.merge_all(&batch.categories, &mut stats)?;
        self.merge_all(&batch.transactions, &mut stats)?;
        if let Some(settings) = &batch.settings {
            self.merge_all(std::slice::from_ref(settings), &mut stats)?;
        }
        Ok(stats)
    }

    fn merge_all<T: SyncEntity>(&self, records: &[SyncedRecord<T>], stats: &mut MergeStats) -> DbResult<()> {
        for record in records {
            if self.merge(record)? {
                stats.applied += 1;
            } else {
                stats.kept_local += 1;
            }
        }
        Ok(())
    }

    /// Clear the dirty flag of every record in an acknowledged batch
    pub fn mark_pushed(&self, batch: &SyncBatch) -> DbResult<usize> {
        let mut cleaned = 0;
        cleaned += self.mark_all(&batch.ledgers)?;
        cleaned += self.mark_all(&batch.groups)?;
        cleaned += self.mark_all(&batch.categories)?;
        cleaned += self.mark_all(&batch.transactions)?;
        if let Some(settings) = &batch.settings {
            cleaned += self.mark_all(std::slice::from_ref(settings))?;
        }
        Ok(cleaned)
    }

    fn mark_all<T: SyncEntity>(&self, records: &[SyncedRecord<T>]) -> DbResult<usize> {
        let mut cleaned = 0;
        for record in records {
            if self.db.mark_clean(T::KIND.as_str(), &record.id, record.updated_at)? {
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }
}

fn decode_rows<T: SyncEntity>(rows: Vec<crate::db::RecordRow>) -> DbResult<Vec<SyncedRecord<T>>> {
    rows.iter()
        .map(|row| SyncedRecord::from_row(row).map_err(|e| DbError::Serialization(e.to_string())))
        .collect()
}
