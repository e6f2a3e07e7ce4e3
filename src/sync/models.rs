//! Sync Data Models - Change-Tracked Records
//!
//! Every synchronizable entity is wrapped in a [`SyncedRecord`] envelope that
//! carries a stable id, an owning scope, a millisecond logical timestamp and a
//! tombstone flag. Entity fields are opaque to the engine and always travel as
//! a whole record.
//!
//! Entities:
//! - Ledger
//! - CategoryGroup / Category
//! - Transaction
//! - AppSettings (singleton)

use chrono::{NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::db::RecordRow;

/// Wall-clock milliseconds used as the logical timestamp
pub type Millis = i64;

/// Id of the singleton settings record
pub const SETTINGS_RECORD_ID: &str = "settings";

/// Namespace for ids derived from legacy display names
const LEGACY_NAME_NAMESPACE: Uuid = Uuid::from_u128(0x6c65_6467_6572_5f73_796e_635f_6e61_6d65);

pub fn now_millis() -> Millis {
    Utc::now().timestamp_millis()
}

// ============================================================================
// Record Kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Ledger,
    CategoryGroup,
    Category,
    Transaction,
    Settings,
}

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::Settings,
        RecordKind::Ledger,
        RecordKind::CategoryGroup,
        RecordKind::Category,
        RecordKind::Transaction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Ledger => "ledger",
            RecordKind::CategoryGroup => "category_group",
            RecordKind::Category => "category",
            RecordKind::Transaction => "transaction",
            RecordKind::Settings => "settings",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ledger" => Some(RecordKind::Ledger),
            "category_group" => Some(RecordKind::CategoryGroup),
            "category" => Some(RecordKind::Category),
            "transaction" => Some(RecordKind::Transaction),
            "settings" => Some(RecordKind::Settings),
            _ => None,
        }
    }
}

/// An entity type that can ride inside a [`SyncedRecord`]
pub trait SyncEntity: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static {
    const KIND: RecordKind;
}

// ============================================================================
// Record Envelope
// ============================================================================

/// Envelope shared by every synchronized entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedRecord<T> {
    /// Globally stable id, never reused
    pub id: String,

    /// Sharding and filtering boundary (ledger id for categories/transactions)
    #[serde(default)]
    pub scope_id: String,

    /// Sole conflict-resolution signal
    pub updated_at: Millis,

    /// Tombstone flag; deleted records keep their id forever
    #[serde(default)]
    pub is_deleted: bool,

    #[serde(flatten)]
    pub data: T,
}

impl<T: SyncEntity> SyncedRecord<T> {
    /// Create a new record with a fresh id, stamped now
    pub fn new(scope_id: impl Into<String>, data: T) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), scope_id, data)
    }

    pub fn with_id(id: impl Into<String>, scope_id: impl Into<String>, data: T) -> Self {
        Self {
            id: id.into(),
            scope_id: scope_id.into(),
            updated_at: now_millis(),
            is_deleted: false,
            data,
        }
    }

    /// Stamp a local mutation. Always moves forward, even within the same
    /// millisecond or under a clock that went backwards.
    pub fn touch(&mut self) {
        self.updated_at = now_millis().max(self.updated_at + 1);
    }

    /// Replace the entity fields as one local mutation
    pub fn update(&mut self, f: impl FnOnce(&mut T)) {
        f(&mut self.data);
        self.touch();
    }

    /// Delete by flipping the tombstone; the deletion itself is a change
    pub fn tombstone(&mut self) {
        self.is_deleted = true;
        self.touch();
    }

    pub fn to_row(&self) -> Result<RecordRow, serde_json::Error> {
        Ok(RecordRow {
            kind: T::KIND.as_str().to_string(),
            id: self.id.clone(),
            scope_id: self.scope_id.clone(),
            updated_at: self.updated_at,
            is_deleted: self.is_deleted,
            payload: serde_json::to_string(&self.data)?,
        })
    }

    pub fn from_row(row: &RecordRow) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: row.id.clone(),
            scope_id: row.scope_id.clone(),
            updated_at: row.updated_at,
            is_deleted: row.is_deleted,
            data: serde_json::from_str(&row.payload)?,
        })
    }
}

/// Derive a stable id from a display name, for legacy data that has none.
///
/// Two distinct categories that share a name collapse into one id. This is a
/// known gap of the legacy format and is kept as-is.
pub fn legacy_id_from_name(kind: RecordKind, name: &str) -> String {
    let key = format!("{}:{}", kind.as_str(), name.trim().to_lowercase());
    Uuid::new_v5(&LEGACY_NAME_NAMESPACE, key.as_bytes()).to_string()
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    pub name: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub sort_order: i32,
}

impl SyncEntity for Ledger {
    const KIND: RecordKind = RecordKind::Ledger;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryGroup {
    pub name: String,
    #[serde(default)]
    pub sort_order: i32,
}

impl SyncEntity for CategoryGroup {
    const KIND: RecordKind = RecordKind::CategoryGroup;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub name: String,
    pub kind: TransactionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub sort_order: i32,
}

impl SyncEntity for Category {
    const KIND: RecordKind = RecordKind::Category;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Expense,
    Income,
    Transfer,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Expense => "expense",
            TransactionType::Income => "income",
            TransactionType::Transfer => "transfer",
        }
    }

    /// Accepts the machine spelling as well as older capitalized labels
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "expense" | "0" => Some(TransactionType::Expense),
            "income" | "1" => Some(TransactionType::Income),
            "transfer" | "2" => Some(TransactionType::Transfer),
            _ => None,
        }
    }

    /// Human label used in the readable columns of exported shards
    pub fn label(&self) -> &'static str {
        match self {
            TransactionType::Expense => "Expense",
            TransactionType::Income => "Income",
            TransactionType::Transfer => "Transfer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub amount: f64,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(default)]
    pub note: String,
    /// Weak references into the attachment store
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_ids: Vec<String>,
}

impl SyncEntity for Transaction {
    const KIND: RecordKind = RecordKind::Transaction;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    #[serde(default = "default_currency")]
    pub default_currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ledger_id: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    /// Nested configuration the engine does not interpret
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            default_currency: default_currency(),
            default_ledger_id: None,
            language: default_language(),
            extra: BTreeMap::new(),
        }
    }
}

impl SyncEntity for AppSettings {
    const KIND: RecordKind = RecordKind::Settings;
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

pub type LedgerRecord = SyncedRecord<Ledger>;
pub type CategoryGroupRecord = SyncedRecord<CategoryGroup>;
pub type CategoryRecord = SyncedRecord<Category>;
pub type TransactionRecord = SyncedRecord<Transaction>;
pub type SettingsRecord = SyncedRecord<AppSettings>;

// ============================================================================
// Record Batches
// ============================================================================

/// A set of records of every kind, as exchanged with a remote
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBatch {
    #[serde(default)]
    pub ledgers: Vec<LedgerRecord>,
    #[serde(default)]
    pub categories: Vec<CategoryRecord>,
    #[serde(default)]
    pub groups: Vec<CategoryGroupRecord>,
    #[serde(default)]
    pub transactions: Vec<TransactionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SettingsRecord>,
}

impl SyncBatch {
    pub fn len(&self) -> usize {
        self.ledgers.len()
            + self.categories.len()
            + self.groups.len()
            + self.transactions.len()
            + usize::from(self.settings.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten into storage rows
    pub fn to_rows(&self) -> Result<Vec<RecordRow>, serde_json::Error> {
        let mut rows = Vec::with_capacity(self.len());
        for r in &self.ledgers {
            rows.push(r.to_row()?);
        }
        for r in &self.groups {
            rows.push(r.to_row()?);
        }
        for r in &self.categories {
            rows.push(r.to_row()?);
        }
        for r in &self.transactions {
            rows.push(r.to_row()?);
        }
        if let Some(settings) = &self.settings {
            rows.push(settings.to_row()?);
        }
        Ok(rows)
    }

    /// Add one storage row to the matching list. Unknown kinds are ignored.
    pub fn push_row(&mut self, row: &RecordRow) -> Result<(), serde_json::Error> {
        match RecordKind::from_str(&row.kind) {
            Some(RecordKind::Ledger) => self.ledgers.push(SyncedRecord::from_row(row)?),
            Some(RecordKind::CategoryGroup) => self.groups.push(SyncedRecord::from_row(row)?),
            Some(RecordKind::Category) => self.categories.push(SyncedRecord::from_row(row)?),
            Some(RecordKind::Transaction) => self.transactions.push(SyncedRecord::from_row(row)?),
            Some(RecordKind::Settings) => self.settings = Some(SyncedRecord::from_row(row)?),
            None => log::debug!("Ignoring record of unknown kind {}", row.kind),
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_transaction() -> Transaction {
        Transaction {
            amount: 50.0,
            tx_type: TransactionType::Expense,
            date: NaiveDate::from_ymd_opt(2024, 3, 14).unwrap(),
            category_id: Some("c1".to_string()),
            note: "groceries".to_string(),
            attachment_ids: vec![],
        }
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut record = SyncedRecord::new("s1", sample_transaction());
        record.updated_at = now_millis() + 60_000;
        let future = record.updated_at;

        record.touch();
        assert_eq!(record.updated_at, future + 1);
    }

    #[test]
    fn test_tombstone_keeps_id_and_bumps_clock() {
        let mut record = SyncedRecord::new("s1", sample_transaction());
        record.updated_at -= 1_000;
        let before = record.updated_at;
        let id = record.id.clone();

        record.tombstone();
        assert!(record.is_deleted);
        assert_eq!(record.id, id);
        assert!(record.updated_at > before);
    }

    #[test]
    fn test_record_json_shape() {
        let record = SyncedRecord::with_id("t1", "s1", sample_transaction());
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["id"], "t1");
        assert_eq!(json["scopeId"], "s1");
        assert_eq!(json["isDeleted"], false);
        assert_eq!(json["type"], "expense");
        assert_eq!(json["date"], "2024-03-14");

        let back: TransactionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_row_conversion_keeps_envelope() {
        let mut record = SyncedRecord::with_id("l1", "", Ledger {
            name: "Household".to_string(),
            currency: "EUR".to_string(),
            sort_order: 0,
        });
        record.tombstone();

        let row = record.to_row().unwrap();
        assert_eq!(row.kind, "ledger");
        assert!(row.is_deleted);

        let back = LedgerRecord::from_row(&row).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_legacy_id_is_stable_and_case_insensitive() {
        let a = legacy_id_from_name(RecordKind::Category, "Food");
        let b = legacy_id_from_name(RecordKind::Category, " food ");
        let c = legacy_id_from_name(RecordKind::CategoryGroup, "Food");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_transaction_type_parse() {
        assert_eq!(TransactionType::parse("Expense"), Some(TransactionType::Expense));
        assert_eq!(TransactionType::parse("income"), Some(TransactionType::Income));
        assert_eq!(TransactionType::parse("bogus"), None);
    }

    #[test]
    fn test_record_kind_roundtrip() {
        for kind in RecordKind::ALL {
            assert_eq!(RecordKind::from_str(kind.as_str()), Some(kind));
        }
    }
}
