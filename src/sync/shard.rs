//! Transaction Shards - remote file naming and CSV codec
//!
//! Transactions are partitioned by `(scope, calendar year)` into
//! `ledger_{scope}_{year}.csv`. Each shard starts with a UTF-8 BOM, carries a
//! few human-readable leading columns and the authoritative machine columns
//! at the end of every row. Only the machine columns are read back.
//!
//! Older clients wrote one unsharded `ledger_{scope}.csv` per scope with a
//! different header. Those files are decoded through [`ColumnLayout::Legacy`]
//! and never written again.

use std::collections::{BTreeMap, HashMap};

use chrono::{Datelike, NaiveDate};

use super::error::{SyncError, SyncResult};
use super::models::{
    legacy_id_from_name, Millis, RecordKind, SyncedRecord, Transaction, TransactionRecord,
    TransactionType,
};

pub const SETTINGS_FILE: &str = "settings.json";
pub const LEDGERS_FILE: &str = "ledgers.json";

const SHARD_PREFIX: &str = "ledger_";
const SHARD_SUFFIX: &str = ".csv";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const ATTACHMENT_SEPARATOR: char = ';';

const HUMAN_HEADER: [&str; 5] = ["Date", "Type", "Amount", "Category", "Note"];
const MACHINE_HEADER: [&str; 9] = [
    "id",
    "date",
    "type",
    "amount",
    "categoryId",
    "note",
    "attachmentIds",
    "updatedAt",
    "isDeleted",
];

// ============================================================================
// File Naming
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardKey {
    pub scope_id: String,
    pub year: i32,
}

impl ShardKey {
    pub fn new(scope_id: impl Into<String>, year: i32) -> Self {
        Self {
            scope_id: scope_id.into(),
            year,
        }
    }

    /// The shard a transaction belongs to
    pub fn for_transaction(record: &TransactionRecord) -> Self {
        Self::new(record.scope_id.clone(), record.data.date.year())
    }

    pub fn file_name(&self) -> String {
        format!("{}{}_{}{}", SHARD_PREFIX, self.scope_id, self.year, SHARD_SUFFIX)
    }
}

pub fn legacy_file_name(scope_id: &str) -> String {
    format!("{}{}{}", SHARD_PREFIX, scope_id, SHARD_SUFFIX)
}

/// What a remote file name refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFileKind {
    Settings,
    Ledgers,
    Shard(ShardKey),
    LegacyShard { scope_id: String },
    Other,
}

pub fn classify(name: &str) -> RemoteFileKind {
    match name {
        SETTINGS_FILE => return RemoteFileKind::Settings,
        LEDGERS_FILE => return RemoteFileKind::Ledgers,
        _ => {}
    }

    let Some(stem) = name
        .strip_prefix(SHARD_PREFIX)
        .and_then(|rest| rest.strip_suffix(SHARD_SUFFIX))
    else {
        return RemoteFileKind::Other;
    };

    if let Some((scope, year)) = stem.rsplit_once('_') {
        if !scope.is_empty() && year.len() == 4 && year.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(year) = year.parse() {
                return RemoteFileKind::Shard(ShardKey::new(scope, year));
            }
        }
    }

    if stem.is_empty() {
        RemoteFileKind::Other
    } else {
        RemoteFileKind::LegacyShard {
            scope_id: stem.to_string(),
        }
    }
}

/// Partition transactions into shards. Every record lands in exactly one.
pub fn partition(records: &[TransactionRecord]) -> BTreeMap<ShardKey, Vec<TransactionRecord>> {
    let mut shards: BTreeMap<ShardKey, Vec<TransactionRecord>> = BTreeMap::new();
    for record in records {
        shards
            .entry(ShardKey::for_transaction(record))
            .or_default()
            .push(record.clone());
    }
    shards
}

// ============================================================================
// Encoding
// ============================================================================

/// Lookups for the human-readable columns
#[derive(Debug, Clone, Default)]
pub struct ShardContext {
    pub currency: String,
    pub category_names: HashMap<String, String>,
}

pub fn encode_shard(records: &[TransactionRecord], ctx: &ShardContext) -> SyncResult<Vec<u8>> {
    let mut sorted: Vec<&TransactionRecord> = records.iter().collect();
    sorted.sort_by(|a, b| (a.data.date, &a.id).cmp(&(b.data.date, &b.id)));

    let mut out = UTF8_BOM.to_vec();
    {
        let mut writer = csv::Writer::from_writer(&mut out);
        writer
            .write_record(HUMAN_HEADER.iter().chain(MACHINE_HEADER.iter()))
            .map_err(encode_error)?;

        for record in sorted {
            let tx = &record.data;
            let category_name = tx
                .category_id
                .as_ref()
                .and_then(|id| ctx.category_names.get(id))
                .map(String::as_str)
                .unwrap_or("");
            let date = tx.date.format("%Y-%m-%d").to_string();
            let amount = tx.amount.to_string();

            writer
                .write_record([
                    date.as_str(),
                    tx.tx_type.label(),
                    format_amount(tx.amount, &ctx.currency).as_str(),
                    category_name,
                    tx.note.as_str(),
                    record.id.as_str(),
                    date.as_str(),
                    tx.tx_type.as_str(),
                    amount.as_str(),
                    tx.category_id.as_deref().unwrap_or(""),
                    tx.note.as_str(),
                    tx.attachment_ids.join(&ATTACHMENT_SEPARATOR.to_string()).as_str(),
                    record.updated_at.to_string().as_str(),
                    if record.is_deleted { "1" } else { "0" },
                ])
                .map_err(encode_error)?;
        }

        writer.flush().map_err(|e| SyncError::Storage(e.to_string()))?;
    }

    Ok(out)
}

fn encode_error(e: csv::Error) -> SyncError {
    SyncError::Storage(format!("shard encoding failed: {}", e))
}

fn format_amount(amount: f64, currency: &str) -> String {
    if currency.is_empty() {
        format!("{:.2}", amount)
    } else {
        format!("{} {:.2}", currency, amount)
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Column positions of the current machine columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineColumns {
    id: usize,
    date: usize,
    tx_type: usize,
    amount: usize,
    category_id: usize,
    note: usize,
    attachment_ids: Option<usize>,
    updated_at: usize,
    is_deleted: usize,
}

/// Column positions in a legacy export, matched case-insensitively
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyColumns {
    id: Option<usize>,
    date: usize,
    tx_type: usize,
    amount: usize,
    category: Option<usize>,
    note: Option<usize>,
    updated_at: Option<usize>,
    is_deleted: Option<usize>,
}

/// Header layout, resolved once per file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnLayout {
    Current(MachineColumns),
    Legacy(LegacyColumns),
}

impl ColumnLayout {
    pub fn resolve(header: &csv::StringRecord) -> Result<Self, String> {
        let fields: Vec<&str> = header.iter().map(str::trim).collect();

        // Machine columns trail the human ones, so search from the right
        let machine = |name: &str| fields.iter().rposition(|f| *f == name);

        if let (Some(id), Some(updated_at), Some(is_deleted)) =
            (machine("id"), machine("updatedAt"), machine("isDeleted"))
        {
            let required = |name: &str| machine(name).ok_or_else(|| format!("missing column {}", name));
            return Ok(ColumnLayout::Current(MachineColumns {
                id,
                date: required("date")?,
                tx_type: required("type")?,
                amount: required("amount")?,
                category_id: required("categoryId")?,
                note: required("note")?,
                attachment_ids: machine("attachmentIds"),
                updated_at,
                is_deleted,
            }));
        }

        let legacy = |names: &[&str]| {
            fields
                .iter()
                .position(|f| names.iter().any(|n| f.eq_ignore_ascii_case(n)))
        };
        let required = |names: &[&str]| legacy(names).ok_or_else(|| format!("missing column {}", names[0]));

        Ok(ColumnLayout::Legacy(LegacyColumns {
            id: legacy(&["id"]),
            date: required(&["date"])?,
            tx_type: required(&["type"])?,
            amount: required(&["amount"])?,
            category: legacy(&["category", "categoryName"]),
            note: legacy(&["note", "notes", "memo"]),
            updated_at: legacy(&["updatedAt", "updated_at"]),
            is_deleted: legacy(&["isDeleted", "deleted"]),
        }))
    }

    fn decode_row(&self, row: &csv::StringRecord, scope_id: &str, line: usize) -> Result<TransactionRecord, String> {
        let field = |idx: usize| row.get(idx).map(str::trim).unwrap_or("");
        let optional = |idx: Option<usize>| idx.map(field).unwrap_or("");

        match self {
            ColumnLayout::Current(cols) => {
                let id = field(cols.id);
                if id.is_empty() {
                    return Err(format!("row {}: empty id", line));
                }
                let attachment_ids = optional(cols.attachment_ids)
                    .split(ATTACHMENT_SEPARATOR)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                let category_id = field(cols.category_id);

                Ok(SyncedRecord {
                    id: id.to_string(),
                    scope_id: scope_id.to_string(),
                    updated_at: parse_millis(field(cols.updated_at), line)?,
                    is_deleted: parse_flag(field(cols.is_deleted), line)?,
                    data: Transaction {
                        amount: parse_amount(field(cols.amount), line)?,
                        tx_type: parse_type(field(cols.tx_type), line)?,
                        date: parse_date(field(cols.date), line)?,
                        category_id: (!category_id.is_empty()).then(|| category_id.to_string()),
                        note: row.get(cols.note).unwrap_or("").to_string(),
                        attachment_ids,
                    },
                })
            }
            ColumnLayout::Legacy(cols) => {
                let date = parse_date(field(cols.date), line)?;
                let tx_type = parse_type(field(cols.tx_type), line)?;
                let amount = parse_amount(field(cols.amount), line)?;
                let category = optional(cols.category);
                let note = cols.note.and_then(|i| row.get(i)).unwrap_or("").to_string();

                let id = match optional(cols.id) {
                    "" => legacy_id_from_name(
                        RecordKind::Transaction,
                        &format!("{}:{}:{}:{}:{}", scope_id, line, date, tx_type.as_str(), amount),
                    ),
                    id => id.to_string(),
                };
                let updated_at = match optional(cols.updated_at) {
                    "" => 0,
                    raw => parse_millis(raw, line)?,
                };
                let is_deleted = match optional(cols.is_deleted) {
                    "" => false,
                    raw => parse_flag(raw, line)?,
                };

                Ok(SyncedRecord {
                    id,
                    scope_id: scope_id.to_string(),
                    updated_at,
                    is_deleted,
                    data: Transaction {
                        amount,
                        tx_type,
                        date,
                        category_id: (!category.is_empty())
                            .then(|| legacy_id_from_name(RecordKind::Category, category)),
                        note,
                        attachment_ids: Vec::new(),
                    },
                })
            }
        }
    }
}

/// Decode a shard (current or legacy layout) into transaction records
pub fn decode_shard(file_name: &str, scope_id: &str, content: &[u8]) -> SyncResult<Vec<TransactionRecord>> {
    let malformed = |reason: String| SyncError::malformed(file_name, reason);

    let body = content.strip_prefix(UTF8_BOM).unwrap_or(content);
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(body);

    let header = reader.headers().map_err(|e| malformed(e.to_string()))?.clone();
    let layout = ColumnLayout::resolve(&header).map_err(malformed)?;

    let mut records = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let row = row.map_err(|e| malformed(e.to_string()))?;
        if row.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        // header is line 1
        records.push(layout.decode_row(&row, scope_id, idx + 2).map_err(malformed)?);
    }

    Ok(records)
}

fn parse_date(raw: &str, line: usize) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y/%m/%d"))
        .map_err(|_| format!("row {}: invalid date {:?}", line, raw))
}

fn parse_type(raw: &str, line: usize) -> Result<TransactionType, String> {
    TransactionType::parse(raw).ok_or_else(|| format!("row {}: invalid type {:?}", line, raw))
}

fn parse_amount(raw: &str, line: usize) -> Result<f64, String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | 'e' | 'E' | '+'))
        .collect();
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("row {}: invalid amount {:?}", line, raw))
}

fn parse_millis(raw: &str, line: usize) -> Result<Millis, String> {
    raw.parse().map_err(|_| format!("row {}: invalid updatedAt {:?}", line, raw))
}

fn parse_flag(raw: &str, line: usize) -> Result<bool, String> {
    match raw {
        "0" | "false" => Ok(false),
        "1" | "true" => Ok(true),
        _ => Err(format!("row {}: invalid isDeleted {:?}", line, raw)),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(id: &str, date: (i32, u32, u32), amount: f64, deleted: bool) -> TransactionRecord {
        SyncedRecord {
            id: id.to_string(),
            scope_id: "s1".to_string(),
            updated_at: 1_700_000_000_000,
            is_deleted: deleted,
            data: Transaction {
                amount,
                tx_type: TransactionType::Expense,
                date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
                category_id: Some("c1".to_string()),
                note: "lunch, with \"friends\"".to_string(),
                attachment_ids: vec!["a1".to_string(), "a2".to_string()],
            },
        }
    }

    #[test]
    fn test_classify_names() {
        assert_eq!(classify("settings.json"), RemoteFileKind::Settings);
        assert_eq!(classify("ledgers.json"), RemoteFileKind::Ledgers);
        assert_eq!(
            classify("ledger_s1_2024.csv"),
            RemoteFileKind::Shard(ShardKey::new("s1", 2024))
        );
        assert_eq!(
            classify("ledger_my_scope_2023.csv"),
            RemoteFileKind::Shard(ShardKey::new("my_scope", 2023))
        );
        assert_eq!(
            classify("ledger_s1.csv"),
            RemoteFileKind::LegacyShard { scope_id: "s1".to_string() }
        );
        assert_eq!(classify("ledger_.csv"), RemoteFileKind::Other);
        assert_eq!(classify("photo.jpg"), RemoteFileKind::Other);
    }

    #[test]
    fn test_file_name_roundtrip() {
        let key = ShardKey::new("9f1c-ab", 2024);
        assert_eq!(key.file_name(), "ledger_9f1c-ab_2024.csv");
        assert_eq!(classify(&key.file_name()), RemoteFileKind::Shard(key));
    }

    #[test]
    fn test_partition_by_scope_and_year() {
        let mut other_scope = tx("t3", (2024, 1, 1), 1.0, false);
        other_scope.scope_id = "s2".to_string();
        let records = vec![
            tx("t1", (2023, 12, 31), 1.0, false),
            tx("t2", (2024, 1, 1), 2.0, false),
            other_scope,
        ];

        let shards = partition(&records);
        assert_eq!(shards.len(), 3);
        assert_eq!(shards.values().map(Vec::len).sum::<usize>(), 3);
        assert!(shards.contains_key(&ShardKey::new("s1", 2023)));
    }

    #[test]
    fn test_shard_roundtrip_keeps_tombstones() {
        let records = vec![
            tx("t2", (2024, 3, 1), 20.0, false),
            tx("t1", (2024, 1, 5), 50.25, true),
        ];
        let ctx = ShardContext {
            currency: "EUR".to_string(),
            category_names: HashMap::from([("c1".to_string(), "Food".to_string())]),
        };

        let bytes = encode_shard(&records, &ctx).unwrap();
        assert!(bytes.starts_with(UTF8_BOM));

        let decoded = decode_shard("ledger_s1_2024.csv", "s1", &bytes).unwrap();
        assert_eq!(decoded.len(), 2);
        // rows are ordered by date
        assert_eq!(decoded[0], records[1]);
        assert_eq!(decoded[1], records[0]);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let a = vec![tx("t1", (2024, 1, 1), 1.0, false), tx("t2", (2024, 1, 1), 2.0, false)];
        let b = vec![a[1].clone(), a[0].clone()];
        let ctx = ShardContext::default();

        assert_eq!(encode_shard(&a, &ctx).unwrap(), encode_shard(&b, &ctx).unwrap());
    }

    #[test]
    fn test_human_columns_are_not_authoritative() {
        let records = vec![tx("t1", (2024, 2, 2), 5.0, false)];
        let bytes = encode_shard(&records, &ShardContext::default()).unwrap();
        let text = String::from_utf8(bytes).unwrap();

        // tamper with the readable amount only
        let tampered = text.replacen(",5.00,", ",999.00,", 1);
        assert_ne!(tampered, text);

        let decoded = decode_shard("f", "s1", tampered.as_bytes()).unwrap();
        assert_eq!(decoded[0].data.amount, 5.0);
    }

    #[test]
    fn test_legacy_layout_is_migrated() {
        let csv = "\u{feff}Date,Type,Amount,Category,Note\n2022-04-01,Income,$1200.50,Salary,April\n";
        let decoded = decode_shard("ledger_s1.csv", "s1", csv.as_bytes()).unwrap();

        assert_eq!(decoded.len(), 1);
        let record = &decoded[0];
        assert_eq!(record.data.tx_type, TransactionType::Income);
        assert_eq!(record.data.amount, 1200.5);
        assert_eq!(record.updated_at, 0);
        assert!(!record.is_deleted);
        assert_eq!(
            record.data.category_id.as_deref(),
            Some(legacy_id_from_name(RecordKind::Category, "Salary").as_str())
        );

        // derived ids are stable across reads
        let again = decode_shard("ledger_s1.csv", "s1", csv.as_bytes()).unwrap();
        assert_eq!(again[0].id, record.id);
    }

    #[test]
    fn test_malformed_shard_is_reported() {
        let csv = "id,date,type,amount,categoryId,note,attachmentIds,updatedAt,isDeleted\n\
                   t1,2024-01-01,expense,abc,,,,1,0\n";
        let err = decode_shard("ledger_s1_2024.csv", "s1", csv.as_bytes()).unwrap_err();
        assert!(matches!(err, SyncError::MalformedRemoteData { ref file, .. } if file == "ledger_s1_2024.csv"));

        let err = decode_shard("x.csv", "s1", b"foo,bar\n1,2\n").unwrap_err();
        assert!(matches!(err, SyncError::MalformedRemoteData { .. }));
    }

    #[test]
    fn test_empty_file_decodes_to_nothing() {
        assert!(decode_shard("f", "s1", UTF8_BOM).unwrap().is_empty());
    }
}
