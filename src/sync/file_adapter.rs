//! File-backed Sync Adapter
//!
//! Serializes the whole local state into a small, stable set of remote files:
//!
//! - `settings.json`: settings record plus all categories and category groups
//! - `ledgers.json`: all ledger records
//! - `ledger_{scope}_{year}.csv`: one transaction shard per scope and year
//!
//! Downloads are skipped when the listed ETag matches the copy remembered
//! from the previous cycle, and uploads are skipped when the re-encoded file
//! is byte-identical to what was read. Every upload is conditioned on the
//! ETag of the most recent read. A remote file that fails to decode is left
//! untouched until it becomes readable again.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::error::{SyncError, SyncResult};
use super::manager::{PushStats, SyncAdapter};
use super::models::{
    legacy_id_from_name, CategoryGroupRecord, CategoryRecord, LedgerRecord, RecordKind,
    SettingsRecord, SyncBatch, SETTINGS_RECORD_ID,
};
use super::shard::{self, RemoteFileKind, ShardContext, LEDGERS_FILE, SETTINGS_FILE};
use super::store::{MergeStats, RecordStore};
use super::webdav::{opaque_etag, same_etag, Precondition, RemoteEntry, RemoteFile, RemoteFileStore};

/// What one pull saw on the remote
#[derive(Debug, Clone, Default)]
pub struct FileSnapshot {
    /// Sync files present at list time, with their listed ETag
    pub listed: BTreeMap<String, Option<String>>,
    /// Content and version token of every file read this cycle
    pub downloaded: BTreeMap<String, RemoteFile>,
    /// Records decoded from the downloaded files
    pub records: SyncBatch,
    /// Why each malformed file failed to decode
    pub malformed: Vec<String>,
    /// Names of the malformed files; never overwritten by `push`
    pub malformed_names: BTreeSet<String>,
}

/// Layout of `settings.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsDocument {
    #[serde(default)]
    settings: Option<SettingsRecord>,
    #[serde(default)]
    categories: Vec<CategoryRecord>,
    #[serde(default)]
    category_groups: Vec<CategoryGroupRecord>,
}

pub struct FileSyncAdapter {
    store: RecordStore,
    remote: Arc<dyn RemoteFileStore>,
}

impl FileSyncAdapter {
    pub fn new(store: RecordStore, remote: Arc<dyn RemoteFileStore>) -> Self {
        Self { store, remote }
    }

    /// Read a listed file, reusing the remembered copy when the ETag is unchanged
    async fn download(&self, entry: &RemoteEntry) -> SyncResult<Option<RemoteFile>> {
        let db = self.store.database();

        if let Some(listed) = &entry.etag {
            if let Some((etag, content)) = db.get_remote_file(&entry.name)? {
                if same_etag(&etag, listed) {
                    log::debug!("File sync: {} unchanged ({}), reusing cached copy", entry.name, etag);
                    return Ok(Some(RemoteFile {
                        content,
                        etag: Some(etag),
                    }));
                }
            }
        }

        let Some(mut file) = self.remote.get(&entry.name).await? else {
            return Ok(None);
        };
        if file.etag.is_none() {
            file.etag = entry.etag.clone();
        }
        if let Some(etag) = &file.etag {
            db.put_remote_file(&entry.name, etag, &file.content)?;
        }

        Ok(Some(file))
    }

    /// Every remote file the current local state maps to
    fn render_files(&self) -> SyncResult<Vec<(String, Vec<u8>)>> {
        let local = self.store.snapshot()?;
        let mut files = Vec::new();

        if local.settings.is_some() || !local.categories.is_empty() || !local.groups.is_empty() {
            let document = SettingsDocument {
                settings: local.settings.clone(),
                categories: local.categories.clone(),
                category_groups: local.groups.clone(),
            };
            files.push((SETTINGS_FILE.to_string(), to_json(&document)?));
        }

        if !local.ledgers.is_empty() {
            files.push((LEDGERS_FILE.to_string(), to_json(&local.ledgers)?));
        }

        let default_currency = local
            .settings
            .as_ref()
            .map(|s| s.data.default_currency.clone())
            .unwrap_or_default();
        let currencies: HashMap<&str, &str> = local
            .ledgers
            .iter()
            .map(|l| (l.id.as_str(), l.data.currency.as_str()))
            .collect();
        let category_names: HashMap<String, String> = local
            .categories
            .iter()
            .map(|c| (c.id.clone(), c.data.name.clone()))
            .collect();

        for (key, records) in shard::partition(&local.transactions) {
            let ctx = ShardContext {
                currency: currencies
                    .get(key.scope_id.as_str())
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| default_currency.clone()),
                category_names: category_names.clone(),
            };
            files.push((key.file_name(), shard::encode_shard(&records, &ctx)?));
        }

        Ok(files)
    }
}

#[async_trait]
impl SyncAdapter for FileSyncAdapter {
    type Snapshot = FileSnapshot;

    fn name(&self) -> &'static str {
        "files"
    }

    async fn pull(&self) -> SyncResult<FileSnapshot> {
        let mut snapshot = FileSnapshot::default();

        for entry in self.remote.list().await? {
            let kind = shard::classify(&entry.name);
            if kind == RemoteFileKind::Other {
                continue;
            }

            let Some(file) = self.download(&entry).await? else {
                log::debug!("File sync: {} vanished after listing", entry.name);
                continue;
            };
            snapshot.listed.insert(entry.name.clone(), entry.etag.clone());

            if let Err(e) = decode_file(&kind, &entry.name, &file.content, &mut snapshot.records) {
                log::warn!("File sync: skipping {}: {}", entry.name, e);
                snapshot.malformed.push(e.to_string());
                snapshot.malformed_names.insert(entry.name.clone());
            }
            snapshot.downloaded.insert(entry.name, file);
        }

        log::info!(
            "File sync: pulled {} files ({} records, {} malformed)",
            snapshot.downloaded.len(),
            snapshot.records.len(),
            snapshot.malformed.len()
        );

        Ok(snapshot)
    }

    async fn merge(&self, snapshot: &FileSnapshot) -> SyncResult<MergeStats> {
        let mut stats = self.store.merge_batch(&snapshot.records)?;
        stats.skipped = snapshot.malformed.clone();
        Ok(stats)
    }

    async fn push(&self, snapshot: &FileSnapshot) -> SyncResult<PushStats> {
        let mut stats = PushStats::default();
        // Listing as of the pull, updated with our own writes
        let mut observed = snapshot.listed.clone();
        let mut observed_complete = true;

        for (name, content) in self.render_files()? {
            if snapshot.malformed_names.contains(&name) {
                log::warn!("File sync: leaving unreadable {} in place, local rows for it not uploaded", name);
                stats.skipped += 1;
                continue;
            }

            let downloaded = snapshot.downloaded.get(&name);

            if downloaded.is_some_and(|file| file.content == content) {
                log::debug!("File sync: {} unchanged, skipping upload", name);
                stats.skipped += 1;
                continue;
            }

            let precondition = match (downloaded, snapshot.listed.get(&name)) {
                (Some(file), _) => match &file.etag {
                    Some(etag) => Precondition::MustMatch(etag.clone()),
                    None => Precondition::None,
                },
                (None, Some(Some(etag))) => Precondition::MustMatch(etag.clone()),
                (None, Some(None)) => Precondition::None,
                (None, None) => Precondition::MustNotExist,
            };

            log::debug!("File sync: uploading {} ({} bytes, {:?})", name, content.len(), precondition);
            let etag = self.remote.put(&name, content.clone(), precondition).await?;

            match &etag {
                Some(etag) => self.store.database().put_remote_file(&name, etag, &content)?,
                None => observed_complete = false,
            }
            observed.insert(name, etag);
            stats.written += 1;
        }

        if observed_complete {
            stats.observed_version = Some(listing_digest(observed));
        }

        log::info!("File sync: pushed {} files, {} unchanged", stats.written, stats.skipped);
        Ok(stats)
    }

    /// Digest of every listed sync file name and ETag
    async fn remote_version(&self) -> SyncResult<String> {
        let entries = self
            .remote
            .list()
            .await?
            .into_iter()
            .filter(|e| shard::classify(&e.name) != RemoteFileKind::Other)
            .map(|e| (e.name, e.etag));
        Ok(listing_digest(entries))
    }
}

fn listing_digest(entries: impl IntoIterator<Item = (String, Option<String>)>) -> String {
    let mut entries: Vec<(String, String)> = entries
        .into_iter()
        .map(|(name, etag)| {
            let etag = etag.as_deref().map(opaque_etag).unwrap_or_default().to_string();
            (name, etag)
        })
        .collect();
    entries.sort();

    let mut hasher = Sha256::new();
    for (name, etag) in entries {
        hasher.update(name.as_bytes());
        hasher.update(b"\t");
        hasher.update(etag.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

// ============================================================================
// Decoding
// ============================================================================

fn to_json<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| SyncError::Storage(e.to_string()))
}

fn decode_file(kind: &RemoteFileKind, name: &str, content: &[u8], batch: &mut SyncBatch) -> SyncResult<()> {
    match kind {
        RemoteFileKind::Settings => {
            let document = decode_settings_document(content).map_err(|e| SyncError::malformed(name, e))?;
            batch.settings = document.settings;
            batch.categories.extend(document.categories);
            batch.groups.extend(document.category_groups);
        }
        RemoteFileKind::Ledgers => {
            let ledgers: Vec<LedgerRecord> =
                serde_json::from_slice(content).map_err(|e| SyncError::malformed(name, e))?;
            batch.ledgers.extend(ledgers);
        }
        RemoteFileKind::Shard(key) => {
            batch.transactions.extend(shard::decode_shard(name, &key.scope_id, content)?);
        }
        RemoteFileKind::LegacyShard { scope_id } => {
            log::debug!("File sync: reading legacy shard {} for migration", name);
            batch.transactions.extend(shard::decode_shard(name, scope_id, content)?);
        }
        RemoteFileKind::Other => {}
    }
    Ok(())
}

/// Decode `settings.json`, filling ids and timestamps missing from older
/// clients. Category and group ids fall back to the display name.
fn decode_settings_document(content: &[u8]) -> Result<SettingsDocument, String> {
    let content = content.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(content);
    let mut root: Value = serde_json::from_slice(content).map_err(|e| e.to_string())?;
    let Some(object) = root.as_object_mut() else {
        return Err("expected a JSON object".to_string());
    };

    // Older documents were the bare settings object with the lists inlined
    if !object.contains_key("settings") && object.contains_key("defaultCurrency") {
        let mut settings = serde_json::Map::new();
        let keys: Vec<String> = object
            .keys()
            .filter(|k| !matches!(k.as_str(), "categories" | "categoryGroups"))
            .cloned()
            .collect();
        for key in keys {
            if let Some(value) = object.remove(&key) {
                settings.insert(key, value);
            }
        }
        object.insert("settings".to_string(), Value::Object(settings));
    }

    if let Some(Value::Object(settings)) = object.get_mut("settings") {
        settings
            .entry("id")
            .or_insert_with(|| Value::from(SETTINGS_RECORD_ID));
        settings.entry("updatedAt").or_insert_with(|| Value::from(0));
    }

    if let Some(Value::Array(groups)) = object.get_mut("categoryGroups") {
        for group in groups.iter_mut().filter_map(Value::as_object_mut) {
            fill_legacy_envelope(group, RecordKind::CategoryGroup);
        }
    }

    if let Some(Value::Array(categories)) = object.get_mut("categories") {
        for category in categories.iter_mut().filter_map(Value::as_object_mut) {
            fill_legacy_envelope(category, RecordKind::Category);
            if !category.contains_key("groupId") {
                let group_name = category
                    .get("groupName")
                    .and_then(Value::as_str)
                    .map(|name| legacy_id_from_name(RecordKind::CategoryGroup, name));
                if let Some(group_id) = group_name {
                    category.insert("groupId".to_string(), Value::from(group_id));
                }
            }
        }
    }

    serde_json::from_value(root).map_err(|e| e.to_string())
}

fn fill_legacy_envelope(object: &mut serde_json::Map<String, Value>, kind: RecordKind) {
    if !object.contains_key("id") {
        if let Some(name) = object.get("name").and_then(Value::as_str) {
            let id = legacy_id_from_name(kind, name);
            object.insert("id".to_string(), Value::from(id));
        }
    }
    object.entry("updatedAt").or_insert_with(|| Value::from(0));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::{Category, CategoryGroup, TransactionType};

    #[test]
    fn test_settings_document_shape() {
        let group = CategoryGroupRecord::with_id("g1", "", CategoryGroup { name: "Daily".into(), sort_order: 0 });
        let document = SettingsDocument {
            settings: None,
            categories: vec![],
            category_groups: vec![group],
        };

        let json: Value = serde_json::from_slice(&to_json(&document).unwrap()).unwrap();
        assert!(json.get("categoryGroups").is_some());
        assert_eq!(json["categoryGroups"][0]["id"], "g1");
    }

    #[test]
    fn test_legacy_settings_document() {
        let raw = br#"{
            "defaultCurrency": "EUR",
            "language": "fr",
            "categories": [{"name": "Food", "kind": "expense", "groupName": "Daily"}],
            "categoryGroups": [{"name": "Daily"}]
        }"#;

        let document = decode_settings_document(raw).unwrap();
        let settings = document.settings.unwrap();
        assert_eq!(settings.id, SETTINGS_RECORD_ID);
        assert_eq!(settings.data.default_currency, "EUR");
        assert_eq!(settings.updated_at, 0);

        let category = &document.categories[0];
        assert_eq!(category.id, legacy_id_from_name(RecordKind::Category, "Food"));
        assert_eq!(category.data.kind, TransactionType::Expense);
        assert_eq!(
            category.data.group_id.as_deref(),
            Some(document.category_groups[0].id.as_str())
        );
    }

    #[test]
    fn test_current_settings_document_roundtrip() {
        let category = CategoryRecord::with_id("c1", "l1", Category {
            name: "Rent".into(),
            kind: TransactionType::Expense,
            group_id: None,
            icon: Some("house".into()),
            color: None,
            sort_order: 2,
        });
        let document = SettingsDocument {
            settings: None,
            categories: vec![category.clone()],
            category_groups: vec![],
        };

        let decoded = decode_settings_document(&to_json(&document).unwrap()).unwrap();
        assert_eq!(decoded.categories, vec![category]);
    }

    #[test]
    fn test_malformed_settings_document() {
        assert!(decode_settings_document(b"[1, 2]").is_err());
        assert!(decode_settings_document(b"{not json").is_err());
    }
}
