//! Engine configuration
//!
//! Stored as JSON in the settings table under `engine_config`. Environment
//! variables prefixed with `LEDGER_SYNC_` override stored values; the binary
//! loads a `.env` file first.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_BUDGET_BYTES;
use crate::db::{Database, DbError};
use crate::sync::manager::SyncOptions;

const CONFIG_KEY: &str = "engine_config";
const ENV_PREFIX: &str = "LEDGER_SYNC_";

/// Which remote the engine reconciles against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BackendConfig {
    /// WebDAV directory of JSON/CSV files
    #[serde(rename_all = "camelCase")]
    Files {
        server_url: String,
        #[serde(default)]
        remote_path: String,
        username: String,
        password: String,
    },
    /// Row-level REST backend
    #[serde(rename_all = "camelCase")]
    Structured { base_url: String, token: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub enabled: bool,
    pub device_id: String,
    pub backend: Option<BackendConfig>,
    pub debounce_secs: u64,
    pub poll_interval_secs: u64,
    pub max_conflict_retries: u32,
    pub request_timeout_secs: u64,
    pub attachment_cache_budget_bytes: u64,
    pub online: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device_id: default_device_id(),
            backend: None,
            debounce_secs: 3,
            poll_interval_secs: 300,
            max_conflict_retries: 3,
            request_timeout_secs: 30,
            attachment_cache_budget_bytes: DEFAULT_BUDGET_BYTES,
            online: true,
        }
    }
}

fn default_device_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

impl EngineConfig {
    /// Stored config, overridden by the process environment, validated
    pub fn load(db: &Database) -> Result<Self, ConfigError> {
        let mut config: EngineConfig = db.get_setting(CONFIG_KEY)?.unwrap_or_default();
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, db: &Database) -> Result<(), ConfigError> {
        self.validate()?;
        db.set_setting(CONFIG_KEY, self)?;
        log::info!("Engine config saved (device {})", self.device_id);
        Ok(())
    }

    /// Apply `LEDGER_SYNC_*` overrides from any key lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("ENABLED") {
            self.enabled = parse_env("ENABLED", &v)?;
        }
        if let Some(v) = var("ONLINE") {
            self.online = parse_env("ONLINE", &v)?;
        }
        if let Some(v) = var("DEVICE_ID") {
            self.device_id = v;
        }
        if let Some(v) = var("DEBOUNCE_SECS") {
            self.debounce_secs = parse_env("DEBOUNCE_SECS", &v)?;
        }
        if let Some(v) = var("POLL_INTERVAL_SECS") {
            self.poll_interval_secs = parse_env("POLL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = var("MAX_CONFLICT_RETRIES") {
            self.max_conflict_retries = parse_env("MAX_CONFLICT_RETRIES", &v)?;
        }
        if let Some(v) = var("REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_env("REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("CACHE_BUDGET_BYTES") {
            self.attachment_cache_budget_bytes = parse_env("CACHE_BUDGET_BYTES", &v)?;
        }

        match var("BACKEND").as_deref() {
            None => {}
            Some("files") => {
                let (server_url, remote_path, username, password) = match self.backend.take() {
                    Some(BackendConfig::Files { server_url, remote_path, username, password }) => {
                        (server_url, remote_path, username, password)
                    }
                    _ => Default::default(),
                };
                self.backend = Some(BackendConfig::Files {
                    server_url: var("SERVER_URL").unwrap_or(server_url),
                    remote_path: var("REMOTE_PATH").unwrap_or(remote_path),
                    username: var("USERNAME").unwrap_or(username),
                    password: var("PASSWORD").unwrap_or(password),
                });
            }
            Some("structured") => {
                let (base_url, token) = match self.backend.take() {
                    Some(BackendConfig::Structured { base_url, token }) => (base_url, token),
                    _ => Default::default(),
                };
                self.backend = Some(BackendConfig::Structured {
                    base_url: var("BASE_URL").unwrap_or(base_url),
                    token: var("TOKEN").unwrap_or(token),
                });
            }
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "{}BACKEND must be 'files' or 'structured', got '{}'",
                    ENV_PREFIX, other
                )));
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(30..=86_400).contains(&self.poll_interval_secs) {
            return Err(ConfigError::Invalid(format!(
                "pollIntervalSecs must be 30-86400, got {}",
                self.poll_interval_secs
            )));
        }
        if !(1..=600).contains(&self.debounce_secs) {
            return Err(ConfigError::Invalid(format!(
                "debounceSecs must be 1-600, got {}",
                self.debounce_secs
            )));
        }
        if !(1..=10).contains(&self.max_conflict_retries) {
            return Err(ConfigError::Invalid(format!(
                "maxConflictRetries must be 1-10, got {}",
                self.max_conflict_retries
            )));
        }
        if !(1..=600).contains(&self.request_timeout_secs) {
            return Err(ConfigError::Invalid(format!(
                "requestTimeoutSecs must be 1-600, got {}",
                self.request_timeout_secs
            )));
        }
        if self.attachment_cache_budget_bytes == 0 {
            return Err(ConfigError::Invalid("attachmentCacheBudgetBytes must be positive".to_string()));
        }

        match &self.backend {
            Some(BackendConfig::Files { server_url, .. }) => check_url("serverUrl", server_url)?,
            Some(BackendConfig::Structured { base_url, token }) => {
                check_url("baseUrl", base_url)?;
                if token.is_empty() {
                    return Err(ConfigError::Invalid("structured backend needs a token".to_string()));
                }
            }
            None => {}
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            max_conflict_retries: self.max_conflict_retries,
            request_timeout: self.request_timeout(),
            ..SyncOptions::default()
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{}{}: cannot parse '{}'", ENV_PREFIX, name, value)))
}

fn check_url(field: &str, value: &str) -> Result<(), ConfigError> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| ConfigError::Invalid(format!("{} '{}': {}", field, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.debounce_secs, 3);
        assert_eq!(config.poll_interval_secs, 300);
        assert_eq!(config.attachment_cache_budget_bytes, 64 * 1024 * 1024);
        assert!(!config.device_id.is_empty());
    }

    #[test]
    fn test_validation_ranges() {
        let mut config = EngineConfig { poll_interval_secs: 10, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.poll_interval_secs = 60;
        config.max_conflict_retries = 0;
        assert!(config.validate().is_err());

        config.max_conflict_retries = 10;
        config.debounce_secs = 601;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let db = Database::in_memory().unwrap();
        let config = EngineConfig {
            device_id: "laptop".to_string(),
            backend: Some(BackendConfig::Structured {
                base_url: "https://sync.example.com".to_string(),
                token: "tok".to_string(),
            }),
            ..Default::default()
        };
        config.save(&db).unwrap();

        let stored: EngineConfig = db.get_setting(CONFIG_KEY).unwrap().unwrap();
        assert_eq!(stored, config);
    }

    #[test]
    fn test_backend_json_shape() {
        let backend = BackendConfig::Files {
            server_url: "https://dav.example.com".to_string(),
            remote_path: "ledger".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
        };
        let json = serde_json::to_value(&backend).unwrap();
        assert_eq!(json["type"], "files");
        assert_eq!(json["serverUrl"], "https://dav.example.com");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::default();
        config
            .apply_env_from(env(&[
                ("LEDGER_SYNC_BACKEND", "files"),
                ("LEDGER_SYNC_SERVER_URL", "https://dav.example.com"),
                ("LEDGER_SYNC_USERNAME", "alice"),
                ("LEDGER_SYNC_POLL_INTERVAL_SECS", "600"),
                ("LEDGER_SYNC_ONLINE", "false"),
            ]))
            .unwrap();

        assert_eq!(config.poll_interval_secs, 600);
        assert!(!config.online);
        match config.backend {
            Some(BackendConfig::Files { server_url, username, .. }) => {
                assert_eq!(server_url, "https://dav.example.com");
                assert_eq!(username, "alice");
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = EngineConfig::default();
        assert!(config
            .apply_env_from(env(&[("LEDGER_SYNC_DEBOUNCE_SECS", "soon")]))
            .is_err());
        assert!(config
            .apply_env_from(env(&[("LEDGER_SYNC_BACKEND", "ftp")]))
            .is_err());
    }
}
