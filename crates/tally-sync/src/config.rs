//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_DEVICE_ID=till-02                                            │
//! │     TALLY_REMOTE_URL=wss://sync.example.com/v1                         │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally-pos/sync.toml (Linux)                              │
//! │     ~/Library/Application Support/com.tally.pos/sync.toml (macOS)      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     auto-generated device id, all tables, 500-record commits           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Register 1"
//!
//! [store]
//! id = "store-001"
//! name = "Downtown Branch"
//!
//! [sync]
//! remote_url = "wss://sync.example.com/v1"
//! transport_limit = 500
//! flush_interval_secs = 30
//! flush_threshold = 50
//! max_attempts = 5
//! tables = ["products", "sales", "sale_items"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tally_core::{SyncTable, DEFAULT_TRANSPORT_LIMIT};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Device & Store
// =============================================================================

/// Identity of this terminal. Stamped on every outbound write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,

    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "POS Terminal".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            id: "default-store".to_string(),
            name: "Default Store".to_string(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Tuning for the outbound and inbound paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// WebSocket endpoint of the remote store (`ws://` or `wss://`).
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Maximum records per remote commit.
    #[serde(default = "default_transport_limit")]
    pub transport_limit: usize,

    /// Maximum records taken from the queue per flush round.
    #[serde(default = "default_flush_max_records")]
    pub flush_max_records: usize,

    /// Periodic flush interval.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Queue length that triggers a flush without waiting for the timer.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    /// Upper bound on a single remote commit.
    #[serde(default = "default_commit_timeout")]
    pub commit_timeout_secs: u64,

    /// Transmission attempts before a record is left `failed`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Inbound notifications applied per local-store round.
    #[serde(default = "default_inbound_batch_size")]
    pub inbound_batch_size: usize,

    /// Collections kept in sync.
    #[serde(default = "default_tables")]
    pub tables: Vec<SyncTable>,
}

fn default_transport_limit() -> usize {
    DEFAULT_TRANSPORT_LIMIT
}
fn default_flush_max_records() -> usize {
    DEFAULT_TRANSPORT_LIMIT
}
fn default_flush_interval() -> u64 {
    30
}
fn default_flush_threshold() -> usize {
    50
}
fn default_commit_timeout() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff() -> u64 {
    1_000
}
fn default_max_backoff() -> u64 {
    300
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_inbound_batch_size() -> usize {
    100
}
fn default_tables() -> Vec<SyncTable> {
    SyncTable::ALL.to_vec()
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            remote_url: None,
            transport_limit: default_transport_limit(),
            flush_max_records: default_flush_max_records(),
            flush_interval_secs: default_flush_interval(),
            flush_threshold: default_flush_threshold(),
            commit_timeout_secs: default_commit_timeout(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            inbound_batch_size: default_inbound_batch_size(),
            tables: default_tables(),
        }
    }
}

// =============================================================================
// Sync Config
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub sync: SyncSettings,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration: defaults, then the TOML file (if present), then
    /// environment overrides, then validation.
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Like [`load`](Self::load), falling back to defaults on any error.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        if let Some(ref raw) = self.sync.remote_url {
            let url = url::Url::parse(raw)?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(SyncError::InvalidUrl(format!(
                    "Remote URL must start with ws:// or wss://, got: {}",
                    raw
                )));
            }
        }

        if self.sync.transport_limit == 0 {
            return Err(SyncError::InvalidConfig(
                "transport_limit must be greater than 0".into(),
            ));
        }

        if self.sync.flush_max_records == 0 {
            return Err(SyncError::InvalidConfig(
                "flush_max_records must be greater than 0".into(),
            ));
        }

        if self.sync.max_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }

        if self.sync.flush_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "flush_interval_secs must be greater than 0".into(),
            ));
        }

        if self.sync.commit_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "commit_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.sync.backoff_multiplier < 1.0 {
            return Err(SyncError::InvalidConfig(
                "backoff_multiplier must be at least 1.0".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `TALLY_*` overrides from `lookup`. Unparseable values are
    /// logged and ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("TALLY_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Some(name) = lookup("TALLY_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Some(id) = lookup("TALLY_STORE_ID") {
            self.store.id = id;
        }

        if let Some(url) = lookup("TALLY_REMOTE_URL") {
            debug!(url = %url, "Overriding remote URL from environment");
            self.sync.remote_url = Some(url);
        }

        if let Some(raw) = lookup("TALLY_TRANSPORT_LIMIT") {
            match raw.parse() {
                Ok(limit) => self.sync.transport_limit = limit,
                Err(_) => warn!(value = %raw, "Ignoring invalid TALLY_TRANSPORT_LIMIT"),
            }
        }

        if let Some(raw) = lookup("TALLY_FLUSH_INTERVAL_SECS") {
            match raw.parse() {
                Ok(secs) => self.sync.flush_interval_secs = secs,
                Err(_) => warn!(value = %raw, "Ignoring invalid TALLY_FLUSH_INTERVAL_SECS"),
            }
        }

        if let Some(raw) = lookup("TALLY_MAX_ATTEMPTS") {
            match raw.parse() {
                Ok(attempts) => self.sync.max_attempts = attempts,
                Err(_) => warn!(value = %raw, "Ignoring invalid TALLY_MAX_ATTEMPTS"),
            }
        }

        if let Some(raw) = lookup("TALLY_SYNC_TABLES") {
            let parsed: Result<Vec<SyncTable>, _> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect();
            match parsed {
                Ok(tables) => self.sync.tables = tables,
                Err(e) => warn!(value = %raw, error = %e, "Ignoring invalid TALLY_SYNC_TABLES"),
            }
        }
    }

    /// Platform config location: `<config dir>/sync.toml`.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "tally", "pos")
            .map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn remote_url(&self) -> Option<&str> {
        self.sync.remote_url.as_deref()
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.sync.flush_interval_secs)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.commit_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.sync.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.sync.max_backoff_secs)
    }

    /// Retry backoff built from the configured bounds. Never gives up on its
    /// own; the attempt budget is enforced per record.
    pub fn retry_backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoff {
            initial_interval: self.initial_backoff(),
            max_interval: self.max_backoff(),
            multiplier: self.sync.backoff_multiplier,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.device.id.is_empty());
        assert_eq!(config.sync.transport_limit, 500);
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(config.sync.tables.len(), SyncTable::ALL.len());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.device.id = String::new();
        assert!(matches!(config.validate(), Err(SyncError::MissingDeviceId)));

        config.device.id = "till-01".to_string();
        config.sync.remote_url = Some("http://sync.example.com".to_string());
        assert!(config.validate().is_err());

        config.sync.remote_url = Some("not a url".to_string());
        assert!(config.validate().is_err());

        config.sync.remote_url = Some("wss://sync.example.com/v1".to_string());
        assert!(config.validate().is_ok());

        config.sync.transport_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("TALLY_DEVICE_ID", "till-07"),
            ("TALLY_REMOTE_URL", "ws://localhost:9000"),
            ("TALLY_TRANSPORT_LIMIT", "250"),
            ("TALLY_MAX_ATTEMPTS", "many"),
            ("TALLY_SYNC_TABLES", "products, sales"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.device_id(), "till-07");
        assert_eq!(config.remote_url(), Some("ws://localhost:9000"));
        assert_eq!(config.sync.transport_limit, 250);
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(
            config.sync.tables,
            vec![SyncTable::Products, SyncTable::Sales]
        );
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = SyncConfig::default();
        config.sync.tables = vec![SyncTable::Products, SyncTable::StockAdjustments];

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[device]"));
        assert!(toml_str.contains("[sync]"));
        assert!(toml_str.contains("stock_adjustments"));

        let parsed: SyncConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.device.id, config.device.id);
        assert_eq!(parsed.sync.tables, config.sync.tables);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: SyncConfig = toml::from_str(
            r#"
            [device]
            id = "till-03"

            [sync]
            flush_threshold = 10
            "#,
        )
        .unwrap();

        assert_eq!(parsed.device.name, "POS Terminal");
        assert_eq!(parsed.sync.flush_threshold, 10);
        assert_eq!(parsed.sync.transport_limit, 500);
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.toml");

        let mut config = SyncConfig::default();
        config.device.id = "till-09".to_string();
        config.save(Some(path.clone())).unwrap();

        let loaded = SyncConfig::load(Some(path)).unwrap();
        // An ambient TALLY_DEVICE_ID would win over the file
        if std::env::var("TALLY_DEVICE_ID").is_err() {
            assert_eq!(loaded.device_id(), "till-09");
        }
    }
}
