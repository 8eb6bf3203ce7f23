//! Configuration management with environment variable support.
//!
//! This module provides [`Config`] for loading and validating DropVault
//! settings from JSON files and environment variables. Every directory the
//! pipeline touches is an explicit value here and is handed to each
//! component's constructor.
//!
//! ## Environment Variables
//!
//! - `DROPVAULT_CONFIG`: Override config file path
//! - `DROPVAULT_STORAGE_DIR`: Override durable archive directory
//! - `DROPVAULT_TEMP_DIR`: Override temp directory (partial archives, decrypted cache)
//! - `DROPVAULT_DATABASE`: Override SQLite database path
//! - `DROPVAULT_MANUAL_KEY`: Override the manual encryption secret

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::keys::KeySource;

/// Environment variable names for configuration overrides
pub const ENV_CONFIG_PATH: &str = "DROPVAULT_CONFIG";
pub const ENV_STORAGE_DIR: &str = "DROPVAULT_STORAGE_DIR";
pub const ENV_TEMP_DIR: &str = "DROPVAULT_TEMP_DIR";
pub const ENV_DATABASE: &str = "DROPVAULT_DATABASE";
pub const ENV_MANUAL_KEY: &str = "DROPVAULT_MANUAL_KEY";

/// Payloads at or above this size take the streamed block-cipher path (50 MiB)
pub const DEFAULT_LARGE_THRESHOLD: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage_dir: String,
    pub temp_dir: String,
    pub database_path: String,
    #[serde(default)]
    pub encryption: CipherConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct CipherConfig {
    pub enabled: bool,
    pub key_source: KeySource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_key: Option<String>,
    #[serde(default = "default_large_threshold")]
    pub large_threshold_bytes: u64,
}

// manual_key stays out of Debug output
impl std::fmt::Debug for CipherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherConfig")
            .field("enabled", &self.enabled)
            .field("key_source", &self.key_source)
            .field("manual_key", &self.manual_key.as_ref().map(|_| "[REDACTED]"))
            .field("large_threshold_bytes", &self.large_threshold_bytes)
            .finish()
    }
}

fn default_large_threshold() -> u64 {
    DEFAULT_LARGE_THRESHOLD
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_source: KeySource::TransferName,
            manual_key: None,
            large_threshold_bytes: DEFAULT_LARGE_THRESHOLD,
        }
    }
}

impl CipherConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Files appended per batch before yielding
    pub batch_size: usize,
    /// Deflate each chunk inside the container
    #[serde(default)]
    pub compress: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            compress: false,
        }
    }
}

/// Upper bound for retention intervals and the cache TTL (ten years)
pub const MAX_RETENTION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub expired_sweep_interval_secs: u64,
    pub cache_sweep_interval_secs: u64,
    pub cache_ttl_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            expired_sweep_interval_secs: 24 * 60 * 60,
            cache_sweep_interval_secs: 60 * 60,
            cache_ttl_secs: 60 * 60,
        }
    }
}

impl RetentionConfig {
    pub fn expired_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expired_sweep_interval_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }

    /// Saturates instead of overflowing; `validate` rejects such values first.
    pub fn cache_ttl(&self) -> chrono::Duration {
        i64::try_from(self.cache_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: "./storage".to_string(),
            temp_dir: "./tmp".to_string(),
            database_path: "./dropvault.db".to_string(),
            encryption: CipherConfig::default(),
            archive: ArchiveConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file path
    pub fn load(path: &str) -> Result<Self> {
        let s =
            fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
        let mut config: Config =
            serde_json::from_str(&s).with_context(|| format!("parsing config file {}", path))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config with environment variable overrides
    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        let config_path = path
            .map(String::from)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok());

        let mut config = match config_path {
            Some(ref p) if Path::new(p).exists() => {
                info!(path = p, "loading config from file");
                let s = fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p))?;
                serde_json::from_str(&s).with_context(|| format!("parsing config file {}", p))?
            }
            _ => {
                debug!("using default configuration");
                Config::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to config
    fn apply_env_overrides(&mut self) {
        if let Ok(storage_dir) = env::var(ENV_STORAGE_DIR) {
            debug!(storage_dir = %storage_dir, "overriding storage_dir from environment");
            self.storage_dir = storage_dir;
        }

        if let Ok(temp_dir) = env::var(ENV_TEMP_DIR) {
            debug!(temp_dir = %temp_dir, "overriding temp_dir from environment");
            self.temp_dir = temp_dir;
        }

        if let Ok(db) = env::var(ENV_DATABASE) {
            debug!(database_path = %db, "overriding database_path from environment");
            self.database_path = db;
        }

        if let Ok(key) = env::var(ENV_MANUAL_KEY) {
            debug!("overriding manual_key from environment");
            self.encryption.manual_key = Some(key);
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.storage_dir.trim().is_empty() {
            anyhow::bail!("storage_dir cannot be empty");
        }

        if self.temp_dir.trim().is_empty() {
            anyhow::bail!("temp_dir cannot be empty");
        }

        if self.database_path.trim().is_empty() {
            anyhow::bail!("database_path cannot be empty");
        }

        if Path::new(&self.storage_dir) == Path::new(&self.temp_dir) {
            anyhow::bail!("storage_dir and temp_dir must be different directories");
        }

        if self.archive.batch_size == 0 {
            anyhow::bail!("archive.batch_size must be at least 1");
        }

        let r = &self.retention;
        if r.expired_sweep_interval_secs == 0 || r.cache_sweep_interval_secs == 0 {
            anyhow::bail!("retention sweep intervals must be non-zero");
        }
        if r.cache_ttl_secs == 0 {
            anyhow::bail!("retention.cache_ttl_secs must be non-zero");
        }
        for (field, secs) in [
            ("expired_sweep_interval_secs", r.expired_sweep_interval_secs),
            ("cache_sweep_interval_secs", r.cache_sweep_interval_secs),
            ("cache_ttl_secs", r.cache_ttl_secs),
        ] {
            if secs > MAX_RETENTION_SECS {
                anyhow::bail!("retention.{field} must be at most {MAX_RETENTION_SECS} seconds");
            }
        }

        let enc = &self.encryption;
        if enc.enabled
            && enc.key_source == KeySource::Manual
            && enc.manual_key.as_deref().map_or(true, |k| k.is_empty())
        {
            anyhow::bail!("encryption.manual_key is required when key_source is \"manual\"");
        }

        if enc.enabled && enc.key_source == KeySource::Timestamp {
            warn!("timestamp key source derives keys from public metadata - archives are obfuscated, not secret");
        }

        Ok(())
    }

    pub fn new(
        storage_dir: impl Into<String>,
        temp_dir: impl Into<String>,
        database_path: impl Into<String>,
    ) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            temp_dir: temp_dir.into(),
            database_path: database_path.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_manual_source_requires_key() {
        let mut cfg = Config::default();
        cfg.encryption.key_source = KeySource::Manual;
        assert!(cfg.validate().is_err());

        cfg.encryption.manual_key = Some("operator-secret".into());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut cfg = Config::default();
        cfg.archive.batch_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_oversized_retention_rejected() {
        let mut cfg = Config::default();
        cfg.retention.cache_ttl_secs = u64::MAX;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("cache_ttl_secs"));
        assert_eq!(cfg.retention.cache_ttl(), chrono::Duration::MAX);

        let mut cfg = Config::default();
        cfg.retention.expired_sweep_interval_secs = MAX_RETENTION_SECS + 1;
        assert!(cfg.validate().is_err());

        cfg.retention.expired_sweep_interval_secs = MAX_RETENTION_SECS;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_parse_minimal_json() {
        let json = r#"{
            "storage_dir": "/srv/dv/storage",
            "temp_dir": "/srv/dv/tmp",
            "database_path": "/srv/dv/db.sqlite",
            "encryption": { "enabled": true, "key_source": "email" }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.encryption.key_source, KeySource::Email);
        assert_eq!(cfg.encryption.large_threshold_bytes, DEFAULT_LARGE_THRESHOLD);
        assert_eq!(cfg.archive.batch_size, 50);
        assert_eq!(cfg.retention.cache_ttl_secs, 3600);
    }

    #[test]
    fn test_debug_hides_manual_key() {
        let enc = CipherConfig {
            manual_key: Some("hunter2".into()),
            ..Default::default()
        };
        assert!(!format!("{enc:?}").contains("hunter2"));
    }
}
