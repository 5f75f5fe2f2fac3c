use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::integrity::{ChecksumAlgorithm, IntegrityError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Checksum(#[from] IntegrityError),
}

/// Retry policy parameters (optional `[retry]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// Where the running build is described when there is no static `[device]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertiesConfig {
    pub file: PathBuf,
    pub device_key: String,
    pub version_key: String,
    pub date_key: String,
}

impl Default for PropertiesConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("/system/build.prop"),
            device_key: "ro.arcana.device".into(),
            version_key: "ro.arcana.version".into(),
            date_key: "ro.arcana.build_date_utc".into(),
        }
    }
}

/// Description of the running build. Static values win over the
/// properties file when both are given.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub codename: Option<String>,
    pub version: Option<String>,
    pub build_date: Option<i64>,
    pub properties: Option<PropertiesConfig>,
}

/// External program that applies a verified artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    pub program: String,
    /// `{file}` is replaced with the artifact path.
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            program: "update_engine_client".into(),
            args: vec!["--update".into(), "--payload=file://{file}".into()],
            env: BTreeMap::new(),
        }
    }
}

/// Updater configuration, typically `/etc/ota-updater/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Metadata endpoint; `{device}` is replaced with the device codename.
    pub metadata_url: String,
    /// Holds `state.db` and the `downloads/` directory.
    pub data_dir: PathBuf,
    pub checksum_algorithm: String,
    /// Bytes written between two persisted progress records.
    pub chunk_size_bytes: usize,
    pub request_timeout_secs: u64,
    /// Hash bytes as they are written instead of re-reading the whole file.
    pub verify_inline: bool,
    pub check_interval_secs: u64,
    pub auto_download: bool,
    pub user_agent: String,
    pub retry: RetryConfig,
    pub device: DeviceConfig,
    pub installer: InstallerConfig,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            metadata_url: "https://ota.example.com/{device}/ota.json".into(),
            data_dir: PathBuf::from("/var/lib/ota-updater"),
            checksum_algorithm: "md5".into(),
            chunk_size_bytes: 1024 * 1024,
            request_timeout_secs: 30,
            verify_inline: false,
            check_interval_secs: 7 * 24 * 60 * 60,
            auto_download: false,
            user_agent: concat!("ota-updater/", env!("CARGO_PKG_VERSION")).into(),
            retry: RetryConfig::default(),
            device: DeviceConfig::default(),
            installer: InstallerConfig::default(),
        }
    }
}

impl UpdaterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: UpdaterConfig = toml::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Like [`load`](Self::load) but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metadata_url.trim().is_empty() {
            return Err(ConfigError::Invalid("metadata_url is empty".into()));
        }
        if self.chunk_size_bytes == 0 {
            return Err(ConfigError::Invalid("chunk_size_bytes must be positive".into()));
        }
        if self.installer.program.trim().is_empty() {
            return Err(ConfigError::Invalid("installer.program is empty".into()));
        }
        self.algorithm()?;
        Ok(())
    }

    pub fn algorithm(&self) -> Result<ChecksumAlgorithm, ConfigError> {
        Ok(self.checksum_algorithm.parse()?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg: UpdaterConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.checksum_algorithm, "md5");
        assert_eq!(cfg.chunk_size_bytes, 1024 * 1024);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert!(!cfg.verify_inline);
        cfg.validate().unwrap();
    }

    #[test]
    fn custom_values() {
        let toml = r#"
            metadata_url = "http://ota.local/{device}.json"
            data_dir = "/data/ota"
            checksum_algorithm = "sha256"
            chunk_size_bytes = 65536
            verify_inline = true

            [retry]
            max_attempts = 2
            base_delay_ms = 10

            [device]
            codename = "lemon"
            version = "2.0"
            build_date = 1690000000

            [installer]
            program = "/usr/bin/apply-ota"
            args = ["{file}"]
        "#;
        let cfg: UpdaterConfig = toml::from_str(toml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.algorithm().unwrap(), ChecksumAlgorithm::Sha256);
        assert_eq!(cfg.database_path(), PathBuf::from("/data/ota/state.db"));
        assert_eq!(cfg.retry.max_attempts, 2);
        assert_eq!(cfg.retry.base_delay_ms, 10);
        assert_eq!(cfg.retry.max_delay_ms, 30_000);
        assert_eq!(cfg.device.codename.as_deref(), Some("lemon"));
        assert_eq!(cfg.installer.args, vec!["{file}".to_string()]);
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let cfg: UpdaterConfig = toml::from_str(r#"checksum_algorithm = "crc32""#).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Checksum(IntegrityError::HashUnavailable(_)))));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let cfg: UpdaterConfig = toml::from_str("chunk_size_bytes = 0").unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = UpdaterConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.check_interval_secs, 7 * 24 * 60 * 60);
    }
}
