// src/environment.rs

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::config::{DeviceConfig, PropertiesConfig};

const UNAVAILABLE: &str = "unavailable";

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("failed to read build properties {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Source of the running build's identity, substitutable in tests.
pub trait DeviceEnvironment: Send + Sync {
    fn codename(&self) -> String;
    fn version(&self) -> String;
    /// Seconds since the epoch, 0 when unknown.
    fn build_date(&self) -> i64;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticEnvironment {
    pub codename: String,
    pub version: String,
    pub build_date: i64,
}

impl StaticEnvironment {
    pub fn new(codename: impl Into<String>, version: impl Into<String>, build_date: i64) -> Self {
        Self {
            codename: codename.into(),
            version: version.into(),
            build_date,
        }
    }
}

impl DeviceEnvironment for StaticEnvironment {
    fn codename(&self) -> String {
        self.codename.clone()
    }

    fn version(&self) -> String {
        self.version.clone()
    }

    fn build_date(&self) -> i64 {
        self.build_date
    }
}

/// Reads `key=value` pairs from a build properties file, once.
#[derive(Debug, Clone)]
pub struct PropertyFileEnvironment {
    props: HashMap<String, String>,
    keys: PropertiesConfig,
}

impl PropertyFileEnvironment {
    pub fn load(keys: PropertiesConfig) -> Result<Self, EnvironmentError> {
        let data = std::fs::read_to_string(&keys.file).map_err(|source| EnvironmentError::Read {
            path: keys.file.display().to_string(),
            source,
        })?;
        Ok(Self {
            props: parse_properties(&data),
            keys,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }
}

impl DeviceEnvironment for PropertyFileEnvironment {
    fn codename(&self) -> String {
        self.get(&self.keys.device_key).unwrap_or(UNAVAILABLE).to_string()
    }

    fn version(&self) -> String {
        self.get(&self.keys.version_key).unwrap_or(UNAVAILABLE).to_string()
    }

    fn build_date(&self) -> i64 {
        match self.get(&self.keys.date_key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(value = raw, "unparseable build date property");
                0
            }),
            None => 0,
        }
    }
}

fn parse_properties(data: &str) -> HashMap<String, String> {
    data.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// Build the environment described by the `[device]` config section.
/// Static fields override values read from the properties file.
pub fn from_config(cfg: &DeviceConfig) -> Result<Arc<dyn DeviceEnvironment>, EnvironmentError> {
    let props = match &cfg.properties {
        Some(keys) => Some(PropertyFileEnvironment::load(keys.clone())?),
        None if cfg.codename.is_none() => {
            let keys = PropertiesConfig::default();
            if Path::new(&keys.file).exists() {
                Some(PropertyFileEnvironment::load(keys)?)
            } else {
                None
            }
        }
        None => None,
    };

    let codename = cfg
        .codename
        .clone()
        .or_else(|| props.as_ref().map(|p| p.codename()))
        .unwrap_or_else(|| UNAVAILABLE.to_string());
    let version = cfg
        .version
        .clone()
        .or_else(|| props.as_ref().map(|p| p.version()))
        .unwrap_or_else(|| UNAVAILABLE.to_string());
    let build_date = cfg
        .build_date
        .or_else(|| props.as_ref().map(|p| p.build_date()))
        .unwrap_or(0);

    Ok(Arc::new(StaticEnvironment::new(codename, version, build_date)))
}
