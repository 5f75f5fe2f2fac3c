#![allow(dead_code)]

pub mod range_server;

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use md5::{Digest, Md5};
use ota_updater::config::{DeviceConfig, RetryConfig, UpdaterConfig};
use ota_updater::installer::InstallerGateway;
use ota_updater::models::{InstallOutcome, UpdateInfo};

pub const DEVICE: &str = "lemon";
pub const RUNNING_VERSION: &str = "2.0";
pub const RUNNING_DATE: i64 = 1_690_000_000;

/// Deterministic, non-repeating-looking bytes.
pub fn body(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x1234_5678;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

pub fn ota_json(version: &str, date: i64, url: &str, body: &[u8]) -> Vec<u8> {
    serde_json::json!({
        "device": DEVICE,
        "version": version,
        "date": date,
        "url": url,
        "file_size": body.len(),
        "md5": md5_hex(body),
    })
    .to_string()
    .into_bytes()
}

pub fn update_info(version: &str, url: &str, body: &[u8]) -> UpdateInfo {
    UpdateInfo {
        device: DEVICE.into(),
        version: version.into(),
        build_date: 1_700_000_000,
        url: url.into(),
        file_name: format!("{DEVICE}-{version}.zip"),
        file_size: body.len() as u64,
        checksum: md5_hex(body),
    }
}

/// Config for a device running 2.0, talking to `metadata_url`, storing
/// everything under `data_dir`, retrying fast.
pub fn config(metadata_url: String, data_dir: &Path, chunk_size: usize) -> UpdaterConfig {
    UpdaterConfig {
        metadata_url,
        data_dir: data_dir.to_path_buf(),
        chunk_size_bytes: chunk_size,
        request_timeout_secs: 2,
        retry: RetryConfig {
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 50,
        },
        device: DeviceConfig {
            codename: Some(DEVICE.into()),
            version: Some(RUNNING_VERSION.into()),
            build_date: Some(RUNNING_DATE),
            properties: None,
        },
        ..UpdaterConfig::default()
    }
}

/// Records the artifacts it is asked to install and answers with a fixed
/// outcome after an optional delay.
pub struct FakeInstaller {
    outcome: InstallOutcome,
    delay: Duration,
    pub calls: Mutex<Vec<PathBuf>>,
}

impl FakeInstaller {
    pub fn new(outcome: InstallOutcome) -> Self {
        Self {
            outcome,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }
}

impl InstallerGateway for FakeInstaller {
    fn install<'a>(&'a self, artifact: &'a Path) -> BoxFuture<'a, InstallOutcome> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(artifact.to_path_buf());
            tokio::time::sleep(self.delay).await;
            self.outcome.clone()
        })
    }
}
