// src/metadata.rs

use std::sync::RwLock;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::integrity::ChecksumAlgorithm;
use crate::models::{FailureReason, UpdateInfo};
use crate::retry::{run_with_retry, RetryPolicy};

#[derive(Debug, Error)]
pub enum MetadataError {
    /// Worth retrying: connection trouble or a 5xx/429 from the server.
    #[error("network error: {0}")]
    Network(String),
    /// The server answered, but not with something usable.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl MetadataError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MetadataError::Network(_))
    }

    pub fn to_failure(&self) -> FailureReason {
        match self {
            MetadataError::Network(msg) => FailureReason::Network(msg.clone()),
            MetadataError::MalformedResponse(msg) => FailureReason::MalformedResponse(msg.clone()),
        }
    }
}

/// Wire format of the per-device `ota.json` document.
#[derive(Debug, Deserialize)]
struct OtaDocument {
    device: Option<String>,
    version: String,
    #[serde(alias = "build_date")]
    date: i64,
    url: String,
    file_name: Option<String>,
    #[serde(alias = "size")]
    file_size: u64,
    #[serde(alias = "md5", alias = "sha256")]
    checksum: String,
}

/// Parse and validate a metadata document for `device`.
pub fn parse_document(body: &[u8], device: &str, algorithm: ChecksumAlgorithm) -> Result<UpdateInfo, MetadataError> {
    let doc: OtaDocument =
        serde_json::from_slice(body).map_err(|e| MetadataError::MalformedResponse(e.to_string()))?;

    let version = doc.version.trim().to_string();
    if version.is_empty() {
        return Err(MetadataError::MalformedResponse("empty version".into()));
    }
    if let Some(doc_device) = doc.device.as_deref() {
        if doc_device != device {
            return Err(MetadataError::MalformedResponse(format!(
                "document is for device {doc_device}, expected {device}"
            )));
        }
    }
    let url = reqwest::Url::parse(doc.url.trim())
        .map_err(|e| MetadataError::MalformedResponse(format!("bad download url: {e}")))?;
    if doc.file_size == 0 {
        return Err(MetadataError::MalformedResponse("file size is zero".into()));
    }
    let checksum = doc.checksum.trim().to_ascii_lowercase();
    if checksum.len() != algorithm.hex_len() || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(MetadataError::MalformedResponse(format!(
            "checksum {checksum:?} is not a {algorithm} digest"
        )));
    }
    let file_name = doc
        .file_name
        .filter(|name| !name.trim().is_empty())
        .or_else(|| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("{device}-{version}.zip"));

    Ok(UpdateInfo {
        device: device.to_string(),
        version,
        build_date: doc.date,
        url: url.to_string(),
        file_name,
        file_size: doc.file_size,
        checksum,
    })
}

/// Fetches [`UpdateInfo`] from the configured endpoint and remembers the
/// last good answer. The cache is only replaced by another successful fetch.
pub struct MetadataRepository {
    client: Client,
    url_template: String,
    algorithm: ChecksumAlgorithm,
    retry: RetryPolicy,
    timeout: Duration,
    cache: RwLock<Option<UpdateInfo>>,
}

impl MetadataRepository {
    /// `url_template` may contain `{device}`.
    pub fn new(client: Client, url_template: impl Into<String>, algorithm: ChecksumAlgorithm, retry: RetryPolicy) -> Self {
        Self {
            client,
            url_template: url_template.into(),
            algorithm,
            retry,
            timeout: Duration::from_secs(30),
            cache: RwLock::new(None),
        }
    }

    /// Bound on one request, from connect to the last body byte.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn fetch_latest(&self, device: &str) -> Result<UpdateInfo, MetadataError> {
        let url = self.url_template.replace("{device}", device);
        debug!(%url, "fetching update metadata");
        let info = run_with_retry(&self.retry, MetadataError::is_transient, || self.fetch_once(&url, device)).await?;
        info!(version = %info.version, size = info.file_size, "latest build");
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(info.clone());
        Ok(info)
    }

    /// Last successfully fetched build, without touching the network.
    pub fn cached(&self) -> Option<UpdateInfo> {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn fetch_once(&self, url: &str, device: &str) -> Result<UpdateInfo, MetadataError> {
        let request = async {
            let resp = self.client.get(url).send().await.map_err(classify_request_error)?;
            let status = resp.status();
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(MetadataError::Network(format!("HTTP {status}")));
            }
            if !status.is_success() {
                return Err(MetadataError::MalformedResponse(format!("HTTP {status}")));
            }
            resp.bytes().await.map_err(|e| MetadataError::Network(e.to_string()))
        };
        let body = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| MetadataError::Network(format!("no response within {:?}", self.timeout)))??;
        parse_document(&body, device, self.algorithm)
    }
}

fn classify_request_error(e: reqwest::Error) -> MetadataError {
    if e.is_builder() {
        MetadataError::MalformedResponse(e.to_string())
    } else {
        MetadataError::Network(e.to_string())
    }
}
