// src/downloader.rs

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{header, Client, StatusCode};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::integrity::{self, Checksum, ChecksumAlgorithm, IntegrityError};
use crate::models::{DownloadSession, FailureReason, SessionStatus, UpdateInfo};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::state_manager::{StateError, StateManager};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server refused transfer: HTTP {0}")]
    Http(StatusCode),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("server sent {actual} bytes, expected {expected}")]
    Oversized { expected: u64, actual: u64 },
    #[error("download paused")]
    Paused,
    #[error("download cancelled")]
    Cancelled,
}

/// Tunables for the transfer loop.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub download_dir: PathBuf,
    pub algorithm: ChecksumAlgorithm,
    /// Bytes buffered between two persisted progress records.
    pub chunk_size: usize,
    /// A body read that makes no progress for this long counts as a disconnect.
    pub idle_timeout: Duration,
    pub verify_inline: bool,
    pub retry: RetryPolicy,
}

impl DownloadConfig {
    pub fn new(download_dir: impl Into<PathBuf>, algorithm: ChecksumAlgorithm) -> Self {
        Self {
            download_dir: download_dir.into(),
            algorithm,
            chunk_size: 1024 * 1024,
            idle_timeout: Duration::from_secs(30),
            verify_inline: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Status change of one transfer, delivered in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub transfer: u64,
    pub key: String,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    Progress { bytes_written: u64, total_bytes: u64 },
    /// Connection lost; the session is paused and will be retried.
    Interrupted { attempt: u32, error: String },
    Paused,
    Verifying,
    Verified { path: PathBuf },
    Failed(FailureReason),
}

/// Handle returned by [`DownloadManager::start_or_resume`].
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: u64,
    pub session: DownloadSession,
}

struct ActiveTransfer {
    id: u64,
    pause: CancellationToken,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns every download session and the files behind them.
pub struct DownloadManager {
    client: Client,
    store: StateManager,
    config: Arc<DownloadConfig>,
    events: mpsc::UnboundedSender<SessionEvent>,
    active: Mutex<HashMap<String, ActiveTransfer>>,
    next_transfer: AtomicU64,
}

impl DownloadManager {
    /// Sessions left `InProgress`/`Verifying` by a previous process are
    /// marked `Paused` so they resume on the next start.
    pub async fn new(
        client: Client,
        store: StateManager,
        config: DownloadConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, DownloadError> {
        for mut session in store.load_all_sessions().await? {
            if matches!(
                session.status,
                SessionStatus::Pending | SessionStatus::InProgress | SessionStatus::Verifying
            ) {
                info!(key = session.key(), bytes = session.bytes_written, "recovered interrupted session");
                session.status = SessionStatus::Paused;
                store.save_session(&session).await?;
            }
        }

        Ok(Self {
            client,
            store,
            config: Arc::new(config),
            events,
            active: Mutex::new(HashMap::new()),
            next_transfer: AtomicU64::new(1),
        })
    }

    /// Where bytes for `info` accumulate until verified.
    pub fn partial_path(&self, info: &UpdateInfo) -> PathBuf {
        partial_path(&self.config.download_dir, info)
    }

    /// Start a transfer for `info`, or resume its persisted session.
    ///
    /// While a transfer for the same checksum is running this is a no-op
    /// returning that transfer. An already verified artifact is reported
    /// again without touching the network.
    pub async fn start_or_resume(&self, info: &UpdateInfo) -> Result<Transfer, DownloadError> {
        let key = info.session_key().to_string();
        let mut active = self.active.lock().await;

        if let Some(running) = active.get(&key) {
            if !running.handle.is_finished() {
                let session = self
                    .store
                    .load_session(&key)
                    .await?
                    .unwrap_or_else(|| DownloadSession::new(info.clone(), self.partial_path(info)));
                debug!(key = %key, transfer = running.id, "transfer already running");
                return Ok(Transfer {
                    id: running.id,
                    session,
                });
            }
        }
        active.remove(&key);

        let id = self.next_transfer.fetch_add(1, Ordering::SeqCst);
        let session = self.prepare_session(info).await?;

        if session.status == SessionStatus::Verified {
            info!(key = %key, "artifact already verified");
            let _ = self.events.send(SessionEvent {
                transfer: id,
                key,
                kind: SessionEventKind::Verified {
                    path: session.path.clone(),
                },
            });
            return Ok(Transfer { id, session });
        }

        info!(
            version = %info.version,
            offset = session.bytes_written,
            total = session.total_bytes,
            transfer = id,
            "starting transfer"
        );

        let pause = CancellationToken::new();
        let cancel = CancellationToken::new();
        let worker = Worker {
            id,
            client: self.client.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            pause: pause.clone(),
            cancel: cancel.clone(),
            session: session.clone(),
            checksum: None,
        };
        let handle = tokio::spawn(worker.run());
        active.insert(
            key,
            ActiveTransfer {
                id,
                pause,
                cancel,
                handle,
            },
        );

        Ok(Transfer { id, session })
    }

    /// Stop the transfer at the next chunk boundary, keeping its progress.
    /// Returns once the session has been persisted as `Paused`.
    pub async fn pause(&self, key: &str) -> Result<(), DownloadError> {
        let mut active = self.active.lock().await;
        if let Some(running) = active.remove(key) {
            info!(key, "pausing transfer");
            running.pause.cancel();
            let _ = running.handle.await;
        }
        Ok(())
    }

    /// Stop the transfer and discard its session and files. Cancelling an
    /// unknown or already cancelled session does nothing.
    pub async fn cancel(&self, key: &str) -> Result<(), DownloadError> {
        let mut active = self.active.lock().await;
        if let Some(running) = active.remove(key) {
            info!(key, "cancelling transfer");
            running.cancel.cancel();
            let _ = running.handle.await;
        }
        if let Some(session) = self.store.load_session(key).await? {
            remove_if_exists(&self.partial_path(&session.update)).await?;
            remove_if_exists(&session.path).await?;
            self.store.delete_session(key).await?;
            debug!(key, "session discarded");
        }
        Ok(())
    }

    /// Cancel and discard every session other than `keep`.
    pub async fn discard_all_except(&self, keep: Option<&str>) -> Result<(), DownloadError> {
        let stale: Vec<String> = self
            .store
            .load_all_sessions()
            .await?
            .iter()
            .map(|s| s.key().to_string())
            .filter(|k| Some(k.as_str()) != keep)
            .collect();
        for key in stale {
            info!(key = %key, "discarding superseded session");
            self.cancel(&key).await?;
        }
        Ok(())
    }

    pub async fn session(&self, key: &str) -> Result<Option<DownloadSession>, DownloadError> {
        Ok(self.store.load_session(key).await?)
    }

    pub async fn is_running(&self, key: &str) -> bool {
        self.active
            .lock()
            .await
            .get(key)
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Path of the artifact for `key`, only if its session is `Verified` and
    /// the file on disk still has the expected size.
    pub async fn verified_artifact(&self, key: &str) -> Result<Option<PathBuf>, DownloadError> {
        let Some(session) = self.store.load_session(key).await? else {
            return Ok(None);
        };
        if session.status != SessionStatus::Verified {
            return Ok(None);
        }
        match tokio::fs::metadata(&session.path).await {
            Ok(meta) if meta.len() == session.total_bytes => Ok(Some(session.path)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Abort every running transfer without recording anything, the way a
    /// killed process would leave them.
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        for (_, running) in active.drain() {
            running.handle.abort();
            let _ = running.handle.await;
        }
    }

    async fn prepare_session(&self, info: &UpdateInfo) -> Result<DownloadSession, DownloadError> {
        let part = self.partial_path(info);
        let existing = self.store.load_session(info.session_key()).await?;

        let resumed = match existing {
            Some(s) if s.status == SessionStatus::Verified => {
                if file_len(&s.path).await? == Some(s.total_bytes) {
                    return Ok(s);
                }
                None
            }
            Some(mut s) if s.is_resumable() => match file_len(&part).await? {
                Some(on_disk) if on_disk <= s.total_bytes => {
                    let offset = on_disk.min(s.bytes_written);
                    if on_disk > offset {
                        debug!(on_disk, offset, "trimming unrecorded tail of partial file");
                    }
                    truncate(&part, offset).await?;
                    s.bytes_written = offset;
                    s.path = part.clone();
                    s.update = info.clone();
                    Some(s)
                }
                _ => None,
            },
            _ => None,
        };

        let mut session = match resumed {
            Some(s) => {
                info!(offset = s.bytes_written, "resuming partial download");
                s
            }
            None => {
                tokio::fs::create_dir_all(&self.config.download_dir).await?;
                truncate(&part, 0).await?;
                DownloadSession::new(info.clone(), part)
            }
        };
        session.status = SessionStatus::InProgress;
        self.store.save_session(&session).await?;
        Ok(session)
    }
}

/// `<download_dir>/<file_name>.part`, with the file name reduced to its last
/// path component.
pub fn partial_path(download_dir: &Path, info: &UpdateInfo) -> PathBuf {
    download_dir.join(format!("{}.part", artifact_name(info)))
}

fn final_path(download_dir: &Path, info: &UpdateInfo) -> PathBuf {
    download_dir.join(artifact_name(info))
}

fn artifact_name(info: &UpdateInfo) -> String {
    Path::new(&info.file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "..")
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}.zip", info.version))
}

async fn file_len(path: &Path) -> Result<Option<u64>, std::io::Error> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

async fn truncate(path: &Path, len: u64) -> Result<(), std::io::Error> {
    let file = OpenOptions::new().create(true).write(true).open(path).await?;
    file.set_len(len).await?;
    file.sync_all().await
}

async fn remove_if_exists(path: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Outcome of waiting on the next body chunk.
enum Next<B> {
    Data(B),
    Broken(reqwest::Error),
    End,
    Stalled,
    Paused,
    Cancelled,
}

/// Runs one transfer to completion, pause, cancellation or failure.
struct Worker {
    id: u64,
    client: Client,
    store: StateManager,
    config: Arc<DownloadConfig>,
    events: mpsc::UnboundedSender<SessionEvent>,
    pause: CancellationToken,
    cancel: CancellationToken,
    session: DownloadSession,
    checksum: Option<Checksum>,
}

impl Worker {
    async fn run(mut self) {
        match self.download_with_retry().await {
            Ok(()) => self.verify().await,
            Err(DownloadError::Cancelled) => debug!(transfer = self.id, "transfer cancelled"),
            Err(DownloadError::Paused) => {
                info!(transfer = self.id, bytes = self.session.bytes_written, "transfer paused");
                self.record(SessionStatus::Paused, SessionEventKind::Paused).await;
            }
            Err(DownloadError::Network(msg)) => {
                warn!(transfer = self.id, error = %msg, "giving up after repeated network failures");
                self.record(
                    SessionStatus::Paused,
                    SessionEventKind::Failed(FailureReason::Network(msg)),
                )
                .await;
            }
            Err(DownloadError::Http(status)) => {
                warn!(transfer = self.id, %status, "server refused transfer");
                self.record(
                    SessionStatus::Paused,
                    SessionEventKind::Failed(FailureReason::Network(format!("HTTP {status}"))),
                )
                .await;
            }
            Err(DownloadError::Oversized { expected, actual }) => {
                error!(transfer = self.id, expected, actual, "server sent more bytes than expected");
                self.discard_file().await;
                let reason = FailureReason::SizeMismatch { expected, actual };
                self.record(SessionStatus::Failed(reason.clone()), SessionEventKind::Failed(reason))
                    .await;
            }
            Err(e) => {
                error!(transfer = self.id, error = %e, "local storage failure");
                let reason = FailureReason::Io(e.to_string());
                self.record(SessionStatus::Failed(reason.clone()), SessionEventKind::Failed(reason))
                    .await;
            }
        }
    }

    fn emit(&self, kind: SessionEventKind) {
        let _ = self.events.send(SessionEvent {
            transfer: self.id,
            key: self.session.key().to_string(),
            kind,
        });
    }

    async fn persist(&self) -> Result<(), StateError> {
        self.store.save_session(&self.session).await
    }

    /// Persist a terminal status and announce it. A failure to persist is
    /// reported in place of the requested event.
    async fn record(&mut self, status: SessionStatus, kind: SessionEventKind) {
        self.session.status = status;
        match self.persist().await {
            Ok(()) => self.emit(kind),
            Err(e) => {
                error!(transfer = self.id, error = %e, "failed to persist session");
                self.emit(SessionEventKind::Failed(FailureReason::Io(e.to_string())));
            }
        }
    }

    async fn download_with_retry(&mut self) -> Result<(), DownloadError> {
        let policy = self.config.retry;
        let pause = self.pause.clone();
        let cancel = self.cancel.clone();
        let mut attempt = 1u32;

        loop {
            let before = self.session.bytes_written;
            let error = match self.transfer_once().await {
                Ok(()) => return Ok(()),
                Err(DownloadError::Network(msg)) => msg,
                Err(e) => return Err(e),
            };
            if self.session.bytes_written > before {
                attempt = 1;
            }
            let delay = match policy.decide(attempt) {
                RetryDecision::NoRetry => return Err(DownloadError::Network(error)),
                RetryDecision::RetryAfter(delay) => delay,
            };

            warn!(
                transfer = self.id,
                attempt,
                offset = self.session.bytes_written,
                ?delay,
                error = %error,
                "transfer interrupted, will resume"
            );
            self.session.status = SessionStatus::Paused;
            self.persist().await?;
            self.emit(SessionEventKind::Interrupted { attempt, error });

            tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = pause.cancelled() => return Err(DownloadError::Paused),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
            self.session.status = SessionStatus::InProgress;
            self.persist().await?;
        }
    }

    /// One HTTP request, resuming from the persisted offset.
    async fn transfer_once(&mut self) -> Result<(), DownloadError> {
        let pause = self.pause.clone();
        let cancel = self.cancel.clone();
        let total = self.session.total_bytes;
        let mut offset = self.session.bytes_written;
        if offset >= total {
            return Ok(());
        }

        let mut request = self.client.get(&self.session.update.url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
        }
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            _ = pause.cancelled() => return Err(DownloadError::Paused),
            r = tokio::time::timeout(self.config.idle_timeout, request.send()) => match r {
                Err(_) => {
                    return Err(DownloadError::Network(format!(
                        "no response within {:?}",
                        self.config.idle_timeout
                    )))
                }
                Ok(r) => r.map_err(|e| DownloadError::Network(e.to_string()))?,
            },
        };

        let status = response.status();
        match status {
            StatusCode::PARTIAL_CONTENT => {
                if offset > 0 && !content_range_starts_at(response.headers(), offset) {
                    return Err(DownloadError::Network("unexpected Content-Range in response".into()));
                }
            }
            StatusCode::OK => {
                if offset > 0 {
                    warn!(transfer = self.id, offset, "server ignored range request, restarting from zero");
                    offset = 0;
                    self.restart_from_zero().await?;
                }
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                warn!(transfer = self.id, offset, "range not satisfiable, restarting from zero");
                self.restart_from_zero().await?;
                return Err(DownloadError::Network("range not satisfiable".into()));
            }
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                return Err(DownloadError::Network(format!("HTTP {s}")));
            }
            s => return Err(DownloadError::Http(s)),
        }

        let path = self.session.path.clone();
        let mut file = OpenOptions::new().write(true).create(true).open(&path).await?;
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        if self.config.verify_inline && self.checksum.as_ref().map(Checksum::consumed) != Some(offset) {
            self.checksum = Some(integrity::hash_prefix(self.config.algorithm, &path, offset).await?);
        }

        let chunk_size = self.config.chunk_size.max(1);
        let idle = self.config.idle_timeout;
        let mut buffer: Vec<u8> = Vec::with_capacity(chunk_size);
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Next::Cancelled,
                _ = pause.cancelled() => Next::Paused,
                r = tokio::time::timeout(idle, stream.next()) => match r {
                    Err(_) => Next::Stalled,
                    Ok(None) => Next::End,
                    Ok(Some(Ok(bytes))) => Next::Data(bytes),
                    Ok(Some(Err(e))) => Next::Broken(e),
                },
            };

            match next {
                Next::Data(bytes) => {
                    let received = self.session.bytes_written + (buffer.len() + bytes.len()) as u64;
                    if received > total {
                        return Err(DownloadError::Oversized {
                            expected: total,
                            actual: received,
                        });
                    }
                    buffer.extend_from_slice(&bytes);
                    if buffer.len() >= chunk_size {
                        self.commit(&mut file, &mut buffer).await?;
                    }
                }
                Next::End => break,
                Next::Cancelled => return Err(DownloadError::Cancelled),
                Next::Paused => {
                    self.commit(&mut file, &mut buffer).await?;
                    return Err(DownloadError::Paused);
                }
                Next::Stalled => {
                    self.commit(&mut file, &mut buffer).await?;
                    return Err(DownloadError::Network(format!("no data received for {idle:?}")));
                }
                Next::Broken(e) => {
                    self.commit(&mut file, &mut buffer).await?;
                    return Err(DownloadError::Network(e.to_string()));
                }
            }
        }

        self.commit(&mut file, &mut buffer).await?;
        if self.session.bytes_written < total {
            return Err(DownloadError::Network(format!(
                "connection closed at {} of {} bytes",
                self.session.bytes_written, total
            )));
        }
        Ok(())
    }

    async fn restart_from_zero(&mut self) -> Result<(), DownloadError> {
        truncate(&self.session.path, 0).await?;
        self.session.bytes_written = 0;
        self.checksum = None;
        self.persist().await?;
        Ok(())
    }

    /// Write buffered bytes, make them durable, then record the new offset.
    async fn commit(&mut self, file: &mut File, buffer: &mut Vec<u8>) -> Result<(), DownloadError> {
        if buffer.is_empty() {
            return Ok(());
        }
        file.write_all(buffer).await?;
        file.flush().await?;
        file.sync_data().await?;
        if let Some(checksum) = self.checksum.as_mut() {
            checksum.update(buffer);
        }
        self.session.bytes_written += buffer.len() as u64;
        buffer.clear();
        self.persist().await?;
        self.emit(SessionEventKind::Progress {
            bytes_written: self.session.bytes_written,
            total_bytes: self.session.total_bytes,
        });
        Ok(())
    }

    async fn verify(&mut self) {
        let cancel = self.cancel.clone();
        self.session.status = SessionStatus::Verifying;
        if let Err(e) = self.persist().await {
            self.fail_io(e.to_string()).await;
            return;
        }
        self.emit(SessionEventKind::Verifying);

        let expected = self.session.update.checksum.clone();
        let total = self.session.total_bytes;
        let path = self.session.path.clone();

        let actual = match self.checksum.take() {
            Some(checksum) if checksum.consumed() == total => Ok(checksum.finalize_hex()),
            _ => tokio::select! {
                _ = cancel.cancelled() => return,
                r = integrity::hash_file(self.config.algorithm, &path) => r,
            },
        };
        let actual = match actual {
            Ok(actual) => actual,
            Err(e) => {
                self.fail_io(e.to_string()).await;
                return;
            }
        };
        let on_disk = match file_len(&path).await {
            Ok(len) => len.unwrap_or(0),
            Err(e) => {
                self.fail_io(e.to_string()).await;
                return;
            }
        };

        if on_disk != total || self.session.bytes_written != total {
            error!(transfer = self.id, on_disk, total, "size mismatch after transfer");
            self.discard_file().await;
            let reason = FailureReason::SizeMismatch {
                expected: total,
                actual: on_disk,
            };
            self.record(SessionStatus::Failed(reason.clone()), SessionEventKind::Failed(reason))
                .await;
            return;
        }

        if !integrity::digests_match(&expected, &actual) {
            error!(transfer = self.id, %expected, %actual, "checksum mismatch, discarding download");
            self.discard_file().await;
            let reason = FailureReason::ChecksumMismatch { expected, actual };
            self.record(SessionStatus::Failed(reason.clone()), SessionEventKind::Failed(reason))
                .await;
            return;
        }

        let target = final_path(&self.config.download_dir, &self.session.update);
        if let Err(e) = tokio::fs::rename(&path, &target).await {
            self.fail_io(e.to_string()).await;
            return;
        }
        info!(transfer = self.id, path = %target.display(), "artifact verified");
        self.session.path = target.clone();
        self.record(SessionStatus::Verified, SessionEventKind::Verified { path: target })
            .await;
    }

    async fn fail_io(&mut self, msg: String) {
        error!(transfer = self.id, error = %msg, "local storage failure");
        let reason = FailureReason::Io(msg);
        self.record(SessionStatus::Failed(reason.clone()), SessionEventKind::Failed(reason))
            .await;
    }

    /// Corrupt bytes cannot anchor a resume: drop the file and the offset.
    async fn discard_file(&mut self) {
        if let Err(e) = remove_if_exists(&self.session.path).await {
            warn!(transfer = self.id, error = %e, "failed to delete corrupt download");
        }
        self.session.bytes_written = 0;
        self.checksum = None;
    }
}

fn content_range_starts_at(headers: &header::HeaderMap, offset: u64) -> bool {
    headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("bytes "))
        .and_then(|v| v.split_once('-'))
        .and_then(|(start, _)| start.trim().parse::<u64>().ok())
        .is_some_and(|start| start == offset)
}
