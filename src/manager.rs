// src/manager.rs

use crate::config::{ConfigError, UpdaterConfig};
use crate::downloader::{DownloadConfig, DownloadError, DownloadManager, SessionEvent, SessionEventKind};
use crate::environment::DeviceEnvironment;
use crate::installer::InstallerGateway;
use crate::metadata::{MetadataError, MetadataRepository};
use crate::models::{
    FailureCategory, FailureReason, InstallOutcome, LifecycleState, Phase, SessionStatus, StateSnapshot,
    UpdateInfo,
};
use crate::retry::RetryPolicy;
use crate::state_manager::{StateError, StateManager};
use reqwest::Client;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("state manager error: {0}")]
    State(#[from] StateError),
    #[error("download error: {0}")]
    Download(#[from] DownloadError),
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot {action} while {phase}")]
    InvalidTransition { action: &'static str, phase: String },
    #[error("no update is being tracked")]
    NoUpdate,
    #[error("no verified artifact for the tracked update")]
    NotVerified,
}

/// Result of [`UpdateManager::check_for_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    UpdateAvailable(UpdateInfo),
    NoUpdateAvailable,
}

/// Collaborators the lifecycle is built from. [`UpdateManager::open`]
/// derives them from an [`UpdaterConfig`]; tests assemble them directly.
pub struct ManagerParts {
    pub client: Client,
    pub store: StateManager,
    pub metadata: MetadataRepository,
    pub download: DownloadConfig,
    pub environment: Arc<dyn DeviceEnvironment>,
    pub installer: Arc<dyn InstallerGateway>,
}

/// Lifecycle record plus the live numbers of the tracked transfer.
struct Tracker {
    state: LifecycleState,
    /// Id of the transfer whose events are applied; others are stale.
    transfer: Option<u64>,
    session_status: Option<SessionStatus>,
    bytes_written: u64,
    total_bytes: u64,
}

impl Tracker {
    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            phase: self.state.phase.clone(),
            update: self.state.update.clone(),
            session_status: self.session_status.clone(),
            bytes_written: self.bytes_written,
            total_bytes: self.total_bytes,
            last_error: self.state.last_error.clone(),
            install_result: self.state.install_result.clone(),
        }
    }

    fn fail(&mut self, reason: FailureReason) {
        self.state.phase = Phase::Failed(reason.clone());
        self.state.last_error = Some(reason);
        self.transfer = None;
    }
}

struct Inner {
    device: String,
    environment: Arc<dyn DeviceEnvironment>,
    metadata: MetadataRepository,
    downloads: DownloadManager,
    installer: Arc<dyn InstallerGateway>,
    store: StateManager,
    /// Single mutation point for the lifecycle.
    tracker: Mutex<Tracker>,
    /// Serializes control commands so a slow check does not interleave with
    /// a start or cancel.
    command: Mutex<()>,
    snapshot: watch::Sender<StateSnapshot>,
}

/// Owns the update lifecycle of one device: check, download, verify, install.
///
/// Every phase change goes through one mutex and is persisted before it is
/// published. Reads ([`get_state`](Self::get_state)) never wait on it.
pub struct UpdateManager {
    inner: Arc<Inner>,
    events_task: JoinHandle<()>,
}

impl UpdateManager {
    /// Build the manager described by `config`, creating its data directory.
    pub async fn open(
        config: &UpdaterConfig,
        environment: Arc<dyn DeviceEnvironment>,
        installer: Arc<dyn InstallerGateway>,
    ) -> Result<Self, ManagerError> {
        let algorithm = config.algorithm()?;
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let store = StateManager::new(&config.database_path()).await?;

        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.request_timeout())
            .build()?;
        let retry = RetryPolicy::from(&config.retry);
        let metadata = MetadataRepository::new(client.clone(), config.metadata_url.clone(), algorithm, retry)
            .with_timeout(config.request_timeout());
        let download = DownloadConfig {
            download_dir: config.download_dir(),
            algorithm,
            chunk_size: config.chunk_size_bytes,
            idle_timeout: config.request_timeout(),
            verify_inline: config.verify_inline,
            retry,
        };

        Self::new(ManagerParts {
            client,
            store,
            metadata,
            download,
            environment,
            installer,
        })
        .await
    }

    pub async fn new(parts: ManagerParts) -> Result<Self, ManagerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let downloads = DownloadManager::new(parts.client, parts.store.clone(), parts.download, tx).await?;
        let device = parts.environment.codename();
        let store = parts.store;

        let mut state = store.load_lifecycle(&device).await?.unwrap_or_default();
        let mut reverify = false;
        match state.phase {
            Phase::Downloading => {
                info!("resuming lifecycle in downloading phase, transfer paused");
            }
            Phase::Verifying => {
                let key = state.session_key.clone().unwrap_or_default();
                let complete = downloads
                    .session(&key)
                    .await?
                    .is_some_and(|s| s.total_bytes > 0 && s.bytes_written >= s.total_bytes);
                if complete {
                    info!("verification was interrupted, running it again");
                    reverify = true;
                } else {
                    warn!("verifying without a complete download, back to downloading");
                    state.phase = Phase::Downloading;
                }
            }
            Phase::Installing => {
                warn!("installation was interrupted by a restart");
                let reason = FailureReason::InstallFailure {
                    code: -1,
                    message: "installation interrupted".into(),
                };
                state.phase = Phase::Failed(reason.clone());
                state.last_error = Some(reason);
            }
            Phase::Verified => {
                let key = state.session_key.clone().unwrap_or_default();
                if downloads.verified_artifact(&key).await?.is_none() {
                    warn!("verified artifact is gone, update offered again");
                    state.phase = Phase::Available;
                }
            }
            _ => {}
        }
        store.save_lifecycle(&device, &state).await?;

        let session = match &state.session_key {
            Some(key) => downloads.session(key).await?,
            None => None,
        };
        let tracker = Tracker {
            transfer: None,
            session_status: session.as_ref().map(|s| s.status.clone()),
            bytes_written: session.as_ref().map_or(0, |s| s.bytes_written),
            total_bytes: session
                .as_ref()
                .map(|s| s.total_bytes)
                .or_else(|| state.update.as_ref().map(|u| u.file_size))
                .unwrap_or(0),
            state,
        };
        info!(device = %device, phase = %tracker.state.phase, "update manager ready");

        let (snapshot, _) = watch::channel(tracker.snapshot());
        let inner = Arc::new(Inner {
            device,
            environment: parts.environment,
            metadata: parts.metadata,
            downloads,
            installer: parts.installer,
            store,
            tracker: Mutex::new(tracker),
            command: Mutex::new(()),
            snapshot,
        });
        let events_task = tokio::spawn(pump_events(Arc::downgrade(&inner), rx));

        let manager = Self { inner, events_task };
        if reverify {
            if let Err(e) = manager.start_download().await {
                error!(error = %e, "could not restart verification");
            }
        }
        Ok(manager)
    }

    /// Latest snapshot; never waits on network, disk or the state lock.
    pub fn get_state(&self) -> StateSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Wait until a published snapshot satisfies `pred`.
    pub async fn wait_until(&self, mut pred: impl FnMut(&StateSnapshot) -> bool) -> StateSnapshot {
        let mut rx = self.subscribe();
        let snapshot = match rx.wait_for(|s| pred(s)).await {
            Ok(snapshot) => (*snapshot).clone(),
            Err(_) => self.get_state(),
        };
        snapshot
    }

    /// Last build seen by a successful check, without a network round trip.
    pub fn cached_update(&self) -> Option<UpdateInfo> {
        self.inner.metadata.cached()
    }

    /// Fetch the latest build. A build other than the tracked one replaces
    /// it, whatever the current phase, and its stale download is deleted.
    pub async fn check_for_update(&self) -> Result<CheckOutcome, ManagerError> {
        let inner = &self.inner;
        let fetched = inner.metadata.fetch_latest(&inner.device).await;
        let _command = inner.command.lock().await;

        let info = match fetched {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "update check failed");
                let mut t = inner.tracker.lock().await;
                t.state.last_error = Some(e.to_failure());
                inner.commit(&t).await?;
                return Err(e.into());
            }
        };

        let mut t = inner.tracker.lock().await;
        if !is_newer(&info, inner.environment.as_ref()) {
            info!(version = %info.version, "running build is up to date");
            let tracked_elsewhere = t
                .state
                .update
                .as_ref()
                .is_some_and(|u| u.version != info.version);
            if tracked_elsewhere {
                inner.downloads.discard_all_except(None).await?;
                t.state = LifecycleState::default();
                reset_progress(&mut t, 0);
            } else if t.state.update.is_none() {
                t.state.phase = Phase::NoUpdate;
            }
            t.state.last_error = None;
            inner.commit(&t).await?;
            return Ok(CheckOutcome::NoUpdateAvailable);
        }

        let same = t
            .state
            .update
            .as_ref()
            .is_some_and(|u| u.version == info.version && u.checksum == info.checksum);
        if same {
            debug!(version = %info.version, "tracked update unchanged");
            t.state.update = Some(info.clone());
            if matches!(&t.state.last_error, Some(e) if e.category() == FailureCategory::Network)
                && !matches!(t.state.phase, Phase::Failed(_))
            {
                t.state.last_error = None;
            }
            inner.commit(&t).await?;
            return Ok(CheckOutcome::UpdateAvailable(info));
        }

        if let Some(old) = &t.state.update {
            info!(old = %old.version, new = %info.version, phase = %t.state.phase, "tracked update superseded");
        } else {
            info!(version = %info.version, "update available");
        }
        inner.downloads.discard_all_except(Some(info.session_key())).await?;
        t.state = LifecycleState {
            phase: Phase::Available,
            update: Some(info.clone()),
            session_key: Some(info.session_key().to_string()),
            last_error: None,
            install_result: None,
        };
        reset_progress(&mut t, info.file_size);
        inner.commit(&t).await?;
        Ok(CheckOutcome::UpdateAvailable(info))
    }

    /// Start or resume the download of the tracked update. Calling it while
    /// the transfer is running does nothing. From `Verifying` the complete
    /// file is checked again without a new request.
    pub async fn start_download(&self) -> Result<(), ManagerError> {
        let inner = &self.inner;
        let _command = inner.command.lock().await;
        let mut t = inner.tracker.lock().await;

        let info = t.state.update.clone().ok_or(ManagerError::NoUpdate)?;
        match &t.state.phase {
            Phase::Available | Phase::Downloading | Phase::Verifying => {}
            Phase::Failed(reason) if reason.category() != FailureCategory::Installation => {}
            Phase::Verified => return Ok(()),
            other => {
                return Err(ManagerError::InvalidTransition {
                    action: "start download",
                    phase: other.to_string(),
                })
            }
        }

        if t.state.phase != Phase::Verifying {
            t.state.phase = Phase::Downloading;
        }
        t.state.session_key = Some(info.session_key().to_string());
        t.state.last_error = None;
        inner.store.save_lifecycle(&inner.device, &t.state).await?;

        match inner.downloads.start_or_resume(&info).await {
            Ok(transfer) => {
                t.transfer = Some(transfer.id);
                t.session_status = Some(transfer.session.status.clone());
                t.bytes_written = transfer.session.bytes_written;
                t.total_bytes = transfer.session.total_bytes;
                inner.publish(&t);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "could not start download");
                t.fail(FailureReason::Io(e.to_string()));
                inner.commit(&t).await?;
                Err(e.into())
            }
        }
    }

    /// Stop the transfer, keeping progress. The phase stays `Downloading`.
    pub async fn pause_download(&self) -> Result<(), ManagerError> {
        let inner = &self.inner;
        let _command = inner.command.lock().await;
        let key = {
            let t = inner.tracker.lock().await;
            if t.state.phase != Phase::Downloading {
                return Err(ManagerError::InvalidTransition {
                    action: "pause download",
                    phase: t.state.phase.to_string(),
                });
            }
            t.state.session_key.clone().ok_or(ManagerError::NoUpdate)?
        };

        inner.downloads.pause(&key).await?;

        let mut t = inner.tracker.lock().await;
        if t.state.phase == Phase::Downloading {
            t.transfer = None;
            if let Some(session) = inner.downloads.session(&key).await? {
                t.bytes_written = session.bytes_written;
                t.session_status = Some(session.status);
            }
            inner.publish(&t);
        }
        Ok(())
    }

    /// Stop the transfer and delete its partial file. The update stays
    /// `Available`. Cancelling with nothing to cancel is a no-op.
    pub async fn cancel_download(&self) -> Result<(), ManagerError> {
        let inner = &self.inner;
        let _command = inner.command.lock().await;
        let mut t = inner.tracker.lock().await;

        match &t.state.phase {
            Phase::NoUpdate | Phase::Available => return Ok(()),
            Phase::Installing | Phase::Installed => {
                return Err(ManagerError::InvalidTransition {
                    action: "cancel download",
                    phase: t.state.phase.to_string(),
                })
            }
            _ => {}
        }

        if let Some(key) = t.state.session_key.clone() {
            inner.downloads.cancel(&key).await?;
        }
        info!("download cancelled");
        t.state.phase = if t.state.update.is_some() {
            Phase::Available
        } else {
            Phase::NoUpdate
        };
        t.state.last_error = None;
        let total = t.state.update.as_ref().map_or(0, |u| u.file_size);
        reset_progress(&mut t, total);
        inner.commit(&t).await?;
        Ok(())
    }

    /// Hand the verified artifact to the installer. Never called
    /// automatically; the outcome arrives asynchronously as `Installed` or
    /// `Failed(InstallFailure)`.
    pub async fn start_install(&self) -> Result<(), ManagerError> {
        let inner = &self.inner;
        let _command = inner.command.lock().await;
        let mut t = inner.tracker.lock().await;

        match &t.state.phase {
            Phase::Verified => {}
            Phase::Failed(reason) if reason.category() == FailureCategory::Installation => {}
            other => {
                return Err(ManagerError::InvalidTransition {
                    action: "install",
                    phase: other.to_string(),
                })
            }
        }
        let key = t.state.session_key.clone().ok_or(ManagerError::NoUpdate)?;
        let artifact = inner
            .downloads
            .verified_artifact(&key)
            .await?
            .ok_or(ManagerError::NotVerified)?;

        info!(path = %artifact.display(), "starting installation");
        t.state.phase = Phase::Installing;
        t.state.install_result = None;
        t.state.last_error = None;
        inner.commit(&t).await?;

        let task_inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = task_inner.installer.install(&artifact).await;
            task_inner.finish_install(&key, artifact, outcome).await;
        });
        Ok(())
    }

    /// Abort running transfers without recording anything, as if the process
    /// had been killed. Persisted sessions resume on the next open.
    pub async fn shutdown(&self) {
        self.inner.downloads.shutdown().await;
    }
}

impl Drop for UpdateManager {
    fn drop(&mut self) {
        self.events_task.abort();
    }
}

impl Inner {
    fn publish(&self, t: &Tracker) {
        self.snapshot.send_replace(t.snapshot());
    }

    /// Persist, then publish.
    async fn commit(&self, t: &Tracker) -> Result<(), StateError> {
        self.store.save_lifecycle(&self.device, &t.state).await?;
        self.publish(t);
        Ok(())
    }

    async fn apply_event(&self, event: SessionEvent) {
        let mut t = self.tracker.lock().await;
        if t.transfer != Some(event.transfer) || t.state.session_key.as_deref() != Some(event.key.as_str()) {
            debug!(transfer = event.transfer, "ignoring event from stale transfer");
            return;
        }

        let downloading = t.state.phase == Phase::Downloading;
        let persist = match event.kind {
            SessionEventKind::Progress {
                bytes_written,
                total_bytes,
            } if downloading => {
                t.bytes_written = bytes_written;
                t.total_bytes = total_bytes;
                t.session_status = Some(SessionStatus::InProgress);
                false
            }
            SessionEventKind::Interrupted { attempt, error } if downloading => {
                debug!(attempt, error = %error, "transfer interrupted, retrying");
                t.session_status = Some(SessionStatus::Paused);
                false
            }
            SessionEventKind::Paused if downloading => {
                t.session_status = Some(SessionStatus::Paused);
                t.transfer = None;
                false
            }
            SessionEventKind::Verifying if downloading || t.state.phase == Phase::Verifying => {
                t.state.phase = Phase::Verifying;
                t.session_status = Some(SessionStatus::Verifying);
                true
            }
            SessionEventKind::Verified { path }
                if downloading || t.state.phase == Phase::Verifying =>
            {
                info!(path = %path.display(), "update verified");
                t.state.phase = Phase::Verified;
                t.state.last_error = None;
                t.session_status = Some(SessionStatus::Verified);
                t.bytes_written = t.total_bytes;
                t.transfer = None;
                true
            }
            SessionEventKind::Failed(reason) if downloading || t.state.phase == Phase::Verifying => {
                warn!(reason = %reason, "download failed");
                t.session_status = Some(if reason.is_transient() {
                    SessionStatus::Paused
                } else {
                    SessionStatus::Failed(reason.clone())
                });
                if reason.category() == FailureCategory::Integrity {
                    t.bytes_written = 0;
                }
                t.fail(reason);
                true
            }
            kind => {
                debug!(?kind, phase = %t.state.phase, "event does not apply to current phase");
                return;
            }
        };

        if persist {
            if let Err(e) = self.store.save_lifecycle(&self.device, &t.state).await {
                error!(error = %e, "failed to persist lifecycle state");
            }
        }
        self.publish(&t);
    }

    async fn finish_install(&self, key: &str, artifact: PathBuf, outcome: InstallOutcome) {
        let mut t = self.tracker.lock().await;
        if t.state.phase != Phase::Installing || t.state.session_key.as_deref() != Some(key) {
            warn!(path = %artifact.display(), "installer outcome for a superseded update ignored");
            return;
        }
        match &outcome {
            InstallOutcome::Success => {
                info!("update installed");
                t.state.phase = Phase::Installed;
            }
            InstallOutcome::Failure { code, message } => {
                error!(code, message = %message, "installation failed");
                t.fail(FailureReason::InstallFailure {
                    code: *code,
                    message: message.clone(),
                });
            }
        }
        t.state.install_result = Some(outcome);
        if let Err(e) = self.commit(&t).await {
            error!(error = %e, "failed to persist installation result");
        }
    }
}

async fn pump_events(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        inner.apply_event(event).await;
    }
}

fn reset_progress(t: &mut Tracker, total_bytes: u64) {
    t.transfer = None;
    t.session_status = None;
    t.bytes_written = 0;
    t.total_bytes = total_bytes;
}

/// A build is newer if its version differs from the running one and its
/// build date is later. An unknown running date (0) accepts any other version.
pub fn is_newer(info: &UpdateInfo, environment: &dyn DeviceEnvironment) -> bool {
    if info.version == environment.version() {
        return false;
    }
    let running = environment.build_date();
    running == 0 || info.build_date > running
}
