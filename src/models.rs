// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Description of one published build, as returned by the metadata endpoint.
/// Never mutated; a newer fetch replaces it wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateInfo {
    pub device: String,
    pub version: String,
    /// Build timestamp in seconds since the epoch.
    pub build_date: i64,
    pub url: String,
    pub file_name: String,
    pub file_size: u64,
    /// Lowercase hex digest of the complete artifact.
    pub checksum: String,
}

impl UpdateInfo {
    /// Key under which the download session for this build is persisted.
    pub fn session_key(&self) -> &str {
        &self.checksum
    }
}

/// Why a download or installation stopped for good.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureReason {
    Network(String),
    MalformedResponse(String),
    Io(String),
    ChecksumMismatch { expected: String, actual: String },
    SizeMismatch { expected: u64, actual: u64 },
    InstallFailure { code: i32, message: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailureCategory {
    Network,
    Integrity,
    Storage,
    Installation,
}

impl FailureReason {
    pub fn category(&self) -> FailureCategory {
        match self {
            FailureReason::Network(_) | FailureReason::MalformedResponse(_) => FailureCategory::Network,
            FailureReason::Io(_) => FailureCategory::Storage,
            FailureReason::ChecksumMismatch { .. } | FailureReason::SizeMismatch { .. } => {
                FailureCategory::Integrity
            }
            FailureReason::InstallFailure { .. } => FailureCategory::Installation,
        }
    }

    /// Only plain network failures are worth retrying without asking the user.
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureReason::Network(_))
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Network(msg) => write!(f, "network error: {msg}"),
            FailureReason::MalformedResponse(msg) => write!(f, "malformed server response: {msg}"),
            FailureReason::Io(msg) => write!(f, "local storage error: {msg}"),
            FailureReason::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
            FailureReason::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch: expected {expected} bytes, got {actual}")
            }
            FailureReason::InstallFailure { code, message } => {
                write!(f, "installation failed (code {code}): {message}")
            }
        }
    }
}

/// Status of a download session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    InProgress,
    Paused,
    Verifying,
    Verified,
    Failed(FailureReason),
}

/// The persisted state of one artifact transfer, keyed by the target checksum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadSession {
    pub update: UpdateInfo,
    pub path: PathBuf,
    pub bytes_written: u64,
    pub total_bytes: u64,
    pub status: SessionStatus,
}

impl DownloadSession {
    pub fn new(update: UpdateInfo, path: PathBuf) -> Self {
        let total_bytes = update.file_size;
        Self {
            update,
            path,
            bytes_written: 0,
            total_bytes,
            status: SessionStatus::Pending,
        }
    }

    pub fn key(&self) -> &str {
        self.update.session_key()
    }

    /// Calculates download progress as a fraction from 0.0 to 1.0.
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.bytes_written as f64 / self.total_bytes as f64
        }
    }

    /// A session can be picked up again unless its bytes are known to be bad.
    pub fn is_resumable(&self) -> bool {
        match &self.status {
            SessionStatus::Failed(reason) => reason.category() != FailureCategory::Integrity,
            _ => true,
        }
    }
}

/// Phase of the tracked update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Phase {
    NoUpdate,
    Available,
    Downloading,
    Verifying,
    Verified,
    Installing,
    Installed,
    Failed(FailureReason),
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::NoUpdate => "no-update",
            Phase::Available => "available",
            Phase::Downloading => "downloading",
            Phase::Verifying => "verifying",
            Phase::Verified => "verified",
            Phase::Installing => "installing",
            Phase::Installed => "installed",
            Phase::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Failed(reason) => write!(f, "failed ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Result reported by the installer gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstallOutcome {
    Success,
    Failure { code: i32, message: String },
}

/// The persisted lifecycle record, one per device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecycleState {
    pub phase: Phase,
    pub update: Option<UpdateInfo>,
    /// Checksum of the download session tracked for `update`.
    pub session_key: Option<String>,
    pub last_error: Option<FailureReason>,
    pub install_result: Option<InstallOutcome>,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self {
            phase: Phase::NoUpdate,
            update: None,
            session_key: None,
            last_error: None,
            install_result: None,
        }
    }
}

/// What observers see: the lifecycle plus live transfer numbers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StateSnapshot {
    pub phase: Phase,
    pub update: Option<UpdateInfo>,
    pub session_status: Option<SessionStatus>,
    pub bytes_written: u64,
    pub total_bytes: u64,
    pub last_error: Option<FailureReason>,
    pub install_result: Option<InstallOutcome>,
}

impl StateSnapshot {
    /// Download progress in 0.0..=1.0, only meaningful while downloading.
    pub fn progress(&self) -> Option<f64> {
        if self.phase != Phase::Downloading || self.total_bytes == 0 {
            return None;
        }
        Some(self.bytes_written as f64 / self.total_bytes as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> UpdateInfo {
        UpdateInfo {
            device: "lemon".into(),
            version: "2.1".into(),
            build_date: 1_700_000_000,
            url: "https://example.com/lemon-2.1.zip".into(),
            file_name: "lemon-2.1.zip".into(),
            file_size: 1_000,
            checksum: "0123456789abcdef0123456789abcdef".into(),
        }
    }

    #[test]
    fn session_progress() {
        let mut s = DownloadSession::new(info(), PathBuf::from("/tmp/x"));
        assert_eq!(s.progress(), 0.0);
        s.bytes_written = 250;
        assert!((s.progress() - 0.25).abs() < f64::EPSILON);
        assert_eq!(s.key(), "0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn integrity_failures_are_not_resumable() {
        let mut s = DownloadSession::new(info(), PathBuf::from("/tmp/x"));
        s.status = SessionStatus::Failed(FailureReason::Io("disk full".into()));
        assert!(s.is_resumable());
        s.status = SessionStatus::Failed(FailureReason::ChecksumMismatch {
            expected: "a".into(),
            actual: "b".into(),
        });
        assert!(!s.is_resumable());
    }

    #[test]
    fn failure_categories() {
        assert!(FailureReason::Network("reset".into()).is_transient());
        assert!(!FailureReason::MalformedResponse("x".into()).is_transient());
        assert_eq!(
            FailureReason::InstallFailure { code: 9, message: "x".into() }.category(),
            FailureCategory::Installation
        );
        assert_eq!(
            FailureReason::SizeMismatch { expected: 1, actual: 2 }.category(),
            FailureCategory::Integrity
        );
    }

    #[test]
    fn progress_only_while_downloading() {
        let mut snap = StateSnapshot {
            phase: Phase::Downloading,
            update: Some(info()),
            session_status: Some(SessionStatus::InProgress),
            bytes_written: 500,
            total_bytes: 1_000,
            last_error: None,
            install_result: None,
        };
        assert_eq!(snap.progress(), Some(0.5));
        snap.phase = Phase::Verified;
        assert_eq!(snap.progress(), None);
    }

    #[test]
    fn lifecycle_state_json_roundtrip() {
        let state = LifecycleState {
            phase: Phase::Failed(FailureReason::Network("timed out".into())),
            update: Some(info()),
            session_key: Some(info().checksum),
            last_error: Some(FailureReason::Network("timed out".into())),
            install_result: None,
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: LifecycleState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
