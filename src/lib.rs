pub mod config;
pub mod downloader;
pub mod environment;
pub mod installer;
pub mod integrity;
pub mod logging;
pub mod manager;
pub mod metadata;
pub mod models;
pub mod retry;
pub mod state_manager;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::UpdaterConfig;
    pub use crate::environment::{DeviceEnvironment, StaticEnvironment};
    pub use crate::installer::{CommandInstaller, InstallerGateway};
    pub use crate::integrity::ChecksumAlgorithm;
    pub use crate::manager::{CheckOutcome, ManagerError, UpdateManager};
    pub use crate::models::{FailureReason, InstallOutcome, Phase, SessionStatus, StateSnapshot, UpdateInfo};
    pub use crate::state_manager::StateManager;
}
