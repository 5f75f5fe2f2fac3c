// src/installer.rs

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use futures_util::future::BoxFuture;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::InstallerConfig;
use crate::models::InstallOutcome;

/// Applies an artifact. Errors are part of the outcome, never a panic.
pub trait InstallerGateway: Send + Sync {
    fn install<'a>(&'a self, artifact: &'a Path) -> BoxFuture<'a, InstallOutcome>;
}

/// Error codes reported by Android's update_engine.
pub fn describe_exit_code(code: i32) -> String {
    let known = match code {
        1 => "generic error",
        7 => "install device open error",
        9 => "download transfer error",
        10 => "payload hash mismatch",
        11 => "payload size mismatch",
        12 => "download payload verification error",
        15 => "new rootfs verification error",
        20 => "download state initialization error",
        21 => "invalid metadata magic string",
        26 => "metadata signature mismatch",
        48 => "canceled by user",
        51 => "payload timestamp error (downgrade refused)",
        52 => "updated but not active",
        _ => return format!("installer exited with code {code}"),
    };
    known.to_string()
}

/// Runs an external program, `{file}` in its arguments replaced with the
/// artifact path. Exit status 0 is success.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandInstaller {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
        }
    }

    pub fn from_config(cfg: &InstallerConfig) -> Self {
        Self {
            program: cfg.program.clone(),
            args: cfg.args.clone(),
            env: cfg.env.clone(),
        }
    }

    fn command_args(&self, artifact: &Path) -> Vec<String> {
        let file = artifact.display().to_string();
        self.args.iter().map(|a| a.replace("{file}", &file)).collect()
    }

    async fn run(&self, artifact: &Path) -> InstallOutcome {
        let args = self.command_args(artifact);
        info!(program = %self.program, ?args, "running installer");

        let output = Command::new(&self.program)
            .args(&args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                warn!(program = %self.program, error = %e, "failed to launch installer");
                return InstallOutcome::Failure {
                    code: -1,
                    message: format!("failed to launch {}: {e}", self.program),
                };
            }
        };

        match output.status.code() {
            Some(0) => {
                info!("installer finished successfully");
                InstallOutcome::Success
            }
            Some(code) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(code, stderr = %stderr.trim(), "installer failed");
                InstallOutcome::Failure {
                    code,
                    message: describe_exit_code(code),
                }
            }
            None => InstallOutcome::Failure {
                code: -1,
                message: "installer terminated by signal".into(),
            },
        }
    }
}

impl InstallerGateway for CommandInstaller {
    fn install<'a>(&'a self, artifact: &'a Path) -> BoxFuture<'a, InstallOutcome> {
        Box::pin(self.run(artifact))
    }
}
