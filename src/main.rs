// src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ota_updater::prelude::*;
use ota_updater::{environment, logging};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ota-updater", version, about = "Over-the-air system update client")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "/etc/ota-updater/config.toml")]
    config: PathBuf,

    /// Debug logging for the updater.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask the server for a newer build.
    Check,
    /// Download and verify the tracked update. Ctrl-C pauses.
    Download,
    /// Cancel the download and delete the partial file.
    Cancel,
    /// Install the verified update and wait for the result.
    Install,
    /// Print the current state as JSON.
    Status,
    /// Check periodically, downloading automatically if configured.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = UpdaterConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let env = environment::from_config(&config.device)?;
    let installer: Arc<dyn InstallerGateway> = Arc::new(CommandInstaller::from_config(&config.installer));
    let manager = UpdateManager::open(&config, env, installer).await?;

    match cli.command {
        Command::Check => check(&manager).await,
        Command::Download => download(&manager).await,
        Command::Cancel => {
            manager.cancel_download().await?;
            println!("download cancelled");
            Ok(())
        }
        Command::Install => install(&manager).await,
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&manager.get_state())?);
            Ok(())
        }
        Command::Watch => watch(&manager, &config).await,
    }
}

async fn check(manager: &UpdateManager) -> Result<()> {
    match manager.check_for_update().await? {
        CheckOutcome::UpdateAvailable(info) => {
            println!(
                "update available: {} ({} bytes, built {})",
                info.version, info.file_size, info.build_date
            );
        }
        CheckOutcome::NoUpdateAvailable => println!("system is up to date"),
    }
    Ok(())
}

async fn download(manager: &UpdateManager) -> Result<()> {
    if manager.get_state().update.is_none() {
        check(manager).await?;
    }
    manager.start_download().await?;

    let mut rx = manager.subscribe();
    loop {
        let state = rx.borrow_and_update().clone();
        match &state.phase {
            Phase::Verified => {
                println!("download verified");
                return Ok(());
            }
            Phase::Failed(reason) => bail!("download failed: {reason}"),
            Phase::Verifying => println!("verifying..."),
            _ => {
                if let Some(progress) = state.progress() {
                    println!(
                        "{:>6.2}% ({} / {} bytes)",
                        progress * 100.0,
                        state.bytes_written,
                        state.total_bytes
                    );
                }
            }
        }

        tokio::select! {
            changed = rx.changed() => changed?,
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, pausing download");
                manager.pause_download().await?;
                println!("download paused; run `download` again to resume");
                return Ok(());
            }
        }
    }
}

async fn install(manager: &UpdateManager) -> Result<()> {
    manager.start_install().await?;
    let state = manager
        .wait_until(|s| matches!(s.phase, Phase::Installed | Phase::Failed(_)))
        .await;
    match state.phase {
        Phase::Installed => {
            println!("update installed, reboot to apply");
            Ok(())
        }
        Phase::Failed(reason) => bail!("{reason}"),
        other => bail!("unexpected phase {other}"),
    }
}

async fn watch(manager: &UpdateManager, config: &UpdaterConfig) -> Result<()> {
    let mut ticker = tokio::time::interval(config.check_interval());
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("stopping");
                if manager.get_state().phase == Phase::Downloading {
                    manager.pause_download().await?;
                }
                return Ok(());
            }
        }

        match manager.check_for_update().await {
            Ok(CheckOutcome::UpdateAvailable(info)) => {
                info!(version = %info.version, "update available");
                let phase = manager.get_state().phase;
                let retryable = matches!(&phase, Phase::Failed(reason) if reason.is_transient());
                if config.auto_download && (phase == Phase::Available || retryable) {
                    manager.start_download().await?;
                }
            }
            Ok(CheckOutcome::NoUpdateAvailable) => info!("system is up to date"),
            Err(e) => warn!(error = %e, "update check failed"),
        }
    }
}
