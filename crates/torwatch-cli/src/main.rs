#![deny(unsafe_code)]

//! torwatch CLI — spawns a tor daemon and supervises its launch.

mod bootstrap;
mod spawn;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::process::Child;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use torwatch_config::AppConfig;
use torwatch_control::ListenerAddr;
use torwatch_core::{TorDaemon, TorEvent, TorPaths};

/// torwatch — spawn a tor daemon and supervise its control port.
#[derive(Parser)]
#[command(name = "torwatch", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "torwatch.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn tor and supervise it until interrupted.
    Start,

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, from_file) = load_config(&cli.config).await?;

    // -v flags override the configured level; RUST_LOG overrides both.
    let filter = match cli.verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();
    if !from_file {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Start => cmd_start(&config).await?,
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
    }

    Ok(())
}

async fn cmd_start(config: &AppConfig) -> Result<()> {
    let paths = TorPaths::new(config.daemon.resolve_profile_dir());
    info!(profile = %paths.profile_dir().display(), "Starting tor");

    let mut daemon = TorDaemon::new(paths.clone());
    daemon
        .setup()
        .await
        .context("creating the tor artifact directories")?;

    // Watch before spawning so a fast daemon cannot slip its control
    // artifacts past us.
    let mut events = daemon.events();
    daemon.start().context("starting the artifact watch")?;
    let mut child = spawn::spawn_tor(&config.daemon, &paths)
        .await
        .context("spawning tor")?;
    info!(
        binary = %config.daemon.binary,
        pid = child.id().unwrap_or(0),
        "tor spawned"
    );

    let socks = match wait_for_launch(&mut events, config.daemon.launch_timeout_secs).await {
        Ok(socks) => socks,
        Err(err) => {
            shutdown(&daemon, &mut child).await;
            return Err(err);
        }
    };
    let version = daemon.version().await;
    info!(
        %socks,
        version = version.as_deref().unwrap_or("unknown"),
        "tor is up"
    );

    if let Some(control) = daemon.control().await {
        tokio::select! {
            result = bootstrap::watch_bootstrap(&control) => {
                if let Err(err) = result {
                    warn!(%err, "Bootstrap reporting ended early");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down tor");
                shutdown(&daemon, &mut child).await;
                return Ok(());
            }
        }
        tokio::select! {
            result = bootstrap::watch_status(&control) => {
                if let Err(err) = result {
                    warn!(%err, "Status reporting ended early");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down tor");
                shutdown(&daemon, &mut child).await;
                return Ok(());
            }
            _ = wait_exited(&mut events) => {
                warn!("tor exited on its own");
                shutdown(&daemon, &mut child).await;
                return Ok(());
            }
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down tor");
        }
        _ = wait_exited(&mut events) => {
            warn!("tor exited on its own");
        }
    }
    shutdown(&daemon, &mut child).await;
    Ok(())
}

/// Wait for the launch event, with an optional watchdog timeout.
async fn wait_for_launch(
    events: &mut broadcast::Receiver<TorEvent>,
    timeout_secs: u64,
) -> Result<ListenerAddr> {
    let launch = async {
        loop {
            match events.recv().await {
                Ok(TorEvent::Launched(socks)) => return Ok(socks),
                Ok(TorEvent::Exited) => bail!("tor exited before completing its launch"),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("supervisor stopped unexpectedly"),
            }
        }
    };
    if timeout_secs == 0 {
        return launch.await;
    }
    match tokio::time::timeout(Duration::from_secs(timeout_secs), launch).await {
        Ok(result) => result,
        Err(_) => bail!("tor did not launch within {timeout_secs}s"),
    }
}

async fn wait_exited(events: &mut broadcast::Receiver<TorEvent>) {
    loop {
        match events.recv().await {
            Ok(TorEvent::Exited) | Err(RecvError::Closed) => return,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
        }
    }
}

/// Tear the supervisor down and make sure the child is gone.
async fn shutdown(daemon: &TorDaemon, child: &mut Child) {
    daemon.kill();
    if let Err(err) = child.kill().await {
        // Already-exited children report an error here; nothing to do.
        tracing::debug!(%err, "tor child was already gone");
    }
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str =
            toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

async fn load_config(path: &Path) -> Result<(AppConfig, bool)> {
    if path.exists() {
        let config = AppConfig::load(path)
            .await
            .with_context(|| format!("loading configuration from {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}
