//! tether agent daemon
//!
//! Runs the sessions of one container and keeps a control connection to the
//! port layer's attach server so they can be attached to.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether_agent::Tether;
use tether_core::config::{self, AgentConfig, Transport};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "tether - container agent for attach sessions")]
#[command(version)]
struct Args {
    /// Path to agent configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to executor (session) configuration
    #[arg(short, long)]
    executor: Option<PathBuf>,

    /// Attach server to dial, host:port
    #[arg(long, conflicts_with = "serial")]
    controller: Option<String>,

    /// Serial device carrying the control connection
    #[arg(long)]
    serial: Option<PathBuf>,

    /// Path to the control-channel private key (ephemeral if unset)
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Helper to run on SIGPWR after handing the connection back
    #[arg(long)]
    fork_helper: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Answer the lossiness check during frame sync
    #[arg(long)]
    debug: bool,
}

fn load(args: &Args) -> Result<AgentConfig> {
    if let Some(path) = &args.config {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_path("agent");
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            AgentConfig::default()
        }))
    } else {
        tracing::info!("Using default configuration");
        Ok(AgentConfig::default())
    }
}

fn apply_overrides(config: &mut AgentConfig, args: Args) {
    if let Some(executor) = args.executor {
        config.executor_config_path = executor;
    }
    if let Some(controller) = args.controller {
        config.transport = Transport::Tcp;
        config.controller_address = controller;
    }
    if let Some(serial) = args.serial {
        config.transport = Transport::Serial;
        config.serial_device = serial;
    }
    if let Some(key) = args.key {
        config.key_path = Some(key);
    }
    if let Some(helper) = args.fork_helper {
        config.fork_helper = Some(helper);
    }
    config.debug |= args.debug;
}

/// Forward SIGPWR as fork requests
#[cfg(target_os = "linux")]
fn watch_fork_signal(forks: mpsc::Sender<()>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut power = signal(SignalKind::from_raw(nix::sys::signal::Signal::SIGPWR as i32))
        .context("Failed to install SIGPWR handler")?;
    tokio::spawn(async move {
        while power.recv().await.is_some() {
            tracing::info!("Received SIGPWR, handing off for fork");
            if forks.try_send(()).is_err() {
                tracing::debug!("Fork already pending");
            }
        }
    });
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn watch_fork_signal(_forks: mpsc::Sender<()>) -> Result<()> {
    tracing::warn!("Fork handoff is only supported on Linux");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("tether starting...");

    let mut config = load(&args)?;
    apply_overrides(&mut config, args);

    let tether = Tether::load(config)?;
    let backchannel = tether.backchannel_with_key()?;

    let (fork_tx, fork_rx) = mpsc::channel(1);
    if tether.config.fork_helper.is_some() {
        watch_fork_signal(fork_tx)?;
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown..."),
            _ = terminate => tracing::info!("Received SIGTERM, initiating shutdown..."),
        }
        shutdown.cancel();
    });

    tether.start().await?;
    let run = backchannel.run(cancel.clone(), fork_rx);
    tokio::pin!(run);
    tokio::select! {
        _ = &mut run => {}
        status = tether.primary_exit() => {
            tracing::info!("Primary session exited with {}, shutting down", status);
            cancel.cancel();
            run.await;
        }
    }
    tether.stop().await;

    tracing::info!("tether shutdown complete");
    Ok(())
}
