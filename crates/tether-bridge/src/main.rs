//! tether bridge binary.
//!
//! Keeps one game session alive through the WebSocket gateway, relays chat
//! and payments to a webhook, and takes operator commands on stdin.
//!
//! # Usage
//!
//! ```bash
//! tether --config tether.toml
//! RUST_LOG=tether=trace tether --log-json --no-console
//! ```

#![forbid(unsafe_code)]

mod console;
mod relay;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tether_core::notify::FanoutNotifier;
use tether_core::{MachineBuilder, MachineHandle, Notifier, TetherConfig, TracingNotifier};
use tether_ws::WsTransport;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::console::Flow;
use crate::relay::WebhookNotifier;

/// Persistent game session bridge.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "tether.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, default_value_t = false)]
    log_json: bool,

    /// Do not read operator commands from stdin.
    #[arg(long, default_value_t = false)]
    no_console: bool,
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tether=debug"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<TetherConfig> {
    if path.exists() {
        return TetherConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()));
    }
    warn!(path = %path.display(), "Config file not found, using defaults");
    let mut config = TetherConfig::default();
    config.apply_overrides(|key| std::env::var(key).ok());
    config.validate().context("invalid default configuration")?;
    Ok(config)
}

fn build_notifier(config: &TetherConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    let mut fanout = FanoutNotifier::new().with(Arc::new(TracingNotifier));
    if let Some(url) = &config.relay.webhook_url {
        info!("Chat relay enabled");
        fanout = fanout.with(Arc::new(WebhookNotifier::new(url.clone())?));
    }
    Ok(Arc::new(fanout))
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler failed");
                wait_for_ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    wait_for_ctrl_c().await;
    info!("Shutdown signal received");
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn shutdown(handle: &MachineHandle) {
    info!("Shutting down");
    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "Machine already stopped");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = load_config(&args.config)?;
    info!(
        gateway = %config.server.gateway_url,
        username = %config.server.username,
        "Starting tether"
    );

    let transport = WsTransport::new(
        config.server.gateway_url.clone(),
        config.server.username.clone(),
    )
    .with_connect_timeout(config.server.connect_timeout());
    let notifier = build_notifier(&config)?;

    let (handle, machine) = MachineBuilder::new(config, Arc::new(transport))
        .with_notifier(notifier)
        .spawn();
    handle
        .request_connect()
        .context("machine stopped before the first connect")?;

    if args.no_console {
        wait_for_signal().await;
    } else {
        let console = console::run(handle.clone());
        tokio::select! {
            result = console => match result {
                Ok(Flow::Quit) => {}
                Ok(Flow::Continue) => wait_for_signal().await,
                Err(e) => {
                    warn!(error = %e, "Console stopped");
                    wait_for_signal().await;
                }
            },
            () = wait_for_signal() => {}
        }
    }

    shutdown(&handle).await;
    machine.await.context("machine task failed")?;
    Ok(())
}
