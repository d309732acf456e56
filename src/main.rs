//! RPC server binary.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌───────────────────────────────────────────────────────┐
//!                      │                      RPC SERVER                        │
//!                      │                                                        │
//!   Client stream      │  ┌─────────┐   ┌─────────┐   ┌─────────────┐           │
//!   ───────────────────┼─▶│   net   │──▶│  http   │──▶│ interceptor │           │
//!                      │  │listener │   │ HTTP/2  │   │   chain     │           │
//!                      │  │  + TLS  │   │ service │   └──────┬──────┘           │
//!                      │  └─────────┘   └─────────┘          ▼                  │
//!                      │                              ┌─────────────┐           │
//!                      │                              │  dispatch   │◀── reset  │
//!                      │                              │ (ArcSwap)   │   (SIGHUP)│
//!                      │                              └──────┬──────┘           │
//!   Responses +        │  ┌─────────┐                        ▼                  │
//!   trailers           │  │  body   │◀──────────────── handler task             │
//!   ◀──────────────────┼──│ framing │                                           │
//!                      │  └─────────┘                                           │
//!                      │                                                        │
//!                      │  health registry · config · observability · lifecycle  │
//!                      └───────────────────────────────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};

use clap::Parser;

use rpc_server::config::{load_config, ServerConfig};
use rpc_server::interceptor::builtin::registry_from_config;
use rpc_server::lifecycle::signals::{SignalEvent, Signals};
use rpc_server::lifecycle::ShutdownMode;
use rpc_server::observability::{logging, metrics};
use rpc_server::{echo, RpcServer, ServerHandle};

#[derive(Debug, Parser)]
#[command(name = "rpc-server", version, about = "HTTP/2 RPC server with hot routing resets")]
struct Cli {
    /// Configuration file (TOML, or JSON when the extension is .json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override listener.bind_address.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = &cli.bind {
        config.listener.bind_address = bind.clone();
    }

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rpc-server starting");

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let mut signals = Signals::install()?;
    let handle = RpcServer::new(config).routes(echo::routes()).listen().await?;

    loop {
        match signals.next().await {
            SignalEvent::Reload => reload(&handle, cli.config.as_deref()),
            SignalEvent::Stop => break,
        }
    }

    let graceful = handle.shutdown(ShutdownMode::Graceful {
        timeout: handle.grace_period(),
    });
    tokio::select! {
        _ = graceful => {}
        _ = next_stop(&mut signals) => {
            tracing::warn!("Second stop signal, forcing shutdown");
            handle.shutdown(ShutdownMode::Hard).await;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Re-read the configuration, recompose interceptors and reset the routes.
///
/// Listener and TLS settings keep their startup values.
fn reload(handle: &ServerHandle, path: Option<&Path>) {
    tracing::info!("Reload requested");
    if let Some(path) = path {
        match load_config(path) {
            Ok(config) => match registry_from_config(&config.interceptors) {
                Ok(registry) => handle.recompose(&registry),
                Err(e) => tracing::error!(error = %e, "Invalid interceptors, keeping current chain"),
            },
            Err(e) => tracing::error!(error = %e, "Failed to reload configuration, keeping current chain"),
        }
    }

    match handle.reset(echo::routes()) {
        Ok(epoch) => tracing::info!(epoch = %epoch, "Reload applied"),
        Err(e) => tracing::error!(error = %e, epoch = %handle.epoch(), "Reset failed, previous routes stay active"),
    }
}

async fn next_stop(signals: &mut Signals) {
    while signals.next().await != SignalEvent::Stop {}
}
