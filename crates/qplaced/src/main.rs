//! qplaced, the queue placement daemon.
//!
//! Wires the placement layer together:
//! - Scheduler worker owning the placement engine
//! - Broker connection server (optionally mutual TLS)
//! - Desired-state feed client
//!
//! # Usage
//!
//! ```text
//! qplaced run --config /etc/qplace/qplace.toml --cert-dir /etc/qplace/certs
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::FutureExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use qplace_core::{DesiredState, QplaceConfig};
use qplace_feed::{DesiredStateCallback, DesiredStateClient, FeedConfig};
use qplace_placement::PlacementEngine;
use qplace_scheduler::{Scheduler, SchedulerHandle, SchedulerServer, ServerConfig, tls};

#[derive(Parser)]
#[command(name = "qplaced", about = "Queue placement daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept broker connections and schedule queues onto them.
    Run {
        /// Path to qplace.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the listener port.
        #[arg(long)]
        port: Option<u16>,

        /// Override the certificate directory (enables mutual TLS).
        #[arg(long)]
        cert_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,qplaced=debug,qplace=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            cert_dir,
        } => {
            let mut config = load_config(config.as_deref())?;
            apply_overrides(&mut config, port, cert_dir);
            run(config).await
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<QplaceConfig> {
    match path {
        Some(path) => QplaceConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(QplaceConfig::default()),
    }
}

fn apply_overrides(config: &mut QplaceConfig, port: Option<u16>, cert_dir: Option<PathBuf>) {
    if let Some(port) = port {
        config.listener.port = port;
    }
    if cert_dir.is_some() {
        config.listener.cert_dir = cert_dir;
    }
}

async fn run(config: QplaceConfig) -> anyhow::Result<()> {
    info!("qplace daemon starting");

    // ── Scheduler worker ───────────────────────────────────────

    let (scheduler, worker) = Scheduler::spawn(PlacementEngine::new());

    // ── Broker connection server ───────────────────────────────

    let mut server = SchedulerServer::new(ServerConfig::from_config(&config), scheduler.clone());
    match &config.listener.cert_dir {
        Some(dir) => server = server.with_tls(tls::load_server_config(dir)?),
        None => warn!("no cert_dir configured, broker identities will not be verified"),
    }

    let listener = TcpListener::bind((config.listener.host.as_str(), config.listener.port))
        .await
        .with_context(|| format!("binding {}:{}", config.listener.host, config.listener.port))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_handle = tokio::spawn(server.serve(listener, shutdown_rx.clone()));

    // ── Desired-state feed ─────────────────────────────────────

    let feed = DesiredStateClient::new(FeedConfig::from(&config.feed));
    let callback = desired_state_callback(scheduler.clone());
    let feed_handle = tokio::spawn(async move { feed.run(callback, shutdown_rx).await });
    info!(
        host = %config.feed.host,
        port = config.feed.port,
        "following desired-state feed"
    );

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    server_handle.await??;
    let _ = feed_handle.await;

    // Worker exits once the last handle is gone.
    drop(scheduler);
    let _ = worker.await;

    info!("qplace daemon stopped");
    Ok(())
}

fn desired_state_callback(scheduler: SchedulerHandle) -> DesiredStateCallback {
    Arc::new(move |state: DesiredState| {
        let scheduler = scheduler.clone();
        async move {
            if let Err(e) = scheduler.set_desired_state(state).await {
                warn!(error = %e, "desired state not fully applied");
            }
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use qplace_core::Address;
    use std::collections::BTreeSet;

    #[test]
    fn run_accepts_overrides() {
        let cli = Cli::try_parse_from([
            "qplaced",
            "run",
            "--config",
            "qplace.toml",
            "--port",
            "6000",
            "--cert-dir",
            "/certs",
        ])
        .unwrap();
        let Command::Run {
            config,
            port,
            cert_dir,
        } = cli.command;
        assert_eq!(config, Some(PathBuf::from("qplace.toml")));
        assert_eq!(port, Some(6000));
        assert_eq!(cert_dir, Some(PathBuf::from("/certs")));
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut config = QplaceConfig::default();
        apply_overrides(&mut config, Some(7000), Some(PathBuf::from("/certs")));
        assert_eq!(config.listener.port, 7000);
        assert!(config.is_mutual_tls());
    }

    #[test]
    fn absent_overrides_keep_file_values() {
        let mut config = QplaceConfig::default();
        config.listener.cert_dir = Some(PathBuf::from("/etc/qplace/certs"));
        apply_overrides(&mut config, None, None);
        assert_eq!(config.listener.port, 55667);
        assert_eq!(config.listener.cert_dir, Some(PathBuf::from("/etc/qplace/certs")));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/qplace.toml"))).is_err());
        assert!(load_config(None).is_ok());
    }

    #[tokio::test]
    async fn feed_callback_applies_desired_state() {
        let (scheduler, _worker) = Scheduler::spawn(PlacementEngine::new());
        let callback = desired_state_callback(scheduler.clone());

        let mut state = DesiredState::new();
        state.insert(
            "pooled-inmemory".into(),
            BTreeSet::from([Address::pooled("q1", "pooled-inmemory")]),
        );
        callback(state).await;

        let groups = scheduler.groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].group_id, "pooled-inmemory");
    }
}
