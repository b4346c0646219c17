//! mdbroker daemon
//!
//! Runs a Majordomo broker on a TCP endpoint until interrupted.

use anyhow::Context;
use clap::Parser;
use mdbroker_broker::Broker;
use mdbroker_core::{BrokerConfig, LoggingConfig};
use mdbroker_network::{Announcement, HttpRegistrator, NoopRegistrator, Registrator};
use mdbroker_transport::TcpTransport;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

/// mdbrokerd - Majordomo request/reply broker
#[derive(Parser, Debug)]
#[command(name = "mdbrokerd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Endpoint to bind (e.g. tcp://0.0.0.0:5555)
    #[arg(long)]
    endpoint: Option<String>,

    /// Heartbeat interval in milliseconds
    #[arg(long)]
    heartbeat_interval_ms: Option<u64>,

    /// Discovery URL to announce the broker to
    #[arg(long)]
    registrator_url: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<BrokerConfig> {
        let mut config = match &self.config {
            Some(path) => BrokerConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => BrokerConfig::default(),
        };

        if let Some(endpoint) = &self.endpoint {
            config.broker.endpoint = endpoint.clone();
        }
        if let Some(interval) = self.heartbeat_interval_ms {
            config.broker.heartbeat_interval_ms = interval;
        }
        if let Some(url) = &self.registrator_url {
            config.registrator.url = Some(url.clone());
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    match config.format.as_str() {
        "json" => tracing::subscriber::set_global_default(builder.json().finish())?,
        _ => tracing::subscriber::set_global_default(builder.finish())?,
    }
    Ok(())
}

fn build_registrator(
    config: &BrokerConfig,
    identity: &str,
) -> anyhow::Result<Box<dyn Registrator>> {
    let Some(url) = config.registrator.url.clone() else {
        return Ok(Box::new(NoopRegistrator));
    };

    let endpoint = config
        .registrator
        .advertised_endpoint
        .clone()
        .unwrap_or_else(|| config.broker.endpoint.clone());
    if endpoint.contains("0.0.0.0") || endpoint.contains("*:") {
        warn!(
            endpoint = %endpoint,
            "Announcing a wildcard endpoint; set registrator.advertised_endpoint"
        );
    }

    let registrator = HttpRegistrator::new(
        url,
        Announcement {
            identity: identity.to_string(),
            endpoint,
        },
        Duration::from_secs(config.registrator.interval_secs),
    )?;
    info!(url = %registrator.url(), "Announcing broker to discovery service");
    Ok(Box::new(registrator))
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;
    init_logging(&config.logging)?;

    info!("Starting mdbroker daemon v{}", env!("CARGO_PKG_VERSION"));

    let identity = Uuid::new_v4().to_string();
    let registrator = build_registrator(&config, &identity)?;

    let mut broker = Broker::new(config.broker.clone(), TcpTransport::new(), registrator)
        .with_identity(identity);
    broker
        .bind()
        .await
        .with_context(|| format!("binding {}", config.broker.endpoint))?;

    if let Some(addr) = broker.transport().local_addr() {
        info!(address = %addr, "Broker listening");
    }
    info!(
        heartbeat_interval_ms = config.broker.heartbeat_interval_ms,
        max_liveness = config.broker.max_liveness,
        "Heartbeat settings"
    );

    broker.run(wait_for_shutdown_signal()).await?;

    let snapshot = broker.snapshot();
    info!(
        services = snapshot.services.len(),
        workers = snapshot.workers.len(),
        "Broker shut down"
    );
    Ok(())
}
