//! mdbroker CLI
//!
//! Command-line client and echo worker for an mdbroker daemon.

mod commands;

use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// mdcli - talk to a Majordomo broker
#[derive(Parser, Debug)]
#[command(name = "mdcli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Broker endpoint
    #[arg(long, default_value = "tcp://127.0.0.1:5555", global = true)]
    endpoint: String,

    /// How long to wait for the broker, in milliseconds
    #[arg(long, default_value_t = 5000, global = true)]
    timeout_ms: u64,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verify the broker is reachable and print its identity
    Ping,

    /// Send a request to a service and print the reply
    Request {
        /// Service name
        service: String,

        /// Request body, one frame per argument
        #[arg(required = true)]
        body: Vec<String>,
    },

    /// Run an echo worker for a service until interrupted
    Worker {
        /// Service name
        service: String,

        /// Heartbeat interval in milliseconds
        #[arg(long, default_value_t = mdbroker_core::DEFAULT_HEARTBEAT_INTERVAL_MS)]
        heartbeat_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let deadline = Duration::from_millis(cli.timeout_ms);

    match cli.command {
        Commands::Ping => {
            let identity = commands::ping(&cli.endpoint, deadline).await?;
            println!("Broker {} is alive", identity);
        }
        Commands::Request { service, body } => {
            let reply = commands::request(&cli.endpoint, &service, body, deadline).await?;
            for frame in reply {
                println!("{}", frame);
            }
        }
        Commands::Worker {
            service,
            heartbeat_ms,
        } => {
            println!("Serving '{}' on {} (Ctrl-C to stop)", service, cli.endpoint);
            let served = commands::worker(
                &cli.endpoint,
                &service,
                Duration::from_millis(heartbeat_ms.max(1)),
                async {
                    let _ = tokio::signal::ctrl_c().await;
                },
            )
            .await?;
            println!("Served {} request(s)", served);
        }
    }

    Ok(())
}
