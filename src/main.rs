use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use veleta::{ClusterEvent, ReplicaSetClient, ReplicaSetConfig};

#[derive(Parser)]
#[command(name = "veleta")]
#[command(about = "Replica set topology tracker and read/write router")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the configured set and print lifecycle events
    Watch {
        /// Configuration file path
        #[arg(short, long, default_value = "veleta.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long, default_value = "veleta.toml")]
        output: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, default_value = "veleta.toml")]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch { config } => {
            let config = ReplicaSetConfig::load_from_file(&config)
                .with_context(|| format!("failed to load config from {}", config.display()))?;
            init_logging(&config.logging.level);
            watch(config).await
        }
        Commands::Config { output } => {
            ReplicaSetConfig::create_example_config(&output)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("example configuration written to {}", output.display());
            Ok(())
        }
        Commands::Validate { config } => {
            match ReplicaSetConfig::load_from_file(&config) {
                Ok(loaded) => {
                    println!("configuration is valid");
                    println!("  set:             {}", loaded.set.name);
                    println!("  seeds:           {}", loaded.set.seeds.len());
                    println!("  read preference: {}", loaded.routing.read_preference);
                    Ok(())
                }
                Err(err) => {
                    error!("configuration is invalid: {}", err);
                    std::process::exit(1);
                }
            }
        }
        Commands::Version => {
            println!("veleta {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("veleta={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn watch(config: ReplicaSetConfig) -> Result<()> {
    let mut client = ReplicaSetClient::open(config).await?;
    info!("watching set `{}`", client.config().set.name);

    loop {
        tokio::select! {
            event = client.next_event() => {
                match event {
                    Some(ClusterEvent::Close) | None => break,
                    Some(event) => {
                        let snapshot = client.topology();
                        info!(
                            "{}: v{} primary={} secondaries={} state={}",
                            event.name(),
                            snapshot.version,
                            snapshot
                                .primary
                                .as_ref()
                                .map(|d| d.endpoint.to_string())
                                .unwrap_or_else(|| "none".to_string()),
                            snapshot.secondaries.len(),
                            client.failover_state(),
                        );
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                client.close().await;
                break;
            }
        }
    }
    Ok(())
}
