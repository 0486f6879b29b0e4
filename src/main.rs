use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kestrel::collector::{CollectorConfig, CollectorRuntime};
use kestrel::dispatcher::{DispatcherConfig, DispatcherServer};

#[derive(Parser)]
#[command(
    name = "kestrel",
    version,
    about = "Distributed feed-collection dispatcher and collector",
    long_about = None
)]
struct Cli {
    /// Log output format: text or json
    #[arg(long, default_value = "text", global = true)]
    log_format: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher server
    Dispatcher {
        /// Path to a TOML config file (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<String>,

        /// Override the bind address
        #[arg(short, long)]
        bind: Option<String>,

        /// Override the source catalog path
        #[arg(long)]
        catalog: Option<String>,
    },

    /// Run a collector process
    Collector {
        /// Path to a TOML config file
        #[arg(short, long)]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_tracing(&cli.log_format, cli.verbose)?;

    match cli.command {
        Commands::Dispatcher {
            config,
            bind,
            catalog,
        } => {
            let mut config = match config {
                Some(path) => DispatcherConfig::from_file(&path)?,
                None => DispatcherConfig::default(),
            };
            if let Some(bind) = bind {
                config.bind_address = bind.parse()?;
            }
            if let Some(catalog) = catalog {
                config.catalog_path = catalog;
            }

            let server = DispatcherServer::from_config(config)?;
            println!("{}", server.info().display());

            server
                .start_with_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::info!("Shutdown signal received");
                })
                .await?;
        }

        Commands::Collector { config } => {
            let config = CollectorConfig::from_file(&config)?;
            let runtime = Arc::new(CollectorRuntime::new(config)?);

            runtime
                .run(async {
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::info!("Shutdown signal received");
                })
                .await?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("kestrel=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("kestrel=info,warn")
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
