//! Depi server entry point: parse arguments, load configuration,
//! initialize logging, open the storage backend, and serve.

use clap::Parser;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

use depi::config::{DepiConfig, DEPI_CONFIG_ENV_VAR};
use depi::rpc::{server, DepiService};

#[derive(Parser)]
#[command(name = "depi_server", about = "Dependency registry server")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

fn resolve_config(cli: &Cli) -> Option<String> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    std::env::var(DEPI_CONFIG_ENV_VAR).ok().filter(|v| !v.is_empty())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match resolve_config(&cli) {
        Some(path) => match DepiConfig::load(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(1);
            }
        },
        None => {
            eprintln!(
                "No config file given; using defaults. Pass --config or set {DEPI_CONFIG_ENV_VAR}."
            );
            DepiConfig::default()
        }
    };

    let level = cli
        .log_level
        .clone()
        .or_else(|| config.logging.level.clone())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if config.server.insecure_port == 0 {
        error!(
            "no insecure_port configured; TLS termination is delegated to the deployment, \
             the server itself only listens on insecure_port"
        );
        std::process::exit(1);
    }

    let config = Arc::new(config);
    let service = match DepiService::new(Arc::clone(&config)).await {
        Ok(service) => service,
        Err(err) => {
            error!("failed to initialize: {err}");
            std::process::exit(1);
        }
    };
    service.start_background_tasks();

    if let Err(err) = server::serve(service, config.server.insecure_port).await {
        error!("server error: {err}");
        std::process::exit(1);
    }
}
