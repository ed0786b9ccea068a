use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use maat_tuner::cli::Args;
use maat_tuner::config::ServiceConfig;
use maat_tuner::service::TuningService;
use maat_tuner::web;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = ServiceConfig::resolve(&args)?;
    tracing::info!(
        target: "main",
        host = %config.host,
        port = config.port,
        data_dir = %config.data_dir.display(),
        in_memory = config.in_memory,
        "configuration resolved"
    );

    let service = Arc::new(TuningService::open(&config)?);
    web::serve(&config, service).await?;
    Ok(())
}
