use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "maat-tuner")]
#[command(version)]
#[command(about = "Telemetry-driven rule tuning, regression gates and A/B tracking for movement coaching")]
pub struct Args {
    /// Address to bind the HTTP server on
    #[arg(long, env = "API_HOST")]
    pub host: Option<String>,

    /// Port for the HTTP server
    #[arg(long, env = "API_PORT")]
    pub port: Option<u16>,

    /// Root directory for telemetry, rules, experiments and test reports
    #[arg(long, env = "DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Optional TOML config file (CLI flags and env vars override it)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Keep all state in memory instead of under the data directory
    #[arg(long)]
    pub in_memory: bool,
}
