//! Fleetwatch - Multi-cluster deployment watcher
//!
//! Validates fleet configuration and runs the watch pipeline against
//! simulated clusters.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use fleetwatch_core::FleetConfig;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "fleetwatch")]
#[command(author = "Fleetwatch Team")]
#[command(version = fleetwatch_core::VERSION)]
#[command(about = "Multi-cluster deployment watcher", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true, env = "FLEETWATCH_CONFIG")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_config(format: &str) -> Self {
        match format.to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Check the fleet configuration and print it
    Validate,

    /// Run the pipeline against in-memory clusters seeded from a fixture
    Simulate {
        /// JSON fixture describing clusters, objects and scripted changes
        #[arg(long)]
        fixture: PathBuf,

        /// Seconds between status reports
        #[arg(long, default_value_t = 10)]
        status_interval: u64,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => FleetConfig::from_file(path)?.apply_env(),
        None => FleetConfig::from_env(),
    };

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let format = cli
        .log_format
        .unwrap_or_else(|| LogFormat::from_config(&config.logging.format));
    init_logging(&level, format);

    match cli.command {
        Commands::Validate => commands::validate::execute(&config),
        Commands::Simulate {
            fixture,
            status_interval,
            duration,
        } => commands::simulate::execute(&config, &fixture, status_interval, duration).await,
        Commands::Version => {
            println!("fleetwatch {}", fleetwatch_core::VERSION);
            Ok(())
        }
    }
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .init(),
    }
}
