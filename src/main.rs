use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use coinload::{Config, Runner};
use tracing::{event, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Drive the coin shop API with ramping virtual users and check thresholds.
#[derive(Debug, Parser)]
#[command(name = "coinload", version, about)]
struct Cli {
    /// TOML run configuration. Defaults to the reference run.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Override the base URL of the service.
    #[arg(long)]
    base_url: Option<String>,
    /// Write the final summary as JSON to this file.
    #[arg(long)]
    summary_export: Option<PathBuf>,
    /// Start users without probing /api/healthcheck first.
    #[arg(long)]
    skip_healthcheck: bool,
    /// Log filter used when RUST_LOG is unset, e.g. `debug` or `coinload=trace`.
    #[arg(long)]
    log_level: Option<String>,
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) if level.contains('=') => EnvFilter::new(level),
        Some(level) => EnvFilter::new(format!("coinload={level}")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("coinload=info")),
    };
    let _ = Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }

    let summary = Runner::new(config)
        .skip_healthcheck(cli.skip_healthcheck)
        .run()
        .await?;

    println!("{summary}");
    if let Some(path) = &cli.summary_export {
        let json = serde_json::to_vec_pretty(&summary)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write summary to {}", path.display()))?;
    }
    Ok(summary.exit_code())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match run(cli).await {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            event!(target: "coinload", Level::ERROR, "{err:#}");
            ExitCode::FAILURE
        }
    }
}
