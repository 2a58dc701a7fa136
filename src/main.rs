//! statpool CLI entry point

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use statpool::config::cli::{Cli, Role};
use statpool::config::{toml::load_config, Config};
use statpool::distributed::{Coordinator, NodeService};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    cli.validate()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.to_ascii_lowercase().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&cli).context("Configuration validation failed")?;

    let runtime = tokio::runtime::Runtime::new()
        .context("Failed to create tokio runtime")?;

    runtime.block_on(async {
        match cli.role {
            Role::Coordinator => run_coordinator(&cli, config).await,
            Role::Worker => run_worker(config).await,
        }
    })
}

/// Run the worker role until the coordinator goes away or Ctrl-C
async fn run_worker(config: Config) -> Result<()> {
    let service = NodeService::new(config);
    info!(worker = %service.worker_name(), "Worker activated");

    tokio::select! {
        result = service.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping worker");
            Ok(())
        }
    }
}

/// Run the coordinator role: distribute the data set, then report mean and median
async fn run_coordinator(cli: &Cli, config: Config) -> Result<()> {
    let workers = config.pool.workers;
    let mut values = load_values(cli)?;
    if cli.shuffle {
        values.shuffle(&mut rand::thread_rng());
    }

    let coordinator = Coordinator::start(config).await?;
    info!("Coordinator activated, waiting for {} worker(s)", workers);

    let ready = tokio::select! {
        result = coordinator.wait_for_workers(workers) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    match ready {
        Some(result) => result?,
        None => {
            info!("Interrupted before the pool was ready");
            return coordinator.stop().await;
        }
    }

    info!(values = values.len(), "Submitting values");
    for (index, value) in values.iter().enumerate() {
        coordinator.submit(*value, index + 1 == values.len())?;
    }

    // Chunks and commands travel on separate connections
    tokio::time::sleep(Duration::from_millis(cli.settle_ms)).await;

    let outcome = tokio::select! {
        (average, median) = async { tokio::join!(coordinator.average(), coordinator.median()) } => {
            report("AVERAGE", average);
            report("MEDIAN", median);
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping coordinator");
            Ok(())
        }
    };

    coordinator.stop().await?;
    outcome
}

fn report(label: &str, result: Result<f64, statpool::distributed::RoundError>) {
    match result {
        Ok(value) => {
            info!("{} result received: {}", label, value);
            println!("{}: {}", label, value);
        }
        Err(e) => warn!("{} request failed: {}", label, e),
    }
}

/// Values to submit: the input file when given, otherwise `0..count`
fn load_values(cli: &Cli) -> Result<Vec<f64>> {
    match cli.input {
        Some(ref path) => read_values(path),
        None => Ok((0..cli.count).map(|v| v as f64).collect()),
    }
}

/// Read one number per line, skipping blank lines and `#` comments
fn read_values(path: &Path) -> Result<Vec<f64>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file: {}", path.display()))?;

    let mut values = Vec::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let value: f64 = line.parse()
            .with_context(|| format!("{}:{}: not a number: {}", path.display(), number + 1, line))?;
        if !value.is_finite() {
            anyhow::bail!("{}:{}: value must be finite", path.display(), number + 1);
        }
        values.push(value);
    }

    if values.is_empty() {
        anyhow::bail!("Input file {} contains no values", path.display());
    }
    Ok(values)
}
