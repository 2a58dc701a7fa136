//! CLI argument parsing using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Process role
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    /// Coordinator - bind the channels, distribute data, compute statistics
    Coordinator,
    /// Worker - connect to the coordinator and hold one partition
    Worker,
}

/// statpool - distributed mean and exact median over a worker pool
#[derive(Parser, Debug)]
#[command(name = "statpool")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Process role: coordinator or worker
    #[arg(long, value_enum, default_value = "coordinator")]
    pub role: Role,

    /// TOML configuration file (CLI flags take precedence)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    // === Channels ===
    /// Broadcast channel address (coordinator -> all workers)
    #[arg(long)]
    pub broadcast: Option<String>,

    /// Work distribution channel address (coordinator -> one worker per chunk)
    #[arg(long)]
    pub work: Option<String>,

    /// Result aggregation channel address (workers -> coordinator)
    #[arg(long)]
    pub results: Option<String>,

    // === Pool ===
    /// Number of workers in the pool
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Values staged per worker before a fan-out
    #[arg(short = 'b', long)]
    pub batch_size: Option<usize>,

    // === Protocol ===
    /// Pause before each chunk dispatch in milliseconds
    #[arg(long)]
    pub send_delay_ms: Option<u64>,

    /// Per-step reply deadline in milliseconds (0 = wait forever)
    #[arg(long)]
    pub round_timeout_ms: Option<u64>,

    /// How long a worker retries reaching the coordinator, in milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    // === Coordinator demo ===
    /// Number of demo values (0..count) submitted when no input file is given
    #[arg(short = 'n', long, default_value = "99000")]
    pub count: usize,

    /// File of values to submit, one number per line
    #[arg(short = 'i', long)]
    pub input: Option<PathBuf>,

    /// Shuffle the values before submitting them
    #[arg(long)]
    pub shuffle: bool,

    /// Wait this long after the last submit before requesting statistics (milliseconds)
    #[arg(long, default_value = "3000")]
    pub settle_ms: u64,

    // === Logging ===
    /// Log level when RUST_LOG is not set (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == Some(0) {
            anyhow::bail!("workers must be at least 1");
        }

        if self.batch_size == Some(0) {
            anyhow::bail!("batch_size must be at least 1");
        }

        if self.role == Role::Coordinator && self.input.is_none() && self.count == 0 {
            anyhow::bail!("count must be at least 1 when no input file is given");
        }

        match self.log_level.to_ascii_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => anyhow::bail!("Unknown log level: {}", other),
        }

        Ok(())
    }
}
