//! TOML configuration file parsing

use super::*;
use crate::config::cli::Cli;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Config {
    // Override channel addresses
    if let Some(ref addr) = cli.broadcast {
        config.channels.broadcast = addr.clone();
    }
    if let Some(ref addr) = cli.work {
        config.channels.work = addr.clone();
    }
    if let Some(ref addr) = cli.results {
        config.channels.results = addr.clone();
    }

    // Override pool sizing
    if let Some(workers) = cli.workers {
        config.pool.workers = workers;
    }
    if let Some(batch_size) = cli.batch_size {
        config.pool.batch_size = batch_size;
    }

    // Override protocol timing
    if let Some(ms) = cli.send_delay_ms {
        config.protocol.send_delay_ms = ms;
    }
    if let Some(ms) = cli.round_timeout_ms {
        config.protocol.round_timeout_ms = ms;
    }
    if let Some(ms) = cli.connect_timeout_ms {
        config.protocol.connect_timeout_ms = ms;
    }

    config
}

/// Build the effective configuration: file (if any), then CLI overrides, then validation
pub fn load_config(cli: &Cli) -> Result<Config> {
    let base = match cli.config {
        Some(ref path) => parse_toml_file(path)?,
        None => Config::default(),
    };

    let config = merge_cli_with_config(cli, base);
    super::validator::validate_config(&config)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn test_parse_toml_basic() {
        let toml = r#"
[channels]
broadcast = "10.0.1.10:7000"
work = "10.0.1.10:7001"
results = "10.0.1.10:7002"

[pool]
workers = 4
batch_size = 250

[protocol]
send_delay_ms = 5
round_timeout_ms = 30000
"#;

        let config = parse_toml_string(toml).unwrap();
        assert_eq!(config.channels.broadcast, "10.0.1.10:7000");
        assert_eq!(config.channels.results, "10.0.1.10:7002");
        assert_eq!(config.pool.workers, 4);
        assert_eq!(config.pool.batch_size, 250);
        assert_eq!(config.protocol.send_delay_ms, 5);
        assert_eq!(config.protocol.round_timeout_ms, 30000);
        assert_eq!(config.protocol.max_bisection_rounds, 256);
    }

    #[test]
    fn test_parse_toml_partial_sections() {
        let toml = r#"
[pool]
workers = 2
"#;

        let config = parse_toml_string(toml).unwrap();
        assert_eq!(config.pool.workers, 2);
        assert_eq!(config.pool.batch_size, 10);
        assert_eq!(config.channels, ChannelConfig::default());
        assert_eq!(config.protocol, ProtocolConfig::default());
    }

    #[test]
    fn test_parse_toml_empty() {
        assert_eq!(parse_toml_string("").unwrap(), Config::default());
    }

    #[test]
    fn test_parse_toml_rejects_wrong_types() {
        let toml = r#"
[pool]
workers = "many"
"#;
        assert!(parse_toml_string(toml).is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let config = parse_toml_string("[pool]\nworkers = 2\nbatch_size = 50\n").unwrap();
        let cli = Cli::parse_from(["statpool", "--workers", "8", "--results", "0.0.0.0:9000"]);

        let merged = merge_cli_with_config(&cli, config);
        assert_eq!(merged.pool.workers, 8);
        assert_eq!(merged.pool.batch_size, 50);
        assert_eq!(merged.channels.results, "0.0.0.0:9000");
        assert_eq!(merged.channels.broadcast, "127.0.0.1:5560");
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool]\nworkers = 3\n\n[protocol]\nmax_bisection_rounds = 64").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let cli = Cli::parse_from(["statpool", "--config", path.as_str(), "--batch-size", "7"]);

        let config = load_config(&cli).unwrap();
        assert_eq!(config.pool.workers, 3);
        assert_eq!(config.pool.batch_size, 7);
        assert_eq!(config.protocol.max_bisection_rounds, 64);
    }

    #[test]
    fn test_load_config_missing_file() {
        let cli = Cli::parse_from(["statpool", "--config", "/nonexistent/statpool.toml"]);
        let err = load_config(&cli).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read config file"));
    }

    #[test]
    fn test_load_config_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[channels]\nwork = \"not-an-address\"").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let cli = Cli::parse_from(["statpool", "--config", path.as_str()]);
        assert!(load_config(&cli).is_err());
    }
}
