//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.
//!
//! Every section of the file is optional; a missing section or key falls back
//! to the defaults below, which describe a single local worker on the
//! loopback interface.
//!
//! ```text
//! [channels]
//! broadcast = "127.0.0.1:5560"
//! work      = "127.0.0.1:5561"
//! results   = "127.0.0.1:5562"
//!
//! [pool]
//! workers    = 1
//! batch_size = 10
//!
//! [protocol]
//! send_delay_ms        = 0
//! round_timeout_ms     = 0
//! max_bisection_rounds = 256
//! connect_timeout_ms   = 10000
//! ```

pub mod cli;
pub mod toml;
pub mod validator;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete pool configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub channels: ChannelConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

impl Config {
    /// Number of staged values that triggers a fan-out to the workers
    pub fn flush_threshold(&self) -> usize {
        self.pool.batch_size.saturating_mul(self.pool.workers)
    }
}

/// Addresses of the three logical channels
///
/// The coordinator binds them, workers connect to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Coordinator to every worker (commands)
    #[serde(default = "default_broadcast")]
    pub broadcast: String,
    /// Coordinator to one worker per chunk (data)
    #[serde(default = "default_work")]
    pub work: String,
    /// Workers to coordinator (replies)
    #[serde(default = "default_results")]
    pub results: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            broadcast: default_broadcast(),
            work: default_work(),
            results: default_results(),
        }
    }
}

fn default_broadcast() -> String {
    "127.0.0.1:5560".to_string()
}

fn default_work() -> String {
    "127.0.0.1:5561".to_string()
}

fn default_results() -> String {
    "127.0.0.1:5562".to_string()
}

/// Worker pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of workers; every protocol step waits for this many replies
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Staged values per worker before the buffer is split and dispatched
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_workers() -> usize {
    1
}

fn default_batch_size() -> usize {
    10
}

/// Protocol timing and limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Pause before each chunk dispatch (milliseconds, 0 = none)
    #[serde(default)]
    pub send_delay_ms: u64,
    /// Deadline for each broadcast-and-collect step (milliseconds, 0 = wait forever)
    #[serde(default)]
    pub round_timeout_ms: u64,
    /// Bound-count rounds allowed before a median request gives up
    ///
    /// Any finite data set converges in well under 150 counts; this is a safety cap.
    #[serde(default = "default_max_bisection_rounds")]
    pub max_bisection_rounds: u32,
    /// How long a worker keeps retrying to reach the coordinator (milliseconds)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            send_delay_ms: 0,
            round_timeout_ms: 0,
            max_bisection_rounds: default_max_bisection_rounds(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ProtocolConfig {
    pub fn send_delay(&self) -> Option<Duration> {
        (self.send_delay_ms > 0).then(|| Duration::from_millis(self.send_delay_ms))
    }

    pub fn round_timeout(&self) -> Option<Duration> {
        (self.round_timeout_ms > 0).then(|| Duration::from_millis(self.round_timeout_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_max_bisection_rounds() -> u32 {
    256
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.channels.broadcast, "127.0.0.1:5560");
        assert_eq!(config.channels.work, "127.0.0.1:5561");
        assert_eq!(config.channels.results, "127.0.0.1:5562");
        assert_eq!(config.pool.workers, 1);
        assert_eq!(config.pool.batch_size, 10);
        assert_eq!(config.protocol.max_bisection_rounds, 256);
        assert_eq!(config.flush_threshold(), 10);
    }

    #[test]
    fn test_zero_durations_disable() {
        let protocol = ProtocolConfig::default();
        assert_eq!(protocol.send_delay(), None);
        assert_eq!(protocol.round_timeout(), None);
        assert_eq!(protocol.connect_timeout(), Duration::from_secs(10));

        let protocol = ProtocolConfig { send_delay_ms: 5, round_timeout_ms: 250, ..ProtocolConfig::default() };
        assert_eq!(protocol.send_delay(), Some(Duration::from_millis(5)));
        assert_eq!(protocol.round_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_flush_threshold_scales_with_pool() {
        let mut config = Config::default();
        config.pool.workers = 4;
        config.pool.batch_size = 25;
        assert_eq!(config.flush_threshold(), 100);
    }
}
