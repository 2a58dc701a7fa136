//! Configuration validation

use super::*;
use anyhow::{Context, Result};

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_channels(&config.channels)?;
    validate_pool(&config.pool)?;
    validate_protocol(&config.protocol)?;

    Ok(())
}

/// Validate channel addresses
pub fn validate_channels(channels: &ChannelConfig) -> Result<()> {
    for (name, addr) in [
        ("broadcast", &channels.broadcast),
        ("work", &channels.work),
        ("results", &channels.results),
    ] {
        validate_address(addr).with_context(|| format!("Invalid {} channel address", name))?;
    }

    Ok(())
}

/// Check `host:port` shape without resolving the host
fn validate_address(addr: &str) -> Result<()> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("'{}' is not of the form host:port", addr))?;

    if host.is_empty() {
        anyhow::bail!("'{}' has no host", addr);
    }

    port.parse::<u16>()
        .with_context(|| format!("'{}' has an invalid port", addr))?;

    Ok(())
}

/// Validate pool sizing
pub fn validate_pool(pool: &PoolConfig) -> Result<()> {
    if pool.workers == 0 {
        anyhow::bail!("workers must be at least 1");
    }

    if pool.batch_size == 0 {
        anyhow::bail!("batch_size must be at least 1");
    }

    Ok(())
}

/// Validate protocol limits
pub fn validate_protocol(protocol: &ProtocolConfig) -> Result<()> {
    if protocol.max_bisection_rounds == 0 {
        anyhow::bail!("max_bisection_rounds must be at least 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_addresses() {
        assert!(validate_address("127.0.0.1:5560").is_ok());
        assert!(validate_address("coordinator.internal:5560").is_ok());
        assert!(validate_address("[::1]:5560").is_ok());

        assert!(validate_address("127.0.0.1").is_err());
        assert!(validate_address(":5560").is_err());
        assert!(validate_address("127.0.0.1:http").is_err());
        assert!(validate_address("127.0.0.1:70000").is_err());
    }

    #[test]
    fn test_validate_channels_names_the_channel() {
        let channels = ChannelConfig {
            results: "nowhere".to_string(),
            ..ChannelConfig::default()
        };

        let err = validate_channels(&channels).unwrap_err();
        assert!(err.to_string().contains("results"));
    }

    #[test]
    fn test_validate_pool() {
        let mut pool = PoolConfig::default();
        assert!(validate_pool(&pool).is_ok());

        pool.workers = 0;
        assert!(validate_pool(&pool).is_err());

        pool.workers = 2;
        pool.batch_size = 0;
        assert!(validate_pool(&pool).is_err());
    }

    #[test]
    fn test_validate_protocol() {
        let mut protocol = ProtocolConfig::default();
        assert!(validate_protocol(&protocol).is_ok());

        protocol.max_bisection_rounds = 0;
        assert!(validate_protocol(&protocol).is_err());
    }
}
