use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use topic_bus::BusConfig;

/// CLI configuration loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub bus: BusConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_timeout_var(env::var("BUS_PENDING_REPLY_TIMEOUT_MS").ok())
    }

    fn from_timeout_var(value: Option<String>) -> Result<Self> {
        let mut bus = BusConfig::default();
        if let Some(value) = value {
            let millis: u64 = value
                .trim()
                .parse()
                .context("BUS_PENDING_REPLY_TIMEOUT_MS must be a number of milliseconds")?;
            bus = bus.with_pending_reply_timeout(Duration::from_millis(millis));
        }
        Ok(Self { bus })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use topic_bus::DEFAULT_PENDING_REPLY_TIMEOUT;

    #[test]
    fn test_missing_timeout_uses_default() {
        let config = Config::from_timeout_var(None).unwrap();
        assert_eq!(config.bus.pending_reply_timeout, DEFAULT_PENDING_REPLY_TIMEOUT);
    }

    #[test]
    fn test_timeout_is_read_in_millis() {
        let config = Config::from_timeout_var(Some(" 2500 ".to_string())).unwrap();
        assert_eq!(config.bus.pending_reply_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn test_invalid_timeout_is_rejected() {
        let err = Config::from_timeout_var(Some("soon".to_string())).unwrap_err();
        assert!(err.to_string().contains("BUS_PENDING_REPLY_TIMEOUT_MS"));
    }
}
