//! Timeouts and confirmation depth used by the client, the funder and the
//! adjudicator.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_FUNDING_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_FINALITY_DEPTH: u64 = 1;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0} must not be zero")]
    Zero(&'static str),
}

/// All durations are given in milliseconds when (de)serialized. Missing
/// fields take their default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How long to wait for the answers of the other participants to an
    /// update proposal.
    #[serde(with = "as_millis")]
    pub response_timeout: Duration,
    /// How long to wait for all participants' deposits.
    #[serde(with = "as_millis")]
    pub funding_timeout: Duration,
    /// How long to wait for a single transaction to reach `finality_depth`.
    #[serde(with = "as_millis")]
    pub tx_timeout: Duration,
    /// Number of blocks, including its own, a transaction needs to be
    /// considered final.
    pub finality_depth: u64,
    /// Interval between ledger reads while waiting for on-chain events.
    #[serde(with = "as_millis")]
    pub poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            funding_timeout: DEFAULT_FUNDING_TIMEOUT,
            tx_timeout: DEFAULT_TX_TIMEOUT,
            finality_depth: DEFAULT_FINALITY_DEPTH,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ClientConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.finality_depth == 0 {
            return Err(ConfigError::Zero("finality_depth"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Zero("poll_interval"));
        }
        Ok(())
    }
}

mod as_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        assert_eq!(ClientConfig::from_json("{}").unwrap(), ClientConfig::default());
    }

    #[test]
    fn durations_are_milliseconds() {
        let config =
            ClientConfig::from_json(r#"{"response_timeout": 250, "finality_depth": 3}"#).unwrap();
        assert_eq!(config.response_timeout, Duration::from_millis(250));
        assert_eq!(config.finality_depth, 3);
        assert_eq!(config.tx_timeout, DEFAULT_TX_TIMEOUT);

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""response_timeout":250"#));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            ClientConfig::from_json(r#"{"finality_depth": 0}"#),
            Err(ConfigError::Zero("finality_depth"))
        ));
        assert!(matches!(
            ClientConfig::from_json(r#"{"poll_interval": "fast"}"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
