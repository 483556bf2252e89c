//! Ambient runtime configuration, loaded from the environment
//! (spec.md §6 "CLI / config (external, not core)").

use std::time::Duration;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub hostname: String,
    pub redis_url: String,
    pub liveliness_timeout: Duration,
    pub lockout_timeout: Duration,
    pub validator_address: Address,
    pub validator_utils_address: Address,
}

impl Config {
    /// Reads `HOSTNAME`, `REDIS_URL`, `VALIDATOR_ADDRESS`,
    /// `VALIDATOR_UTILS_ADDRESS` (required); `LIVELINESS_TIMEOUT_SECS`
    /// and `LOCKOUT_TIMEOUT_SECS` default to 30s each per spec.md §6.
    pub fn from_env() -> Result<Self, ConfigError> {
        let hostname = required("HOSTNAME")?;
        let redis_url = required("REDIS_URL")?;
        let liveliness_timeout = optional_secs("LIVELINESS_TIMEOUT_SECS", 30)?;
        let lockout_timeout = optional_secs("LOCKOUT_TIMEOUT_SECS", 30)?;
        let validator_address = parse_address("VALIDATOR_ADDRESS")?;
        let validator_utils_address = parse_address("VALIDATOR_UTILS_ADDRESS")?;
        Ok(Self {
            hostname,
            redis_url,
            liveliness_timeout,
            lockout_timeout,
            validator_address,
            validator_utils_address,
        })
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::Missing(key))
}

fn optional_secs(key: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::Invalid(key, e.to_string())),
        Err(_) => Ok(Duration::from_secs(default_secs)),
    }
}

fn parse_address(key: &'static str) -> Result<Address, ConfigError> {
    let raw = required(key)?;
    raw.parse().map_err(|_| ConfigError::Invalid(key, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_secs_falls_back_to_default() {
        std::env::remove_var("SOME_UNSET_TIMEOUT_SECS");
        let value = optional_secs("SOME_UNSET_TIMEOUT_SECS", 30).unwrap();
        assert_eq!(value, Duration::from_secs(30));
    }
}
