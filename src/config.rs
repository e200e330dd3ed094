//! Configuration Module
//!
//! Handles building cache configuration in code or from environment variables.

use std::env;

use crate::error::{CacheError, Result};

/// Environment variable selecting the blocking-read policy
pub const ENV_WAIT_ON_UPDATE: &str = "REFRESH_CACHE_WAIT_ON_UPDATE";
/// Environment variable holding the sustained fetch rate (events per second)
pub const ENV_RATE_LIMIT: &str = "REFRESH_CACHE_RATE_LIMIT";
/// Environment variable holding the limiter burst size
pub const ENV_RATE_BURST: &str = "REFRESH_CACHE_RATE_BURST";

// == Rate Limit Config ==
/// Token-bucket parameters bounding how often fetch functions may run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Sustained rate in fetches per second
    pub rate_per_sec: f64,
    /// Maximum number of fetches admitted back to back
    pub burst: u32,
}

impl RateLimitConfig {
    /// Checks that the rate is a positive finite number and the burst is non-zero.
    pub fn validate(&self) -> Result<()> {
        if !self.rate_per_sec.is_finite() || self.rate_per_sec <= 0.0 {
            return Err(CacheError::InvalidConfig(format!(
                "rate must be a positive number, got {}",
                self.rate_per_sec
            )));
        }
        if self.burst == 0 {
            return Err(CacheError::InvalidConfig(
                "burst must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cache configuration parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Whether `get` waits for an in-flight fetch before returning
    pub wait_on_update: bool,
    /// Optional limiter shared by every fetch; `None` runs fetches unrestricted
    pub rate_limit: Option<RateLimitConfig>,
}

impl Config {
    /// Creates a configuration with the given read policy and no rate limit.
    pub fn new(wait_on_update: bool) -> Self {
        Self {
            wait_on_update,
            rate_limit: None,
        }
    }

    /// Sets the blocking-read policy.
    pub fn with_wait_on_update(mut self, wait_on_update: bool) -> Self {
        self.wait_on_update = wait_on_update;
        self
    }

    /// Allows fetches at up to `rate_per_sec` with bursts of at most `burst`.
    pub fn with_rate_limit(mut self, rate_per_sec: f64, burst: u32) -> Self {
        self.rate_limit = Some(RateLimitConfig {
            rate_per_sec,
            burst,
        });
        self
    }

    /// Validates the rate limit parameters, if any.
    pub fn validate(&self) -> Result<()> {
        match &self.rate_limit {
            Some(limit) => limit.validate(),
            None => Ok(()),
        }
    }

    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `REFRESH_CACHE_WAIT_ON_UPDATE` - Block readers during fetches (default: true)
    /// - `REFRESH_CACHE_RATE_LIMIT` - Fetches per second (default: unlimited)
    /// - `REFRESH_CACHE_RATE_BURST` - Burst size, only read with a rate (default: 1)
    ///
    /// Unparseable values fall back to their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let wait_on_update = lookup(ENV_WAIT_ON_UPDATE)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(true);

        let rate_limit = lookup(ENV_RATE_LIMIT)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(|rate_per_sec| RateLimitConfig {
                rate_per_sec,
                burst: lookup(ENV_RATE_BURST)
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(1),
            })
            .filter(|limit| limit.validate().is_ok());

        Self {
            wait_on_update,
            rate_limit,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.wait_on_update);
        assert!(config.rate_limit.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new(false).with_rate_limit(20.0, 5);
        assert!(!config.wait_on_update);
        assert_eq!(
            config.rate_limit,
            Some(RateLimitConfig {
                rate_per_sec: 20.0,
                burst: 5
            })
        );
        assert!(config.with_wait_on_update(true).wait_on_update);
    }

    #[test]
    fn test_validate_rejects_bad_rate() {
        assert!(Config::default().with_rate_limit(0.0, 1).validate().is_err());
        assert!(Config::default().with_rate_limit(-3.0, 1).validate().is_err());
        assert!(Config::default()
            .with_rate_limit(f64::NAN, 1)
            .validate()
            .is_err());
    }

    #[test]
    fn test_validate_rejects_zero_burst() {
        let err = Config::default()
            .with_rate_limit(10.0, 0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_defaults() {
        let config = Config::from_lookup(lookup_from(&[]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_from_env_values() {
        let config = Config::from_lookup(lookup_from(&[
            (ENV_WAIT_ON_UPDATE, "false"),
            (ENV_RATE_LIMIT, "2.5"),
            (ENV_RATE_BURST, "4"),
        ]));
        assert!(!config.wait_on_update);
        assert_eq!(
            config.rate_limit,
            Some(RateLimitConfig {
                rate_per_sec: 2.5,
                burst: 4
            })
        );
    }

    #[test]
    fn test_config_from_env_invalid_values_fall_back() {
        let config = Config::from_lookup(lookup_from(&[
            (ENV_WAIT_ON_UPDATE, "maybe"),
            (ENV_RATE_LIMIT, "-1"),
        ]));
        assert!(config.wait_on_update);
        assert!(config.rate_limit.is_none());
    }

    #[test]
    fn test_config_from_env_burst_defaults_to_one() {
        let config = Config::from_lookup(lookup_from(&[(ENV_RATE_LIMIT, "10")]));
        assert_eq!(config.rate_limit.map(|l| l.burst), Some(1));
    }
}
