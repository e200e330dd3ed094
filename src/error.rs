//! Error types for the cache
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache.
///
/// Cache operations themselves never fail; errors surface while building a
/// cache from configuration, and fetch failures are wrapped here before they
/// are logged.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Rejected configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A caller-supplied fetch function failed
    #[error("Fetch failed: {0}")]
    Fetch(#[from] anyhow::Error),
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_message() {
        let err = CacheError::InvalidConfig("burst must be greater than 0".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: burst must be greater than 0"
        );
    }

    #[test]
    fn test_fetch_error_from_anyhow() {
        let err: CacheError = anyhow::anyhow!("backend unavailable").into();
        assert!(matches!(err, CacheError::Fetch(_)));
        assert_eq!(err.to_string(), "Fetch failed: backend unavailable");
    }
}
