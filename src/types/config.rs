//! Configuration structures.
//!
//! Configuration is built from defaults or loaded from a JSON file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::Result;

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Hook invocation configuration.
    #[serde(default)]
    pub invocation: InvocationConfig,
}

impl Config {
    /// Load configuration from a JSON file. Missing sections fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Hook invocation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct InvocationConfig {
    /// Upper bound for a single handler call. `None` waits forever.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Option<Duration>,

    /// Whether a race over zero handlers is an error instead of `None`.
    pub race_empty_is_error: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.observability.log_level, "info");
        assert!(!config.observability.json_logs);
        assert!(config.invocation.call_timeout.is_none());
    }

    #[test]
    fn test_from_file_with_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"invocation": {{"call_timeout": "250ms"}}}}"#).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(
            config.invocation.call_timeout,
            Some(Duration::from_millis(250))
        );
        assert!(!config.invocation.race_empty_is_error);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_from_file_missing() {
        let result = Config::from_file("/nonexistent/soa-config.json");
        assert!(result.is_err());
    }
}
