//! Configuration management utilities
//!
//! Settings are read from `AGENT_*` environment variables, falling back to
//! defaults for anything unset.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Variable holding the application name
pub const APP_NAME_VAR: &str = "AGENT_APP_NAME";
/// Variable holding the environment name
pub const ENVIRONMENT_VAR: &str = "AGENT_ENV";
/// Variable holding the fallback log filter
pub const LOG_FILTER_VAR: &str = "AGENT_LOG";
/// Variable selecting the log output format
pub const LOG_FORMAT_VAR: &str = "AGENT_LOG_FORMAT";

/// Errors raised while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidLogFilter { filter: String, reason: String },

    #[error("Unknown log format '{0}' (expected 'pretty' or 'json')")]
    UnknownLogFormat(String),
}

/// How log lines are rendered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::UnknownLogFormat(s.to_string())),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Application name
    pub app_name: String,
    /// Environment (dev, prod, etc.)
    pub environment: String,
    /// Filter used when `RUST_LOG` is not set
    pub log_filter: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: "agent-rs".to_string(),
            environment: "development".to_string(),
            log_filter: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Load configuration from the process environment
    ///
    /// # Errors
    ///
    /// Returns an error if `AGENT_LOG` is not a valid filter or
    /// `AGENT_LOG_FORMAT` names an unknown format.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through a variable lookup function
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let log_filter = non_empty(LOG_FILTER_VAR).unwrap_or(defaults.log_filter);
        EnvFilter::try_new(&log_filter).map_err(|e| ConfigError::InvalidLogFilter {
            filter: log_filter.clone(),
            reason: e.to_string(),
        })?;

        let log_format = match non_empty(LOG_FORMAT_VAR) {
            Some(format) => format.parse()?,
            None => defaults.log_format,
        };

        Ok(Self {
            app_name: non_empty(APP_NAME_VAR).unwrap_or(defaults.app_name),
            environment: non_empty(ENVIRONMENT_VAR).unwrap_or(defaults.environment),
            log_filter,
            log_format,
        })
    }

    /// Check if this is a production environment
    pub fn is_production(&self) -> bool {
        matches!(self.environment.as_str(), "prod" | "production")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert!(!config.is_production());
    }

    #[test]
    fn test_reads_variables() {
        let config = Config::from_lookup(lookup(&[
            (APP_NAME_VAR, "relay-demo"),
            (ENVIRONMENT_VAR, "production"),
            (LOG_FILTER_VAR, "agent_runtime=debug,warn"),
            (LOG_FORMAT_VAR, "JSON"),
        ]))
        .unwrap();

        assert_eq!(config.app_name, "relay-demo");
        assert_eq!(config.log_filter, "agent_runtime=debug,warn");
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.is_production());
    }

    #[test]
    fn test_blank_values_fall_back() {
        let config = Config::from_lookup(lookup(&[(APP_NAME_VAR, "  ")])).unwrap();
        assert_eq!(config.app_name, "agent-rs");
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = Config::from_lookup(lookup(&[(LOG_FILTER_VAR, "agent_runtime=loud")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLogFilter { .. }));

        let err = Config::from_lookup(lookup(&[(LOG_FORMAT_VAR, "xml")])).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownLogFormat(f) if f == "xml"));
    }

    #[test]
    fn test_serde_defaults_format() {
        let config: Config = serde_json::from_str(
            r#"{"app_name":"a","environment":"dev","log_filter":"debug"}"#,
        )
        .unwrap();
        assert_eq!(config.log_format, LogFormat::Pretty);
    }
}
