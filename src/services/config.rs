//! Configuration for the mitos platform.

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid max_iterations: {0}. Must be between 1 and 100")]
    InvalidMaxIterations(u32),

    #[error("Invalid platform max_cells: {0}. Must be at least 1")]
    InvalidMaxCells(u64),

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: ".mitos/mitos.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// json | pretty
    pub format: String,
    /// Directory for daily-rolling file output. Stdout only when unset.
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8900,
            enable_cors: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MindConfig {
    /// Default provider for cells that do not name one.
    pub provider: String,
    pub model: String,
    pub requests_per_second: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for MindConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-5-20250929".to_string(),
            requests_per_second: 10,
            timeout_secs: 300,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Tool-loop iterations per message before giving up.
    pub max_iterations: u32,
    /// Working-memory sliding window size.
    pub max_messages: usize,
    /// Summarize once the window holds this many messages. Off when unset.
    pub summarize_after: Option<usize>,
    /// Durable-consumer ack window. Must exceed the longest LLM turn.
    pub ack_wait_secs: u64,
    /// Consume the inbox durably (acks + redelivery) or best-effort.
    pub durable_inbox: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            max_messages: 50,
            summarize_after: None,
            ack_wait_secs: 600,
            durable_inbox: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Absolute cap on cells in the realm.
    pub max_cells: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self { max_cells: 10_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Base of the reconcile retry backoff (5s · 2^attempt).
    pub retry_base_secs: u64,
    pub max_retries: u32,
    /// Swarm trigger evaluation interval.
    pub swarm_tick_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry_base_secs: 5,
            max_retries: 3,
            swarm_tick_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub api: ApiConfig,
    pub mind: MindConfig,
    pub runtime: RuntimeConfig,
    pub platform: PlatformConfig,
    pub controllers: ControllerConfig,
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `.mitos/config.yaml` (project config)
    /// 3. `.mitos/local.yaml` (local overrides, optional)
    /// 4. Environment variables (`MITOS_` prefix, `__` nesting)
    pub fn load() -> Result<Config, ConfigError> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".mitos/config.yaml"))
            .merge(Yaml::file(".mitos/local.yaml"))
            .merge(Env::prefixed("MITOS_").split("__"))
            .extract()
            .map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config, ConfigError> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(config.database.max_connections));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.runtime.max_iterations == 0 || config.runtime.max_iterations > 100 {
            return Err(ConfigError::InvalidMaxIterations(config.runtime.max_iterations));
        }

        if config.platform.max_cells == 0 {
            return Err(ConfigError::InvalidMaxCells(config.platform.max_cells));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(ConfigLoader::validate(&config).is_ok());
        assert_eq!(config.runtime.max_iterations, 20);
        assert_eq!(config.runtime.max_messages, 50);
        assert_eq!(config.runtime.ack_wait_secs, 600);
        assert_eq!(config.controllers.swarm_tick_secs, 10);
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let mut config = Config::default();
        config.runtime.max_iterations = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxIterations(0))
        ));
    }
}
