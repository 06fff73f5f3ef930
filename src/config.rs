//! Configuration System using Figment
//!
//! Strongly-typed configuration for engines and aggregators. Configuration is
//! loaded from:
//! 1. built-in defaults
//! 2. a TOML file (`config/lrc.toml` by default)
//! 3. environment variables prefixed with `LRC_`, `__` separating sections
//!
//! # Environment Variable Overrides
//!
//! ```text
//! LRC_APPLICATION__LOG_LEVEL=debug
//! LRC_ENGINE__MAX_QUEUE_SIZE=8
//! LRC_ENGINE__POLL_INTERVAL=50ms
//! LRC_AGGREGATOR__GROUP_TIMEOUT=30s
//! ```
//!
//! # Example file
//!
//! ```toml
//! [application]
//! name = "dish-controller"
//! log_level = "info"
//!
//! [engine]
//! max_queue_size = 16
//! poll_interval = "100ms"
//!
//! [aggregator]
//! endpoints = ["dish-1", "dish-2"]
//! group_timeout = "2m"
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{AppResult, LrcError};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LrcConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Execution engine settings
    pub engine: EngineConfig,
    /// Completion aggregator settings
    pub aggregator: AggregatorConfig,
    /// Attribute notification settings
    pub notifications: NotificationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines instead of human-readable text
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "rust-daq-lrc".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Execution engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of pending (not yet started) commands
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// How long the worker waits for work before re-checking its flags
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            poll_interval: default_poll_interval(),
        }
    }
}

/// Completion aggregator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Addresses of the endpoints every dispatch fans out to
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Resolve a group as timed out if it has not completed within this time.
    /// Unset means a group waits indefinitely.
    #[serde(default, with = "humantime_serde")]
    pub group_timeout: Option<Duration>,
}

/// Attribute notification configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Undelivered events per subscriber at which a warning is logged.
    /// Events are never dropped.
    #[serde(default = "default_backlog_warning")]
    pub backlog_warning: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            backlog_warning: default_backlog_warning(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_max_queue_size() -> usize {
    64
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_backlog_warning() -> usize {
    1024
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl LrcConfig {
    /// Load configuration from `config/lrc.toml` and environment variables.
    ///
    /// Precedence (highest first): `LRC_` environment variables, the file,
    /// built-in defaults. A missing file is not an error.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/lrc.toml")
    }

    /// Load configuration from a specific file path, then validate it.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(LrcConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LRC_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML, in the format [`load_from`] reads.
    ///
    /// [`load_from`]: LrcConfig::load_from
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| LrcError::Configuration(format!("cannot render configuration: {e}")))
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Queue size, poll interval and backlog warning are non-zero
    /// - Endpoint addresses are unique
    /// - A group timeout, if set, is non-zero
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(LrcError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.engine.max_queue_size == 0 {
            return Err(LrcError::Configuration(
                "engine.max_queue_size must be at least 1".to_string(),
            ));
        }

        if self.engine.poll_interval.is_zero() {
            return Err(LrcError::Configuration(
                "engine.poll_interval must be non-zero".to_string(),
            ));
        }

        if self.notifications.backlog_warning == 0 {
            return Err(LrcError::Configuration(
                "notifications.backlog_warning must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for endpoint in &self.aggregator.endpoints {
            if !seen.insert(endpoint) {
                return Err(LrcError::Configuration(format!(
                    "Duplicate endpoint address: '{}'",
                    endpoint
                )));
            }
        }

        if self.aggregator.group_timeout.is_some_and(|t| t.is_zero()) {
            return Err(LrcError::Configuration(
                "aggregator.group_timeout must be non-zero when set".to_string(),
            ));
        }

        Ok(())
    }
}
