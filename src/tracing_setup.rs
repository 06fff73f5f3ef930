//! Tracing initialization.
//!
//! Installs a global `tracing-subscriber` formatter. The level comes from
//! `application.log_level`; `RUST_LOG` takes precedence when set, e.g.
//!
//! ```bash
//! RUST_LOG=rust_daq_lrc::aggregator=debug
//! ```

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LrcConfig;
use crate::error::{AppResult, LrcError};

/// Initialize tracing from configuration.
///
/// Returns an error if a global subscriber is already installed.
pub fn init_from_config(config: &LrcConfig) -> AppResult<()> {
    init(&config.application.log_level, config.application.json_logs)
}

/// Initialize tracing at `level`, optionally as JSON lines.
pub fn init(level: &str, json: bool) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| LrcError::Logging(format!("invalid log filter '{level}': {e}")))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    result.map_err(|e| LrcError::Logging(e.to_string()))
}
