//! Custom error types for the crate.
//!
//! This module defines the primary error type, `LrcError`, shared by the
//! execution engine, the completion aggregator and the transports between
//! them. Using the `thiserror` crate, it provides a centralized and consistent
//! way to handle the different kinds of errors that can occur.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type
//!   mismatches in the configuration sources.
//! - **`Configuration`**: Semantic errors in a configuration that parsed
//!   correctly (e.g. a zero queue size). Caught during validation.
//! - **[`SubmitError`]**: A command was rejected at submission time. It is
//!   returned by the engine directly and never appears on any channel.
//! - **`Transport`** / **`EndpointNotFound`**: Failures of the remote
//!   invocation transport between an aggregator and its endpoints.
//! - **`CommandNotFound`**: An endpoint was asked to run a command it does not
//!   host.
//!
//! Errors raised *inside* an operation body are not represented here. They
//! are contained by the engine and reported asynchronously as a `FAILED`
//! result on the result channel.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, LrcError>;

/// Reasons a submission is refused before anything is enqueued.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The bounded queue already holds `max_queue_size` pending commands.
    #[error("queue is full")]
    QueueFull,

    /// An abort is draining the queue; new work is refused until it finishes.
    #[error("queue is aborting")]
    Aborting,

    /// The engine has been asked to stop.
    #[error("engine is shutting down")]
    ShuttingDown,
}

/// Errors raised by engines, hosts, transports and aggregators.
#[derive(Error, Debug)]
pub enum LrcError {
    /// A configuration source could not be read or did not match the schema.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// The configuration parsed but is not usable.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The remote invocation transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No endpoint is reachable under this address.
    #[error("Endpoint '{0}' not found")]
    EndpointNotFound(String),

    /// The endpoint does not host the requested command.
    #[error("Command '{command}' is not hosted by endpoint '{endpoint}'")]
    CommandNotFound {
        /// Endpoint that was asked.
        endpoint: String,
        /// Command it was asked to run.
        command: String,
    },

    /// The global tracing subscriber could not be installed.
    #[error("Logging setup error: {0}")]
    Logging(String),

    /// One or more components did not shut down cleanly.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<LrcError>),
}
