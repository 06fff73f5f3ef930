//! Long-running command support for rust-daq instruments.
//!
//! Instrument operations such as homing a stage or running a scan outlast a
//! normal request/response timeout. This library provides:
//!
//! - [`lrc::ExecutionEngine`]: hosted by an instrument endpoint, queues
//!   commands, executes them one at a time and publishes their progress and
//!   results on observable channels;
//! - [`aggregator::CompletionAggregator`]: used by a caller, dispatches one
//!   command to several endpoints and fires a callback once all of them have
//!   finished.
//!
//! The two halves talk through the [`transport`] and [`notify`] traits;
//! in-process implementations of both are included.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod host;
pub mod lrc;
pub mod notify;
pub mod observable;
pub mod tracing_setup;
pub mod transport;

pub use aggregator::{CompletionAggregator, GroupCompletion, GroupId, GroupStatus};
pub use config::LrcConfig;
pub use error::{AppResult, LrcError, SubmitError};
pub use host::{CommandHost, SubmitResponse};
pub use lrc::{CommandId, CommandState, ExecutionEngine, FnOperation, Operation, ResultCode};
pub use notify::{AttributeBus, AttributeEvent, ChangeBroadcaster};
pub use transport::{Endpoint, EndpointProvider, LocalEndpoint, LocalRegistry, NotificationSink};
