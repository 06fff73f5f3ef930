//! Long-running commands.
//!
//! - [`command_id`]: opaque, sortable command identifiers
//! - [`operation`]: the unit of work and its execution context
//! - [`channels`]: the observable state of an engine
//! - [`engine`]: bounded queue + single worker executing operations

pub mod channels;
pub mod command_id;
pub mod engine;
pub mod operation;

pub use channels::{CommandResult, Progress, StatusEntry};
pub use command_id::{CommandId, CommandIdGenerator};
pub use engine::ExecutionEngine;
pub use operation::{
    AbortToken, CommandState, ExecutionContext, FnOperation, Operation, Outcome, ResultCode,
};
