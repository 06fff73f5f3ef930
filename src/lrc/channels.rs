//! The five observable channels of an execution engine.
//!
//! | Channel                          | Value                            |
//! |----------------------------------|----------------------------------|
//! | `longRunningCommandIDsInQueue`   | ids of pending commands          |
//! | `longRunningCommandsInQueue`     | names of pending commands        |
//! | `longRunningCommandStatus`       | `(id, "IN_PROGRESS")` or null    |
//! | `longRunningCommandResult`       | `(id, code, message)` or null    |
//! | `longRunningCommandProgress`     | `(id, percent)` or null          |
//!
//! All channels are read-only for callers; only the engine writes them, and
//! only while holding its state lock.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::command_id::CommandId;
use super::operation::ResultCode;
use crate::notify::ChangeBroadcaster;
use crate::observable::{Observable, ParameterSet};

/// Channel carrying the ids of pending commands.
pub const QUEUED_IDS: &str = "longRunningCommandIDsInQueue";
/// Channel carrying the names of pending commands.
pub const QUEUED_NAMES: &str = "longRunningCommandsInQueue";
/// Channel carrying the currently executing command.
pub const CURRENT_STATUS: &str = "longRunningCommandStatus";
/// Channel carrying the last completed command's result.
pub const LAST_RESULT: &str = "longRunningCommandResult";
/// Channel carrying the executing command's progress.
pub const CURRENT_PROGRESS: &str = "longRunningCommandProgress";

/// Status text published while a command executes.
pub const IN_PROGRESS: &str = "IN_PROGRESS";

/// Value of the current-status channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    /// Executing command.
    pub id: CommandId,
    /// Always [`IN_PROGRESS`].
    pub status: String,
}

/// Value of the last-result channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Completed command.
    pub id: CommandId,
    /// Outcome code.
    pub code: ResultCode,
    /// Outcome message.
    pub message: String,
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:?})", self.code, self.message)
    }
}

/// Value of the progress channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Executing command.
    pub id: CommandId,
    /// 0..=100
    pub percent: u8,
}

/// The engine's observable state.
#[derive(Debug)]
pub(crate) struct EngineChannels {
    pub(crate) queued_ids: Observable<Vec<CommandId>>,
    pub(crate) queued_names: Observable<Vec<String>>,
    pub(crate) current_status: Observable<Option<StatusEntry>>,
    pub(crate) last_result: Observable<Option<CommandResult>>,
    pub(crate) current_progress: Observable<Option<Progress>>,
    pub(crate) registry: ParameterSet,
}

impl EngineChannels {
    /// Create the channels for engine `source`, announcing on `broadcaster`.
    pub(crate) fn new(source: &str, broadcaster: Arc<dyn ChangeBroadcaster>) -> Self {
        let queued_ids = Observable::new(QUEUED_IDS, Vec::new())
            .with_description("Ids of commands waiting to execute, oldest first")
            .with_broadcaster(source, broadcaster.clone());
        let queued_names = Observable::new(QUEUED_NAMES, Vec::new())
            .with_description("Names of commands waiting to execute, oldest first")
            .with_broadcaster(source, broadcaster.clone());
        let current_status = Observable::new(CURRENT_STATUS, None)
            .with_description("Command currently executing")
            .with_broadcaster(source, broadcaster.clone());
        let last_result = Observable::new(LAST_RESULT, None)
            .with_description("Result of the most recently completed command")
            .with_broadcaster(source, broadcaster.clone());
        let current_progress = Observable::new(CURRENT_PROGRESS, None)
            .with_description("Progress of the executing command")
            .with_units("%")
            .with_broadcaster(source, broadcaster);

        let mut registry = ParameterSet::new();
        registry.register(queued_ids.clone());
        registry.register(queued_names.clone());
        registry.register(current_status.clone());
        registry.register(last_result.clone());
        registry.register(current_progress.clone());

        Self {
            queued_ids,
            queued_names,
            current_status,
            last_result,
            current_progress,
            registry,
        }
    }
}
