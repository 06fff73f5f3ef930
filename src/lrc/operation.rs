//! The unit of work executed by an [`ExecutionEngine`](super::ExecutionEngine).
//!
//! An [`Operation`] is constructed fresh for every submission and dropped once
//! its result has been recorded. While executing it receives an
//! [`ExecutionContext`] through which it can poll for a pending abort and
//! report progress.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::command_id::CommandId;

/// Outcome codes of a long-running command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    /// Completed successfully.
    Ok,
    /// Accepted and running asynchronously, e.g. an abort request.
    Started,
    /// Accepted into the queue.
    Queued,
    /// Execution returned an error or panicked.
    Failed,
    /// The outcome could not be determined.
    Unknown,
    /// Refused at submission time; never recorded on a channel.
    Rejected,
    /// The permission gate refused execution.
    NotAllowed,
    /// Resolved by an abort request.
    Aborted,
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResultCode::Ok => "OK",
            ResultCode::Started => "STARTED",
            ResultCode::Queued => "QUEUED",
            ResultCode::Failed => "FAILED",
            ResultCode::Unknown => "UNKNOWN",
            ResultCode::Rejected => "REJECTED",
            ResultCode::NotAllowed => "NOT_ALLOWED",
            ResultCode::Aborted => "ABORTED",
        };
        f.write_str(text)
    }
}

/// Where a command currently is, as reported by `check_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandState {
    /// Waiting in the queue.
    Queued,
    /// Executing now.
    InProgress,
    /// Resolved by an abort request.
    Aborted,
    /// Not queued, not executing, and not the most recent result.
    NotFound,
    /// Completed successfully.
    Ok,
    /// Finished without a usable outcome.
    Failed,
    /// Refused by the permission gate.
    NotAllowed,
}

impl CommandState {
    /// State of a command whose result was recorded with `code`.
    ///
    /// A recorded command has finished, so codes that are not outcomes
    /// (`STARTED`, `QUEUED`, `UNKNOWN`, `REJECTED`) map to `Failed`.
    pub fn from_result_code(code: ResultCode) -> Self {
        match code {
            ResultCode::Aborted => CommandState::Aborted,
            ResultCode::Ok => CommandState::Ok,
            ResultCode::NotAllowed => CommandState::NotAllowed,
            ResultCode::Failed
            | ResultCode::Started
            | ResultCode::Queued
            | ResultCode::Unknown
            | ResultCode::Rejected => CommandState::Failed,
        }
    }
}

/// `(code, message)` pair produced by an operation.
pub type Outcome = (ResultCode, String);

/// Read-only view of the owning engine's abort flag.
#[derive(Debug, Clone, Default)]
pub struct AbortToken {
    flag: Arc<AtomicBool>,
}

impl AbortToken {
    pub(crate) fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    /// `true` once `abort_all` has been requested and until the drain completes.
    pub fn is_aborting(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// Handed to [`Operation::execute`] for the duration of one execution.
#[derive(Clone)]
pub struct ExecutionContext {
    command_id: CommandId,
    abort: AbortToken,
    progress: ProgressFn,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("command_id", &self.command_id)
            .field("aborting", &self.abort.is_aborting())
            .finish()
    }
}

impl ExecutionContext {
    pub(crate) fn new(command_id: CommandId, abort: AbortToken, progress: ProgressFn) -> Self {
        Self {
            command_id,
            abort,
            progress,
        }
    }

    /// A context that is never aborted and discards progress.
    pub fn detached(command_id: CommandId) -> Self {
        Self::new(command_id, AbortToken::default(), Arc::new(|_| {}))
    }

    /// Id of the command being executed.
    pub fn command_id(&self) -> &CommandId {
        &self.command_id
    }

    /// The abort token of the owning engine.
    pub fn abort_token(&self) -> &AbortToken {
        &self.abort
    }

    /// Shorthand for `abort_token().is_aborting()`.
    pub fn is_aborting(&self) -> bool {
        self.abort.is_aborting()
    }

    /// Publish progress (clamped to 100) on the engine's progress channel.
    pub fn report_progress(&self, percent: u8) {
        (self.progress)(percent.min(100));
    }
}

/// A named, possibly long-running unit of work.
///
/// Errors returned from [`execute`](Operation::execute), and panics inside it,
/// never reach the submitter; the engine records them as a `FAILED` result.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Logical command name.
    fn name(&self) -> &str;

    /// Permission gate. `Ok(false)` and `Err(_)` both yield `NOT_ALLOWED`.
    fn is_allowed(&self) -> Result<bool> {
        Ok(true)
    }

    /// Run the command. Long-running bodies should poll
    /// [`ExecutionContext::is_aborting`] and return `ABORTED` when it is set.
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        arg: Option<serde_json::Value>,
    ) -> Result<Outcome>;
}

type ExecuteFn =
    Arc<dyn Fn(ExecutionContext, Option<serde_json::Value>) -> BoxFuture<'static, Result<Outcome>> + Send + Sync>;
type AllowedFn = Arc<dyn Fn() -> Result<bool> + Send + Sync>;

/// An [`Operation`] assembled from closures.
///
/// ```rust,ignore
/// let home = FnOperation::new("Home", |ctx, _arg| async move {
///     for step in 0..=10u8 {
///         if ctx.is_aborting() {
///             return Ok((ResultCode::Aborted, "Home aborted".into()));
///         }
///         ctx.report_progress(step * 10);
///         tokio::time::sleep(Duration::from_millis(50)).await;
///     }
///     Ok((ResultCode::Ok, "Homed".into()))
/// });
/// ```
#[derive(Clone)]
pub struct FnOperation {
    name: String,
    execute: ExecuteFn,
    allowed: Option<AllowedFn>,
}

impl fmt::Debug for FnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation")
            .field("name", &self.name)
            .field("gated", &self.allowed.is_some())
            .finish()
    }
}

impl FnOperation {
    /// Wrap an async closure as an operation named `name`.
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn(ExecutionContext, Option<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Arc::new(move |ctx, arg| Box::pin(execute(ctx, arg))),
            allowed: None,
        }
    }

    /// Attach a permission gate.
    pub fn with_permission<F>(mut self, allowed: F) -> Self
    where
        F: Fn() -> Result<bool> + Send + Sync + 'static,
    {
        self.allowed = Some(Arc::new(allowed));
        self
    }
}

#[async_trait]
impl Operation for FnOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_allowed(&self) -> Result<bool> {
        match &self.allowed {
            Some(allowed) => allowed(),
            None => Ok(true),
        }
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        arg: Option<serde_json::Value>,
    ) -> Result<Outcome> {
        (self.execute)(ctx.clone(), arg).await
    }
}
