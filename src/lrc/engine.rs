//! Long-running command execution engine.
//!
//! One engine per command-hosting endpoint. Submissions are accepted
//! synchronously into a bounded FIFO and executed one at a time by a single
//! worker task:
//!
//! ```text
//! submit() --try_reserve--> mpsc (bounded) --recv--> worker --execute--> record result
//!    |                                                 |                     |
//!    +-- queued_ids / queued_names                     +-- current_status    +-- last_result
//!                                                      +-- current_progress
//! ```
//!
//! Every channel mutation happens under one state lock and is announced on
//! the engine's [`ChangeBroadcaster`] as it happens. A command moves from the
//! queue channels to the status channel in a single critical section, and its
//! result replaces its status in another, so an observer never sees a command
//! both queued and in progress, or in neither place.
//!
//! Aborting is cooperative: `abort_all` raises a flag that the executing
//! operation may poll through its [`AbortToken`], and the worker resolves every
//! command still waiting in the queue as `ABORTED` before accepting new work.

use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::channels::{
    CommandResult, EngineChannels, Progress, StatusEntry, IN_PROGRESS,
};
use super::command_id::{CommandId, CommandIdGenerator};
use super::operation::{
    AbortToken, CommandState, ExecutionContext, Operation, Outcome, ResultCode,
};
use crate::config::EngineConfig;
use crate::error::{AppResult, LrcError, SubmitError};
use crate::notify::ChangeBroadcaster;

/// A command accepted into the queue.
struct QueuedCommand {
    id: CommandId,
    operation: Box<dyn Operation>,
    arg: Option<serde_json::Value>,
}

/// State guarded by the engine lock.
struct EngineState {
    sender: mpsc::Sender<QueuedCommand>,
    /// Mirror of the pending queue, oldest first.
    pending: VecDeque<(CommandId, String)>,
}

struct EngineShared {
    name: String,
    state: Mutex<EngineState>,
    channels: EngineChannels,
    ids: CommandIdGenerator,
    aborting: Arc<AtomicBool>,
    stopping: AtomicBool,
    poll_interval: Duration,
}

/// Serializing executor for long-running commands.
///
/// Must be created from within a Tokio runtime; the worker task is spawned
/// on construction and runs until [`shutdown`](ExecutionEngine::shutdown)
/// or until the engine is dropped.
pub struct ExecutionEngine {
    shared: Arc<EngineShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    max_queue_size: usize,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("name", &self.shared.name)
            .field("max_queue_size", &self.max_queue_size)
            .field("queued", &self.queue_len())
            .finish()
    }
}

impl ExecutionEngine {
    /// Create an engine named `name` and start its worker.
    pub fn new(
        name: impl Into<String>,
        config: &EngineConfig,
        broadcaster: Arc<dyn ChangeBroadcaster>,
    ) -> Self {
        let name = name.into();
        let max_queue_size = config.max_queue_size.max(1);
        let (sender, receiver) = mpsc::channel(max_queue_size);

        let shared = Arc::new(EngineShared {
            channels: EngineChannels::new(&name, broadcaster),
            name,
            state: Mutex::new(EngineState {
                sender,
                pending: VecDeque::with_capacity(max_queue_size),
            }),
            ids: CommandIdGenerator::new(),
            aborting: Arc::new(AtomicBool::new(false)),
            stopping: AtomicBool::new(false),
            poll_interval: config.poll_interval,
        });

        let worker = tokio::spawn(Arc::clone(&shared).run(receiver));

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
            max_queue_size,
        }
    }

    /// Name of the endpoint hosting this engine.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Maximum number of pending commands.
    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Queue `operation` for execution and return its id without waiting.
    ///
    /// Fails fast with [`SubmitError`] when the engine is stopping, the queue
    /// is full, or an abort is in progress. A rejected command is never
    /// enqueued and gets no id.
    pub fn submit(
        &self,
        operation: Box<dyn Operation>,
        arg: Option<serde_json::Value>,
    ) -> Result<CommandId, SubmitError> {
        let shared = &self.shared;
        let mut state = shared.state.lock();

        if shared.stopping.load(Ordering::SeqCst) {
            return Err(SubmitError::ShuttingDown);
        }

        let permit = match state.sender.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(())) => {
                warn!(engine = %shared.name, command = operation.name(), "Command rejected: queue is full");
                return Err(SubmitError::QueueFull);
            }
            Err(mpsc::error::TrySendError::Closed(())) => return Err(SubmitError::ShuttingDown),
        };

        if shared.aborting.load(Ordering::SeqCst) {
            warn!(engine = %shared.name, command = operation.name(), "Command rejected: queue is aborting");
            return Err(SubmitError::Aborting);
        }

        let name = operation.name().to_string();
        let id = shared.ids.generate(&name);
        permit.send(QueuedCommand {
            id: id.clone(),
            operation,
            arg,
        });

        state.pending.push_back((id.clone(), name));
        shared.publish_pending(&state);

        info!(engine = %shared.name, command_id = %id, queued = state.pending.len(), "Command queued");
        Ok(id)
    }

    /// Request that every pending command be resolved as `ABORTED`.
    ///
    /// Returns immediately; the drain happens on the worker. The executing
    /// command is not interrupted but can observe the request through its
    /// [`AbortToken`]. Watch the result channel (or [`check_status`]) to learn
    /// when a particular command has been marked aborted.
    ///
    /// [`check_status`]: ExecutionEngine::check_status
    pub fn abort_all(&self) -> Outcome {
        let _state = self.shared.state.lock();
        self.shared.aborting.store(true, Ordering::SeqCst);
        info!(engine = %self.shared.name, "Abort requested");
        (
            ResultCode::Started,
            "Aborting queued commands; the drain may still be in progress".to_string(),
        )
    }

    /// `true` while an abort request is being drained.
    pub fn is_aborting(&self) -> bool {
        self.shared.aborting.load(Ordering::SeqCst)
    }

    /// Ask the worker to stop. In-flight execution is not cancelled; call
    /// [`abort_all`](ExecutionEngine::abort_all) first if queued work should
    /// not run.
    pub fn shutdown(&self) {
        let _state = self.shared.state.lock();
        if !self.shared.stopping.swap(true, Ordering::SeqCst) {
            info!(engine = %self.shared.name, "Shutdown requested");
        }
    }

    /// Wait for the worker task to exit. Call after [`shutdown`](ExecutionEngine::shutdown).
    pub async fn join(&self) -> AppResult<()> {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle.await.map_err(|e| {
                LrcError::ShutdownFailed(vec![LrcError::Transport(format!(
                    "worker of '{}' did not exit cleanly: {}",
                    self.shared.name, e
                ))])
            })?;
        }
        Ok(())
    }

    /// Classify `id` from the current channel contents.
    ///
    /// Checks the last result first, then the executing command, then the
    /// pending queue. Only the most recent result is retained, so an older
    /// completed command reports `NotFound`.
    pub fn check_status(&self, id: &CommandId) -> CommandState {
        let state = self.shared.state.lock();
        let channels = &self.shared.channels;

        if let Some(result) = channels.last_result.get() {
            if &result.id == id {
                return CommandState::from_result_code(result.code);
            }
        }

        if channels
            .current_status
            .get()
            .is_some_and(|status| &status.id == id)
        {
            return CommandState::InProgress;
        }

        if state.pending.iter().any(|(queued, _)| queued == id) {
            return CommandState::Queued;
        }

        CommandState::NotFound
    }

    /// Number of pending (not yet started) commands.
    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Ids of pending commands, oldest first.
    pub fn queued_ids(&self) -> Vec<CommandId> {
        self.shared.channels.queued_ids.get()
    }

    /// Names of pending commands, oldest first.
    pub fn queued_names(&self) -> Vec<String> {
        self.shared.channels.queued_names.get()
    }

    /// The executing command, if any.
    pub fn current_status(&self) -> Option<StatusEntry> {
        self.shared.channels.current_status.get()
    }

    /// Result of the most recently completed command.
    pub fn last_result(&self) -> Option<CommandResult> {
        self.shared.channels.last_result.get()
    }

    /// Progress of the executing command.
    pub fn current_progress(&self) -> Option<Progress> {
        self.shared.channels.current_progress.get()
    }

    /// Watch the last-result channel locally. Only the latest value is kept;
    /// use the broadcaster to observe every result.
    pub fn subscribe_last_result(&self) -> watch::Receiver<Option<CommandResult>> {
        self.shared.channels.last_result.subscribe()
    }

    /// Watch the current-status channel locally.
    pub fn subscribe_current_status(&self) -> watch::Receiver<Option<StatusEntry>> {
        self.shared.channels.current_status.subscribe()
    }

    /// Watch the progress channel locally.
    pub fn subscribe_current_progress(&self) -> watch::Receiver<Option<Progress>> {
        self.shared.channels.current_progress.subscribe()
    }

    /// Watch the queued-ids channel locally.
    pub fn subscribe_queued_ids(&self) -> watch::Receiver<Vec<CommandId>> {
        self.shared.channels.queued_ids.subscribe()
    }

    /// Read any channel by its attribute name as JSON.
    pub fn read_attribute(&self, attribute: &str) -> Option<serde_json::Value> {
        let param = self.shared.channels.registry.get(attribute)?;
        match param.get_json() {
            Ok(value) => Some(value),
            Err(e) => {
                error!(engine = %self.shared.name, attribute, error = %e, "Attribute read failed");
                None
            }
        }
    }

    /// Names of all channels exposed by this engine.
    pub fn attribute_names(&self) -> Vec<&str> {
        self.shared.channels.registry.names()
    }
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
    }
}

impl EngineShared {
    /// Worker loop. Exits when `stopping` is set or every sender is gone.
    async fn run(self: Arc<Self>, mut receiver: mpsc::Receiver<QueuedCommand>) {
        info!(engine = %self.name, "Command worker started");

        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            if self.aborting.load(Ordering::SeqCst) {
                self.drain_aborted(&mut receiver);
                continue;
            }

            match tokio::time::timeout(self.poll_interval, receiver.recv()).await {
                Ok(Some(command)) => self.process(command).await,
                Ok(None) => break,
                Err(_) => continue,
            }
        }

        // Leave no command stranded on the queue channels.
        receiver.close();
        let mut abandoned = 0usize;
        while let Ok(command) = receiver.try_recv() {
            self.record_aborted(command);
            abandoned += 1;
        }
        if abandoned > 0 {
            warn!(engine = %self.name, abandoned, "Worker stopped with commands still queued");
        }

        info!(engine = %self.name, "Command worker stopped");
    }

    /// Resolve every pending command as aborted, then clear the abort flag.
    fn drain_aborted(&self, receiver: &mut mpsc::Receiver<QueuedCommand>) {
        let mut drained = 0usize;
        while let Ok(command) = receiver.try_recv() {
            self.record_aborted(command);
            drained += 1;
        }

        // Submissions are refused while the flag is up, so the queue is
        // empty here and stays empty until the flag drops.
        let _state = self.state.lock();
        self.aborting.store(false, Ordering::SeqCst);
        info!(engine = %self.name, drained, "Abort drain complete");
    }

    fn record_aborted(&self, command: QueuedCommand) {
        let outcome = (
            ResultCode::Aborted,
            format!("{} Aborted", command.operation.name()),
        );
        self.record(&command.id, outcome, true);
    }

    async fn process(self: &Arc<Self>, command: QueuedCommand) {
        // Raced in just before an abort request: it has not started, so it
        // belongs to the backlog being aborted.
        if self.aborting.load(Ordering::SeqCst) {
            self.record_aborted(command);
            return;
        }

        let QueuedCommand { id, operation, arg } = command;
        self.begin(&id);

        let outcome = self.execute(&id, operation.as_ref(), arg).await;
        drop(operation);
        self.record(&id, outcome, false);
    }

    /// Move `id` from the queue channels to the status channel.
    fn begin(&self, id: &CommandId) {
        let mut state = self.state.lock();
        Self::remove_pending(&mut state, id);
        self.publish_pending(&state);
        self.channels.current_status.set(Some(StatusEntry {
            id: id.clone(),
            status: IN_PROGRESS.to_string(),
        }));
        debug!(engine = %self.name, command_id = %id, "Command started");
    }

    async fn execute(
        self: &Arc<Self>,
        id: &CommandId,
        operation: &dyn Operation,
        arg: Option<serde_json::Value>,
    ) -> Outcome {
        let name = operation.name().to_string();

        match std::panic::catch_unwind(AssertUnwindSafe(|| operation.is_allowed())) {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                return (ResultCode::NotAllowed, format!("Command {name} not allowed"));
            }
            Ok(Err(e)) => {
                return (
                    ResultCode::NotAllowed,
                    format!("Command {name} not allowed: {e}"),
                );
            }
            Err(panic) => {
                return (
                    ResultCode::NotAllowed,
                    format!("Command {name} not allowed: {}", panic_message(&*panic)),
                );
            }
        }

        let progress = {
            let shared = Arc::clone(self);
            let id = id.clone();
            Arc::new(move |percent: u8| shared.update_progress(&id, percent))
        };
        let ctx = ExecutionContext::new(
            id.clone(),
            AbortToken::new(Arc::clone(&self.aborting)),
            progress,
        );

        match AssertUnwindSafe(operation.execute(&ctx, arg))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(engine = %self.name, command_id = %id, error = %e, "Command failed");
                // Debug output carries the cause chain and, when captured, the backtrace.
                (ResultCode::Failed, format!("Error: {e:?}"))
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(engine = %self.name, command_id = %id, panic = %message, "Command panicked");
                (
                    ResultCode::Failed,
                    format!("Error: {message} (panicked while executing {name})"),
                )
            }
        }
    }

    fn update_progress(&self, id: &CommandId, percent: u8) {
        let _state = self.state.lock();
        let executing = self
            .channels
            .current_status
            .get()
            .is_some_and(|status| &status.id == id);
        if executing {
            self.channels.current_progress.set(Some(Progress {
                id: id.clone(),
                percent,
            }));
        } else {
            debug!(engine = %self.name, command_id = %id, "Ignoring progress from a command that is not executing");
        }
    }

    /// Publish `outcome` for `id`. `from_queue` is set for commands that
    /// never started and are still listed on the queue channels.
    fn record(&self, id: &CommandId, outcome: Outcome, from_queue: bool) {
        let (code, message) = outcome;
        let mut state = self.state.lock();

        if self.channels.current_progress.get().is_some() {
            self.channels.current_progress.set(None);
        }

        self.channels.last_result.set(Some(CommandResult {
            id: id.clone(),
            code,
            message,
        }));

        if from_queue {
            Self::remove_pending(&mut state, id);
            self.publish_pending(&state);
        }

        if self.channels.current_status.get().is_some() {
            self.channels.current_status.set(None);
        }

        info!(engine = %self.name, command_id = %id, result = %code, "Command completed");
    }

    fn remove_pending(state: &mut EngineState, id: &CommandId) {
        match state.pending.front() {
            Some((front, _)) if front == id => {
                state.pending.pop_front();
            }
            _ => {
                if let Some(position) = state.pending.iter().position(|(queued, _)| queued == id) {
                    state.pending.remove(position);
                }
            }
        }
    }

    fn publish_pending(&self, state: &EngineState) {
        let (ids, names): (Vec<_>, Vec<_>) = state.pending.iter().cloned().unzip();
        self.channels.queued_ids.set(ids);
        self.channels.queued_names.set(names);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
