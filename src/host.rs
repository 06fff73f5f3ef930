//! Command-hosting endpoint.
//!
//! A [`CommandHost`] pairs an [`ExecutionEngine`] with a table of the commands
//! it serves. Each command is registered as a factory so that every
//! invocation gets a fresh [`Operation`].

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::{AppResult, LrcError};
use crate::lrc::{CommandId, ExecutionEngine, Operation, ResultCode};
use crate::notify::AttributeBus;

/// Builds a fresh operation for one invocation.
pub type OperationFactory = Arc<dyn Fn() -> Box<dyn Operation> + Send + Sync>;

/// Immediate answer to a command invocation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubmitResponse {
    /// `QUEUED` on acceptance, `REJECTED` otherwise.
    pub code: ResultCode,
    /// Human-readable detail.
    pub message: String,
    /// Assigned id; present only when queued.
    pub command_id: Option<CommandId>,
}

impl SubmitResponse {
    /// Accepted into the queue as `id`.
    pub fn queued(id: CommandId) -> Self {
        Self {
            code: ResultCode::Queued,
            message: format!("Queued as {id}"),
            command_id: Some(id),
        }
    }

    /// Refused at submission time.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            code: ResultCode::Rejected,
            message: message.into(),
            command_id: None,
        }
    }
}

/// An endpoint hosting long-running commands on its own engine.
pub struct CommandHost {
    name: String,
    engine: ExecutionEngine,
    bus: Arc<AttributeBus>,
    commands: RwLock<HashMap<String, OperationFactory>>,
}

impl std::fmt::Debug for CommandHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHost")
            .field("name", &self.name)
            .field("commands", &self.command_names())
            .field("engine", &self.engine)
            .finish()
    }
}

impl CommandHost {
    /// Create a host named `name` whose engine announces on `bus`.
    pub fn new(name: impl Into<String>, config: &EngineConfig, bus: Arc<AttributeBus>) -> Self {
        let name = name.into();
        let engine = ExecutionEngine::new(name.clone(), config, bus.clone());
        Self {
            name,
            engine,
            bus,
            commands: RwLock::new(HashMap::new()),
        }
    }

    /// Endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The engine executing this host's commands.
    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// The bus the engine's channels are announced on.
    pub fn bus(&self) -> &Arc<AttributeBus> {
        &self.bus
    }

    /// Serve `command` by running a fresh operation from `factory` per call.
    pub fn register_command<F>(&self, command: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Operation> + Send + Sync + 'static,
    {
        let command = command.into();
        info!(endpoint = %self.name, %command, "Command registered");
        self.commands.write().insert(command, Arc::new(factory));
    }

    /// Sorted names of the hosted commands.
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Invoke `command`. Queue rejections are reported in the response, not
    /// as errors; an unknown command is an error.
    pub fn invoke(
        &self,
        command: &str,
        arg: Option<serde_json::Value>,
    ) -> AppResult<SubmitResponse> {
        let factory = self
            .commands
            .read()
            .get(command)
            .cloned()
            .ok_or_else(|| LrcError::CommandNotFound {
                endpoint: self.name.clone(),
                command: command.to_string(),
            })?;

        Ok(match self.engine.submit(factory(), arg) {
            Ok(id) => SubmitResponse::queued(id),
            Err(e) => SubmitResponse::rejected(e.to_string()),
        })
    }

    /// Abort everything queued, then stop the engine and wait for its worker.
    pub async fn teardown(&self) -> AppResult<()> {
        self.engine.abort_all();
        self.engine.shutdown();
        self.engine.join().await?;
        info!(endpoint = %self.name, "Endpoint torn down");
        Ok(())
    }
}
