//! Task specifications handed to workers and the handles used to track them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ExecutionId, SessionId};
use crate::session::SessionState;

/// How the gateway routes a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandMode {
    /// Answered by the session itself, no worker.
    Sync,
    /// Executed by a spawned worker; the caller gets an execution id.
    Async,
}

/// Everything a worker needs. `context` is a copy of the session state taken
/// at spawn time, never a live reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub command: String,
    #[serde(default)]
    pub args: Value,
    pub context: SessionState,
    pub session_id: SessionId,
    pub execution_id: ExecutionId,
}

impl TaskSpec {
    pub fn new(command: impl Into<String>, args: Value, context: SessionState) -> Self {
        Self {
            command: command.into(),
            args,
            session_id: context.session_id.clone(),
            context,
            execution_id: ExecutionId::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
}

/// A progress report; `percent` never decreases within one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub execution_id: ExecutionId,
    pub percent: u8,
    pub message: String,
}
