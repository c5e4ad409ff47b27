//! # arbor-runtime: sessions, workers, and their supervision
//!
//! ## Module Overview
//!
//! - [`manager`]: `SessionManager`: starts, looks up, and stops sessions, and
//!   restarts crashed ones within a restart budget
//! - [`session`]: the per-session coordinator actor and its `SessionHandle`
//! - [`worker`]: ephemeral `WorkerAgent`s and per-execution supervision
//! - [`pool`]: `AgentPool`: bounded worker slots with a FIFO wait queue
//! - [`registry`]: live agent records; terminating an agent revokes its capabilities
//! - [`tasks`]: task handlers and the static sync/async command table
//! - [`sandbox`]: capability-checked host program execution inside session workspaces
//! - [`error`]: `SessionError`, `ExecutionError`, `PoolError`

pub mod error;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod sandbox;
pub mod session;
pub mod tasks;
pub mod worker;

pub use error::{ExecutionError, PoolError, SessionError};
pub use manager::{SessionManager, SupervisionConfig};
pub use pool::{AgentPool, PoolConfig, PoolLease, PoolTicket, QueuedRequest};
pub use registry::AgentRegistry;
pub use sandbox::{LocalSandboxRunner, SandboxExecution, SandboxLimits, SandboxRequest, SandboxRunner};
pub use session::{SessionConfig, SessionHandle, SessionReply, WorkerTicket};
pub use tasks::{
    READ_ONLY_COMMANDS, SYNC_COMMANDS, TaskContext, TaskHandler, TaskRegistry, is_read_only,
};
pub use worker::{ProgressReporter, WorkerAgent, WorkerConfig};

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use arbor_events::EventBus;
use arbor_persistence::Persistence;
use arbor_security::SecurityKernel;

/// Shared services every session and worker runs against.
pub struct RuntimeServices {
    pub security: Arc<SecurityKernel>,
    pub bus: Arc<EventBus>,
    pub persistence: Arc<dyn Persistence>,
    pub pool: AgentPool,
    pub registry: Arc<AgentRegistry>,
    pub tasks: Arc<TaskRegistry>,
    pub sandbox: Arc<dyn SandboxRunner>,
    /// Root for files tasks write (exports).
    pub workspace_root: PathBuf,
    pub worker: WorkerConfig,
    pub session: SessionConfig,
    pub supervision: SupervisionConfig,
}

impl std::fmt::Debug for RuntimeServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeServices")
            .field("pool", &self.pool.config())
            .field("tasks", &self.tasks)
            .field("workspace_root", &self.workspace_root)
            .field("worker", &self.worker)
            .field("session", &self.session)
            .field("supervision", &self.supervision)
            .finish_non_exhaustive()
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with a non-string payload".to_owned()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(
            panic_message(Box::new(7_u8)),
            "panic with a non-string payload"
        );
    }
}
