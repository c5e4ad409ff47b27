use std::time::Duration;

use arbor_persistence::PersistenceError;
use arbor_protocol::{ErrorKind, ExecutionId, ProtocolError, SessionId, SessionStatus};
use arbor_security::SecurityError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("worker pool is exhausted: {queued} requests already waiting")]
    PoolExhausted { queued: usize },
    #[error("no worker slot became free within {waited:?}")]
    QueueTimeout { waited: Duration },
    #[error("worker pool is shut down")]
    Closed,
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Resource
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error(transparent)]
    Denied(#[from] SecurityError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("{0}")]
    Failed(String),
    #[error("task did not finish within {0:?}")]
    Timeout(Duration),
    #[error("execution was cancelled")]
    Cancelled,
    #[error("worker crashed: {0}")]
    Crashed(String),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownCommand(_) | Self::InvalidArgs(_) => ErrorKind::Validation,
            Self::Denied(error) => error.kind(),
            Self::Pool(error) => error.kind(),
            Self::Failed(_) | Self::Timeout(_) | Self::Cancelled => ErrorKind::Execution,
            Self::Crashed(_) => ErrorKind::SystemFault,
        }
    }

    /// Whether the owning session may retry the task automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Timeout(_) | Self::Crashed(_))
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session {0} already exists")]
    AlreadyExists(SessionId),
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("session {session_id} is {status:?} and not accepting commands")]
    NotAccepting {
        session_id: SessionId,
        status: SessionStatus,
    },
    #[error("session {0} has stopped")]
    Stopped(SessionId),
    #[error(transparent)]
    Invalid(#[from] ProtocolError),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("invalid arguments for `{command}`: {reason}")]
    InvalidArgs { command: String, reason: String },
    #[error("version conflict: expected {expected}, current {actual}")]
    Conflict { expected: u64, actual: u64 },
    #[error("execution {0} not found")]
    UnknownExecution(ExecutionId),
    #[error("capability denied: {0}")]
    CapabilityDenied(#[from] SecurityError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("session {session_id} failed: {reason}")]
    Failed {
        session_id: SessionId,
        reason: String,
    },
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyExists(_)
            | Self::NotFound(_)
            | Self::Invalid(_)
            | Self::UnknownCommand(_)
            | Self::InvalidArgs { .. }
            | Self::Conflict { .. }
            | Self::UnknownExecution(_) => ErrorKind::Validation,
            Self::NotAccepting { .. } | Self::Stopped(_) => ErrorKind::Resource,
            Self::CapabilityDenied(_) => ErrorKind::Authorization,
            Self::Pool(error) => error.kind(),
            Self::Persistence(error) => error.kind(),
            Self::Failed { .. } => ErrorKind::SystemFault,
        }
    }

    pub(crate) fn invalid_args(command: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArgs {
            command: command.to_owned(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_excludes_cancellation_and_queue_timeouts() {
        assert!(ExecutionError::failed("boom").is_retryable());
        assert!(ExecutionError::Crashed("panic".into()).is_retryable());
        assert!(!ExecutionError::Cancelled.is_retryable());
        assert!(
            !ExecutionError::Pool(PoolError::QueueTimeout {
                waited: Duration::from_millis(5)
            })
            .is_retryable()
        );
        assert!(!ExecutionError::InvalidArgs("numbers".into()).is_retryable());
    }

    #[test]
    fn session_errors_map_to_taxonomy() {
        let id = SessionId::from_string("S1");
        assert_eq!(
            SessionError::AlreadyExists(id.clone()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            SessionError::Pool(PoolError::PoolExhausted { queued: 3 }).kind(),
            ErrorKind::Resource
        );
        assert_eq!(
            SessionError::CapabilityDenied(SecurityError::Revoked("c".into())).kind(),
            ErrorKind::Authorization
        );
        assert_eq!(
            SessionError::Failed {
                session_id: id,
                reason: "restart budget exhausted".into()
            }
            .kind(),
            ErrorKind::SystemFault
        );
    }
}
