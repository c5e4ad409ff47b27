//! Error taxonomy shared by every Arbor crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse classification every boundary error maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input at a boundary.
    Validation,
    /// Capability denied, expired or out of scope.
    Authorization,
    /// Pool exhaustion or queue timeout; the caller may retry.
    Resource,
    /// A worker task failed.
    Execution,
    /// Internal invariant violation.
    SystemFault,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::Authorization => "authorization_error",
            Self::Resource => "resource_error",
            Self::Execution => "execution_error",
            Self::SystemFault => "system_fault",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Resource)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while parsing protocol values received from outside.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid resource uri `{uri}`: {reason}")]
    InvalidResourceUri { uri: String, reason: String },
    #[error("invalid agent address `{0}`")]
    InvalidAddress(String),
    #[error("invalid identifier `{0}`")]
    InvalidId(String),
    #[error("invalid command payload: {0}")]
    InvalidCommand(String),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}
