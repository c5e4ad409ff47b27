//! Event taxonomy broadcast on the Arbor event bus.
//!
//! Forward-compatible: unknown `"type"` tags deserialize into
//! `Custom { event_type, data }` instead of failing, so older subscribers
//! keep working when new variants appear.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::AuditEvent;
use crate::envelope::AgentAddress;
use crate::error::ErrorKind;
use crate::ids::{AgentId, EventId, ExecutionId, SessionId};
use crate::session::SessionStatus;

/// One published event. `sequence` is assigned by the bus per topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: EventId,
    pub topic: String,
    pub source: AgentAddress,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl EventRecord {
    pub fn execution_id(&self) -> Option<&ExecutionId> {
        self.kind.execution_id()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[non_exhaustive]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ── Session lifecycle ──
    SessionStatusChanged {
        session_id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    },
    SessionRestarted {
        session_id: SessionId,
        attempt: u32,
        reason: String,
    },
    SessionFailed {
        session_id: SessionId,
        reason: String,
    },
    StateUpdated {
        session_id: SessionId,
        key: String,
        version: u64,
    },

    // ── Worker / execution lifecycle ──
    WorkerQueued {
        execution_id: ExecutionId,
        command: String,
        position: usize,
    },
    WorkerSpawned {
        execution_id: ExecutionId,
        worker_id: AgentId,
        command: String,
        attempt: u32,
    },
    ExecutionProgress {
        execution_id: ExecutionId,
        percent: u8,
        message: String,
    },
    ExecutionCompleted {
        execution_id: ExecutionId,
        output: Value,
    },
    ExecutionFailed {
        execution_id: ExecutionId,
        error_kind: ErrorKind,
        error: String,
        will_retry: bool,
    },

    // ── Messaging ──
    MessageDelivered {
        message_id: crate::ids::MessageId,
        from: AgentAddress,
        to: AgentAddress,
    },

    // ── Security ──
    SecurityAudit {
        event: AuditEvent,
    },

    Custom {
        event_type: String,
        data: Value,
    },
}

impl EventKind {
    pub fn execution_id(&self) -> Option<&ExecutionId> {
        match self {
            Self::WorkerQueued { execution_id, .. }
            | Self::WorkerSpawned { execution_id, .. }
            | Self::ExecutionProgress { execution_id, .. }
            | Self::ExecutionCompleted { execution_id, .. }
            | Self::ExecutionFailed { execution_id, .. } => Some(execution_id),
            _ => None,
        }
    }

    /// Whether this event closes out an execution.
    pub fn is_terminal_for_execution(&self) -> bool {
        matches!(
            self,
            Self::ExecutionCompleted { .. }
                | Self::ExecutionFailed {
                    will_retry: false,
                    ..
                }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStatusChanged { .. } => "session_status_changed",
            Self::SessionRestarted { .. } => "session_restarted",
            Self::SessionFailed { .. } => "session_failed",
            Self::StateUpdated { .. } => "state_updated",
            Self::WorkerQueued { .. } => "worker_queued",
            Self::WorkerSpawned { .. } => "worker_spawned",
            Self::ExecutionProgress { .. } => "execution_progress",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::MessageDelivered { .. } => "message_delivered",
            Self::SecurityAudit { .. } => "security_audit",
            Self::Custom { .. } => "custom",
        }
    }
}

/// Mirror of [`EventKind`] with derived deserialization, used as the first
/// attempt by the forward-compatible deserializer.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EventKindKnown {
    SessionStatusChanged {
        session_id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    },
    SessionRestarted {
        session_id: SessionId,
        attempt: u32,
        reason: String,
    },
    SessionFailed {
        session_id: SessionId,
        reason: String,
    },
    StateUpdated {
        session_id: SessionId,
        key: String,
        version: u64,
    },
    WorkerQueued {
        execution_id: ExecutionId,
        command: String,
        position: usize,
    },
    WorkerSpawned {
        execution_id: ExecutionId,
        worker_id: AgentId,
        command: String,
        attempt: u32,
    },
    ExecutionProgress {
        execution_id: ExecutionId,
        percent: u8,
        message: String,
    },
    ExecutionCompleted {
        execution_id: ExecutionId,
        output: Value,
    },
    ExecutionFailed {
        execution_id: ExecutionId,
        error_kind: ErrorKind,
        error: String,
        will_retry: bool,
    },
    MessageDelivered {
        message_id: crate::ids::MessageId,
        from: AgentAddress,
        to: AgentAddress,
    },
    SecurityAudit {
        event: AuditEvent,
    },
    Custom {
        event_type: String,
        data: Value,
    },
}

impl From<EventKindKnown> for EventKind {
    fn from(known: EventKindKnown) -> Self {
        match known {
            EventKindKnown::SessionStatusChanged {
                session_id,
                from,
                to,
            } => Self::SessionStatusChanged {
                session_id,
                from,
                to,
            },
            EventKindKnown::SessionRestarted {
                session_id,
                attempt,
                reason,
            } => Self::SessionRestarted {
                session_id,
                attempt,
                reason,
            },
            EventKindKnown::SessionFailed { session_id, reason } => {
                Self::SessionFailed { session_id, reason }
            }
            EventKindKnown::StateUpdated {
                session_id,
                key,
                version,
            } => Self::StateUpdated {
                session_id,
                key,
                version,
            },
            EventKindKnown::WorkerQueued {
                execution_id,
                command,
                position,
            } => Self::WorkerQueued {
                execution_id,
                command,
                position,
            },
            EventKindKnown::WorkerSpawned {
                execution_id,
                worker_id,
                command,
                attempt,
            } => Self::WorkerSpawned {
                execution_id,
                worker_id,
                command,
                attempt,
            },
            EventKindKnown::ExecutionProgress {
                execution_id,
                percent,
                message,
            } => Self::ExecutionProgress {
                execution_id,
                percent,
                message,
            },
            EventKindKnown::ExecutionCompleted {
                execution_id,
                output,
            } => Self::ExecutionCompleted {
                execution_id,
                output,
            },
            EventKindKnown::ExecutionFailed {
                execution_id,
                error_kind,
                error,
                will_retry,
            } => Self::ExecutionFailed {
                execution_id,
                error_kind,
                error,
                will_retry,
            },
            EventKindKnown::MessageDelivered {
                message_id,
                from,
                to,
            } => Self::MessageDelivered {
                message_id,
                from,
                to,
            },
            EventKindKnown::SecurityAudit { event } => Self::SecurityAudit { event },
            EventKindKnown::Custom { event_type, data } => Self::Custom { event_type, data },
        }
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        match serde_json::from_value::<EventKindKnown>(raw.clone()) {
            Ok(known) => Ok(known.into()),
            Err(_) => {
                let event_type = raw
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_owned();
                let mut data = raw;
                if let Some(object) = data.as_object_mut() {
                    object.remove("type");
                }
                Ok(Self::Custom { event_type, data })
            }
        }
    }
}
