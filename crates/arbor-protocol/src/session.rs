//! Session lifecycle, session state, and the journal records that rebuild it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::AuditEvent;
use crate::envelope::AgentAddress;
use crate::ids::{ExecutionId, MessageId, SessionId};
use crate::task::ExecutionStatus;

/// Execution records kept in session state; older ones are dropped first.
pub const MAX_EXECUTION_HISTORY: usize = 256;

/// Session handle lifecycle:
/// `starting → active → (idle ⇄ active) → stopping → terminated`, with
/// `error` reachable from any live state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Starting,
    Active,
    Idle,
    Stopping,
    Terminated,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }

    pub fn accepts_commands(self) -> bool {
        matches!(self, Self::Active | Self::Idle)
    }

    /// Legal transitions. A supervised restart moves a live session back to `starting`.
    pub fn can_transition_to(self, next: Self) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Starting, Active | Idle | Stopping | Error)
                | (Active, Idle | Stopping | Starting | Error)
                | (Idle, Active | Stopping | Starting | Error)
                | (Stopping, Terminated | Error)
        )
    }
}

/// Options supplied when a session is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub owner: String,
    /// Resource URIs granted to the session coordinator at start (and on every restart).
    pub grants: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            owner: "anonymous".to_owned(),
            grants: vec![
                "res://tool/execute".to_owned(),
                "res://exec/run".to_owned(),
                "res://export/write".to_owned(),
            ],
            metadata: BTreeMap::new(),
        }
    }
}

impl SessionOptions {
    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..Self::default()
        }
    }

    pub fn with_grants<I, S>(mut self, grants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grants = grants.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub command: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Authoritative in-memory state of one session. Persistence holds durable
/// copies; replaying the journal over a snapshot reproduces it exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    #[serde(default)]
    pub owner: String,
    /// Bumped on every key/value mutation; used for optimistic concurrency.
    pub version: u64,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
    #[serde(default)]
    pub executions: Vec<ExecutionRecord>,
    #[serde(default)]
    pub messages_received: u64,
    /// Journal sequence of the last applied entry.
    #[serde(default)]
    pub last_sequence: u64,
}

impl SessionState {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            owner: String::new(),
            version: 0,
            values: BTreeMap::new(),
            executions: Vec::new(),
            messages_received: 0,
            last_sequence: 0,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn execution(&self, execution_id: &ExecutionId) -> Option<&ExecutionRecord> {
        self.executions
            .iter()
            .rev()
            .find(|record| record.execution_id == *execution_id)
    }

    /// Fold one journal entry into the state.
    pub fn apply(&mut self, entry: &JournalEntry) {
        match &entry.record {
            JournalRecord::SessionOpened { owner } => {
                self.owner.clone_from(owner);
            }
            JournalRecord::StateSet { key, value } => {
                self.values.insert(key.clone(), value.clone());
                self.version += 1;
            }
            JournalRecord::StateRemoved { key } => {
                if self.values.remove(key).is_some() {
                    self.version += 1;
                }
            }
            JournalRecord::MessageReceived { .. } => {
                self.messages_received += 1;
            }
            JournalRecord::ExecutionRecorded { record } => {
                self.executions.push(record.clone());
                if self.executions.len() > MAX_EXECUTION_HISTORY {
                    let overflow = self.executions.len() - MAX_EXECUTION_HISTORY;
                    self.executions.drain(..overflow);
                }
            }
            JournalRecord::SessionClosed { .. } | JournalRecord::Audit { .. } => {}
        }
        self.last_sequence = entry.sequence;
    }
}

/// A durable record written to a session's append-only journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalRecord {
    SessionOpened {
        owner: String,
    },
    SessionClosed {
        reason: String,
    },
    StateSet {
        key: String,
        value: Value,
    },
    StateRemoved {
        key: String,
    },
    MessageReceived {
        message_id: MessageId,
        from: AgentAddress,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    ExecutionRecorded {
        record: ExecutionRecord,
    },
    /// Security audit mirror; written to the `system` stream.
    Audit {
        event: AuditEvent,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub session_id: SessionId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub record: JournalRecord,
}

impl JournalEntry {
    pub fn new(session_id: SessionId, sequence: u64, record: JournalRecord) -> Self {
        Self {
            session_id,
            sequence,
            timestamp: Utc::now(),
            record,
        }
    }
}
