//! Agent records tracked by the runtime registry.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, CapabilityId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Long-lived coordinator owning a session's state.
    Session,
    /// Short-lived agent executing one task.
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Active,
    Inactive,
    Terminated,
    Error,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<AgentId>,
    pub session_id: SessionId,
    pub state: AgentState,
    #[serde(default)]
    pub capabilities: Vec<CapabilityId>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AgentRecord {
    pub fn session(id: AgentId, session_id: SessionId) -> Self {
        Self {
            id,
            agent_type: AgentType::Session,
            parent_id: None,
            session_id,
            state: AgentState::Active,
            capabilities: Vec::new(),
            started_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn worker(id: AgentId, parent_id: AgentId, session_id: SessionId) -> Self {
        Self {
            id,
            agent_type: AgentType::Worker,
            parent_id: Some(parent_id),
            session_id,
            state: AgentState::Active,
            capabilities: Vec::new(),
            started_at: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }
}
