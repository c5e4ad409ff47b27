//! Inter-agent message envelopes and agent addressing.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::ids::{AgentId, ExecutionId, MessageId, SessionId, TraceId, validate_id};

/// Where a message can be delivered.
///
/// Text forms: `gateway`, `client:<id>`, `session:<id>`, `worker:<session>/<agent>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AgentAddress {
    Gateway,
    Client(String),
    Session(SessionId),
    Worker {
        session_id: SessionId,
        agent_id: AgentId,
    },
}

impl AgentAddress {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidAddress(raw.to_owned());
        if raw == "gateway" {
            return Ok(Self::Gateway);
        }
        let (scheme, rest) = raw.split_once(':').ok_or_else(invalid)?;
        match scheme {
            "client" => {
                validate_id(rest).map_err(|_| invalid())?;
                Ok(Self::Client(rest.to_owned()))
            }
            "session" => Ok(Self::Session(
                SessionId::parse(rest).map_err(|_| invalid())?,
            )),
            "worker" => {
                let (session, agent) = rest.split_once('/').ok_or_else(invalid)?;
                Ok(Self::Worker {
                    session_id: SessionId::parse(session).map_err(|_| invalid())?,
                    agent_id: AgentId::parse(agent).map_err(|_| invalid())?,
                })
            }
            _ => Err(invalid()),
        }
    }

    /// Session that owns the addressed agent, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Session(session_id) | Self::Worker { session_id, .. } => Some(session_id),
            Self::Gateway | Self::Client(_) => None,
        }
    }
}

impl fmt::Display for AgentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gateway => f.write_str("gateway"),
            Self::Client(id) => write!(f, "client:{id}"),
            Self::Session(id) => write!(f, "session:{id}"),
            Self::Worker {
                session_id,
                agent_id,
            } => write!(f, "worker:{session_id}/{agent_id}"),
        }
    }
}

impl FromStr for AgentAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AgentAddress {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AgentAddress> for String {
    fn from(address: AgentAddress) -> Self {
        address.to_string()
    }
}

/// One inter-agent message. Built once, then moved into the recipient's
/// mailbox; there is no API for changing it after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: MessageId,
    pub to: AgentAddress,
    pub from: AgentAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<AgentAddress>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl MessageEnvelope {
    pub fn new(to: AgentAddress, from: AgentAddress, payload: Value) -> Self {
        let session_id = to.session_id().cloned();
        Self {
            id: MessageId::default(),
            to,
            from,
            session_id,
            trace_id: None,
            execution_id: None,
            payload,
            timestamp: Utc::now(),
            reply_to: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_trace(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    pub fn with_execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn with_reply_to(mut self, reply_to: AgentAddress) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Interpret the payload as a command request.
    pub fn command(&self) -> Result<CommandRequest, ProtocolError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|error| ProtocolError::InvalidCommand(error.to_string()))
    }
}

/// Command payload carried by envelopes addressed to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, args: Value) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn into_payload(self) -> Value {
        serde_json::json!({ "command": self.command, "args": self.args })
    }
}
