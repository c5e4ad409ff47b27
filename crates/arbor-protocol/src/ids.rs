//! Canonical ID types for Arbor.
//!
//! IDs are opaque String wrappers (serde-transparent). Generated IDs use
//! UUID v4; externally supplied IDs go through [`validate_id`] at the
//! boundary before they are wrapped.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtocolError;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value without validation.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create from an externally supplied value, rejecting malformed input.
            pub fn parse(s: &str) -> Result<Self, ProtocolError> {
                validate_id(s)?;
                Ok(Self(s.to_owned()))
            }

            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new_uuid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Unique identifier for a bus event.
    EventId
);
typed_id!(
    /// Identifier for a session (coordinator agent).
    SessionId
);
typed_id!(
    /// Identifier for any agent, session coordinators and workers alike.
    AgentId
);
typed_id!(
    /// Identifier for a granted or delegated capability.
    CapabilityId
);
typed_id!(
    /// Identity a capability is granted to (an agent or an external client).
    PrincipalId
);
typed_id!(
    /// Correlation id for one asynchronous execution and its events.
    ExecutionId
);
typed_id!(
    /// Identifier of a message envelope.
    MessageId
);
typed_id!(
    /// Distributed trace id carried across envelopes.
    TraceId
);

impl SessionId {
    /// Reserved journal stream for kernel-wide records (audit mirror).
    pub fn system() -> Self {
        Self("system".to_owned())
    }

    /// Bus topic carrying this session's events.
    pub fn topic(&self) -> String {
        format!("session:{}", self.0)
    }
}

impl From<&AgentId> for PrincipalId {
    fn from(agent: &AgentId) -> Self {
        Self(agent.0.clone())
    }
}

const MAX_ID_LEN: usize = 128;

/// Identifiers are 1..=128 chars of `[A-Za-z0-9_.:-]`.
pub fn validate_id(raw: &str) -> Result<(), ProtocolError> {
    let valid = !raw.is_empty()
        && raw.len() <= MAX_ID_LEN
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidId(raw.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_id_new_is_unique() {
        let a = ExecutionId::new_uuid();
        let b = ExecutionId::new_uuid();
        assert_ne!(a, b);
    }

    #[test]
    fn session_id_topic() {
        let id = SessionId::from_string("S1");
        assert_eq!(id.topic(), "session:S1");
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!(SessionId::parse("S1").is_ok());
        assert!(SessionId::parse("worker:abc-1.2").is_ok());
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("has space").is_err());
        assert!(SessionId::parse("slash/inside").is_err());
        assert!(SessionId::parse(&"x".repeat(129)).is_err());
        assert!(crate::validate_id("client:cli-1").is_ok());
        assert!(crate::validate_id("a/b").is_err());
    }

    #[test]
    fn typed_id_serde_is_transparent() {
        let id = CapabilityId::from_string("CAP1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"CAP1\"");
        let back: CapabilityId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn principal_from_agent_keeps_value() {
        let agent = AgentId::from_string("worker-7");
        let principal = PrincipalId::from(&agent);
        assert_eq!(principal.as_str(), "worker-7");
    }
}
