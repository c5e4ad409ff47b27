//! Security audit events and the port the security kernel writes them to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CapabilityId, PrincipalId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Granted,
    Delegated,
    Revoked,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id: Option<CapabilityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<PrincipalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    pub fn new(at: DateTime<Utc>, action: AuditAction) -> Self {
        Self {
            at,
            action,
            capability_id: None,
            principal_id: None,
            resource_uri: None,
            reason: None,
        }
    }

    pub fn capability(mut self, capability_id: &CapabilityId) -> Self {
        self.capability_id = Some(capability_id.clone());
        self
    }

    pub fn principal(mut self, principal_id: &PrincipalId) -> Self {
        self.principal_id = Some(principal_id.clone());
        self
    }

    pub fn resource(mut self, resource_uri: impl Into<String>) -> Self {
        self.resource_uri = Some(resource_uri.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Receives audit events. Called synchronously from the security kernel, so
/// implementations must not block.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) {}
}
