//! Capability-based security kernel.
//!
//! The kernel is the only place capability validation happens. Grants,
//! delegations and revocations take the store's write lock, so they are
//! serialized and immediately visible; validation takes the read lock and
//! runs concurrently. Every public operation returns a typed error on
//! malformed input instead of panicking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arbor_protocol::{
    AuditAction, AuditEvent, AuditSink, Capability, CapabilityConstraints, CapabilityId, Clock,
    ErrorKind, NullAuditSink, PrincipalId, ResourceUri, SystemClock, validate_id,
};
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    #[error("invalid resource: {0}")]
    InvalidResource(String),
    #[error("invalid principal: {0}")]
    InvalidPrincipal(String),
    #[error("invalid ttl: {0}")]
    InvalidTtl(String),
    #[error("capability {0} has expired")]
    Expired(CapabilityId),
    #[error("capability {0} has been revoked")]
    Revoked(CapabilityId),
    #[error("capability {0} is not known to this kernel")]
    UnknownCapability(CapabilityId),
    #[error("capability {0} carries an invalid signature")]
    InvalidSignature(CapabilityId),
    #[error("resource {requested} is outside capability scope {scope}")]
    ResourceMismatch { scope: String, requested: String },
    #[error("operation `{operation}` on {resource} exceeds capability constraints")]
    InsufficientScope { operation: String, resource: String },
    #[error("capability {0} cannot be delegated further")]
    DepthExceeded(CapabilityId),
    #[error("delegated constraints would widen capability {0}")]
    ConstraintWidening(CapabilityId),
}

impl SecurityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidResource(_) | Self::InvalidPrincipal(_) | Self::InvalidTtl(_) => {
                ErrorKind::Validation
            }
            _ => ErrorKind::Authorization,
        }
    }
}

pub type SecurityResult<T> = Result<T, SecurityError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Lifetime applied when a grant does not name one. `None` means no expiry.
    pub default_ttl_secs: Option<u64>,
    pub default_delegation_depth: u8,
    /// Requested depths above this are clamped.
    pub max_delegation_depth: u8,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: Some(3600),
            default_delegation_depth: 2,
            max_delegation_depth: 8,
        }
    }
}

#[derive(Debug)]
struct Entry {
    capability: Capability,
    revoked: bool,
    children: Vec<CapabilityId>,
}

#[derive(Debug, Default)]
struct Store {
    entries: HashMap<CapabilityId, Entry>,
    by_principal: HashMap<PrincipalId, IndexSet<CapabilityId>>,
}

impl Store {
    fn insert(&mut self, capability: Capability) {
        self.by_principal
            .entry(capability.principal_id.clone())
            .or_default()
            .insert(capability.id.clone());
        if let Some(parent_id) = &capability.parent_capability_id {
            if let Some(parent) = self.entries.get_mut(parent_id) {
                parent.children.push(capability.id.clone());
            }
        }
        self.entries.insert(
            capability.id.clone(),
            Entry {
                capability,
                revoked: false,
                children: Vec::new(),
            },
        );
    }

    /// Revoke `root` and every capability delegated from it.
    fn revoke_tree(&mut self, root: &CapabilityId) -> Vec<Capability> {
        let mut revoked = Vec::new();
        let mut pending = vec![root.clone()];
        while let Some(id) = pending.pop() {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            pending.extend(entry.children.iter().cloned());
            if !entry.revoked {
                entry.revoked = true;
                revoked.push(entry.capability.clone());
            }
        }
        revoked
    }

    fn remove(&mut self, id: &CapabilityId) {
        if let Some(entry) = self.entries.remove(id) {
            let principal = &entry.capability.principal_id;
            let now_empty = self.by_principal.get_mut(principal).is_some_and(|ids| {
                ids.shift_remove(id);
                ids.is_empty()
            });
            if now_empty {
                self.by_principal.remove(principal);
            }
        }
    }
}

pub struct SecurityKernel {
    store: RwLock<Store>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    key: [u8; 32],
    config: SecurityConfig,
}

impl std::fmt::Debug for SecurityKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityKernel")
            .field("config", &self.config)
            .field("capabilities", &self.store.read().entries.len())
            .finish_non_exhaustive()
    }
}

impl Default for SecurityKernel {
    fn default() -> Self {
        Self::new(
            SecurityConfig::default(),
            Arc::new(SystemClock),
            Arc::new(NullAuditSink),
        )
    }
}

impl SecurityKernel {
    pub fn new(config: SecurityConfig, clock: Arc<dyn Clock>, audit: Arc<dyn AuditSink>) -> Self {
        Self::with_signing_key(config, clock, audit, random_key())
    }

    pub fn with_signing_key(
        config: SecurityConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        key: [u8; 32],
    ) -> Self {
        Self {
            store: RwLock::new(Store::default()),
            clock,
            audit,
            key,
            config,
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Grant a root capability with the configured default delegation depth.
    pub fn grant(
        &self,
        resource_uri: &str,
        principal_id: &PrincipalId,
        constraints: CapabilityConstraints,
        ttl: Option<Duration>,
    ) -> SecurityResult<Capability> {
        self.grant_with_depth(
            resource_uri,
            principal_id,
            constraints,
            ttl,
            self.config.default_delegation_depth,
        )
    }

    pub fn grant_with_depth(
        &self,
        resource_uri: &str,
        principal_id: &PrincipalId,
        constraints: CapabilityConstraints,
        ttl: Option<Duration>,
        delegation_depth: u8,
    ) -> SecurityResult<Capability> {
        let resource_uri = ResourceUri::parse(resource_uri)
            .map_err(|error| SecurityError::InvalidResource(error.to_string()))?;
        constraints
            .check_paths(&resource_uri)
            .map_err(|error| SecurityError::InvalidResource(error.to_string()))?;
        validate_id(principal_id.as_str())
            .map_err(|_| SecurityError::InvalidPrincipal(principal_id.to_string()))?;

        let granted_at = self.clock.now();
        let ttl = ttl.or(self.config.default_ttl_secs.map(Duration::from_secs));
        let ttl = match (ttl, constraints.max_ttl_secs) {
            (Some(ttl), Some(max)) => Some(ttl.min(Duration::from_secs(max))),
            (None, Some(max)) => Some(Duration::from_secs(max)),
            (ttl, None) => ttl,
        };
        let expires_at = ttl.map(|ttl| expiry_after(granted_at, ttl)).transpose()?;

        let mut capability = Capability {
            id: CapabilityId::default(),
            resource_uri,
            principal_id: principal_id.clone(),
            granted_at,
            expires_at,
            parent_capability_id: None,
            delegation_depth: delegation_depth.min(self.config.max_delegation_depth),
            constraints,
            signature: None,
        };
        capability.signature = Some(self.sign(&capability));

        self.store.write().insert(capability.clone());
        self.audit.record(
            AuditEvent::new(granted_at, AuditAction::Granted)
                .capability(&capability.id)
                .principal(&capability.principal_id)
                .resource(capability.resource_uri.to_string()),
        );
        info!(
            capability_id = %capability.id,
            principal = %capability.principal_id,
            resource = %capability.resource_uri,
            depth = capability.delegation_depth,
            "capability granted"
        );
        Ok(capability)
    }

    /// Succeeds iff the capability is genuine, unrevoked, unexpired, and
    /// `operation` on `resource_uri` lies within its scope and constraints.
    pub fn validate(
        &self,
        capability: &Capability,
        operation: &str,
        resource_uri: &str,
    ) -> SecurityResult<()> {
        let result = self.check(capability, operation, resource_uri);
        match &result {
            Ok(()) => debug!(
                capability_id = %capability.id,
                operation,
                resource = resource_uri,
                "capability validated"
            ),
            Err(error) => {
                warn!(
                    capability_id = %capability.id,
                    operation,
                    resource = resource_uri,
                    %error,
                    "capability denied"
                );
                self.audit.record(
                    AuditEvent::new(self.clock.now(), AuditAction::Denied)
                        .capability(&capability.id)
                        .principal(&capability.principal_id)
                        .resource(resource_uri)
                        .reason(error.to_string()),
                );
            }
        }
        result
    }

    fn check(
        &self,
        capability: &Capability,
        operation: &str,
        resource_uri: &str,
    ) -> SecurityResult<()> {
        let requested = ResourceUri::parse(resource_uri)
            .map_err(|error| SecurityError::InvalidResource(error.to_string()))?;
        self.verify_signature(capability)?;

        let store = self.store.read();
        let entry = store
            .entries
            .get(&capability.id)
            .ok_or_else(|| SecurityError::UnknownCapability(capability.id.clone()))?;
        if entry.capability != *capability {
            return Err(SecurityError::InvalidSignature(capability.id.clone()));
        }
        if entry.revoked {
            return Err(SecurityError::Revoked(capability.id.clone()));
        }
        if capability.is_expired_at(self.clock.now()) {
            return Err(SecurityError::Expired(capability.id.clone()));
        }
        if !capability.resource_uri.covers(&requested) {
            return Err(SecurityError::ResourceMismatch {
                scope: capability.resource_uri.to_string(),
                requested: requested.to_string(),
            });
        }
        let constraints = &capability.constraints;
        if !constraints.permits_operation(&capability.resource_uri, operation)
            || !constraints.permits_path(requested.kind(), requested.segments())
        {
            return Err(SecurityError::InsufficientScope {
                operation: operation.to_owned(),
                resource: requested.to_string(),
            });
        }
        Ok(())
    }

    /// Derive a narrower capability for `new_principal_id`.
    ///
    /// The child's depth is one less than the parent's, its constraints must be
    /// a subset of the parent's, and it never outlives the parent.
    pub fn delegate(
        &self,
        capability: &Capability,
        new_principal_id: &PrincipalId,
        narrower_constraints: CapabilityConstraints,
    ) -> SecurityResult<Capability> {
        self.verify_signature(capability)?;
        validate_id(new_principal_id.as_str())
            .map_err(|_| SecurityError::InvalidPrincipal(new_principal_id.to_string()))?;

        let now = self.clock.now();
        let mut store = self.store.write();
        let (parent, revoked) = {
            let entry = store
                .entries
                .get(&capability.id)
                .ok_or_else(|| SecurityError::UnknownCapability(capability.id.clone()))?;
            if entry.capability != *capability {
                return Err(SecurityError::InvalidSignature(capability.id.clone()));
            }
            (entry.capability.clone(), entry.revoked)
        };
        if revoked {
            drop(store);
            self.record_denied(&parent, "parent capability is revoked");
            return Err(SecurityError::Revoked(parent.id));
        }
        if parent.is_expired_at(now) {
            drop(store);
            self.record_denied(&parent, "parent capability has expired");
            return Err(SecurityError::Expired(parent.id));
        }
        if let Err(error) = narrower_constraints.check_paths(&parent.resource_uri) {
            drop(store);
            self.record_denied(&parent, "invalid path prefix");
            return Err(SecurityError::InvalidResource(error.to_string()));
        }
        if parent.delegation_depth == 0 {
            drop(store);
            self.record_denied(&parent, "delegation depth exhausted");
            return Err(SecurityError::DepthExceeded(parent.id));
        }
        if !narrower_constraints.is_subset_of(&parent.constraints, &parent.resource_uri) {
            drop(store);
            self.record_denied(&parent, "delegation would widen constraints");
            return Err(SecurityError::ConstraintWidening(parent.id));
        }

        let own_expiry = narrower_constraints
            .max_ttl_secs
            .map(|secs| expiry_after(now, Duration::from_secs(secs)))
            .transpose()?;
        let expires_at = match (parent.expires_at, own_expiry) {
            (Some(parent_expiry), Some(own)) => Some(parent_expiry.min(own)),
            (parent_expiry, own) => parent_expiry.or(own),
        };

        let mut child = Capability {
            id: CapabilityId::default(),
            resource_uri: parent.resource_uri.clone(),
            principal_id: new_principal_id.clone(),
            granted_at: now,
            expires_at,
            parent_capability_id: Some(parent.id.clone()),
            delegation_depth: parent.delegation_depth - 1,
            constraints: narrower_constraints,
            signature: None,
        };
        child.signature = Some(self.sign(&child));
        store.insert(child.clone());
        drop(store);

        self.audit.record(
            AuditEvent::new(now, AuditAction::Delegated)
                .capability(&child.id)
                .principal(&child.principal_id)
                .resource(child.resource_uri.to_string())
                .reason(format!("delegated from {}", parent.id)),
        );
        info!(
            parent_id = %parent.id,
            capability_id = %child.id,
            principal = %child.principal_id,
            depth = child.delegation_depth,
            "capability delegated"
        );
        Ok(child)
    }

    /// Revoke a capability and everything delegated from it. Unknown ids are a
    /// no-op. Returns how many capabilities were newly revoked.
    pub fn revoke(&self, capability_id: &CapabilityId) -> usize {
        let revoked = self.store.write().revoke_tree(capability_id);
        self.record_revoked(&revoked);
        revoked.len()
    }

    /// Revoke everything held by `principal_id` (and its delegations).
    pub fn revoke_principal(&self, principal_id: &PrincipalId) -> usize {
        let revoked = {
            let mut store = self.store.write();
            let held: Vec<CapabilityId> = store
                .by_principal
                .get(principal_id)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default();
            let mut revoked = Vec::new();
            for id in held {
                revoked.extend(store.revoke_tree(&id));
            }
            revoked
        };
        self.record_revoked(&revoked);
        revoked.len()
    }

    pub fn get(&self, capability_id: &CapabilityId) -> Option<Capability> {
        self.store
            .read()
            .entries
            .get(capability_id)
            .map(|entry| entry.capability.clone())
    }

    pub fn is_revoked(&self, capability_id: &CapabilityId) -> bool {
        self.store
            .read()
            .entries
            .get(capability_id)
            .is_none_or(|entry| entry.revoked)
    }

    /// Live (unrevoked, unexpired) capabilities held by a principal.
    pub fn capabilities_for(&self, principal_id: &PrincipalId) -> Vec<Capability> {
        let now = self.clock.now();
        let store = self.store.read();
        store
            .by_principal
            .get(principal_id)
            .into_iter()
            .flatten()
            .filter_map(|id| store.entries.get(id))
            .filter(|entry| !entry.revoked && !entry.capability.is_expired_at(now))
            .map(|entry| entry.capability.clone())
            .collect()
    }

    /// Drop revoked and expired capabilities from the store. Once purged, a
    /// presented copy fails validation as unknown.
    pub fn purge(&self) -> usize {
        let now = self.clock.now();
        let mut store = self.store.write();
        let dead: Vec<CapabilityId> = store
            .entries
            .values()
            .filter(|entry| entry.revoked || entry.capability.is_expired_at(now))
            .map(|entry| entry.capability.id.clone())
            .collect();
        for id in &dead {
            store.remove(id);
        }
        if !dead.is_empty() {
            debug!(purged = dead.len(), "capability store purged");
        }
        dead.len()
    }

    pub fn len(&self) -> usize {
        self.store.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sign(&self, capability: &Capability) -> String {
        let hash = blake3::keyed_hash(&self.key, capability.signing_payload().as_bytes());
        hex::encode(hash.as_bytes())
    }

    fn verify_signature(&self, capability: &Capability) -> SecurityResult<()> {
        let invalid = || SecurityError::InvalidSignature(capability.id.clone());
        let presented = capability.signature.as_deref().ok_or_else(invalid)?;
        let bytes: [u8; 32] = hex::decode(presented)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(invalid)?;
        let expected = blake3::keyed_hash(&self.key, capability.signing_payload().as_bytes());
        // blake3::Hash equality is constant-time.
        if expected == blake3::Hash::from(bytes) {
            Ok(())
        } else {
            Err(invalid())
        }
    }

    fn record_denied(&self, capability: &Capability, reason: &str) {
        warn!(capability_id = %capability.id, reason, "delegation denied");
        self.audit.record(
            AuditEvent::new(self.clock.now(), AuditAction::Denied)
                .capability(&capability.id)
                .principal(&capability.principal_id)
                .resource(capability.resource_uri.to_string())
                .reason(reason),
        );
    }

    fn record_revoked(&self, revoked: &[Capability]) {
        let now = self.clock.now();
        for capability in revoked {
            self.audit.record(
                AuditEvent::new(now, AuditAction::Revoked)
                    .capability(&capability.id)
                    .principal(&capability.principal_id)
                    .resource(capability.resource_uri.to_string()),
            );
        }
        if !revoked.is_empty() {
            info!(count = revoked.len(), "capabilities revoked");
        }
    }
}

fn expiry_after(start: DateTime<Utc>, ttl: Duration) -> SecurityResult<DateTime<Utc>> {
    if ttl.is_zero() {
        return Err(SecurityError::InvalidTtl("ttl must be positive".to_owned()));
    }
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| start.checked_add_signed(ttl))
        .ok_or_else(|| SecurityError::InvalidTtl(format!("{ttl:?} is out of range")))
}

fn random_key() -> [u8; 32] {
    let mut key = [0_u8; 32];
    key[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    key[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    key
}

/// Parse a 64-char hex signing key.
pub fn parse_signing_key(raw: &str) -> Option<[u8; 32]> {
    hex::decode(raw).ok().and_then(|bytes| bytes.try_into().ok())
}
