use std::collections::HashMap;
use std::sync::Arc;

use arbor_protocol::{AgentId, AgentRecord, AgentState, CapabilityId, PrincipalId, SessionId};
use arbor_security::SecurityKernel;
use parking_lot::RwLock;
use tracing::debug;

/// Live agents (session coordinators and workers), keyed by id.
#[derive(Debug)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
    security: Arc<SecurityKernel>,
}

impl AgentRegistry {
    pub fn new(security: Arc<SecurityKernel>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            security,
        }
    }

    /// Insert or replace a record.
    pub fn register(&self, record: AgentRecord) {
        debug!(agent_id = %record.id, agent_type = ?record.agent_type, "agent registered");
        self.agents.write().insert(record.id.clone(), record);
    }

    pub fn set_state(&self, agent_id: &AgentId, state: AgentState) -> bool {
        match self.agents.write().get_mut(agent_id) {
            Some(record) => {
                record.state = state;
                true
            }
            None => false,
        }
    }

    pub fn attach_capability(&self, agent_id: &AgentId, capability_id: CapabilityId) -> bool {
        match self.agents.write().get_mut(agent_id) {
            Some(record) => {
                record.capabilities.push(capability_id);
                true
            }
            None => false,
        }
    }

    /// Remove an agent and revoke every capability it holds, including
    /// anything delegated from them.
    pub fn terminate(&self, agent_id: &AgentId, final_state: AgentState) -> Option<AgentRecord> {
        let mut record = self.agents.write().remove(agent_id)?;
        record.state = final_state;
        let revoked = self.security.revoke_principal(&PrincipalId::from(agent_id));
        debug!(%agent_id, state = ?final_state, revoked, "agent terminated");
        Some(record)
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<AgentRecord> {
        self.agents.read().get(agent_id).cloned()
    }

    pub fn list_for_session(&self, session_id: &SessionId) -> Vec<AgentRecord> {
        let mut records: Vec<AgentRecord> = self
            .agents
            .read()
            .values()
            .filter(|record| record.session_id == *session_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        records
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use arbor_protocol::{AgentType, CapabilityConstraints};

    use super::*;

    #[test]
    fn terminate_revokes_agent_capabilities() {
        let security = Arc::new(SecurityKernel::default());
        let registry = AgentRegistry::new(security.clone());
        let session = SessionId::from_string("S1");
        let coordinator = AgentId::from_string("session.S1");
        let worker = AgentId::from_string("worker-1");

        registry.register(AgentRecord::session(coordinator.clone(), session.clone()));
        registry.register(AgentRecord::worker(
            worker.clone(),
            coordinator.clone(),
            session.clone(),
        ));
        let cap = security
            .grant(
                "res://tool/execute/echo",
                &PrincipalId::from(&worker),
                CapabilityConstraints::unrestricted(),
                None,
            )
            .unwrap();
        assert!(registry.attach_capability(&worker, cap.id.clone()));
        assert_eq!(registry.list_for_session(&session).len(), 2);

        let record = registry.terminate(&worker, AgentState::Terminated).unwrap();
        assert_eq!(record.agent_type, AgentType::Worker);
        assert_eq!(record.capabilities, vec![cap.id.clone()]);
        assert!(security.is_revoked(&cap.id));
        assert!(registry.get(&worker).is_none());
        assert!(registry.terminate(&worker, AgentState::Terminated).is_none());
        assert!(registry.set_state(&coordinator, AgentState::Inactive));
        assert_eq!(registry.len(), 1);
    }
}
