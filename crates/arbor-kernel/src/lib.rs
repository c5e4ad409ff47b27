//! # arbor-kernel: assembly and client gateway
//!
//! [`KernelBuilder`] wires the security kernel, event bus, persistence, worker
//! pool, and session manager into an [`ArborKernel`]. Clients talk to it
//! through the capability-checked [`Gateway`].

pub mod config;
pub mod gateway;

pub use config::{BusConfig, ConfigError, KernelConfig};
pub use gateway::{CommandOutcome, ExecutionView, Gateway, GatewayError, SessionSummary};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arbor_events::{EventBus, SECURITY_TOPIC};
use arbor_persistence::{FilePersistence, Persistence};
use arbor_protocol::{
    AuditSink, Capability, CapabilityConstraints, Clock, EventKind, JournalEntry, JournalRecord,
    PrincipalId, SessionId, SystemClock,
};
use arbor_runtime::{
    AgentPool, AgentRegistry, LocalSandboxRunner, PoolConfig, RuntimeServices, SandboxRunner,
    SessionManager, SupervisionConfig, TaskHandler, TaskRegistry, WorkerConfig,
};
use arbor_security::{SecurityConfig, SecurityError, SecurityKernel};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct KernelBuilder {
    config: KernelConfig,
    clock: Arc<dyn Clock>,
    persistence: Option<Arc<dyn Persistence>>,
    sandbox: Option<Arc<dyn SandboxRunner>>,
    tasks: TaskRegistry,
}

impl KernelBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::from_config(KernelConfig {
            root: root.into(),
            ..KernelConfig::default()
        })
    }

    pub fn from_config(config: KernelConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            persistence: None,
            sandbox: None,
            tasks: TaskRegistry::with_builtin_tasks(),
        }
    }

    pub fn allowed_commands(mut self, commands: Vec<String>) -> Self {
        self.config.allowed_commands = commands;
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    pub fn worker(mut self, worker: WorkerConfig) -> Self {
        self.config.worker = worker;
        self
    }

    pub fn supervision(mut self, supervision: SupervisionConfig) -> Self {
        self.config.supervision = supervision;
        self
    }

    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.config.security = security;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the default file store under `<root>/state`.
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn SandboxRunner>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Add an async command. A handler with a builtin's name replaces it.
    pub fn register_task(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.tasks.register(handler);
        self
    }

    /// Assemble the kernel. Must run inside a tokio runtime for security
    /// audit events to be persisted.
    pub fn build(self) -> Result<ArborKernel, ConfigError> {
        let config = self.config;
        config.validate()?;

        let bus = Arc::new(EventBus::new(config.bus.buffer));
        let audit: Arc<dyn AuditSink> = bus.clone();
        let security = Arc::new(match config.signing_key_bytes()? {
            Some(key) => {
                SecurityKernel::with_signing_key(config.security.clone(), self.clock, audit, key)
            }
            None => SecurityKernel::new(config.security.clone(), self.clock, audit),
        });
        let persistence = self
            .persistence
            .unwrap_or_else(|| Arc::new(FilePersistence::new(config.root.join("state"))));
        let sandbox = self.sandbox.unwrap_or_else(|| {
            Arc::new(LocalSandboxRunner::new(
                security.clone(),
                config.allowed_commands.clone(),
            ))
        });

        let services = Arc::new(RuntimeServices {
            registry: Arc::new(AgentRegistry::new(security.clone())),
            security,
            bus,
            persistence,
            pool: AgentPool::new(config.pool.clone()),
            tasks: Arc::new(self.tasks),
            sandbox,
            workspace_root: config.root.clone(),
            worker: config.worker.clone(),
            session: config.session.clone(),
            supervision: config.supervision.clone(),
        });
        let audit_mirror = spawn_audit_mirror(&services);
        let sessions = Arc::new(SessionManager::new(services.clone()));
        let gateway = Gateway::new(
            sessions.clone(),
            services.security.clone(),
            services.bus.clone(),
        );
        info!(
            root = %config.root.display(),
            max_workers = config.pool.max_workers,
            tasks = ?services.tasks.names().collect::<Vec<_>>(),
            "kernel ready"
        );
        Ok(ArborKernel {
            config,
            services,
            sessions,
            gateway,
            audit_mirror,
        })
    }
}

/// Copy security audit events into the `system` journal.
fn spawn_audit_mirror(services: &RuntimeServices) -> Option<JoinHandle<()>> {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("no tokio runtime; security audit events will not be persisted");
        return None;
    };
    let mut events = services.bus.subscribe(SECURITY_TOPIC);
    let persistence = services.persistence.clone();
    Some(runtime.spawn(async move {
        let stream = SessionId::system();
        let mut next = match persistence.latest_sequence(&stream).await {
            Ok(sequence) => sequence + 1,
            Err(error) => {
                warn!(%error, "audit journal unreadable; restarting its sequence");
                1
            }
        };
        while let Some(record) = events.next().await {
            let EventKind::SecurityAudit { event } = record.kind else {
                continue;
            };
            let mut entry = JournalEntry::new(stream.clone(), next, JournalRecord::Audit { event });
            if let Err(error) = persistence.append_event(&entry).await {
                // Someone else wrote to the stream, or a write half-failed.
                // Pick up after whatever is there now and try once more.
                warn!(%error, sequence = next, "audit append failed; resyncing");
                match persistence.latest_sequence(&stream).await {
                    Ok(latest) => entry.sequence = latest + 1,
                    Err(error) => {
                        warn!(%error, "audit journal unreadable; event dropped");
                        continue;
                    }
                }
                if let Err(error) = persistence.append_event(&entry).await {
                    warn!(%error, sequence = entry.sequence, "audit event dropped");
                    next = entry.sequence;
                    continue;
                }
            }
            next = entry.sequence + 1;
        }
        debug!("audit mirror stopped");
    }))
}

pub struct ArborKernel {
    config: KernelConfig,
    services: Arc<RuntimeServices>,
    sessions: Arc<SessionManager>,
    gateway: Gateway,
    audit_mirror: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ArborKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArborKernel")
            .field("config", &self.config)
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

impl ArborKernel {
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn services(&self) -> &Arc<RuntimeServices> {
        &self.services
    }

    /// Grant a client the credential it presents to the gateway. `None` uses
    /// the configured default TTL.
    pub fn issue_client_credential(
        &self,
        client_id: &str,
        resource_uri: &str,
        ttl: Option<Duration>,
    ) -> Result<Capability, SecurityError> {
        let principal = PrincipalId::parse(client_id)
            .map_err(|error| SecurityError::InvalidPrincipal(error.to_string()))?;
        self.services.security.grant(
            resource_uri,
            &principal,
            CapabilityConstraints::unrestricted(),
            ttl,
        )
    }

    /// Stop every session, then let the audit mirror drain and exit.
    pub async fn shutdown(self) {
        self.sessions.shutdown().await;
        self.services.bus.close_topic(SECURITY_TOPIC);
        if let Some(mirror) = self.audit_mirror {
            if let Err(error) = mirror.await {
                warn!(%error, "audit mirror ended abnormally");
            }
        }
        info!("kernel stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::{Result, anyhow};
    use arbor_persistence::MemoryPersistence;
    use arbor_protocol::{AuditAction, AuditEvent, ExecutionId, SessionOptions};

    use super::*;

    fn test_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("arbor-kernel-{name}-{}", ExecutionId::default()))
    }

    #[tokio::test]
    async fn audit_events_land_in_the_system_journal() -> Result<()> {
        let persistence = Arc::new(MemoryPersistence::new());
        let kernel = KernelBuilder::new(test_root("audit"))
            .persistence(persistence.clone())
            .build()?;
        let credential = kernel.issue_client_credential("auditor", "res://session/*", None)?;
        kernel.services().security.revoke(&credential.id);

        let system = SessionId::system();
        tokio::time::timeout(Duration::from_secs(5), async {
            while persistence.journal_len(&system) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        let journal = persistence.read_journal(&system, 1).await?;
        assert_eq!(journal[0].sequence, 1);
        assert!(matches!(journal[1].record, JournalRecord::Audit { .. }));
        kernel.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn audit_mirror_recovers_from_a_foreign_append() -> Result<()> {
        let persistence = Arc::new(MemoryPersistence::new());
        let kernel = KernelBuilder::new(test_root("audit-resync"))
            .persistence(persistence.clone())
            .build()?;
        let system = SessionId::system();
        let settle = |len: usize| {
            let persistence = persistence.clone();
            let system = system.clone();
            tokio::time::timeout(Duration::from_secs(5), async move {
                while persistence.journal_len(&system) < len {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        };

        kernel.issue_client_credential("first", "res://session/*", None)?;
        settle(1).await?;
        let foreign = AuditEvent::new(SystemClock.now(), AuditAction::Revoked).reason("operator");
        persistence
            .append_event(&JournalEntry::new(
                system.clone(),
                2,
                JournalRecord::Audit { event: foreign },
            ))
            .await?;

        let credential = kernel.issue_client_credential("second", "res://session/*", None)?;
        kernel.services().security.revoke(&credential.id);
        settle(4).await?;

        let journal = persistence.read_journal(&system, 1).await?;
        let sequences: Vec<u64> = journal.iter().map(|entry| entry.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
        assert!(
            journal[2..]
                .iter()
                .all(|entry| matches!(entry.record, JournalRecord::Audit { .. }))
        );
        kernel.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn builder_applies_overrides() -> Result<()> {
        let kernel = KernelBuilder::new(test_root("overrides"))
            .persistence(Arc::new(MemoryPersistence::new()))
            .pool(PoolConfig {
                max_workers: 2,
                ..PoolConfig::default()
            })
            .allowed_commands(vec!["echo".into(), "true".into()])
            .build()?;
        assert_eq!(kernel.services().pool.config().max_workers, 2);
        assert_eq!(kernel.config().allowed_commands, vec!["echo", "true"]);
        assert!(kernel.gateway().command_mode("shell.exec").is_some());
        kernel.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn signing_key_is_validated_and_used() -> Result<()> {
        let bad = KernelConfig {
            signing_key: Some("zz".into()),
            ..KernelConfig::default()
        };
        assert!(matches!(
            KernelBuilder::from_config(bad).build(),
            Err(ConfigError::Invalid(_))
        ));

        let config = KernelConfig {
            root: test_root("signed"),
            signing_key: Some("ab".repeat(32)),
            ..KernelConfig::default()
        };
        let kernel = KernelBuilder::from_config(config)
            .persistence(Arc::new(MemoryPersistence::new()))
            .build()?;
        let credential = kernel.issue_client_credential("signer", "res://session/*", None)?;
        assert!(credential.signature.is_some());

        let mut forged = credential.clone();
        forged.resource_uri = arbor_protocol::ResourceUri::parse("res://fs/*")?;
        let summary = kernel
            .gateway()
            .create_session(&forged, SessionId::from_string("signed"), SessionOptions::default())
            .await;
        assert!(summary.is_err());
        kernel.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn client_ids_are_validated() -> Result<()> {
        let kernel = KernelBuilder::new(test_root("principals"))
            .persistence(Arc::new(MemoryPersistence::new()))
            .build()?;
        let error = kernel
            .issue_client_credential("bad id with spaces", "res://session/*", None)
            .err()
            .ok_or_else(|| anyhow!("invalid principal accepted"))?;
        assert!(matches!(error, SecurityError::InvalidPrincipal(_)));
        kernel.shutdown().await;
        Ok(())
    }
}
