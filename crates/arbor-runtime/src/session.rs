//! The session coordinator: one actor per session.
//!
//! A session owns its [`SessionState`] outright and processes its mailbox one
//! message at a time. Every mutation is journaled before it is applied, sync
//! commands are answered in place, and async commands are handed to workers
//! through the [`AgentPool`](crate::AgentPool). Worker outcomes come back
//! through the same mailbox, so state is only ever touched by this actor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arbor_persistence::PersistenceError;
use arbor_protocol::{
    AgentAddress, AgentId, AgentRecord, AgentState, Capability, CapabilityConstraints,
    CommandMode, CommandRequest, EventKind, ExecutionHandle, ExecutionId, ExecutionStatus,
    JournalEntry, JournalRecord, MessageEnvelope, MessageId, PrincipalId, ProtocolError,
    ResourceUri, SessionId, SessionOptions, SessionState, SessionStatus, TaskSpec,
};
use arbor_security::SecurityError;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::RuntimeServices;
use crate::error::SessionError;
use crate::pool::PoolTicket;
use crate::tasks::is_read_only;
use crate::worker::{ExecutionJob, ExecutionOutcome, supervise_execution};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Take a snapshot after this many journal entries.
    pub snapshot_every: u64,
    pub mailbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            snapshot_every: 32,
            mailbox_capacity: 256,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub(crate) enum SessionCommand {
    Message {
        envelope: MessageEnvelope,
        reply: Reply<SessionReply>,
    },
    SpawnWorker {
        command: String,
        args: Value,
        reply: Reply<WorkerTicket>,
    },
    Stop {
        reason: String,
        reply: Reply<()>,
    },
    WorkerFinished {
        outcome: ExecutionOutcome,
    },
    #[cfg(test)]
    Crash,
}

/// What a session answers to a delivered message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SessionReply {
    /// A sync command's result.
    Sync { result: Value },
    /// An async command was accepted; its outcome arrives on the event bus.
    Async(WorkerTicket),
    /// A plain (non-command) message was recorded.
    Delivered { message_id: MessageId },
}

/// Receipt for an accepted async command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerTicket {
    pub execution_id: ExecutionId,
    /// Worker for the first attempt. A retry runs under a fresh id.
    pub worker_id: AgentId,
    /// Set when the request had to wait for a pool slot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
}

impl WorkerTicket {
    pub fn handle(&self) -> ExecutionHandle {
        ExecutionHandle {
            execution_id: self.execution_id.clone(),
            status: if self.queue_position.is_some() {
                ExecutionStatus::Pending
            } else {
                ExecutionStatus::Running
            },
        }
    }
}

/// Cheap, cloneable reference to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    agent_id: AgentId,
    mailbox: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    failure: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Message { .. } => "Message",
            Self::SpawnWorker { .. } => "SpawnWorker",
            Self::Stop { .. } => "Stop",
            Self::WorkerFinished { .. } => "WorkerFinished",
            #[cfg(test)]
            Self::Crash => "Crash",
        };
        f.write_str(name)
    }
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: SessionId,
        agent_id: AgentId,
        mailbox: mpsc::Sender<SessionCommand>,
        status: watch::Receiver<SessionStatus>,
        failure: Arc<Mutex<Option<String>>>,
    ) -> Self {
        Self {
            session_id,
            agent_id,
            mailbox,
            status,
            failure,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Principal the session coordinator holds its capabilities under.
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn address(&self) -> AgentAddress {
        AgentAddress::Session(self.session_id.clone())
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Why the session ended in `error`, if it did.
    pub fn failure_reason(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Wait until the status satisfies `predicate`, for at most `limit`.
    pub async fn wait_for_status(
        &self,
        mut predicate: impl FnMut(SessionStatus) -> bool,
        limit: Duration,
    ) -> Option<SessionStatus> {
        let mut status = self.status.clone();
        let reached = async {
            status
                .wait_for(|current| predicate(*current))
                .await
                .map(|reached| *reached)
        };
        let outcome = timeout(limit, reached).await;
        match outcome {
            Ok(Ok(reached)) => Some(reached),
            Ok(Err(_)) => {
                let current = self.status();
                predicate(current).then_some(current)
            }
            Err(_) => None,
        }
    }

    /// Deliver an envelope and wait for the session's answer.
    pub async fn handle_message(
        &self,
        envelope: MessageEnvelope,
    ) -> Result<SessionReply, SessionError> {
        self.request(|reply| SessionCommand::Message { envelope, reply })
            .await
    }

    /// Send `command` from `from` and wait for the reply.
    pub async fn command(
        &self,
        from: AgentAddress,
        command: &str,
        args: Value,
    ) -> Result<SessionReply, SessionError> {
        let envelope = MessageEnvelope::new(
            self.address(),
            from,
            CommandRequest::new(command, args).into_payload(),
        );
        self.handle_message(envelope).await
    }

    /// Run `command` on a worker. Returns once the execution is accepted.
    pub async fn spawn_worker(
        &self,
        command: impl Into<String>,
        args: Value,
    ) -> Result<WorkerTicket, SessionError> {
        let command = command.into();
        self.request(|reply| SessionCommand::SpawnWorker {
            command,
            args,
            reply,
        })
        .await
    }

    pub(crate) async fn stop(&self, reason: impl Into<String>) -> Result<(), SessionError> {
        let reason = reason.into();
        self.request(|reply| SessionCommand::Stop { reason, reply })
            .await
    }

    #[cfg(test)]
    pub(crate) async fn crash(&self) {
        let _ = self.mailbox.send(SessionCommand::Crash).await;
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, answer) = oneshot::channel();
        self.mailbox
            .send(command(reply))
            .await
            .map_err(|_| self.closed_error())?;
        answer.await.map_err(|_| SessionError::Failed {
            session_id: self.session_id.clone(),
            reason: "session crashed while handling the request".to_owned(),
        })?
    }

    fn closed_error(&self) -> SessionError {
        match self.failure_reason() {
            Some(reason) => SessionError::Failed {
                session_id: self.session_id.clone(),
                reason,
            },
            None => SessionError::Stopped(self.session_id.clone()),
        }
    }
}

/// Move the session to `next` and announce it. Illegal transitions are
/// logged and ignored.
pub(crate) fn set_status(
    services: &RuntimeServices,
    session_id: &SessionId,
    status: &watch::Sender<SessionStatus>,
    next: SessionStatus,
) -> bool {
    let mut from = None;
    let mut illegal = None;
    status.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        if !current.can_transition_to(next) {
            illegal = Some(*current);
            return false;
        }
        from = Some(*current);
        *current = next;
        true
    });
    if let Some(current) = illegal {
        warn!(%session_id, from = ?current, to = ?next, "illegal session transition ignored");
    }
    let Some(from) = from else {
        return false;
    };
    services.bus.publish(
        &session_id.topic(),
        AgentAddress::Session(session_id.clone()),
        EventKind::SessionStatusChanged {
            session_id: session_id.clone(),
            from,
            to: next,
        },
    );
    debug!(%session_id, ?from, to = ?next, "session status changed");
    true
}

/// Answer every command still queued in a mailbox that is going away.
pub(crate) fn reject_pending(
    mailbox: &mut mpsc::Receiver<SessionCommand>,
    rejected: impl Fn() -> SessionError,
) {
    mailbox.close();
    while let Ok(command) = mailbox.try_recv() {
        match command {
            SessionCommand::Message { reply, .. } => {
                let _ = reply.send(Err(rejected()));
            }
            SessionCommand::SpawnWorker { reply, .. } => {
                let _ = reply.send(Err(rejected()));
            }
            SessionCommand::Stop { reply, .. } => {
                let _ = reply.send(Ok(()));
            }
            SessionCommand::WorkerFinished { .. } => {}
            #[cfg(test)]
            SessionCommand::Crash => {}
        }
    }
}

/// Everything that survives a session restart.
pub(crate) struct SessionSeed {
    pub services: Arc<RuntimeServices>,
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub options: SessionOptions,
    pub mailbox: mpsc::WeakSender<SessionCommand>,
    pub status: watch::Sender<SessionStatus>,
}

impl SessionSeed {
    pub fn set_status(&self, next: SessionStatus) -> bool {
        set_status(&self.services, &self.session_id, &self.status, next)
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    fn address(&self) -> AgentAddress {
        AgentAddress::Session(self.session_id.clone())
    }

    pub fn publish(&self, kind: EventKind) {
        self.services
            .bus
            .publish(&self.session_id.topic(), self.address(), kind);
    }
}

struct RunningExecution {
    command: String,
    worker_id: AgentId,
    cancel: CancellationToken,
    accepted_at: DateTime<Utc>,
    /// Set by the execution's supervisor once it holds a pool slot.
    leased: Arc<AtomicBool>,
}

impl RunningExecution {
    fn status(&self) -> ExecutionStatus {
        if self.leased.load(Ordering::Acquire) {
            ExecutionStatus::Running
        } else {
            ExecutionStatus::Pending
        }
    }
}

/// One incarnation of a session coordinator.
pub(crate) struct Session {
    seed: Arc<SessionSeed>,
    state: SessionState,
    capabilities: Vec<Capability>,
    running: IndexMap<ExecutionId, RunningExecution>,
    since_snapshot: u64,
    cancel: CancellationToken,
}

impl Session {
    /// Bring a session up: recover or open its state, grant its capabilities,
    /// and register the coordinator. `restarting` makes a missing persisted
    /// state an error instead of a fresh start.
    #[instrument(skip(seed), fields(session_id = %seed.session_id))]
    pub(crate) async fn start(
        seed: Arc<SessionSeed>,
        restarting: bool,
    ) -> Result<Self, SessionError> {
        let session_id = seed.session_id.clone();
        let state = match seed.services.persistence.recover(&session_id).await {
            Ok(state) => {
                info!(
                    sequence = state.last_sequence,
                    version = state.version,
                    "session state recovered"
                );
                state
            }
            Err(PersistenceError::NotFound(_)) if !restarting => SessionState::new(session_id),
            Err(error) => return Err(error.into()),
        };

        let mut session = Self {
            seed,
            state,
            capabilities: Vec::new(),
            running: IndexMap::new(),
            since_snapshot: 0,
            cancel: CancellationToken::new(),
        };
        if session.state.last_sequence == 0 {
            let owner = session.seed.options.owner.clone();
            session
                .journal(JournalRecord::SessionOpened { owner })
                .await?;
        }
        session.grant_capabilities()?;
        session.seed.set_status(SessionStatus::Active);
        Ok(session)
    }

    /// Cancelled when this incarnation ends, taking its workers with it.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Process the mailbox until the session is stopped. Panics propagate to
    /// the supervisor.
    pub(crate) async fn run(mut self, mailbox: &mut mpsc::Receiver<SessionCommand>) {
        self.settle();
        loop {
            let Some(command) = mailbox.recv().await else {
                if let Err(error) = self.shutdown("all handles dropped", mailbox).await {
                    warn!(session_id = %self.seed.session_id, %error, "session shutdown incomplete");
                }
                return;
            };
            match command {
                SessionCommand::Message { envelope, reply } => {
                    let result = self.handle_message(envelope).await;
                    let _ = reply.send(result);
                }
                SessionCommand::SpawnWorker {
                    command,
                    args,
                    reply,
                } => {
                    let result = self.spawn_worker(command, args).await;
                    let _ = reply.send(result);
                }
                SessionCommand::WorkerFinished { outcome } => {
                    self.on_worker_finished(outcome).await;
                }
                SessionCommand::Stop { reason, reply } => {
                    let result = self.shutdown(&reason, mailbox).await;
                    let _ = reply.send(result);
                    return;
                }
                #[cfg(test)]
                SessionCommand::Crash => panic!("injected session crash"),
            }
            self.settle();
        }
    }

    fn services(&self) -> &RuntimeServices {
        &self.seed.services
    }

    fn session_id(&self) -> &SessionId {
        &self.seed.session_id
    }

    fn principal(&self) -> PrincipalId {
        PrincipalId::from(&self.seed.agent_id)
    }

    /// `active` while workers run, `idle` otherwise.
    fn settle(&self) {
        let (status, agent_state) = if self.running.is_empty() {
            (SessionStatus::Idle, AgentState::Inactive)
        } else {
            (SessionStatus::Active, AgentState::Active)
        };
        if self.seed.set_status(status) {
            self.services()
                .registry
                .set_state(&self.seed.agent_id, agent_state);
        }
    }

    fn grant_capabilities(&mut self) -> Result<(), SessionError> {
        let principal = self.principal();
        let mut record = AgentRecord::session(self.seed.agent_id.clone(), self.session_id().clone());
        self.capabilities.clear();
        for uri in &self.seed.options.grants {
            let capability = self.services().security.grant(
                uri,
                &principal,
                CapabilityConstraints::unrestricted(),
                None,
            )?;
            record.capabilities.push(capability.id.clone());
            self.capabilities.push(capability);
        }
        record
            .metadata
            .insert("owner".to_owned(), self.seed.options.owner.clone());
        self.services().registry.register(record);
        Ok(())
    }

    /// A session capability that authorizes `resource`. An expired grant is
    /// renewed in place; a revoked one is not.
    fn authority_for(&mut self, resource: &str) -> Result<Capability, SessionError> {
        let requested = ResourceUri::parse(resource)?;
        let Some(index) = self
            .capabilities
            .iter()
            .position(|capability| capability.resource_uri.covers(&requested))
        else {
            return Err(SecurityError::ResourceMismatch {
                scope: self
                    .capabilities
                    .iter()
                    .map(|capability| capability.resource_uri.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                requested: resource.to_owned(),
            }
            .into());
        };

        let capability = &self.capabilities[index];
        let security = &self.seed.services.security;
        match security.validate(capability, requested.operation(), resource) {
            Ok(()) => Ok(capability.clone()),
            Err(SecurityError::Expired(_)) => {
                let renewed = security.grant(
                    &capability.resource_uri.to_string(),
                    &capability.principal_id,
                    capability.constraints.clone(),
                    None,
                )?;
                debug!(session_id = %self.seed.session_id, capability_id = %renewed.id, "session capability renewed");
                self.services()
                    .registry
                    .attach_capability(&self.seed.agent_id, renewed.id.clone());
                self.capabilities[index] = renewed.clone();
                Ok(renewed)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Persist, then apply. A failed append leaves state untouched.
    async fn journal(&mut self, record: JournalRecord) -> Result<(), SessionError> {
        let entry = JournalEntry::new(
            self.session_id().clone(),
            self.state.last_sequence + 1,
            record,
        );
        self.services().persistence.append_event(&entry).await?;
        self.state.apply(&entry);
        self.since_snapshot += 1;
        if self.since_snapshot >= self.services().session.snapshot_every.max(1) {
            self.snapshot().await;
        }
        Ok(())
    }

    async fn snapshot(&mut self) {
        match self
            .seed
            .services
            .persistence
            .snapshot(&self.seed.session_id, &self.state)
            .await
        {
            Ok(()) => self.since_snapshot = 0,
            Err(error) => {
                warn!(session_id = %self.seed.session_id, %error, "snapshot failed; journal still authoritative");
            }
        }
    }

    #[instrument(
        skip(self, envelope),
        fields(session_id = %self.seed.session_id, message_id = %envelope.id, from = %envelope.from)
    )]
    async fn handle_message(
        &mut self,
        envelope: MessageEnvelope,
    ) -> Result<SessionReply, SessionError> {
        if envelope.to != self.seed.address() {
            return Err(ProtocolError::InvalidAddress(format!(
                "message for {} delivered to {}",
                envelope.to,
                self.seed.address()
            ))
            .into());
        }
        let request = match envelope.payload.get("command") {
            Some(_) => Some(envelope.command()?),
            None => None,
        };
        let routed = match request {
            Some(request) => {
                let mode = self
                    .services()
                    .tasks
                    .command_mode(&request.command)
                    .ok_or_else(|| SessionError::UnknownCommand(request.command.clone()))?;
                Some((request, mode))
            }
            None => None,
        };

        let read_only = routed
            .as_ref()
            .is_some_and(|(request, _)| is_read_only(&request.command));
        if !read_only {
            self.journal(JournalRecord::MessageReceived {
                message_id: envelope.id.clone(),
                from: envelope.from.clone(),
                command: routed.as_ref().map(|(request, _)| request.command.clone()),
            })
            .await?;
        }

        match routed {
            None => {
                self.seed.publish(EventKind::MessageDelivered {
                    message_id: envelope.id.clone(),
                    from: envelope.from,
                    to: envelope.to,
                });
                Ok(SessionReply::Delivered {
                    message_id: envelope.id,
                })
            }
            Some((request, CommandMode::Sync)) => {
                debug!(command = %request.command, "sync command");
                let result = self.handle_sync(&request.command, &request.args).await?;
                Ok(SessionReply::Sync { result })
            }
            Some((request, CommandMode::Async)) => {
                let ticket = self.spawn_worker(request.command, request.args).await?;
                Ok(SessionReply::Async(ticket))
            }
        }
    }

    async fn handle_sync(&mut self, command: &str, args: &Value) -> Result<Value, SessionError> {
        match command {
            "ping" => Ok(json!({ "pong": true, "session_id": self.session_id() })),
            "status" => Ok(json!({
                "session_id": self.session_id(),
                "owner": self.state.owner,
                "status": self.seed.status(),
                "version": self.state.version,
                "running": self.running.len(),
                "messages_received": self.state.messages_received,
                "last_sequence": self.state.last_sequence,
            })),
            "state.get" => {
                let key = required_str(command, args, "key")?;
                Ok(json!({
                    "key": key,
                    "value": self.state.get(key).cloned().unwrap_or(Value::Null),
                    "version": self.state.version,
                }))
            }
            "state.set" => {
                let key = required_str(command, args, "key")?.to_owned();
                let value = args
                    .get("value")
                    .cloned()
                    .ok_or_else(|| SessionError::invalid_args(command, "missing `value`"))?;
                let version = self
                    .set_value(key.clone(), value, expected_version(command, args)?)
                    .await?;
                Ok(json!({ "key": key, "version": version }))
            }
            "state.remove" => {
                let key = required_str(command, args, "key")?.to_owned();
                self.check_version(expected_version(command, args)?)?;
                let existed = self.state.values.contains_key(&key);
                if existed {
                    self.journal(JournalRecord::StateRemoved { key: key.clone() })
                        .await?;
                    self.seed.publish(EventKind::StateUpdated {
                        session_id: self.session_id().clone(),
                        key: key.clone(),
                        version: self.state.version,
                    });
                }
                Ok(json!({ "key": key, "removed": existed, "version": self.state.version }))
            }
            "state.list" => Ok(json!({
                "values": self.state.values,
                "version": self.state.version,
            })),
            "model.switch" => {
                let model = required_str(command, args, "model")?.to_owned();
                let previous = self.state.get("model").cloned().unwrap_or(Value::Null);
                let version = self
                    .set_value(
                        "model".to_owned(),
                        Value::String(model.clone()),
                        expected_version(command, args)?,
                    )
                    .await?;
                info!(session_id = %self.seed.session_id, %model, "model switched");
                Ok(json!({ "model": model, "previous": previous, "version": version }))
            }
            "executions" => {
                let running: Vec<Value> = self
                    .running
                    .iter()
                    .map(|(execution_id, execution)| {
                        json!({
                            "execution_id": execution_id,
                            "command": execution.command,
                            "status": execution.status(),
                            "worker_id": execution.worker_id,
                            "accepted_at": execution.accepted_at,
                        })
                    })
                    .collect();
                Ok(json!({ "running": running, "finished": self.state.executions }))
            }
            "cancel" => {
                let execution_id = ExecutionId::parse(required_str(command, args, "execution_id")?)?;
                if let Some(execution) = self.running.get(&execution_id) {
                    execution.cancel.cancel();
                    info!(session_id = %self.seed.session_id, %execution_id, "execution cancelled");
                    return Ok(json!({ "execution_id": execution_id, "cancelled": true }));
                }
                match self.state.execution(&execution_id) {
                    Some(record) => Ok(json!({
                        "execution_id": execution_id,
                        "cancelled": false,
                        "status": record.status,
                    })),
                    None => Err(SessionError::UnknownExecution(execution_id)),
                }
            }
            other => Err(SessionError::UnknownCommand(other.to_owned())),
        }
    }

    fn check_version(&self, expected: Option<u64>) -> Result<(), SessionError> {
        match expected {
            Some(expected) if expected != self.state.version => Err(SessionError::Conflict {
                expected,
                actual: self.state.version,
            }),
            _ => Ok(()),
        }
    }

    async fn set_value(
        &mut self,
        key: String,
        value: Value,
        expected: Option<u64>,
    ) -> Result<u64, SessionError> {
        self.check_version(expected)?;
        self.journal(JournalRecord::StateSet {
            key: key.clone(),
            value,
        })
        .await?;
        self.seed.publish(EventKind::StateUpdated {
            session_id: self.session_id().clone(),
            key,
            version: self.state.version,
        });
        Ok(self.state.version)
    }

    /// Authorize, claim a pool slot (or a queue position), and hand the
    /// execution to its own supervising task.
    #[instrument(skip(self, args), fields(session_id = %self.seed.session_id))]
    async fn spawn_worker(
        &mut self,
        command: String,
        args: Value,
    ) -> Result<WorkerTicket, SessionError> {
        if !self.seed.status().accepts_commands() {
            return Err(SessionError::NotAccepting {
                session_id: self.session_id().clone(),
                status: self.seed.status(),
            });
        }
        let handler = self
            .services()
            .tasks
            .get(&command)
            .ok_or_else(|| SessionError::UnknownCommand(command.clone()))?;
        let spec = TaskSpec::new(command, args, self.state.clone());
        let resource = handler.required_resource(&spec);
        let authority = self.authority_for(&resource)?;

        let ticket = self
            .services()
            .pool
            .request_worker(self.session_id(), &spec.execution_id)?;
        let queue_position = match &ticket {
            PoolTicket::Ready(_) => None,
            PoolTicket::Queued(request) => Some(request.position()),
        };
        if let Some(position) = queue_position {
            self.seed.publish(EventKind::WorkerQueued {
                execution_id: spec.execution_id.clone(),
                command: spec.command.clone(),
                position,
            });
        }

        let worker_id = AgentId::default();
        let cancel = self.cancel.child_token();
        let leased = Arc::new(AtomicBool::new(queue_position.is_none()));
        self.running.insert(
            spec.execution_id.clone(),
            RunningExecution {
                command: spec.command.clone(),
                worker_id: worker_id.clone(),
                cancel: cancel.clone(),
                accepted_at: Utc::now(),
                leased: leased.clone(),
            },
        );
        let receipt = WorkerTicket {
            execution_id: spec.execution_id.clone(),
            worker_id: worker_id.clone(),
            queue_position,
        };
        info!(
            execution_id = %spec.execution_id,
            command = %spec.command,
            queued = queue_position.is_some(),
            "execution accepted"
        );

        let job = ExecutionJob {
            spec,
            handler,
            parent: self.seed.agent_id.clone(),
            authority,
            first_worker: worker_id,
            ticket,
            cancel,
            leased,
        };
        let services = self.seed.services.clone();
        let mailbox = self.seed.mailbox.clone();
        let session_id = self.session_id().clone();
        tokio::spawn(async move {
            let outcome = supervise_execution(services.clone(), job).await;
            let execution_id = outcome.record.execution_id.clone();
            let terminal = outcome.terminal_event();
            let delivered = match mailbox.upgrade() {
                Some(mailbox) => mailbox
                    .send(SessionCommand::WorkerFinished { outcome })
                    .await
                    .is_ok(),
                None => false,
            };
            if !delivered {
                warn!(%session_id, %execution_id, "session gone; outcome not journaled");
                services.bus.publish(
                    &session_id.topic(),
                    AgentAddress::Session(session_id.clone()),
                    terminal,
                );
            }
        });
        Ok(receipt)
    }

    async fn on_worker_finished(&mut self, outcome: ExecutionOutcome) {
        let execution_id = outcome.record.execution_id.clone();
        self.running.shift_remove(&execution_id);
        if let Err(error) = self
            .journal(JournalRecord::ExecutionRecorded {
                record: outcome.record.clone(),
            })
            .await
        {
            warn!(session_id = %self.seed.session_id, %execution_id, %error, "execution outcome not journaled");
        }
        debug!(
            session_id = %self.seed.session_id,
            %execution_id,
            status = ?outcome.record.status,
            attempts = outcome.record.attempts,
            "execution finished"
        );
        self.seed.publish(outcome.terminal_event());
    }

    /// Cancel workers, wait a bounded time for their outcomes, close the
    /// journal, and give up every capability.
    #[instrument(skip(self, mailbox), fields(session_id = %self.seed.session_id))]
    async fn shutdown(
        &mut self,
        reason: &str,
        mailbox: &mut mpsc::Receiver<SessionCommand>,
    ) -> Result<(), SessionError> {
        self.seed.set_status(SessionStatus::Stopping);
        self.cancel.cancel();

        let deadline = Instant::now() + self.services().worker.cancel_grace() + Duration::from_secs(1);
        while !self.running.is_empty() {
            match timeout_at(deadline, mailbox.recv()).await {
                Ok(Some(SessionCommand::WorkerFinished { outcome })) => {
                    self.on_worker_finished(outcome).await;
                }
                Ok(Some(SessionCommand::Message { reply, .. })) => {
                    let _ = reply.send(Err(self.stopping()));
                }
                Ok(Some(SessionCommand::SpawnWorker { reply, .. })) => {
                    let _ = reply.send(Err(self.stopping()));
                }
                Ok(Some(SessionCommand::Stop { reply, .. })) => {
                    let _ = reply.send(Ok(()));
                }
                #[cfg(test)]
                Ok(Some(SessionCommand::Crash)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        if !self.running.is_empty() {
            warn!(abandoned = self.running.len(), "stopping with unfinished executions");
        }

        let closed = self
            .journal(JournalRecord::SessionClosed {
                reason: reason.to_owned(),
            })
            .await;
        self.snapshot().await;
        self.services()
            .registry
            .terminate(&self.seed.agent_id, AgentState::Terminated);
        self.capabilities.clear();
        self.seed.set_status(SessionStatus::Terminated);
        info!(reason, "session stopped");
        closed
    }

    fn stopping(&self) -> SessionError {
        SessionError::NotAccepting {
            session_id: self.session_id().clone(),
            status: SessionStatus::Stopping,
        }
    }
}

fn required_str<'a>(command: &str, args: &'a Value, key: &str) -> Result<&'a str, SessionError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| SessionError::invalid_args(command, format!("missing string `{key}`")))
}

fn expected_version(command: &str, args: &Value) -> Result<Option<u64>, SessionError> {
    match args.get("expected_version") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| {
            SessionError::invalid_args(command, "`expected_version` must be a non-negative integer")
        }),
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::PoolConfig;
    use crate::testing::services;

    use super::*;

    #[test]
    fn argument_helpers_validate_shapes() {
        let args = json!({ "key": "x", "expected_version": 3 });
        assert_eq!(required_str("state.get", &args, "key").ok(), Some("x"));
        assert!(matches!(
            required_str("state.get", &json!({ "key": 1 }), "key"),
            Err(SessionError::InvalidArgs { .. })
        ));
        assert_eq!(expected_version("state.set", &args).ok(), Some(Some(3)));
        assert_eq!(expected_version("state.set", &json!({})).ok(), Some(None));
        assert!(expected_version("state.set", &json!({ "expected_version": -1 })).is_err());
    }

    #[test]
    fn status_changes_follow_the_lifecycle() {
        let services = services("status", PoolConfig::default());
        let session_id = SessionId::from_string("S1");
        let (status, watcher) = watch::channel(SessionStatus::Starting);

        assert!(set_status(&services, &session_id, &status, SessionStatus::Active));
        assert!(!set_status(&services, &session_id, &status, SessionStatus::Active));
        assert!(!set_status(&services, &session_id, &status, SessionStatus::Terminated));
        assert_eq!(*watcher.borrow(), SessionStatus::Active);
        assert!(set_status(&services, &session_id, &status, SessionStatus::Stopping));
        assert!(set_status(&services, &session_id, &status, SessionStatus::Terminated));
        assert_eq!(services.bus.last_sequence(&session_id.topic()), 3);
    }

    #[test]
    fn queued_tickets_report_pending() {
        let ticket = WorkerTicket {
            execution_id: ExecutionId::from_string("E1"),
            worker_id: AgentId::from_string("w1"),
            queue_position: Some(2),
        };
        assert_eq!(ticket.handle().status, ExecutionStatus::Pending);
        let serialized = serde_json::to_value(SessionReply::Async(ticket)).unwrap_or_default();
        assert_eq!(serialized["mode"], "async");
        assert_eq!(serialized["queue_position"], 2);
    }
}
