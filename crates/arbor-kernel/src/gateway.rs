//! Client-facing entry point.
//!
//! Every call carries the client's capability. The gateway checks it against
//! `res://session/<operation>/<session_id>` before anything reaches a session,
//! so a refused request leaves no trace in session state.

use std::sync::Arc;

use arbor_events::{EventBus, EventStream};
use arbor_protocol::{
    AgentAddress, Capability, CommandMode, ErrorKind, ExecutionId, ExecutionRecord,
    ExecutionStatus, MessageEnvelope, MessageId, SessionId, SessionOptions, SessionStatus,
};
use arbor_runtime::{SessionError, SessionManager, SessionReply};
use arbor_security::{SecurityError, SecurityKernel};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, instrument, warn};

const INTERNAL_ERROR: &str = "internal error";

/// Error returned to clients. System faults carry no internal detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{kind}: {reason}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub reason: String,
}

impl GatewayError {
    fn validation(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            reason: reason.into(),
        }
    }

    fn unauthorized(error: &SecurityError) -> Self {
        Self {
            kind: error.kind(),
            reason: format!("unauthorized: {error}"),
        }
    }
}

impl From<SessionError> for GatewayError {
    fn from(error: SessionError) -> Self {
        let kind = error.kind();
        let reason = if kind == ErrorKind::SystemFault {
            warn!(%error, "system fault hidden from client");
            INTERNAL_ERROR.to_owned()
        } else {
            error.to_string()
        };
        Self { kind, reason }
    }
}

/// Result of `execute_command`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CommandOutcome {
    Sync {
        result: Value,
    },
    /// Track the execution with [`Gateway::execution_status`] or the session topic.
    Async {
        execution_id: ExecutionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        queue_position: Option<usize>,
    },
}

impl From<SessionReply> for CommandOutcome {
    fn from(reply: SessionReply) -> Self {
        match reply {
            SessionReply::Sync { result } => Self::Sync { result },
            SessionReply::Async(ticket) => Self::Async {
                execution_id: ticket.execution_id,
                queue_position: ticket.queue_position,
            },
            SessionReply::Delivered { message_id } => Self::Sync {
                result: json!({ "message_id": message_id }),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub status: SessionStatus,
    /// Event topic to subscribe to for this session.
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionView {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct Gateway {
    sessions: Arc<SessionManager>,
    security: Arc<SecurityKernel>,
    bus: Arc<EventBus>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(
        sessions: Arc<SessionManager>,
        security: Arc<SecurityKernel>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            sessions,
            security,
            bus,
        }
    }

    fn authorize(
        &self,
        credential: &Capability,
        operation: &str,
        session_id: &SessionId,
    ) -> Result<(), GatewayError> {
        let resource = format!("res://session/{operation}/{session_id}");
        self.security
            .validate(credential, operation, &resource)
            .map_err(|error| GatewayError::unauthorized(&error))
    }

    fn client_address(credential: &Capability) -> AgentAddress {
        AgentAddress::Client(credential.principal_id.to_string())
    }

    #[instrument(skip(self, credential, options), fields(%session_id, client = %credential.principal_id))]
    pub async fn create_session(
        &self,
        credential: &Capability,
        session_id: SessionId,
        mut options: SessionOptions,
    ) -> Result<SessionSummary, GatewayError> {
        self.authorize(credential, "create", &session_id)?;
        if options.owner == SessionOptions::default().owner {
            options.owner = credential.principal_id.to_string();
        }
        let handle = self.sessions.start_session(session_id, options).await?;
        info!("session created");
        Ok(SessionSummary {
            session_id: handle.session_id().clone(),
            status: handle.status(),
            topic: handle.session_id().topic(),
        })
    }

    #[instrument(skip(self, credential), fields(%session_id, client = %credential.principal_id))]
    pub async fn stop_session(
        &self,
        credential: &Capability,
        session_id: &SessionId,
    ) -> Result<(), GatewayError> {
        self.authorize(credential, "stop", session_id)?;
        self.sessions.stop_session(session_id).await?;
        Ok(())
    }

    /// Run `command` in a session. Sync commands answer inline; async ones
    /// return an execution id right away.
    #[instrument(skip(self, credential, args), fields(%session_id, command, client = %credential.principal_id))]
    pub async fn execute_command(
        &self,
        credential: &Capability,
        session_id: &SessionId,
        command: &str,
        args: Value,
    ) -> Result<CommandOutcome, GatewayError> {
        self.authorize(credential, "execute", session_id)?;
        if self.command_mode(command).is_none() {
            return Err(GatewayError::validation(format!("unknown command `{command}`")));
        }
        let handle = self.sessions.lookup(session_id)?;
        let reply = handle
            .command(Self::client_address(credential), command, args)
            .await?;
        Ok(reply.into())
    }

    pub fn command_mode(&self, command: &str) -> Option<CommandMode> {
        self.sessions.services().tasks.command_mode(command)
    }

    /// Export the session's state to a file under the workspace root.
    #[instrument(skip(self, credential), fields(%session_id, client = %credential.principal_id))]
    pub async fn request_export(
        &self,
        credential: &Capability,
        session_id: &SessionId,
    ) -> Result<ExecutionId, GatewayError> {
        self.authorize(credential, "export", session_id)?;
        let handle = self.sessions.lookup(session_id)?;
        let ticket = handle.spawn_worker("export", json!({})).await?;
        Ok(ticket.execution_id)
    }

    /// Route a plain message from one session to another. Both ends must be
    /// in the credential's scope.
    #[instrument(skip(self, credential, payload), fields(%from, %to, client = %credential.principal_id))]
    pub async fn send_message(
        &self,
        credential: &Capability,
        from: &SessionId,
        to: &SessionId,
        payload: Value,
    ) -> Result<MessageId, GatewayError> {
        self.authorize(credential, "message", from)?;
        self.authorize(credential, "message", to)?;
        if payload.get("command").is_some() {
            return Err(GatewayError::validation(
                "messages between sessions cannot carry commands",
            ));
        }
        self.sessions.lookup(from)?;
        let target = self.sessions.lookup(to)?;
        let envelope = MessageEnvelope::new(
            target.address(),
            AgentAddress::Session(from.clone()),
            payload,
        )
        .with_reply_to(AgentAddress::Session(from.clone()));
        match target.handle_message(envelope).await? {
            SessionReply::Delivered { message_id } => Ok(message_id),
            _ => Err(GatewayError {
                kind: ErrorKind::SystemFault,
                reason: INTERNAL_ERROR.to_owned(),
            }),
        }
    }

    /// Live events for one session: status changes, state updates, execution
    /// progress, and delivered messages.
    pub fn subscribe(
        &self,
        credential: &Capability,
        session_id: &SessionId,
    ) -> Result<EventStream, GatewayError> {
        self.authorize(credential, "subscribe", session_id)?;
        self.sessions.lookup(session_id)?;
        Ok(self.bus.subscribe(&session_id.topic()))
    }

    #[instrument(skip(self, credential), fields(%session_id, %execution_id, client = %credential.principal_id))]
    pub async fn execution_status(
        &self,
        credential: &Capability,
        session_id: &SessionId,
        execution_id: &ExecutionId,
    ) -> Result<ExecutionView, GatewayError> {
        self.authorize(credential, "read", session_id)?;
        let handle = self.sessions.lookup(session_id)?;
        let reply = handle
            .command(Self::client_address(credential), "executions", json!({}))
            .await?;
        let SessionReply::Sync { result } = reply else {
            return Err(GatewayError {
                kind: ErrorKind::SystemFault,
                reason: INTERNAL_ERROR.to_owned(),
            });
        };
        find_execution(&result, execution_id)
            .ok_or_else(|| GatewayError::validation(format!("execution {execution_id} not found")))
    }
}

fn find_execution(listing: &Value, execution_id: &ExecutionId) -> Option<ExecutionView> {
    let matches = |entry: &&Value| {
        entry.get("execution_id").and_then(Value::as_str) == Some(execution_id.as_str())
    };
    if let Some(finished) = listing["finished"]
        .as_array()
        .and_then(|entries| entries.iter().find(matches))
    {
        let record: ExecutionRecord = serde_json::from_value(finished.clone()).ok()?;
        return Some(ExecutionView {
            execution_id: record.execution_id,
            status: record.status,
            attempts: Some(record.attempts),
            output: record.output,
            error: record.error,
        });
    }
    listing["running"]
        .as_array()
        .and_then(|entries| entries.iter().find(matches))
        .map(|entry| ExecutionView {
            execution_id: execution_id.clone(),
            status: entry
                .get("status")
                .cloned()
                .and_then(|status| serde_json::from_value(status).ok())
                .unwrap_or(ExecutionStatus::Pending),
            attempts: None,
            output: None,
            error: None,
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{Result, anyhow};
    use arbor_persistence::{MemoryPersistence, Persistence};
    use arbor_protocol::{EventKind, EventRecord};
    use arbor_runtime::{PoolConfig, WorkerConfig};
    use futures_util::StreamExt;

    use super::*;
    use crate::{ArborKernel, KernelBuilder};

    fn kernel(name: &str) -> Result<(ArborKernel, Capability)> {
        kernel_with_pool(name, PoolConfig::default())
    }

    fn kernel_with_pool(name: &str, pool: PoolConfig) -> Result<(ArborKernel, Capability)> {
        let root = std::env::temp_dir().join(format!(
            "arbor-gateway-{name}-{}",
            ExecutionId::default()
        ));
        let kernel = KernelBuilder::new(root)
            .persistence(Arc::new(MemoryPersistence::new()))
            .pool(pool)
            .worker(WorkerConfig {
                timeout_secs: 5,
                cancel_grace_ms: 200,
                auto_retry: true,
            })
            .build()?;
        let credential = kernel.issue_client_credential("cli-1", "res://session/*", None)?;
        Ok((kernel, credential))
    }

    async fn terminal_event(events: &mut EventStream, execution_id: &ExecutionId) -> Result<EventRecord> {
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = events.next().await {
                if event.execution_id() == Some(execution_id) && event.kind.is_terminal_for_execution() {
                    return Some(event);
                }
            }
            None
        })
        .await?
        .ok_or_else(|| anyhow!("event stream ended"))
    }

    fn session(id: &str) -> SessionId {
        SessionId::from_string(id)
    }

    #[tokio::test]
    async fn commands_need_a_credential_in_scope() -> Result<()> {
        let (kernel, admin) = kernel("scope")?;
        let gateway = kernel.gateway();
        let scoped = kernel.issue_client_credential("cli-2", "res://session/*/s1", None)?;

        gateway
            .create_session(&scoped, session("s1"), SessionOptions::default())
            .await?;
        let denied = gateway
            .create_session(&scoped, session("s2"), SessionOptions::default())
            .await
            .err()
            .ok_or_else(|| anyhow!("out-of-scope create succeeded"))?;
        assert_eq!(denied.kind, ErrorKind::Authorization);

        gateway
            .execute_command(
                &scoped,
                &session("s1"),
                "state.set",
                json!({ "key": "owner", "value": "cli-2" }),
            )
            .await?;
        kernel.services().security.revoke(&scoped.id);
        let revoked = gateway
            .execute_command(
                &scoped,
                &session("s1"),
                "state.set",
                json!({ "key": "owner", "value": "intruder" }),
            )
            .await
            .err()
            .ok_or_else(|| anyhow!("revoked credential accepted"))?;
        assert_eq!(revoked.kind, ErrorKind::Authorization);

        // The refused write never reached the session.
        let CommandOutcome::Sync { result } = gateway
            .execute_command(&admin, &session("s1"), "status", json!({}))
            .await?
        else {
            return Err(anyhow!("status is sync"));
        };
        assert_eq!(result["messages_received"], 1);
        assert_eq!(result["version"], 1);
        kernel.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn sync_and_async_commands_report_results() -> Result<()> {
        let (kernel, credential) = kernel("modes")?;
        let gateway = kernel.gateway();
        let id = session("calc");
        gateway
            .create_session(&credential, id.clone(), SessionOptions::default())
            .await?;
        let mut events = gateway.subscribe(&credential, &id)?;

        let pong = gateway
            .execute_command(&credential, &id, "ping", json!({}))
            .await?;
        assert!(matches!(pong, CommandOutcome::Sync { .. }));

        let CommandOutcome::Async { execution_id, .. } = gateway
            .execute_command(
                &credential,
                &id,
                "calculate",
                json!({ "operation": "sum", "numbers": [1, 2, 3] }),
            )
            .await?
        else {
            return Err(anyhow!("calculate is async"));
        };
        let event = terminal_event(&mut events, &execution_id).await?;
        let EventKind::ExecutionCompleted { output, .. } = event.kind else {
            return Err(anyhow!("unexpected terminal event {:?}", event.kind));
        };
        assert_eq!(output["result"], json!(6.0));

        let view = gateway
            .execution_status(&credential, &id, &execution_id)
            .await?;
        assert_eq!(view.status, ExecutionStatus::Completed);
        assert_eq!(view.attempts, Some(1));

        let unknown = gateway
            .execute_command(&credential, &id, "teleport", json!({}))
            .await
            .err()
            .ok_or_else(|| anyhow!("unknown command accepted"))?;
        assert_eq!(unknown.kind, ErrorKind::Validation);
        kernel.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn queued_executions_read_pending_until_they_get_a_slot() -> Result<()> {
        let (kernel, credential) = kernel_with_pool(
            "queued",
            PoolConfig {
                max_workers: 1,
                ..PoolConfig::default()
            },
        )?;
        let gateway = kernel.gateway();
        let id = session("queue");
        gateway
            .create_session(&credential, id.clone(), SessionOptions::default())
            .await?;
        let mut events = gateway.subscribe(&credential, &id)?;

        let mut submitted = Vec::new();
        for _ in 0..2 {
            let outcome = gateway
                .execute_command(
                    &credential,
                    &id,
                    "long_running",
                    json!({ "steps": 4, "step_ms": 150 }),
                )
                .await?;
            let CommandOutcome::Async {
                execution_id,
                queue_position,
            } = outcome
            else {
                return Err(anyhow!("long_running is async"));
            };
            submitted.push((execution_id, queue_position));
        }
        let (first, second) = (submitted[0].clone(), submitted[1].clone());
        assert_eq!(first.1, None);
        assert_eq!(second.1, Some(1));

        let journal_before = kernel.services().persistence.latest_sequence(&id).await?;
        let running = gateway.execution_status(&credential, &id, &first.0).await?;
        assert_eq!(running.status, ExecutionStatus::Running);
        for _ in 0..20 {
            let queued = gateway.execution_status(&credential, &id, &second.0).await?;
            assert_eq!(queued.status, ExecutionStatus::Pending);
        }
        assert_eq!(
            kernel.services().persistence.latest_sequence(&id).await?,
            journal_before
        );

        terminal_event(&mut events, &second.0).await?;
        let done = gateway.execution_status(&credential, &id, &second.0).await?;
        assert_eq!(done.status, ExecutionStatus::Completed);
        kernel.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn export_writes_the_session_state() -> Result<()> {
        let (kernel, credential) = kernel("export")?;
        let gateway = kernel.gateway();
        let id = session("exp");
        gateway
            .create_session(&credential, id.clone(), SessionOptions::default())
            .await?;
        gateway
            .execute_command(
                &credential,
                &id,
                "state.set",
                json!({ "key": "topic", "value": "forests" }),
            )
            .await?;
        let mut events = gateway.subscribe(&credential, &id)?;
        let execution_id = gateway.request_export(&credential, &id).await?;
        let event = terminal_event(&mut events, &execution_id).await?;
        let EventKind::ExecutionCompleted { output, .. } = event.kind else {
            return Err(anyhow!("export failed: {:?}", event.kind));
        };
        let path = output["path"]
            .as_str()
            .ok_or_else(|| anyhow!("export path missing"))?;
        let written: Value = serde_json::from_slice(&std::fs::read(path)?)?;
        assert_eq!(written["values"]["topic"], "forests");
        let root = kernel.config().root.clone();
        kernel.shutdown().await;
        let _ = std::fs::remove_dir_all(root);
        Ok(())
    }

    #[tokio::test]
    async fn messages_route_between_sessions() -> Result<()> {
        let (kernel, credential) = kernel("route")?;
        let gateway = kernel.gateway();
        for id in ["left", "right"] {
            gateway
                .create_session(&credential, session(id), SessionOptions::default())
                .await?;
        }
        let mut events = gateway.subscribe(&credential, &session("right"))?;
        let message_id = gateway
            .send_message(&credential, &session("left"), &session("right"), json!({ "text": "hi" }))
            .await?;
        let delivered = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.next().await {
                if let EventKind::MessageDelivered { message_id: seen, from, .. } = event.kind {
                    return Some((seen, from));
                }
            }
            None
        })
        .await?
        .ok_or_else(|| anyhow!("no delivery event"))?;
        assert_eq!(delivered, (message_id, AgentAddress::Session(session("left"))));

        let smuggled = gateway
            .send_message(
                &credential,
                &session("left"),
                &session("right"),
                json!({ "command": "state.set", "args": {} }),
            )
            .await
            .err()
            .ok_or_else(|| anyhow!("command accepted as a message"))?;
        assert_eq!(smuggled.kind, ErrorKind::Validation);
        kernel.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn lifecycle_errors_are_classified() -> Result<()> {
        let (kernel, credential) = kernel("lifecycle")?;
        let gateway = kernel.gateway();
        gateway
            .create_session(&credential, session("once"), SessionOptions::default())
            .await?;
        let duplicate = gateway
            .create_session(&credential, session("once"), SessionOptions::default())
            .await
            .err()
            .ok_or_else(|| anyhow!("duplicate session created"))?;
        assert_eq!(duplicate.kind, ErrorKind::Validation);

        let missing = gateway
            .execute_command(&credential, &session("ghost"), "ping", json!({}))
            .await
            .err()
            .ok_or_else(|| anyhow!("missing session answered"))?;
        assert_eq!(missing.kind, ErrorKind::Validation);

        gateway.stop_session(&credential, &session("once")).await?;
        assert!(gateway.subscribe(&credential, &session("once")).is_err());
        kernel.shutdown().await;
        Ok(())
    }

    #[test]
    fn system_faults_hide_their_cause() {
        let error = GatewayError::from(SessionError::Failed {
            session_id: SessionId::from_string("s"),
            reason: "disk at /var/lib/arbor is full".into(),
        });
        assert_eq!(error.kind, ErrorKind::SystemFault);
        assert_eq!(error.reason, INTERNAL_ERROR);
        assert_eq!(
            serde_json::to_value(&error).ok(),
            Some(json!({ "kind": "system_fault", "reason": "internal error" }))
        );
    }
}
