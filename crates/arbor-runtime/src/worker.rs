//! Worker agents: one task, one capability, then gone.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use arbor_events::EventBus;
use arbor_protocol::{
    AgentAddress, AgentId, AgentRecord, AgentState, Capability, CapabilityConstraints, ErrorKind,
    EventKind, ExecutionId, ExecutionRecord, ExecutionStatus, PrincipalId, Progress, ResourceUri,
    TaskSpec,
};
use arbor_security::SecurityKernel;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::RuntimeServices;
use crate::error::ExecutionError;
use crate::pool::PoolTicket;
use crate::sandbox::SandboxRunner;
use crate::tasks::{TaskContext, TaskHandler};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Ceiling on one attempt of one task.
    pub timeout_secs: u64,
    /// How long a cancelled worker may take to stop before it is aborted.
    pub cancel_grace_ms: u64,
    /// Retry a failed execution once.
    pub auto_retry: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            cancel_grace_ms: 2_000,
            auto_retry: true,
        }
    }
}

impl WorkerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn max_attempts(&self) -> u32 {
        if self.auto_retry { 2 } else { 1 }
    }

    /// Lifetime of a worker's delegated capability.
    fn capability_ttl_secs(&self) -> u64 {
        self.timeout_secs.max(1) + self.cancel_grace_ms.div_ceil(1000) + 1
    }
}

/// Publishes progress for one execution. Percentages are clamped to
/// `0..=100` and never go backwards, across retries included.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    execution_id: ExecutionId,
    topic: String,
    source: AgentAddress,
    bus: Arc<EventBus>,
    last: Arc<AtomicU8>,
}

impl ProgressReporter {
    pub fn new(
        bus: Arc<EventBus>,
        topic: impl Into<String>,
        source: AgentAddress,
        execution_id: ExecutionId,
    ) -> Self {
        Self {
            execution_id,
            topic: topic.into(),
            source,
            bus,
            last: Arc::new(AtomicU8::new(0)),
        }
    }

    pub fn report(&self, percent: u8, message: impl Into<String>) -> Progress {
        let requested = percent.min(100);
        let percent = self.last.fetch_max(requested, Ordering::AcqRel).max(requested);
        let message = message.into();
        self.bus.publish(
            &self.topic,
            self.source.clone(),
            EventKind::ExecutionProgress {
                execution_id: self.execution_id.clone(),
                percent,
                message: message.clone(),
            },
        );
        Progress {
            execution_id: self.execution_id.clone(),
            percent,
            message,
        }
    }

    pub fn last_percent(&self) -> u8 {
        self.last.load(Ordering::Acquire)
    }
}

/// One ephemeral worker. It checks its capability, runs the handler under
/// the execution timeout, and returns; faults are not retried here.
pub struct WorkerAgent {
    pub id: AgentId,
    spec: TaskSpec,
    handler: Arc<dyn TaskHandler>,
    capability: Capability,
    security: Arc<SecurityKernel>,
    sandbox: Arc<dyn SandboxRunner>,
    workspace_root: PathBuf,
    progress: ProgressReporter,
    cancel: CancellationToken,
    timeout: Duration,
}

impl WorkerAgent {
    #[instrument(
        skip(self),
        fields(worker_id = %self.id, execution_id = %self.spec.execution_id, command = %self.spec.command)
    )]
    pub async fn execute(self) -> Result<Value, ExecutionError> {
        let resource = self.handler.required_resource(&self.spec);
        let operation = ResourceUri::parse(&resource)
            .map_err(|error| ExecutionError::InvalidArgs(error.to_string()))?
            .operation()
            .to_owned();
        self.security
            .validate(&self.capability, &operation, &resource)?;

        let ctx = TaskContext {
            spec: self.spec,
            worker_id: self.id,
            progress: self.progress,
            cancel: self.cancel,
            capability: self.capability,
            sandbox: self.sandbox,
            workspace_root: self.workspace_root,
        };
        debug!("worker running task");
        match timeout(self.timeout, self.handler.run(&ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout(self.timeout)),
        }
    }
}

/// An accepted async command on its way through the pool and its workers.
pub(crate) struct ExecutionJob {
    pub spec: TaskSpec,
    pub handler: Arc<dyn TaskHandler>,
    pub parent: AgentId,
    pub authority: Capability,
    pub first_worker: AgentId,
    pub ticket: PoolTicket,
    pub cancel: CancellationToken,
    /// Flipped once a pool slot is held; the session reads it to tell
    /// pending executions from running ones.
    pub leased: Arc<AtomicBool>,
}

/// Final result of an execution, handed back to the owning session.
#[derive(Debug, Clone)]
pub(crate) struct ExecutionOutcome {
    pub record: ExecutionRecord,
    pub error_kind: Option<ErrorKind>,
}

/// Wait for a slot, then run up to `max_attempts` workers. The retry notice
/// for a failed first attempt is published here; the terminal event is left
/// to the session once the outcome is journaled.
pub(crate) async fn supervise_execution(
    services: Arc<RuntimeServices>,
    job: ExecutionJob,
) -> ExecutionOutcome {
    let ExecutionJob {
        spec,
        handler,
        parent,
        authority,
        first_worker,
        ticket,
        cancel,
        leased,
    } = job;

    let lease = match ticket {
        PoolTicket::Ready(lease) => lease,
        PoolTicket::Queued(request) => {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return finished(&spec, 0, Err(ExecutionError::Cancelled));
                }
                waited = request.wait() => match waited {
                    Ok(lease) => lease,
                    Err(error) => return finished(&spec, 0, Err(error.into())),
                },
            }
        }
    };
    leased.store(true, Ordering::Release);

    let progress = ProgressReporter::new(
        services.bus.clone(),
        spec.session_id.topic(),
        AgentAddress::Session(spec.session_id.clone()),
        spec.execution_id.clone(),
    );
    let max_attempts = services.worker.max_attempts();
    let mut worker_id = first_worker;
    let mut attempt = 0;
    let result = loop {
        attempt += 1;
        let result = run_attempt(
            &services, &spec, &handler, &parent, &authority, &worker_id, attempt, &cancel,
            &progress,
        )
        .await;
        match result {
            Ok(output) => break Ok(output),
            Err(error) => {
                let will_retry =
                    attempt < max_attempts && error.is_retryable() && !cancel.is_cancelled();
                if !will_retry {
                    break Err(error);
                }
                warn!(
                    execution_id = %spec.execution_id,
                    attempt,
                    %error,
                    "execution failed; retrying"
                );
                services.bus.publish(
                    &spec.session_id.topic(),
                    AgentAddress::Session(spec.session_id.clone()),
                    EventKind::ExecutionFailed {
                        execution_id: spec.execution_id.clone(),
                        error_kind: error.kind(),
                        error: error.to_string(),
                        will_retry: true,
                    },
                );
                worker_id = AgentId::default();
            }
        }
    };
    drop(lease);
    finished(&spec, attempt, result)
}

#[allow(clippy::too_many_arguments)]
async fn run_attempt(
    services: &RuntimeServices,
    spec: &TaskSpec,
    handler: &Arc<dyn TaskHandler>,
    parent: &AgentId,
    authority: &Capability,
    worker_id: &AgentId,
    attempt: u32,
    cancel: &CancellationToken,
    progress: &ProgressReporter,
) -> Result<Value, ExecutionError> {
    let resource = ResourceUri::parse(&handler.required_resource(spec))
        .map_err(|error| ExecutionError::InvalidArgs(error.to_string()))?;
    let mut constraints = CapabilityConstraints::operations([resource.operation()])
        .with_max_ttl_secs(services.worker.capability_ttl_secs());
    if !resource.segments().is_empty() {
        constraints = constraints.with_path_prefix(resource.path());
    }
    let capability =
        services
            .security
            .delegate(authority, &PrincipalId::from(worker_id), constraints)?;

    let mut record = AgentRecord::worker(worker_id.clone(), parent.clone(), spec.session_id.clone());
    record.capabilities.push(capability.id.clone());
    record
        .metadata
        .insert("execution_id".to_owned(), spec.execution_id.to_string());
    services.registry.register(record);

    let address = AgentAddress::Worker {
        session_id: spec.session_id.clone(),
        agent_id: worker_id.clone(),
    };
    services.bus.publish(
        &spec.session_id.topic(),
        address,
        EventKind::WorkerSpawned {
            execution_id: spec.execution_id.clone(),
            worker_id: worker_id.clone(),
            command: spec.command.clone(),
            attempt,
        },
    );
    info!(
        execution_id = %spec.execution_id,
        %worker_id,
        command = %spec.command,
        attempt,
        "worker spawned"
    );

    let worker = WorkerAgent {
        id: worker_id.clone(),
        spec: spec.clone(),
        handler: handler.clone(),
        capability,
        security: services.security.clone(),
        sandbox: services.sandbox.clone(),
        workspace_root: services.workspace_root.clone(),
        progress: progress.clone(),
        cancel: cancel.child_token(),
        timeout: services.worker.timeout(),
    };
    let mut join = tokio::spawn(worker.execute());
    let joined = tokio::select! {
        joined = &mut join => joined,
        _ = cancel.cancelled() => match timeout(services.worker.cancel_grace(), &mut join).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(%worker_id, "worker ignored cancellation; aborting");
                join.abort();
                Ok(Err(ExecutionError::Cancelled))
            }
        },
    };
    let result = match joined {
        Ok(result) => result,
        Err(error) if error.is_panic() => Err(ExecutionError::Crashed(crate::panic_message(
            error.into_panic(),
        ))),
        Err(_) => Err(ExecutionError::Cancelled),
    };

    let final_state = if result.is_ok() {
        AgentState::Terminated
    } else {
        AgentState::Error
    };
    services.registry.terminate(worker_id, final_state);
    result
}

fn finished(
    spec: &TaskSpec,
    attempts: u32,
    result: Result<Value, ExecutionError>,
) -> ExecutionOutcome {
    let (status, output, error) = match result {
        Ok(output) => (ExecutionStatus::Completed, Some(output), None),
        Err(error) => (ExecutionStatus::Failed, None, Some(error)),
    };
    ExecutionOutcome {
        error_kind: error.as_ref().map(ExecutionError::kind),
        record: ExecutionRecord {
            execution_id: spec.execution_id.clone(),
            command: spec.command.clone(),
            status,
            attempts,
            output,
            error: error.map(|error| error.to_string()),
            finished_at: Utc::now(),
        },
    }
}

impl ExecutionOutcome {
    /// The event that closes out this execution on the session topic.
    pub fn terminal_event(&self) -> EventKind {
        let record = &self.record;
        match (&record.output, &record.error) {
            (Some(output), None) => EventKind::ExecutionCompleted {
                execution_id: record.execution_id.clone(),
                output: output.clone(),
            },
            (_, error) => EventKind::ExecutionFailed {
                execution_id: record.execution_id.clone(),
                error_kind: self.error_kind.unwrap_or(ErrorKind::Execution),
                error: error.clone().unwrap_or_default(),
                will_retry: false,
            },
        }
    }
}
