//! Worker task handlers and the static command routing table.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arbor_protocol::{AgentId, Capability, CommandMode, TaskSpec};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{Value, json};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::ExecutionError;
use crate::sandbox::{SandboxLimits, SandboxRequest, SandboxRunner};
use crate::worker::ProgressReporter;

/// Commands the session answers itself, without spawning a worker.
pub const SYNC_COMMANDS: [&str; 9] = [
    "ping",
    "status",
    "state.get",
    "state.set",
    "state.remove",
    "state.list",
    "model.switch",
    "executions",
    "cancel",
];

/// Sync commands that only read session state. They are answered without
/// touching the journal, so polling them costs nothing at recovery.
pub const READ_ONLY_COMMANDS: [&str; 5] =
    ["ping", "status", "state.get", "state.list", "executions"];

pub fn is_read_only(command: &str) -> bool {
    READ_ONLY_COMMANDS.contains(&command)
}

/// Everything a running task may touch. `spec.context` is a copy of the
/// session state taken when the worker was spawned.
pub struct TaskContext {
    pub spec: TaskSpec,
    pub worker_id: AgentId,
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
    /// The worker's own delegated capability.
    pub capability: Capability,
    pub sandbox: Arc<dyn SandboxRunner>,
    pub workspace_root: PathBuf,
}

impl TaskContext {
    pub fn args(&self) -> &Value {
        &self.spec.args
    }

    /// `<root>/workspaces/<session>`: where host programs for this session run.
    pub fn session_workspace(&self) -> PathBuf {
        self.workspace_root
            .join("workspaces")
            .join(self.spec.session_id.as_str())
    }

    /// Fails with `Cancelled` once cancellation has been requested.
    pub fn checkpoint(&self) -> Result<(), ExecutionError> {
        if self.cancel.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Resource a worker must hold a capability for before running this task.
    fn required_resource(&self, _spec: &TaskSpec) -> String {
        format!("res://tool/execute/{}", self.name())
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Value, ExecutionError>;
}

#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: IndexMap<String, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TaskRegistry {
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.name().to_owned(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Static routing: the session's own commands are sync, registered task
    /// handlers are async, anything else is unknown.
    pub fn command_mode(&self, command: &str) -> Option<CommandMode> {
        if SYNC_COMMANDS.contains(&command) {
            Some(CommandMode::Sync)
        } else if self.handlers.contains_key(command) {
            Some(CommandMode::Async)
        } else {
            None
        }
    }

    pub fn with_builtin_tasks() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(EchoTask));
        registry.register(Arc::new(CalculateTask));
        registry.register(Arc::new(LongRunningTask));
        registry.register(Arc::new(ShellExecTask));
        registry.register(Arc::new(ExportTask));
        registry
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EchoTask;

#[async_trait]
impl TaskHandler for EchoTask {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Value, ExecutionError> {
        Ok(ctx.args().clone())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CalculateTask;

impl CalculateTask {
    fn numbers(args: &Value) -> Result<Vec<f64>, ExecutionError> {
        let raw = args
            .get("numbers")
            .and_then(Value::as_array)
            .ok_or_else(|| ExecutionError::InvalidArgs("calculate requires `numbers`".into()))?;
        raw.iter()
            .map(|value| {
                value.as_f64().ok_or_else(|| {
                    ExecutionError::InvalidArgs(format!("`{value}` is not a number"))
                })
            })
            .collect()
    }

    pub fn compute(operation: &str, numbers: &[f64]) -> Result<Value, ExecutionError> {
        if numbers.is_empty() {
            return Err(ExecutionError::InvalidArgs("no numbers provided".into()));
        }
        let count = numbers.len() as f64;
        let sum: f64 = numbers.iter().sum();
        let mut sorted = numbers.to_vec();
        sorted.sort_by(f64::total_cmp);
        let result = match operation {
            "sum" => json!(sum),
            "mean" => json!(sum / count),
            "median" => {
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    json!((sorted[mid - 1] + sorted[mid]) / 2.0)
                } else {
                    json!(sorted[mid])
                }
            }
            "mode" => {
                let mut counts: IndexMap<u64, (f64, usize)> = IndexMap::new();
                for number in numbers {
                    counts.entry(number.to_bits()).or_insert((*number, 0)).1 += 1;
                }
                let best = counts.values().map(|(_, n)| *n).max().unwrap_or(0);
                let modes: Vec<f64> = counts
                    .values()
                    .filter(|(_, n)| *n == best)
                    .map(|(value, _)| *value)
                    .collect();
                match modes.as_slice() {
                    [single] => json!(single),
                    _ => json!(modes),
                }
            }
            "min" => json!(sorted[0]),
            "max" => json!(sorted[sorted.len() - 1]),
            "std_dev" => {
                let mean = sum / count;
                let variance = numbers.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / count;
                json!(variance.sqrt())
            }
            other => {
                return Err(ExecutionError::InvalidArgs(format!(
                    "unknown operation `{other}`"
                )));
            }
        };
        Ok(result)
    }
}

#[async_trait]
impl TaskHandler for CalculateTask {
    fn name(&self) -> &str {
        "calculate"
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Value, ExecutionError> {
        let operation = ctx
            .args()
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("sum");
        let numbers = Self::numbers(ctx.args())?;
        let result = Self::compute(operation, &numbers)?;
        Ok(json!({ "operation": operation, "count": numbers.len(), "result": result }))
    }
}

/// Sleeps through `steps` steps of `step_ms`, reporting progress after each
/// and stopping promptly when cancelled.
#[derive(Debug, Clone, Copy)]
pub struct LongRunningTask;

#[async_trait]
impl TaskHandler for LongRunningTask {
    fn name(&self) -> &str {
        "long_running"
    }

    #[instrument(skip_all, fields(execution_id = %ctx.spec.execution_id))]
    async fn run(&self, ctx: &TaskContext) -> Result<Value, ExecutionError> {
        let steps = ctx
            .args()
            .get("steps")
            .and_then(Value::as_u64)
            .unwrap_or(5)
            .max(1);
        let step = Duration::from_millis(
            ctx.args()
                .get("step_ms")
                .and_then(Value::as_u64)
                .unwrap_or(100),
        );
        if ctx.args().get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(ExecutionError::failed("long_running asked to fail"));
        }

        for index in 1..=steps {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(ExecutionError::Cancelled),
                _ = tokio::time::sleep(step) => {}
            }
            let percent = u8::try_from(index * 100 / steps).unwrap_or(100);
            ctx.progress
                .report(percent, format!("Processing step {index} of {steps}"));
        }
        debug!(steps, "long running task finished");
        Ok(json!({ "completed": true, "steps": steps }))
    }
}

/// Runs one host program through the sandbox. The worker's capability is
/// scoped to `res://exec/run/<program>`, so a worker spawned for `echo`
/// cannot be talked into running anything else.
#[derive(Debug, Clone, Copy)]
pub struct ShellExecTask;

impl ShellExecTask {
    fn program(args: &Value) -> Option<&str> {
        args.get("command").and_then(Value::as_str)
    }
}

#[async_trait]
impl TaskHandler for ShellExecTask {
    fn name(&self) -> &str {
        "shell.exec"
    }

    fn required_resource(&self, spec: &TaskSpec) -> String {
        match Self::program(&spec.args) {
            Some(program) => format!("res://exec/run/{program}"),
            None => "res://exec/run".to_owned(),
        }
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Value, ExecutionError> {
        let program = Self::program(ctx.args())
            .ok_or_else(|| ExecutionError::InvalidArgs("shell.exec requires `command`".into()))?
            .to_owned();
        let args = ctx
            .args()
            .get("args")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|value| value.as_str().map(ToOwned::to_owned))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let workdir = ctx
            .args()
            .get("cwd")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_default();

        ctx.checkpoint()?;
        let execution = ctx
            .sandbox
            .run(SandboxRequest {
                session_id: ctx.spec.session_id.clone(),
                execution_id: ctx.spec.execution_id.clone(),
                capability: ctx.capability.clone(),
                program,
                args,
                workspace: ctx.session_workspace(),
                workdir,
                limits: SandboxLimits::default(),
            })
            .await?;

        if execution.timed_out {
            return Err(ExecutionError::failed(execution.stderr));
        }
        if execution.exit_code != 0 {
            return Err(ExecutionError::failed(format!(
                "{} failed (exit={}): {}",
                execution.program, execution.exit_code, execution.stderr
            )));
        }
        Ok(json!({
            "stdout": execution.stdout,
            "stderr": execution.stderr,
            "exit_code": execution.exit_code,
            "duration_ms": execution.duration_ms,
            "cwd": execution.workdir.to_string_lossy(),
        }))
    }
}

/// Writes the session-state copy the worker was spawned with to
/// `<root>/exports/<session>/<execution>.json`.
#[derive(Debug, Clone, Copy)]
pub struct ExportTask;

#[async_trait]
impl TaskHandler for ExportTask {
    fn name(&self) -> &str {
        "export"
    }

    fn required_resource(&self, spec: &TaskSpec) -> String {
        format!("res://export/write/{}", spec.session_id)
    }

    async fn run(&self, ctx: &TaskContext) -> Result<Value, ExecutionError> {
        let dir = ctx
            .workspace_root
            .join("exports")
            .join(ctx.spec.session_id.as_str());
        let path = dir.join(format!("{}.json", ctx.spec.execution_id));
        let bytes = serde_json::to_vec_pretty(&ctx.spec.context)
            .map_err(|error| ExecutionError::failed(error.to_string()))?;
        ctx.progress.report(10, "writing export");
        ctx.checkpoint()?;

        fs::create_dir_all(&dir)
            .await
            .map_err(|error| ExecutionError::failed(format!("cannot create {dir:?}: {error}")))?;
        fs::write(&path, &bytes)
            .await
            .map_err(|error| ExecutionError::failed(format!("cannot write {path:?}: {error}")))?;
        Ok(json!({
            "path": path.to_string_lossy(),
            "bytes": bytes.len(),
            "version": ctx.spec.context.version,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_match_reference_values() {
        let numbers = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(CalculateTask::compute("sum", &numbers).unwrap(), json!(40.0));
        assert_eq!(CalculateTask::compute("mean", &numbers).unwrap(), json!(5.0));
        assert_eq!(CalculateTask::compute("median", &numbers).unwrap(), json!(4.5));
        assert_eq!(CalculateTask::compute("mode", &numbers).unwrap(), json!(4.0));
        assert_eq!(CalculateTask::compute("min", &numbers).unwrap(), json!(2.0));
        assert_eq!(CalculateTask::compute("max", &numbers).unwrap(), json!(9.0));
        assert_eq!(CalculateTask::compute("std_dev", &numbers).unwrap(), json!(2.0));
        assert_eq!(
            CalculateTask::compute("median", &[3.0, 1.0, 2.0]).unwrap(),
            json!(2.0)
        );
        assert_eq!(
            CalculateTask::compute("mode", &[1.0, 2.0]).unwrap(),
            json!([1.0, 2.0])
        );
    }

    #[test]
    fn calculate_rejects_empty_and_unknown() {
        assert!(matches!(
            CalculateTask::compute("mean", &[]),
            Err(ExecutionError::InvalidArgs(_))
        ));
        assert!(matches!(
            CalculateTask::compute("variance", &[1.0]),
            Err(ExecutionError::InvalidArgs(_))
        ));
        assert!(CalculateTask::numbers(&json!({"numbers": [1, "two"]})).is_err());
    }

    #[test]
    fn command_modes_are_static() {
        let registry = TaskRegistry::with_builtin_tasks();
        assert_eq!(registry.command_mode("ping"), Some(CommandMode::Sync));
        assert_eq!(registry.command_mode("model.switch"), Some(CommandMode::Sync));
        assert_eq!(registry.command_mode("calculate"), Some(CommandMode::Async));
        assert_eq!(registry.command_mode("export"), Some(CommandMode::Async));
        assert_eq!(registry.command_mode("rm -rf"), None);

        let mut spec = TaskSpec::new(
            "shell.exec",
            json!({"command": "echo"}),
            arbor_protocol::SessionState::new(arbor_protocol::SessionId::from_string("S1")),
        );
        let export = registry.get("export").unwrap();
        assert_eq!(export.required_resource(&spec), "res://export/write/S1");
        let echo = registry.get("echo").unwrap();
        assert_eq!(echo.required_resource(&spec), "res://tool/execute/echo");
        let shell = registry.get("shell.exec").unwrap();
        assert_eq!(shell.required_resource(&spec), "res://exec/run/echo");
        spec.args = json!({});
        assert_eq!(shell.required_resource(&spec), "res://exec/run");
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec!["echo", "calculate", "long_running", "shell.exec", "export"]
        );
    }
}
