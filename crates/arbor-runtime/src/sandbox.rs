//! Host command execution for workers.
//!
//! A worker never reaches the host directly: it hands the sandbox its own
//! delegated capability, and the sandbox re-checks `res://exec/run/<program>`
//! against it before spawning anything. Programs run without a shell, with a
//! cleared environment, inside the owning session's workspace.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arbor_protocol::{Capability, ExecutionId, ResourceKind, ResourceUri, SessionId};
use arbor_security::SecurityKernel;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::ExecutionError;

const SEARCH_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub max_runtime: Duration,
    pub max_output_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_runtime: Duration::from_secs(30),
            max_output_bytes: 64 * 1024,
        }
    }
}

/// One program run on behalf of a worker.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub session_id: SessionId,
    pub execution_id: ExecutionId,
    /// The worker's delegated capability; it must cover the program.
    pub capability: Capability,
    /// Bare program name, looked up on a fixed search path.
    pub program: String,
    pub args: Vec<String>,
    /// The session workspace. Nothing runs outside it.
    pub workspace: PathBuf,
    /// Working directory relative to `workspace`.
    pub workdir: PathBuf,
    pub limits: SandboxLimits,
}

impl SandboxRequest {
    /// The exec resource this run touches.
    pub fn resource(&self) -> Result<ResourceUri, ExecutionError> {
        if self.program.contains('/') {
            return Err(ExecutionError::InvalidArgs(format!(
                "program must be a bare name: {}",
                self.program
            )));
        }
        ResourceUri::new("res", ResourceKind::Exec, "run", &self.program)
            .map_err(|error| ExecutionError::InvalidArgs(error.to_string()))
    }

    /// `workspace/workdir`, refusing anything that climbs out of the workspace.
    pub fn resolved_workdir(&self) -> Result<PathBuf, ExecutionError> {
        let escapes = self
            .workdir
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(ExecutionError::InvalidArgs(format!(
                "working directory leaves the session workspace: {}",
                self.workdir.display()
            )));
        }
        Ok(self.workspace.join(&self.workdir))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxExecution {
    pub program: String,
    pub workdir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(&self, request: SandboxRequest) -> Result<SandboxExecution, ExecutionError>;
}

/// Runs programs on the local host. A program must be both covered by the
/// caller's capability and on the host allow-list. The child is killed if the
/// run times out or is dropped.
pub struct LocalSandboxRunner {
    security: Arc<SecurityKernel>,
    allowed_programs: Vec<String>,
}

impl std::fmt::Debug for LocalSandboxRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSandboxRunner")
            .field("allowed_programs", &self.allowed_programs)
            .finish_non_exhaustive()
    }
}

impl LocalSandboxRunner {
    pub fn new(security: Arc<SecurityKernel>, allowed_programs: Vec<String>) -> Self {
        Self {
            security,
            allowed_programs,
        }
    }

    fn authorize(&self, request: &SandboxRequest) -> Result<PathBuf, ExecutionError> {
        let resource = request.resource()?;
        self.security
            .validate(&request.capability, resource.operation(), &resource.to_string())?;
        if !self.allowed_programs.iter().any(|allowed| *allowed == request.program) {
            warn!("program is not on the host allow-list");
            return Err(ExecutionError::InvalidArgs(format!(
                "program not allowed on this host: {}",
                request.program
            )));
        }
        request.resolved_workdir()
    }

    fn lossy(mut output: Vec<u8>, max_output_bytes: usize) -> String {
        output.truncate(max_output_bytes);
        String::from_utf8_lossy(&output).into_owned()
    }
}

async fn prepare(workdir: &Path) -> Result<(), ExecutionError> {
    fs::create_dir_all(workdir).await.map_err(|error| {
        ExecutionError::failed(format!("workspace unavailable at {}: {error}", workdir.display()))
    })
}

#[async_trait]
impl SandboxRunner for LocalSandboxRunner {
    #[instrument(
        skip(self, request),
        fields(
            session_id = %request.session_id,
            execution_id = %request.execution_id,
            program = %request.program,
        )
    )]
    async fn run(&self, request: SandboxRequest) -> Result<SandboxExecution, ExecutionError> {
        let workdir = self.authorize(&request)?;
        prepare(&workdir).await?;

        let started_at = Utc::now();
        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .current_dir(&workdir)
            .env_clear()
            .env("PATH", SEARCH_PATH)
            .env("ARBOR_SESSION_ID", request.session_id.as_str())
            .env("ARBOR_EXECUTION_ID", request.execution_id.to_string())
            .kill_on_drop(true);

        let finished = timeout(request.limits.max_runtime, command.output()).await;
        let ended_at = Utc::now();
        let mut execution = SandboxExecution {
            program: request.program.clone(),
            workdir: request.workdir.clone(),
            started_at,
            ended_at,
            duration_ms: (ended_at - started_at).num_milliseconds(),
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
        };
        match finished {
            Ok(output) => {
                let output = output.map_err(|error| {
                    ExecutionError::failed(format!("failed to run {}: {error}", request.program))
                })?;
                execution.exit_code = output.status.code().unwrap_or(-1);
                execution.stdout = Self::lossy(output.stdout, request.limits.max_output_bytes);
                execution.stderr = Self::lossy(output.stderr, request.limits.max_output_bytes);
                debug!(exit_code = execution.exit_code, "program finished");
            }
            Err(_) => {
                warn!(limit = ?request.limits.max_runtime, "program timed out");
                execution.stderr = format!("timed out after {:?}", request.limits.max_runtime);
                execution.timed_out = true;
            }
        }
        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use arbor_protocol::{AuditSink, CapabilityConstraints, PrincipalId, SystemClock};
    use arbor_security::{SecurityConfig, SecurityError};

    use super::*;

    struct Host {
        security: Arc<SecurityKernel>,
        workspace: PathBuf,
    }

    impl Host {
        fn new(name: &str) -> Self {
            let audit: Arc<dyn AuditSink> = Arc::new(arbor_events::EventBus::default());
            Self {
                security: Arc::new(SecurityKernel::new(
                    SecurityConfig::default(),
                    Arc::new(SystemClock),
                    audit,
                )),
                workspace: crate::testing::unique_test_root(name).join("workspaces/S1"),
            }
        }

        fn runner(&self, programs: &[&str]) -> LocalSandboxRunner {
            LocalSandboxRunner::new(
                self.security.clone(),
                programs.iter().map(|program| (*program).to_owned()).collect(),
            )
        }

        fn capability(&self, scope: &str) -> Capability {
            self.security
                .grant(
                    scope,
                    &PrincipalId::from_string("worker:w1"),
                    CapabilityConstraints::operations(["run"]),
                    None,
                )
                .unwrap()
        }

        fn request(&self, capability: &Capability, program: &str, args: &[&str]) -> SandboxRequest {
            SandboxRequest {
                session_id: SessionId::from_string("S1"),
                execution_id: ExecutionId::from_string("E1"),
                capability: capability.clone(),
                program: program.to_owned(),
                args: args.iter().map(|arg| (*arg).to_owned()).collect(),
                workspace: self.workspace.clone(),
                workdir: PathBuf::new(),
                limits: SandboxLimits::default(),
            }
        }
    }

    #[tokio::test]
    async fn runs_inside_the_session_workspace() -> Result<()> {
        let host = Host::new("sandbox-run");
        let capability = host.capability("res://exec/run/echo");
        let mut request = host.request(&capability, "echo", &["hello sandbox"]);
        request.workdir = PathBuf::from("scratch");
        request.limits.max_output_bytes = 5;

        let execution = host.runner(&["echo"]).run(request).await?;
        assert_eq!(execution.exit_code, 0);
        assert_eq!(execution.stdout, "hello");
        assert_eq!(execution.workdir, PathBuf::from("scratch"));
        assert!(host.workspace.join("scratch").is_dir());
        Ok(())
    }

    #[tokio::test]
    async fn programs_outside_the_capability_are_denied() {
        let host = Host::new("sandbox-scope");
        let capability = host.capability("res://exec/run/echo");
        let runner = host.runner(&["echo", "ls"]);

        let result = runner.run(host.request(&capability, "ls", &["/"])).await;
        assert!(matches!(
            result,
            Err(ExecutionError::Denied(SecurityError::ResourceMismatch { .. }))
        ));
        let result = runner
            .run(host.request(&capability, "/bin/echo", &["x"]))
            .await;
        assert!(matches!(result, Err(ExecutionError::InvalidArgs(_))));
        assert!(!host.workspace.exists());
    }

    #[tokio::test]
    async fn host_allow_list_applies_on_top_of_the_capability() {
        let host = Host::new("sandbox-allow");
        let capability = host.capability("res://exec/run");
        let result = host
            .runner(&["echo"])
            .run(host.request(&capability, "rm", &["-rf", "/"]))
            .await;
        assert!(matches!(result, Err(ExecutionError::InvalidArgs(_))));
    }

    #[tokio::test]
    async fn working_directory_cannot_leave_the_workspace() {
        let host = Host::new("sandbox-escape");
        let capability = host.capability("res://exec/run/echo");
        let runner = host.runner(&["echo"]);
        for workdir in ["../other-session", "/etc", "a/../../b"] {
            let mut request = host.request(&capability, "echo", &["x"]);
            request.workdir = PathBuf::from(workdir);
            assert!(
                matches!(runner.run(request).await, Err(ExecutionError::InvalidArgs(_))),
                "{workdir} was accepted"
            );
        }
    }

    #[tokio::test]
    async fn slow_programs_time_out() -> Result<()> {
        let host = Host::new("sandbox-timeout");
        let capability = host.capability("res://exec/run/sleep");
        let mut request = host.request(&capability, "sleep", &["5"]);
        request.limits.max_runtime = Duration::from_millis(100);

        let execution = host.runner(&["sleep"]).run(request).await?;
        assert!(execution.timed_out);
        assert_eq!(execution.exit_code, -1);
        Ok(())
    }
}
