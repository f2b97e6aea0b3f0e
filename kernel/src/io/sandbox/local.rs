//! Local process backend for development and tests.
//!
//! Runs invocations as child processes inside the workspace directory with a
//! cleared environment and a virtual-memory ulimit. It cannot enforce the CPU
//! share or cut network access; those ceilings need the Docker backend.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{EnvironmentSpec, RawRun, SandboxBackend};
use crate::core::invocation::Invocation;
use crate::error::SandboxFault;
use crate::io::process::run_command_with_timeout;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Default)]
pub struct ProcessBackend {
    workspace: Option<PathBuf>,
    memory_limit_kb: u64,
    output_limit_bytes: usize,
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, invocation: &Invocation) -> (String, Option<String>) {
        let limit = format!("ulimit -v {} 2>/dev/null; ", self.memory_limit_kb);
        match invocation {
            Invocation::Shell(command) => (format!("{limit}{command}"), None),
            Invocation::Python(code) => (
                format!("{limit}exec python3 -c \"$1\""),
                Some(code.clone()),
            ),
        }
    }
}

impl SandboxBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn start(&mut self, spec: &EnvironmentSpec) -> Result<(), SandboxFault> {
        std::fs::create_dir_all(&spec.workspace_root).map_err(|e| {
            SandboxFault::Start(format!(
                "create workspace {}: {e}",
                spec.workspace_root.display()
            ))
        })?;
        if !spec.network {
            warn!("process backend cannot disable network access");
        }
        self.workspace = Some(spec.workspace_root.clone());
        self.memory_limit_kb = (spec.memory_limit_bytes / 1024).max(1);
        self.output_limit_bytes = spec.output_limit_bytes;
        info!(workspace = %spec.workspace_root.display(), "process sandbox ready");
        Ok(())
    }

    fn run(&mut self, invocation: &Invocation, timeout: Duration) -> Result<RawRun, SandboxFault> {
        let workspace = self
            .workspace
            .as_ref()
            .ok_or_else(|| SandboxFault::Exec("process sandbox not started".into()))?;
        let (script, arg) = self.script(invocation);

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        if let Some(arg) = arg {
            cmd.arg("sh").arg(arg);
        }
        cmd.current_dir(workspace)
            .env_clear()
            .env(
                "PATH",
                std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
            )
            .env("HOME", workspace)
            .env("LANG", "C.UTF-8")
            .env("PYTHONDONTWRITEBYTECODE", "1");

        let output = run_command_with_timeout(cmd, None, timeout, self.output_limit_bytes)
            .map_err(|e| SandboxFault::Unavailable(format!("spawn sh: {e:#}")))?;
        debug!(exit_code = ?output.status.code(), timed_out = output.timed_out, "process finished");
        Ok(RawRun {
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            exit_code: output.status.code(),
            timed_out: output.timed_out,
            elapsed: output.elapsed,
        })
    }

    fn destroy(&mut self) -> Result<(), SandboxFault> {
        self.workspace = None;
        Ok(())
    }
}
