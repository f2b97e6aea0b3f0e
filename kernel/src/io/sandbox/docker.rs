//! Resident Docker container backend.
//!
//! One container runs `sleep infinity` with the workspace bind-mounted at
//! `/workspace`; each invocation is a `docker exec` wrapped in the
//! container's own `timeout -s KILL` so runaway commands die inside the
//! container even if the host-side client is killed first.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::{debug, info, warn};

use super::{EnvironmentSpec, RawRun, SandboxBackend};
use crate::core::invocation::Invocation;
use crate::error::SandboxFault;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Mount point of the workspace inside the container.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Exit status `docker exec` uses for its own failures.
const DOCKER_CLI_FAILURE: i32 = 125;
/// Exit status of `timeout -s KILL` when it had to kill the command.
const KILLED_BY_TIMEOUT: i32 = 137;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(300);
const EXEC_GRACE: Duration = Duration::from_secs(10);
const CONTROL_OUTPUT_LIMIT: usize = 64 * 1024;

pub struct DockerBackend {
    program: String,
    container: Option<String>,
    output_limit_bytes: usize,
}

impl DockerBackend {
    pub fn new() -> Self {
        Self {
            program: "docker".to_string(),
            container: None,
            output_limit_bytes: 100_000,
        }
    }

    /// Use a different CLI binary (e.g. `podman`).
    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    fn command(&self) -> Command {
        Command::new(&self.program)
    }

    fn control(&self, cmd: Command, what: &str) -> Result<CommandOutput, SandboxFault> {
        run_command_with_timeout(cmd, None, CONTROL_TIMEOUT, CONTROL_OUTPUT_LIMIT).map_err(|e| {
            SandboxFault::Unavailable(format!("{what}: {} ({e:#})", self.program))
        })
    }
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments for `docker run` creating the resident container.
pub fn run_args(spec: &EnvironmentSpec, name: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        name.into(),
        "--memory".into(),
        spec.memory_limit.clone(),
        "--cpus".into(),
        spec.cpus.to_string(),
        "--pids-limit".into(),
        "256".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
    ];
    if !spec.network {
        args.push("--network=none".into());
    }
    args.extend([
        "-v".into(),
        format!(
            "{}:{CONTAINER_WORKSPACE}",
            spec.workspace_root.to_string_lossy()
        ),
        "-w".into(),
        CONTAINER_WORKSPACE.into(),
        spec.image.clone(),
        "sleep".into(),
        "infinity".into(),
    ]);
    args
}

/// Arguments for `docker exec` running one invocation.
pub fn exec_args(container: &str, invocation: &Invocation, timeout: Duration) -> Vec<String> {
    let secs = timeout.as_secs().max(1).to_string();
    let mut args: Vec<String> = vec![
        "exec".into(),
        "-w".into(),
        CONTAINER_WORKSPACE.into(),
        container.into(),
        "timeout".into(),
        "-s".into(),
        "KILL".into(),
        secs,
    ];
    match invocation {
        Invocation::Shell(command) => args.extend(["sh".into(), "-c".into(), command.clone()]),
        Invocation::Python(code) => args.extend(["python3".into(), "-c".into(), code.clone()]),
    }
    args
}

fn container_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!(
        "kernel-sandbox-{}-{}",
        std::process::id(),
        suffix.to_lowercase()
    )
}

impl SandboxBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn start(&mut self, spec: &EnvironmentSpec) -> Result<(), SandboxFault> {
        std::fs::create_dir_all(&spec.workspace_root).map_err(|e| {
            SandboxFault::Start(format!(
                "create workspace {}: {e}",
                spec.workspace_root.display()
            ))
        })?;
        let workspace: PathBuf = spec
            .workspace_root
            .canonicalize()
            .unwrap_or_else(|_| spec.workspace_root.clone());
        let spec = EnvironmentSpec {
            workspace_root: workspace,
            ..spec.clone()
        };

        let name = container_name();
        let mut cmd = self.command();
        cmd.args(run_args(&spec, &name));
        let output = self.control(cmd, "docker run")?;
        if !output.status.success() {
            return Err(SandboxFault::Start(output.stderr_lossy().trim().to_string()));
        }
        let id = output.stdout_lossy().trim().to_string();
        if id.is_empty() {
            return Err(SandboxFault::Start("docker run printed no container id".into()));
        }
        info!(container = %name, image = %spec.image, "container started");
        self.output_limit_bytes = spec.output_limit_bytes;
        self.container = Some(id);
        Ok(())
    }

    fn run(&mut self, invocation: &Invocation, timeout: Duration) -> Result<RawRun, SandboxFault> {
        let container = self
            .container
            .as_deref()
            .ok_or_else(|| SandboxFault::Exec("container not started".into()))?;
        let mut cmd = self.command();
        cmd.args(exec_args(container, invocation, timeout));
        let output = run_command_with_timeout(
            cmd,
            None,
            timeout + EXEC_GRACE,
            self.output_limit_bytes,
        )
        .map_err(|e| SandboxFault::Unavailable(format!("docker exec: {e:#}")))?;

        let stderr = output.stderr_lossy();
        let code = output.status.code();
        if code == Some(DOCKER_CLI_FAILURE)
            || stderr.contains("No such container")
            || stderr.contains("is not running")
        {
            return Err(SandboxFault::Exec(stderr.trim().to_string()));
        }

        let timed_out =
            output.timed_out || (code == Some(KILLED_BY_TIMEOUT) && output.elapsed >= timeout);
        debug!(exit_code = ?code, timed_out, "docker exec finished");
        Ok(RawRun {
            stdout: output.stdout_lossy(),
            stderr,
            exit_code: code,
            timed_out,
            elapsed: output.elapsed,
        })
    }

    fn destroy(&mut self) -> Result<(), SandboxFault> {
        let Some(id) = self.container.take() else {
            return Ok(());
        };
        let mut cmd = self.command();
        cmd.args(["rm", "-f", id.as_str()]);
        match self.control(cmd, "docker rm") {
            Ok(output) if output.status.success() => {
                info!(container = %id, "container removed");
            }
            Ok(output) => {
                warn!(container = %id, stderr = %output.stderr_lossy().trim(), "docker rm failed");
            }
            Err(e) => warn!(container = %id, err = %e, "docker rm failed"),
        }
        Ok(())
    }
}
