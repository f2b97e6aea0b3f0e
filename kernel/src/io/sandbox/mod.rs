//! Sandbox manager: one resident execution environment shared by all tasks.
//!
//! The environment is created lazily on the first execution, reused across
//! steps and tasks, and destroyed exactly once at shutdown (or on an explicit
//! reset). Executions are serialized through a single gate, so concurrent
//! tasks take turns.
//!
//! Backends ([`SandboxBackend`]) only know how to start, run and destroy; the
//! manager owns the lifecycle state machine and maps raw runs to
//! [`ExecutionResult`]s:
//!
//! ```text
//! CREATED --execute--> RUNNING <--> EXECUTING
//!    |                    |
//!    +------shutdown------+--> STOPPED
//! ```

pub mod docker;
pub mod local;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::invocation::Invocation;
use crate::core::types::ExecutionResult;
use crate::error::SandboxFault;
use crate::io::config::{SandboxBackendKind, SandboxConfig};

pub use docker::DockerBackend;
pub use local::ProcessBackend;

/// Exit code reported when the wall-clock limit kills a command.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when a command dies from a signal without an exit status.
pub const SIGNAL_EXIT_CODE: i32 = 137;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Created,
    Running,
    Executing,
    Stopped,
}

/// Resource ceilings and mounts fixed at environment creation.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentSpec {
    pub workspace_root: PathBuf,
    pub image: String,
    pub memory_limit: String,
    pub memory_limit_bytes: u64,
    pub cpus: f64,
    pub network: bool,
    pub output_limit_bytes: usize,
}

impl EnvironmentSpec {
    pub fn from_config(workspace_root: &Path, cfg: &SandboxConfig) -> Result<Self> {
        Ok(Self {
            workspace_root: workspace_root.to_path_buf(),
            image: cfg.image.clone(),
            memory_limit: cfg.memory_limit.clone(),
            memory_limit_bytes: cfg.memory_limit_bytes().context("sandbox.memory_limit")?,
            cpus: cfg.cpus,
            network: cfg.network,
            output_limit_bytes: cfg.output_limit_bytes,
        })
    }
}

/// What a backend observed for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRun {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// Execution environment implementation.
pub trait SandboxBackend: Send {
    fn name(&self) -> &'static str;

    /// Create the environment with the ceilings in `spec`.
    fn start(&mut self, spec: &EnvironmentSpec) -> Result<(), SandboxFault>;

    /// Run one invocation. Non-zero exits are results, not faults.
    fn run(&mut self, invocation: &Invocation, timeout: Duration) -> Result<RawRun, SandboxFault>;

    /// Tear the environment down.
    fn destroy(&mut self) -> Result<(), SandboxFault>;
}

pub struct SandboxManager {
    spec: EnvironmentSpec,
    timeout: Duration,
    gate: Mutex<Box<dyn SandboxBackend>>,
    state: Mutex<SandboxState>,
    teardowns: AtomicU32,
}

impl SandboxManager {
    pub fn new(spec: EnvironmentSpec, timeout: Duration, backend: Box<dyn SandboxBackend>) -> Self {
        Self {
            spec,
            timeout,
            gate: Mutex::new(backend),
            state: Mutex::new(SandboxState::Created),
            teardowns: AtomicU32::new(0),
        }
    }

    /// Build the backend selected in config for `workspace_root`.
    pub fn from_config(workspace_root: &Path, cfg: &SandboxConfig) -> Result<Self> {
        let spec = EnvironmentSpec::from_config(workspace_root, cfg)?;
        let backend: Box<dyn SandboxBackend> = match cfg.backend {
            SandboxBackendKind::Docker => Box::new(DockerBackend::new()),
            SandboxBackendKind::Process => Box::new(ProcessBackend::new()),
        };
        Ok(Self::new(spec, cfg.timeout(), backend))
    }

    pub fn state(&self) -> SandboxState {
        *lock(&self.state)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of times an environment has been destroyed.
    pub fn teardown_count(&self) -> u32 {
        self.teardowns.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: SandboxState) {
        *lock(&self.state) = next;
    }

    /// Run `invocation` for `step_id` under the hard wall-clock timeout.
    #[instrument(skip_all, fields(step_id = step_id, kind = invocation.kind()))]
    pub fn execute(
        &self,
        step_id: u32,
        invocation: &Invocation,
    ) -> Result<ExecutionResult, SandboxFault> {
        let mut backend = lock(&self.gate);

        match self.state() {
            SandboxState::Stopped => return Err(SandboxFault::Stopped),
            SandboxState::Created => {
                info!(backend = backend.name(), "starting sandbox environment");
                backend.start(&self.spec)?;
                self.set_state(SandboxState::Running);
            }
            SandboxState::Running | SandboxState::Executing => {}
        }

        self.set_state(SandboxState::Executing);
        let outcome = backend.run(invocation, self.timeout);
        match outcome {
            Ok(raw) => {
                self.set_state(SandboxState::Running);
                Ok(self.to_result(step_id, raw))
            }
            Err(fault) => {
                warn!(err = %fault, "sandbox fault, discarding environment");
                if let Err(e) = backend.destroy() {
                    warn!(err = %e, "destroy after fault failed");
                }
                self.teardowns.fetch_add(1, Ordering::SeqCst);
                self.set_state(SandboxState::Created);
                Err(fault)
            }
        }
    }

    fn to_result(&self, step_id: u32, raw: RawRun) -> ExecutionResult {
        let mut stderr = raw.stderr;
        let exit_code = if raw.timed_out {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "[killed after {} ms wall-clock limit]\n",
                self.timeout.as_millis()
            ));
            TIMEOUT_EXIT_CODE
        } else {
            raw.exit_code.unwrap_or(SIGNAL_EXIT_CODE)
        };
        ExecutionResult {
            step_id,
            stdout: raw.stdout,
            stderr,
            exit_code,
            duration_ms: raw.elapsed.as_millis() as u64,
            timed_out: raw.timed_out,
        }
    }

    /// Destroy the environment (if started) and return to CREATED.
    pub fn reset(&self) -> Result<(), SandboxFault> {
        let mut backend = lock(&self.gate);
        match self.state() {
            SandboxState::Stopped => Err(SandboxFault::Stopped),
            SandboxState::Created => Ok(()),
            SandboxState::Running | SandboxState::Executing => {
                info!(backend = backend.name(), "resetting sandbox environment");
                let result = backend.destroy();
                self.teardowns.fetch_add(1, Ordering::SeqCst);
                self.set_state(SandboxState::Created);
                result
            }
        }
    }

    /// Stop for good. Returns `false` when already stopped.
    pub fn shutdown(&self) -> Result<bool, SandboxFault> {
        let mut backend = lock(&self.gate);
        match self.state() {
            SandboxState::Stopped => Ok(false),
            SandboxState::Created => {
                self.set_state(SandboxState::Stopped);
                Ok(true)
            }
            SandboxState::Running | SandboxState::Executing => {
                info!(backend = backend.name(), "tearing down sandbox environment");
                let result = backend.destroy();
                self.teardowns.fetch_add(1, Ordering::SeqCst);
                self.set_state(SandboxState::Stopped);
                result.map(|()| true)
            }
        }
    }
}

impl Drop for SandboxManager {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(err = %e, "sandbox teardown on drop failed");
        }
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingBackend, ScriptedRun};

    fn spec() -> EnvironmentSpec {
        EnvironmentSpec::from_config(Path::new("/ws"), &SandboxConfig::default()).expect("spec")
    }

    #[test]
    fn environment_starts_lazily_and_is_reused() {
        let backend = RecordingBackend::new();
        let log = backend.log();
        let manager = SandboxManager::new(spec(), Duration::from_secs(1), Box::new(backend));
        assert_eq!(manager.state(), SandboxState::Created);
        assert_eq!(log.starts(), 0);

        manager
            .execute(1, &Invocation::Shell("echo a".to_string()))
            .expect("first");
        manager
            .execute(2, &Invocation::Shell("echo b".to_string()))
            .expect("second");

        assert_eq!(log.starts(), 1);
        assert_eq!(log.runs(), 2);
        assert_eq!(manager.state(), SandboxState::Running);
    }

    #[test]
    fn shutdown_destroys_exactly_once() {
        let backend = RecordingBackend::new();
        let log = backend.log();
        let manager = SandboxManager::new(spec(), Duration::from_secs(1), Box::new(backend));
        manager
            .execute(1, &Invocation::Shell("true".to_string()))
            .expect("run");

        assert_eq!(manager.shutdown(), Ok(true));
        assert_eq!(manager.shutdown(), Ok(false));
        drop(manager);
        assert_eq!(log.destroys(), 1);
    }

    #[test]
    fn execute_after_shutdown_is_a_fault() {
        let manager = SandboxManager::new(
            spec(),
            Duration::from_secs(1),
            Box::new(RecordingBackend::new()),
        );
        manager.shutdown().expect("shutdown");
        assert_eq!(
            manager.execute(1, &Invocation::Shell("true".to_string())),
            Err(SandboxFault::Stopped)
        );
    }

    #[test]
    fn timed_out_run_maps_to_synthetic_exit_code() {
        let backend = RecordingBackend::new().with_script(vec![ScriptedRun::TimedOut]);
        let manager = SandboxManager::new(spec(), Duration::from_secs(1), Box::new(backend));
        let result = manager
            .execute(4, &Invocation::Shell("sleep 60".to_string()))
            .expect("run");
        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.contains("wall-clock limit"));
        assert_eq!(manager.state(), SandboxState::Running);
    }

    #[test]
    fn reset_returns_to_created_and_restarts_lazily() {
        let backend = RecordingBackend::new();
        let log = backend.log();
        let manager = SandboxManager::new(spec(), Duration::from_secs(1), Box::new(backend));
        manager
            .execute(1, &Invocation::Shell("true".to_string()))
            .expect("run");
        manager.reset().expect("reset");
        assert_eq!(manager.state(), SandboxState::Created);
        manager
            .execute(2, &Invocation::Shell("true".to_string()))
            .expect("run");
        assert_eq!(log.starts(), 2);
        assert_eq!(log.destroys(), 1);
    }

    #[test]
    fn start_failure_is_a_fault_and_leaves_state_created() {
        let backend = RecordingBackend::new().failing_start();
        let manager = SandboxManager::new(spec(), Duration::from_secs(1), Box::new(backend));
        let err = manager
            .execute(1, &Invocation::Shell("true".to_string()))
            .expect_err("start fails");
        assert!(matches!(err, SandboxFault::Start(_)));
        assert_eq!(manager.state(), SandboxState::Created);
    }
}
