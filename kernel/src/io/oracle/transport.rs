//! Transport abstraction for the remote reasoning service.
//!
//! The [`Transport`] trait decouples the retry/validation logic in
//! [`super::remote`] from how a prompt actually reaches a model. The shipped
//! implementation pipes the prompt into a configured command; tests use
//! scripted transports that return queued replies without spawning anything.

use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::core::types::{Stage, Tier};
use crate::error::OracleFault;
use crate::io::process::run_command_with_timeout;

/// One round trip to the oracle.
#[derive(Debug, Clone)]
pub struct OracleExchange {
    pub stage: Stage,
    pub tier: Tier,
    /// Model bound to `tier`, when configured.
    pub model: Option<String>,
    pub prompt: String,
    /// Soft limit; expiry is a transient failure.
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub trait Transport: Send + Sync {
    /// Send the prompt and return the raw reply text.
    fn exchange(&self, request: &OracleExchange) -> Result<String, OracleFault>;
}

/// Transport that runs a command per call: prompt on stdin, reply on stdout.
///
/// The tier, stage and model are passed as `KERNEL_ORACLE_*` environment
/// variables so one wrapper script can serve every stage.
pub struct CommandTransport {
    argv: Vec<String>,
    workdir: PathBuf,
}

impl CommandTransport {
    pub fn new(argv: Vec<String>, workdir: PathBuf) -> Self {
        Self { argv, workdir }
    }
}

impl Transport for CommandTransport {
    #[instrument(skip_all, fields(stage = request.stage.as_str(), tier = request.tier.as_str()))]
    fn exchange(&self, request: &OracleExchange) -> Result<String, OracleFault> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(OracleFault::Unavailable("no oracle command configured".into()));
        };
        info!(program = %program, "dispatching oracle request");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("KERNEL_ORACLE_STAGE", request.stage.as_str())
            .env("KERNEL_ORACLE_TIER", request.tier.as_str());
        if let Some(model) = &request.model {
            cmd.env("KERNEL_ORACLE_MODEL", model);
        }

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .map_err(|e| match e.downcast_ref::<io::Error>() {
            Some(_) => OracleFault::Unavailable(format!("spawn {program}: {e:#}")),
            None => OracleFault::Transient(format!("{program}: {e:#}")),
        })?;

        if output.timed_out {
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "oracle command timed out"
            );
            return Err(OracleFault::Transient(format!(
                "{program} timed out after {:?}",
                request.timeout
            )));
        }
        if !output.status.success() {
            let stderr = output.stderr_lossy();
            warn!(exit_code = ?output.status.code(), "oracle command failed");
            return Err(OracleFault::Transient(format!(
                "{program} exited with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        if output.stdout_truncated > 0 {
            // A cut-off JSON document cannot validate; let the caller re-prompt.
            warn!(truncated = output.stdout_truncated, "oracle reply truncated");
        }

        debug!(bytes = output.stdout.len(), "oracle reply received");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
