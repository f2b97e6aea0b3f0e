//! Typed faults crossing the oracle and sandbox boundaries.
//!
//! Plumbing errors (config, files, task records) stay `anyhow`. These enums
//! exist where the pipeline has to branch on the kind of failure.

use thiserror::Error;

use crate::core::types::FaultKind;

/// Failure talking to the reasoning oracle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OracleFault {
    /// Timeout, rate limit or non-zero exit; retried with backoff.
    #[error("oracle transient failure: {0}")]
    Transient(String),

    /// Response did not match the stage schema.
    #[error("oracle response malformed: {0}")]
    Malformed(String),

    /// No oracle configured, or it cannot be started.
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
}

impl OracleFault {
    pub fn kind(&self) -> FaultKind {
        match self {
            OracleFault::Malformed(_) => FaultKind::OracleMalformed,
            OracleFault::Transient(_) | OracleFault::Unavailable(_) => FaultKind::OracleTransient,
        }
    }
}

/// Infrastructure failure of the sandbox. Ordinary non-zero exits are not faults.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxFault {
    #[error("sandbox runtime unavailable: {0}")]
    Unavailable(String),

    #[error("sandbox failed to start: {0}")]
    Start(String),

    #[error("sandbox exec failed: {0}")]
    Exec(String),

    #[error("sandbox is stopped")]
    Stopped,
}

impl SandboxFault {
    pub fn kind(&self) -> FaultKind {
        FaultKind::SandboxInfrastructureFault
    }
}
