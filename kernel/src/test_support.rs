//! Scripted collaborators for tests.
//!
//! Each fake hands out a cloneable log handle before it is boxed into the
//! kernel, so tests can assert on what reached the oracle, the sandbox or the
//! approver afterwards.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::approval::{ApprovalChannel, ApprovalRequest};
use crate::core::invocation::Invocation;
use crate::core::types::{RiskLevel, Stage};
use crate::error::{OracleFault, SandboxFault};
use crate::io::oracle::{OracleExchange, Transport};
use crate::io::sandbox::{EnvironmentSpec, RawRun, SandboxBackend};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    Text(String),
    Fault(OracleFault),
}

impl ScriptedReply {
    pub fn text(reply: &str) -> Self {
        ScriptedReply::Text(reply.to_string())
    }
}

/// Prompts received by a [`ScriptedTransport`], in order.
#[derive(Debug, Clone, Default)]
pub struct OracleCalls(Arc<Mutex<Vec<(Stage, String)>>>);

impl OracleCalls {
    pub fn count(&self, stage: Stage) -> usize {
        lock(&self.0).iter().filter(|(s, _)| *s == stage).count()
    }

    pub fn total(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn prompts(&self, stage: Stage) -> Vec<String> {
        lock(&self.0)
            .iter()
            .filter(|(s, _)| *s == stage)
            .map(|(_, prompt)| prompt.clone())
            .collect()
    }
}

/// Transport answering from per-stage queues.
///
/// The last reply of a queue repeats forever; a stage without a script is
/// reported as unavailable.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: Mutex<BTreeMap<Stage, VecDeque<ScriptedReply>>>,
    calls: OracleCalls,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, stage: Stage, replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        lock(&self.scripts)
            .entry(stage)
            .or_default()
            .extend(replies);
        self
    }

    pub fn calls(&self) -> OracleCalls {
        self.calls.clone()
    }
}

impl Transport for ScriptedTransport {
    fn exchange(&self, request: &OracleExchange) -> Result<String, OracleFault> {
        lock(&self.calls.0).push((request.stage, request.prompt.clone()));
        let mut scripts = lock(&self.scripts);
        let queue = scripts.get_mut(&request.stage).filter(|q| !q.is_empty());
        let reply = match queue {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        match reply {
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Fault(fault)) => Err(fault),
            None => Err(OracleFault::Unavailable(format!(
                "no scripted reply for {}",
                request.stage.as_str()
            ))),
        }
    }
}

/// Scripted outcome of one backend run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedRun {
    /// Exit 0 with empty output.
    Ok,
    /// Exit code, stdout, stderr.
    Exit(i32, String, String),
    TimedOut,
    Fault(SandboxFault),
}

#[derive(Debug, Default)]
struct BackendEvents {
    starts: usize,
    destroys: usize,
    invocations: Vec<Invocation>,
    in_flight: usize,
    max_in_flight: usize,
}

/// What a [`RecordingBackend`] was asked to do.
#[derive(Debug, Clone, Default)]
pub struct BackendLog(Arc<Mutex<BackendEvents>>);

impl BackendLog {
    pub fn starts(&self) -> usize {
        lock(&self.0).starts
    }

    pub fn runs(&self) -> usize {
        lock(&self.0).invocations.len()
    }

    pub fn destroys(&self) -> usize {
        lock(&self.0).destroys
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.0).invocations.clone()
    }

    /// Most runs that were ever in progress at the same time.
    pub fn max_concurrent_runs(&self) -> usize {
        lock(&self.0).max_in_flight
    }
}

/// Backend that runs nothing. Runs succeed unless scripted otherwise.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    log: BackendLog,
    script: VecDeque<ScriptedRun>,
    fail_start: bool,
    run_delay: Duration,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes for the next runs, in order; later runs succeed.
    pub fn with_script(mut self, runs: Vec<ScriptedRun>) -> Self {
        self.script = runs.into();
        self
    }

    /// Hold every run open for `delay`, widening the window for overlaps.
    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn log(&self) -> BackendLog {
        self.log.clone()
    }
}

impl SandboxBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn start(&mut self, _: &EnvironmentSpec) -> Result<(), SandboxFault> {
        if self.fail_start {
            return Err(SandboxFault::Start("scripted start failure".to_string()));
        }
        lock(&self.log.0).starts += 1;
        Ok(())
    }

    fn run(&mut self, invocation: &Invocation, timeout: Duration) -> Result<RawRun, SandboxFault> {
        {
            let mut events = lock(&self.log.0);
            events.invocations.push(invocation.clone());
            events.in_flight += 1;
            events.max_in_flight = events.max_in_flight.max(events.in_flight);
        }
        if !self.run_delay.is_zero() {
            std::thread::sleep(self.run_delay);
        }
        lock(&self.log.0).in_flight -= 1;
        let run = |exit_code, stdout: String, stderr: String| RawRun {
            stdout,
            stderr,
            exit_code: Some(exit_code),
            timed_out: false,
            elapsed: Duration::from_millis(1),
        };
        match self.script.pop_front().unwrap_or(ScriptedRun::Ok) {
            ScriptedRun::Ok => Ok(run(0, String::new(), String::new())),
            ScriptedRun::Exit(code, stdout, stderr) => Ok(run(code, stdout, stderr)),
            ScriptedRun::TimedOut => Ok(RawRun {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
                timed_out: true,
                elapsed: timeout,
            }),
            ScriptedRun::Fault(fault) => Err(fault),
        }
    }

    fn destroy(&mut self) -> Result<(), SandboxFault> {
        lock(&self.log.0).destroys += 1;
        Ok(())
    }
}

/// Approver with a fixed answer that remembers what it was asked.
#[derive(Debug, Clone)]
pub struct ScriptedApproval {
    answer: bool,
    asked: Arc<Mutex<Vec<(u32, RiskLevel)>>>,
}

impl ScriptedApproval {
    pub fn new(answer: bool) -> Self {
        Self {
            answer,
            asked: Arc::default(),
        }
    }

    /// `(step_id, risk)` of every request so far.
    pub fn asked(&self) -> Vec<(u32, RiskLevel)> {
        lock(&self.asked).clone()
    }
}

impl ApprovalChannel for ScriptedApproval {
    fn approve(&self, request: &ApprovalRequest<'_>) -> bool {
        lock(&self.asked).push((request.step.step_id, request.classification.risk));
        self.answer
    }
}
