//! Oracle gateway: stage-typed access to the reasoning service.
//!
//! Every stage request goes to the remote [`Reasoner`] when one is
//! configured. Whatever it fails with (transient exhaustion, malformed
//! replies, unavailability) is logged, counted as a fallback and answered by
//! the deterministic [`HeuristicReasoner`] instead, so the pipeline always
//! gets a structured response.

pub mod remote;
pub mod schema;
pub mod transport;

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::core::heuristic;
use crate::core::types::{
    ExecutionResult, IntentAnalysis, Lesson, RecoveryDecision, Stage, Step, VerificationReport,
};
use crate::error::OracleFault;
use crate::io::config::OracleConfig;
use crate::usage::UsageCounters;

pub use remote::RemoteReasoner;
pub use transport::{CommandTransport, OracleExchange, Transport};

#[derive(Debug, Clone)]
pub struct IntentRequest {
    pub raw_input: String,
    pub confidence_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub intent: String,
    pub constraints: Vec<String>,
    pub tool_hints: Vec<String>,
    /// Recent REPLAN lessons, newest last.
    pub lessons: Vec<Lesson>,
}

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub step: Step,
    pub result: ExecutionResult,
}

#[derive(Debug, Clone)]
pub struct RecoverRequest {
    pub intent: String,
    pub step: Step,
    /// `None` when the step never reached the sandbox.
    pub result: Option<ExecutionResult>,
    pub failure: String,
    pub retry_available: bool,
    pub replans_left: u32,
}

#[derive(Debug, Clone)]
pub enum OracleRequest {
    Intent(IntentRequest),
    Plan(PlanRequest),
    Verify(VerifyRequest),
    Recover(RecoverRequest),
}

impl OracleRequest {
    pub fn stage(&self) -> Stage {
        match self {
            OracleRequest::Intent(_) => Stage::Intent,
            OracleRequest::Plan(_) => Stage::Planning,
            OracleRequest::Verify(_) => Stage::Verification,
            OracleRequest::Recover(_) => Stage::Recovery,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OracleResponse {
    Intent(IntentAnalysis),
    /// Proposed steps in execution order; ids are renumbered on adoption.
    Plan(Vec<Step>),
    Verify(VerificationReport),
    Recover(RecoveryDecision),
}

/// Producer of structured stage responses.
pub trait Reasoner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether answers come from the remote service. Failures of a remote
    /// reasoner count as fallbacks.
    fn is_remote(&self) -> bool {
        true
    }

    fn infer(&self, request: &OracleRequest) -> Result<OracleResponse, OracleFault>;
}

/// Deterministic producer backed by [`crate::core::heuristic`]. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicReasoner;

impl HeuristicReasoner {
    pub fn understand(&self, request: &IntentRequest) -> IntentAnalysis {
        heuristic::understand(&request.raw_input)
    }

    pub fn plan(&self, request: &PlanRequest) -> Vec<Step> {
        heuristic::plan(&request.intent, &request.tool_hints)
    }

    pub fn verify(&self, request: &VerifyRequest) -> VerificationReport {
        heuristic::verify(&request.step, &request.result)
    }

    pub fn recover(&self, request: &RecoverRequest) -> RecoveryDecision {
        heuristic::recover(
            &request.step,
            request.result.as_ref(),
            &request.failure,
            request.retry_available,
        )
    }

    pub fn answer(&self, request: &OracleRequest) -> OracleResponse {
        match request {
            OracleRequest::Intent(req) => OracleResponse::Intent(self.understand(req)),
            OracleRequest::Plan(req) => OracleResponse::Plan(self.plan(req)),
            OracleRequest::Verify(req) => OracleResponse::Verify(self.verify(req)),
            OracleRequest::Recover(req) => OracleResponse::Recover(self.recover(req)),
        }
    }
}

impl Reasoner for HeuristicReasoner {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn infer(&self, request: &OracleRequest) -> Result<OracleResponse, OracleFault> {
        Ok(self.answer(request))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerSource {
    Remote,
    Heuristic,
}

/// A stage answer plus where it came from.
#[derive(Debug, Clone)]
pub struct Answered<T> {
    pub value: T,
    pub source: AnswerSource,
    /// Set when the remote reasoner failed and the heuristic stood in.
    pub degraded: Option<OracleFault>,
}

pub struct OracleGateway {
    primary: Box<dyn Reasoner>,
    fallback: HeuristicReasoner,
    usage: Arc<UsageCounters>,
}

impl OracleGateway {
    /// `remote` answers first when present; otherwise the heuristic reasoner
    /// is the primary.
    pub fn new(remote: Option<Box<dyn Reasoner>>, usage: Arc<UsageCounters>) -> Self {
        Self {
            primary: remote.unwrap_or_else(|| Box::new(HeuristicReasoner)),
            fallback: HeuristicReasoner,
            usage,
        }
    }

    pub fn heuristic_only(usage: Arc<UsageCounters>) -> Self {
        Self::new(None, usage)
    }

    /// Remote reasoner over the configured command, or heuristics alone when
    /// no command is set.
    pub fn from_config(cfg: &OracleConfig, workdir: &Path, usage: Arc<UsageCounters>) -> Self {
        if cfg.command.is_empty() {
            debug!("no oracle command configured, using heuristics");
            return Self::heuristic_only(usage);
        }
        let transport = CommandTransport::new(cfg.command.clone(), workdir.to_path_buf());
        let remote = RemoteReasoner::new(Box::new(transport), cfg.clone(), usage.clone());
        Self::new(Some(Box::new(remote)), usage)
    }

    pub fn has_remote(&self) -> bool {
        self.primary.is_remote()
    }

    pub fn usage(&self) -> &Arc<UsageCounters> {
        &self.usage
    }

    #[instrument(skip_all, fields(stage = request.stage().as_str(), reasoner = self.primary.name()))]
    fn ask<T>(
        &self,
        request: &OracleRequest,
        pick: fn(OracleResponse) -> Option<T>,
        fallback: impl FnOnce(&HeuristicReasoner) -> T,
    ) -> Answered<T> {
        let source = if self.primary.is_remote() {
            AnswerSource::Remote
        } else {
            AnswerSource::Heuristic
        };
        let fault = match self.primary.infer(request) {
            Ok(response) => match pick(response) {
                Some(value) => {
                    return Answered {
                        value,
                        source,
                        degraded: None,
                    };
                }
                None => OracleFault::Malformed(format!(
                    "{} returned a response for another stage",
                    self.primary.name()
                )),
            },
            Err(fault) => fault,
        };

        warn!(err = %fault, "oracle degraded to heuristic");
        self.usage.record_fallback();
        Answered {
            value: fallback(&self.fallback),
            source: AnswerSource::Heuristic,
            degraded: Some(fault),
        }
    }

    pub fn understand(&self, request: &IntentRequest) -> Answered<IntentAnalysis> {
        self.ask(
            &OracleRequest::Intent(request.clone()),
            |r| match r {
                OracleResponse::Intent(analysis) => Some(analysis),
                _ => None,
            },
            |h| h.understand(request),
        )
    }

    pub fn plan(&self, request: &PlanRequest) -> Answered<Vec<Step>> {
        self.ask(
            &OracleRequest::Plan(request.clone()),
            |r| match r {
                OracleResponse::Plan(steps) => Some(steps),
                _ => None,
            },
            |h| h.plan(request),
        )
    }

    pub fn verify(&self, request: &VerifyRequest) -> Answered<VerificationReport> {
        self.ask(
            &OracleRequest::Verify(request.clone()),
            |r| match r {
                OracleResponse::Verify(report) => Some(report),
                _ => None,
            },
            |h| h.verify(request),
        )
    }

    pub fn recover(&self, request: &RecoverRequest) -> Answered<RecoveryDecision> {
        self.ask(
            &OracleRequest::Recover(request.clone()),
            |r| match r {
                OracleResponse::Recover(decision) => Some(decision),
                _ => None,
            },
            |h| h.recover(request),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{RecoveryVerdict, Verdict};

    struct Failing(OracleFault);

    impl Reasoner for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn infer(&self, _: &OracleRequest) -> Result<OracleResponse, OracleFault> {
            Err(self.0.clone())
        }
    }

    struct WrongStage;

    impl Reasoner for WrongStage {
        fn name(&self) -> &'static str {
            "wrong-stage"
        }

        fn infer(&self, _: &OracleRequest) -> Result<OracleResponse, OracleFault> {
            Ok(OracleResponse::Plan(Vec::new()))
        }
    }

    fn intent() -> IntentRequest {
        IntentRequest {
            raw_input: "create file.py printing X and run it".to_string(),
            confidence_threshold: 0.7,
        }
    }

    #[test]
    fn heuristic_only_answers_without_fallback_count() {
        let usage = Arc::new(UsageCounters::new());
        let gateway = OracleGateway::heuristic_only(usage.clone());
        let answer = gateway.understand(&intent());
        assert_eq!(answer.source, AnswerSource::Heuristic);
        assert!(answer.degraded.is_none());
        assert!(answer.value.confidence >= 0.7);
        assert_eq!(usage.snapshot().fallbacks, 0);
    }

    #[test]
    fn remote_fault_degrades_to_heuristic() {
        let usage = Arc::new(UsageCounters::new());
        let gateway = OracleGateway::new(
            Some(Box::new(Failing(OracleFault::Transient("503".to_string())))),
            usage.clone(),
        );
        let answer = gateway.plan(&PlanRequest {
            intent: "read notes.txt".to_string(),
            constraints: Vec::new(),
            tool_hints: Vec::new(),
            lessons: Vec::new(),
        });
        assert_eq!(answer.source, AnswerSource::Heuristic);
        assert!(matches!(answer.degraded, Some(OracleFault::Transient(_))));
        assert_eq!(answer.value.len(), 1);
        assert_eq!(usage.snapshot().fallbacks, 1);
    }

    #[test]
    fn response_for_another_stage_counts_as_malformed() {
        let usage = Arc::new(UsageCounters::new());
        let gateway = OracleGateway::new(Some(Box::new(WrongStage)), usage);
        let step = Step::new(1, "Run it", "shell", "exits with status 0");
        let answer = gateway.verify(&VerifyRequest {
            step,
            result: ExecutionResult {
                step_id: 1,
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                duration_ms: 1,
                timed_out: false,
            },
        });
        assert!(matches!(answer.degraded, Some(OracleFault::Malformed(_))));
        assert_eq!(answer.value.verdict, Verdict::Success);
    }

    #[test]
    fn heuristic_recover_aborts_when_step_never_ran() {
        let gateway = OracleGateway::heuristic_only(Arc::new(UsageCounters::new()));
        let answer = gateway.recover(&RecoverRequest {
            intent: "delete everything".to_string(),
            step: Step::new(1, "Delete /etc", "file_remover", "gone"),
            result: None,
            failure: "approval denied".to_string(),
            retry_available: true,
            replans_left: 3,
        });
        assert_eq!(answer.value.verdict, RecoveryVerdict::Abort);
    }

    #[test]
    fn heuristic_reasoner_answers_every_stage_in_kind() {
        let reasoner = HeuristicReasoner;
        let request = OracleRequest::Intent(intent());
        let response = reasoner.infer(&request).expect("heuristic never fails");
        assert!(matches!(response, OracleResponse::Intent(_)));
        assert!(!reasoner.is_remote());
        assert_eq!(
            OracleGateway::heuristic_only(Arc::new(UsageCounters::new()))
                .understand(&intent())
                .value,
            reasoner.understand(&intent())
        );
    }

    #[test]
    fn from_config_without_command_has_no_remote() {
        let gateway = OracleGateway::from_config(
            &OracleConfig::default(),
            Path::new("/tmp"),
            Arc::new(UsageCounters::new()),
        );
        assert!(!gateway.has_remote());
    }
}
