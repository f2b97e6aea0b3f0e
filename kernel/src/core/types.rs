//! Shared deterministic types for kernel core logic.
//!
//! These types define stable contracts between the pipeline stages and the
//! oracle boundary. They carry no I/O and serialize to a stable JSON shape
//! (task records and the cache store round-trip through them).

use serde::{Deserialize, Serialize};

/// Risk classification assigned by the permission gateway.
///
/// Ordered so that `max` yields the more severe level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Safe,
    Risky,
    Dangerous,
}

impl RiskLevel {
    pub fn requires_approval(self) -> bool {
        self != RiskLevel::Safe
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Safe => "SAFE",
            RiskLevel::Risky => "RISKY",
            RiskLevel::Dangerous => "DANGEROUS",
        }
    }
}

/// Approval state of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approval {
    /// Not yet decided (step not reached, or not yet classified).
    #[default]
    Pending,
    /// SAFE step, runs without asking.
    NotRequired,
    Granted,
    Denied,
}

/// Concrete thing a step asks the sandbox to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    Shell { command: String },
    Python { code: String },
}

/// One atomic plan step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: u32,
    pub description: String,
    pub tool: String,
    pub expected_outcome: String,
    /// Declared path the step operates on, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<StepAction>,
    #[serde(default)]
    pub risk: Option<RiskLevel>,
    #[serde(default)]
    pub approval: Approval,
}

impl Step {
    pub fn new(step_id: u32, description: &str, tool: &str, expected_outcome: &str) -> Self {
        Self {
            step_id,
            description: description.to_string(),
            tool: tool.to_string(),
            expected_outcome: expected_outcome.to_string(),
            target: None,
            action: None,
            risk: None,
            approval: Approval::Pending,
        }
    }

    pub fn with_action(mut self, action: StepAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    /// Copy of the step with runtime-only fields (risk, approval) cleared.
    ///
    /// Replayed plans must be classified and approved again.
    pub fn without_runtime_state(&self) -> Self {
        Self {
            risk: None,
            approval: Approval::Pending,
            ..self.clone()
        }
    }
}

/// Outcome of running one step in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub step_id: u32,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// Verification verdict for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Success,
    Failed,
}

/// Who produced a piece of verification feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSource {
    /// Exit code / timeout check.
    Deterministic,
    Oracle,
    Heuristic,
    /// Permission denial or missing action; the step never reached the sandbox.
    Policy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationFeedback {
    pub step_id: u32,
    pub verdict: Verdict,
    pub rationale: String,
    pub source: FeedbackSource,
}

/// Oracle verification response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub verdict: Verdict,
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryVerdict {
    Retry,
    Replan,
    Abort,
}

/// Recovery proposal (from the oracle or the heuristic producer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryDecision {
    pub verdict: RecoveryVerdict,
    pub rationale: String,
    #[serde(default)]
    pub new_steps: Vec<Step>,
}

impl RecoveryDecision {
    pub fn abort(rationale: impl Into<String>) -> Self {
        Self {
            verdict: RecoveryVerdict::Abort,
            rationale: rationale.into(),
            new_steps: Vec::new(),
        }
    }
}

/// What a REPLAN taught: the failing intent and the steps that repaired it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub intent: String,
    pub rationale: String,
    pub new_steps: Vec<String>,
    pub recorded_at: String,
}

/// Structured understanding of a raw instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentAnalysis {
    pub intent: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub suggested_tools: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub clarification_questions: Vec<String>,
}

/// Pipeline stage that talks to the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intent,
    Planning,
    Verification,
    Recovery,
}

impl Stage {
    /// Static capability tier bound to the stage.
    pub fn tier(self) -> Tier {
        match self {
            Stage::Intent => Tier::Cheap,
            Stage::Planning => Tier::Standard,
            Stage::Verification => Tier::Cheap,
            Stage::Recovery => Tier::Premium,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Intent => "intent",
            Stage::Planning => "planning",
            Stage::Verification => "verification",
            Stage::Recovery => "recovery",
        }
    }
}

/// Cost/capability class of an oracle call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Cheap,
    Standard,
    Premium,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Cheap, Tier::Standard, Tier::Premium];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Cheap => "cheap",
            Tier::Standard => "standard",
            Tier::Premium => "premium",
        }
    }
}

/// Error taxonomy codes recorded on transitions and task records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultKind {
    OracleTransient,
    OracleMalformed,
    PermissionDenied,
    SandboxTimeout,
    SandboxInfrastructureFault,
    CacheCorrupt,
}

/// Where the plan of a task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    #[default]
    None,
    Oracle,
    Heuristic,
    ExactCache,
    SimilarCache,
}

impl PlanSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanSource::None => "none",
            PlanSource::Oracle => "oracle",
            PlanSource::Heuristic => "heuristic",
            PlanSource::ExactCache => "exact cache",
            PlanSource::SimilarCache => "similar cache",
        }
    }
}
