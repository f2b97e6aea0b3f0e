use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::permission::Classification;
use crate::core::plan::Plan;
use crate::core::types::{
    ExecutionResult, FaultKind, IntentAnalysis, PlanSource, Step, Verdict, VerificationFeedback,
};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Received,
    Understanding,
    Planning,
    Executing,
    AwaitingApproval,
    Verifying,
    NeedsRecovery,
    Recovering,
    Success,
    Aborted,
    NeedsClarification,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::Success | Phase::Aborted | Phase::NeedsClarification
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Received => "RECEIVED",
            Phase::Understanding => "UNDERSTANDING",
            Phase::Planning => "PLANNING",
            Phase::Executing => "EXECUTING",
            Phase::AwaitingApproval => "AWAITING_APPROVAL",
            Phase::Verifying => "VERIFYING",
            Phase::NeedsRecovery => "NEEDS_RECOVERY",
            Phase::Recovering => "RECOVERING",
            Phase::Success => "SUCCESS",
            Phase::Aborted => "ABORTED",
            Phase::NeedsClarification => "NEEDS_CLARIFICATION",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultKind>,
}

/// Per-submission record threaded through every stage.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskContext {
    pub task_id: String,
    pub raw_input: String,
    pub fingerprint: String,
    pub intent: String,
    pub constraints: Vec<String>,
    pub tool_hints: Vec<String>,
    pub confidence: f64,
    pub clarification_questions: Vec<String>,
    pub plan: Plan,
    /// Superseded plan revisions, oldest first.
    pub plan_history: Vec<Plan>,
    pub plan_source: PlanSource,
    pub classifications: Vec<Classification>,
    pub results: BTreeMap<u32, ExecutionResult>,
    pub feedback: BTreeMap<u32, VerificationFeedback>,
    /// RETRY count per step, independent of `retry_count`.
    pub step_retries: BTreeMap<u32, u32>,
    /// Steps left behind by a REPLAN, with the reason.
    pub skipped: BTreeMap<u32, String>,
    pub retry_count: u32,
    pub phase: Phase,
    pub error: Option<String>,
    pub transitions: Vec<Transition>,
}

impl TaskContext {
    pub fn new(task_id: &str, raw_input: &str, fingerprint: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            raw_input: raw_input.to_string(),
            fingerprint: fingerprint.to_string(),
            intent: String::new(),
            constraints: Vec::new(),
            tool_hints: Vec::new(),
            confidence: 0.0,
            clarification_questions: Vec::new(),
            plan: Plan::default(),
            plan_history: Vec::new(),
            plan_source: PlanSource::None,
            classifications: Vec::new(),
            results: BTreeMap::new(),
            feedback: BTreeMap::new(),
            step_retries: BTreeMap::new(),
            skipped: BTreeMap::new(),
            retry_count: 0,
            phase: Phase::Received,
            error: None,
            transitions: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Move to `to`, recording why. Ignored once terminal.
    pub fn transition(&mut self, to: Phase, rationale: impl Into<String>) {
        self.push_transition(to, rationale.into(), None, None);
    }

    pub fn step_transition(&mut self, to: Phase, step_id: u32, rationale: impl Into<String>) {
        self.push_transition(to, rationale.into(), Some(step_id), None);
    }

    pub fn fault_transition(
        &mut self,
        to: Phase,
        step_id: Option<u32>,
        fault: FaultKind,
        rationale: impl Into<String>,
    ) {
        self.push_transition(to, rationale.into(), step_id, Some(fault));
    }

    fn push_transition(
        &mut self,
        to: Phase,
        rationale: String,
        step_id: Option<u32>,
        fault: Option<FaultKind>,
    ) {
        if self.is_terminal() {
            debug!(
                phase = self.phase.as_str(),
                to = to.as_str(),
                "ignoring transition out of terminal phase"
            );
            return;
        }
        debug!(from = self.phase.as_str(), to = to.as_str(), %rationale, "phase transition");
        self.transitions.push(Transition {
            from: self.phase,
            to,
            rationale,
            step_id,
            fault,
        });
        self.phase = to;
    }

    pub fn abort(&mut self, rationale: impl Into<String>, fault: Option<FaultKind>) {
        let rationale = rationale.into();
        if self.is_terminal() {
            return;
        }
        self.error = Some(rationale.clone());
        self.push_transition(Phase::Aborted, rationale, None, fault);
    }

    pub fn succeed(&mut self, rationale: impl Into<String>) {
        self.transition(Phase::Success, rationale);
    }

    pub fn request_clarification(&mut self) {
        let rationale = if self.clarification_questions.is_empty() {
            format!(
                "intent confidence {:.2} is too low to plan",
                self.confidence
            )
        } else {
            format!(
                "intent confidence {:.2} is too low to plan: {}",
                self.confidence,
                self.clarification_questions.join(" ")
            )
        };
        self.error = Some(rationale.clone());
        self.transition(Phase::NeedsClarification, rationale);
    }

    pub fn apply_intent(&mut self, analysis: &IntentAnalysis) {
        self.intent = analysis.intent.trim().to_string();
        self.constraints = analysis.constraints.clone();
        self.tool_hints = analysis.suggested_tools.clone();
        self.confidence = analysis.confidence;
        self.clarification_questions = analysis.clarification_questions.clone();
    }

    /// Snapshot of the understood intent, as stored in the cache.
    pub fn intent_analysis(&self) -> IntentAnalysis {
        IntentAnalysis {
            intent: self.intent.clone(),
            constraints: self.constraints.clone(),
            suggested_tools: self.tool_hints.clone(),
            confidence: self.confidence,
            clarification_questions: self.clarification_questions.clone(),
        }
    }

    pub fn adopt_plan(&mut self, plan: Plan, source: PlanSource) {
        self.plan = plan;
        self.plan_source = source;
    }

    /// Install the next plan revision, keeping the current one in history.
    pub fn replace_plan(&mut self, next: Plan) {
        let previous = std::mem::replace(&mut self.plan, next);
        self.plan_history.push(previous);
    }

    /// Record a sandbox result; the step must exist in the active plan.
    pub fn record_result(&mut self, result: ExecutionResult) -> Result<(), String> {
        if self.plan.step(result.step_id).is_none() {
            return Err(format!(
                "execution result references unknown step {}",
                result.step_id
            ));
        }
        self.results.insert(result.step_id, result);
        Ok(())
    }

    pub fn record_feedback(&mut self, feedback: VerificationFeedback) {
        self.feedback.insert(feedback.step_id, feedback);
    }

    pub fn step_retry_count(&self, step_id: u32) -> u32 {
        self.step_retries.get(&step_id).copied().unwrap_or(0)
    }

    pub fn bump_step_retry(&mut self, step_id: u32) -> u32 {
        let count = self.step_retries.entry(step_id).or_insert(0);
        *count += 1;
        *count
    }

    /// Steps of the active plan that verified, renumbered from 1.
    ///
    /// This is what a successful task stores in the cache: failed and
    /// superseded steps are left out, so a replay needs no recovery.
    pub fn verified_plan(&self) -> Plan {
        let steps = self
            .plan
            .steps
            .iter()
            .filter(|s| {
                self.feedback
                    .get(&s.step_id)
                    .is_some_and(|f| f.verdict == Verdict::Success)
            })
            .map(Step::without_runtime_state)
            .collect();
        Plan::from_proposal(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FeedbackSource;

    fn ctx() -> TaskContext {
        TaskContext::new("t-1", "read a.txt", "fp")
    }

    #[test]
    fn transitions_record_rationale_and_stop_at_terminal() {
        let mut ctx = ctx();
        ctx.transition(Phase::Understanding, "start");
        ctx.abort("sandbox unavailable", Some(FaultKind::SandboxInfrastructureFault));
        ctx.transition(Phase::Executing, "should be ignored");

        assert_eq!(ctx.phase, Phase::Aborted);
        assert_eq!(ctx.transitions.len(), 2);
        assert_eq!(ctx.error.as_deref(), Some("sandbox unavailable"));
        assert_eq!(
            ctx.transitions[1].fault,
            Some(FaultKind::SandboxInfrastructureFault)
        );
    }

    #[test]
    fn result_for_unknown_step_is_rejected() {
        let mut ctx = ctx();
        ctx.adopt_plan(
            Plan::from_proposal(vec![Step::new(1, "read a.txt", "file_reader", "shown")]),
            PlanSource::Heuristic,
        );
        let result = ExecutionResult {
            step_id: 9,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            duration_ms: 1,
            timed_out: false,
        };
        assert!(ctx.record_result(result.clone()).is_err());
        assert!(
            ctx.record_result(ExecutionResult {
                step_id: 1,
                ..result
            })
            .is_ok()
        );
    }

    #[test]
    fn replace_plan_keeps_history() {
        let mut ctx = ctx();
        let base = Plan::from_proposal(vec![Step::new(1, "a", "shell", "ok")]);
        ctx.adopt_plan(base.clone(), PlanSource::Oracle);
        ctx.replace_plan(base.extend(vec![Step::new(1, "b", "shell", "ok")]));
        assert_eq!(ctx.plan_history, vec![base]);
        assert_eq!(ctx.plan.revision, 1);
    }

    #[test]
    fn verified_plan_keeps_only_passing_steps() {
        let mut ctx = ctx();
        ctx.adopt_plan(
            Plan::from_proposal(vec![
                Step::new(1, "write a.py", "file_writer", "written"),
                Step::new(2, "run a.py", "python", "prints X"),
                Step::new(3, "run a.py again", "python", "prints X"),
            ]),
            PlanSource::Oracle,
        );
        for (step_id, verdict) in [(1, Verdict::Success), (2, Verdict::Failed), (3, Verdict::Success)] {
            ctx.record_feedback(VerificationFeedback {
                step_id,
                verdict,
                rationale: String::new(),
                source: FeedbackSource::Deterministic,
            });
        }
        ctx.plan.steps[0].risk = Some(crate::core::types::RiskLevel::Safe);

        let verified = ctx.verified_plan();
        assert_eq!(verified.revision, 0);
        let ids: Vec<(u32, &str)> = verified
            .steps
            .iter()
            .map(|s| (s.step_id, s.description.as_str()))
            .collect();
        assert_eq!(ids, vec![(1, "write a.py"), (2, "run a.py again")]);
        assert!(verified.steps[0].risk.is_none());
    }

    #[test]
    fn clarification_is_terminal_with_reason() {
        let mut ctx = ctx();
        ctx.confidence = 0.3;
        ctx.clarification_questions = vec!["Which file?".to_string()];
        ctx.request_clarification();
        assert_eq!(ctx.phase, Phase::NeedsClarification);
        assert!(ctx.error.as_deref().unwrap_or("").contains("Which file?"));
    }
}
