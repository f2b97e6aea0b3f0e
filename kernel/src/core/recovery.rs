//! Bounded recovery controller.
//!
//! Turns a recovery proposal into the next move for a failed step. The
//! global `retry_count` ceiling and the per-step RETRY budget are enforced
//! here, so an oracle that keeps proposing RETRY or REPLAN still terminates.

use tracing::{info, warn};

use crate::context::{Phase, TaskContext};
use crate::core::types::{RecoveryDecision, RecoveryVerdict, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryLimits {
    /// Ceiling for REPLAN cycles per task.
    pub max_retries: u32,
    /// RETRY attempts allowed for a single step.
    pub max_step_retries: u32,
}

impl Default for RecoveryLimits {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_step_retries: 2,
        }
    }
}

/// Where execution continues after recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    /// Re-run the same step.
    Retry(u32),
    /// New steps were appended; continue at `resume_at`.
    Replanned { resume_at: u32, appended: Vec<Step> },
    /// Task is terminal (ABORTED).
    Stop,
}

#[derive(Debug, Clone, Copy)]
pub struct RecoveryController {
    limits: RecoveryLimits,
}

impl RecoveryController {
    pub fn new(limits: RecoveryLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> RecoveryLimits {
        self.limits
    }

    /// Rationale for a forced ABORT when the retry ceiling is reached.
    ///
    /// Checked before consulting the oracle.
    pub fn ceiling_reached(&self, ctx: &TaskContext) -> Option<String> {
        (ctx.retry_count >= self.limits.max_retries).then(|| {
            format!(
                "retry ceiling reached ({}/{} replans)",
                ctx.retry_count, self.limits.max_retries
            )
        })
    }

    /// Apply `decision` for `failing_step`, mutating the task context.
    pub fn apply(
        &self,
        ctx: &mut TaskContext,
        failing_step: u32,
        decision: RecoveryDecision,
    ) -> Resume {
        let rationale = decision.rationale.trim().to_string();
        ctx.step_transition(
            Phase::Recovering,
            failing_step,
            format!("{:?}: {}", decision.verdict, rationale),
        );

        if let Some(reason) = self.ceiling_reached(ctx) {
            warn!(%reason, "forcing abort");
            ctx.abort(reason, None);
            return Resume::Stop;
        }

        match decision.verdict {
            RecoveryVerdict::Retry => {
                let used = ctx.step_retry_count(failing_step);
                if used >= self.limits.max_step_retries {
                    ctx.abort(
                        format!(
                            "step {failing_step} exhausted its retry budget ({used}/{}): {rationale}",
                            self.limits.max_step_retries
                        ),
                        None,
                    );
                    return Resume::Stop;
                }
                let attempt = ctx.bump_step_retry(failing_step);
                info!(step_id = failing_step, attempt, "retrying step");
                ctx.step_transition(
                    Phase::Executing,
                    failing_step,
                    format!(
                        "retry {attempt}/{} of step {failing_step}: {rationale}",
                        self.limits.max_step_retries
                    ),
                );
                Resume::Retry(failing_step)
            }
            RecoveryVerdict::Replan => {
                if decision.new_steps.is_empty() {
                    ctx.abort(format!("replan proposed no new steps: {rationale}"), None);
                    return Resume::Stop;
                }
                let next = ctx.plan.extend(decision.new_steps);
                let resume_at = ctx.plan.max_step_id() + 1;
                let revision = next.revision;

                let superseded: Vec<u32> = ctx
                    .plan
                    .steps
                    .iter()
                    .map(|s| s.step_id)
                    .filter(|id| *id > failing_step && !ctx.results.contains_key(id))
                    .collect();
                for id in superseded {
                    ctx.skipped
                        .insert(id, format!("superseded by plan revision {revision}"));
                }

                let appended: Vec<Step> = next
                    .steps
                    .iter()
                    .filter(|s| s.step_id >= resume_at)
                    .cloned()
                    .collect();
                ctx.replace_plan(next);
                ctx.retry_count += 1;
                info!(
                    retry_count = ctx.retry_count,
                    appended = appended.len(),
                    resume_at,
                    "replanned"
                );
                ctx.step_transition(
                    Phase::Executing,
                    resume_at,
                    format!(
                        "replan {}/{} appended {} step(s): {rationale}",
                        ctx.retry_count,
                        self.limits.max_retries,
                        appended.len()
                    ),
                );
                Resume::Replanned {
                    resume_at,
                    appended,
                }
            }
            RecoveryVerdict::Abort => {
                let reason = if rationale.is_empty() {
                    "recovery chose to abort".to_string()
                } else {
                    rationale
                };
                ctx.abort(reason, None);
                Resume::Stop
            }
        }
    }
}
