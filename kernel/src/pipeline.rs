//! Task pipeline: one submission from raw instruction to terminal phase.
//!
//! ```text
//! RECEIVED -> UNDERSTANDING -> PLANNING -> EXECUTING <-> AWAITING_APPROVAL
//!                  |                          |
//!                  v                          v
//!        NEEDS_CLARIFICATION              VERIFYING -> (next step) | NEEDS_RECOVERY
//!                                                                       |
//!                                   EXECUTING <- RECOVERING <-----------+
//!                                                   |
//!                                                ABORTED
//! ```
//!
//! The exact cache is consulted before the oracle, the similar cache after
//! understanding. Every step is classified before anything runs; RISKY and
//! DANGEROUS steps block on the [`ApprovalChannel`] right before execution.
//! Failures go through the [`RecoveryController`], which bounds retries and
//! replans. Successful tasks store their verified plan; every task leaves a
//! record under `<state_dir>/tasks/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::approval::{ApprovalChannel, ApprovalRequest, DenyAll};
use crate::context::{Phase, TaskContext};
use crate::core::fingerprint::{fingerprint, normalize, normalize_intent};
use crate::core::heuristic;
use crate::core::invocation::derive_invocation;
use crate::core::permission::PermissionGateway;
use crate::core::plan::{Plan, validate_plan};
use crate::core::recovery::{RecoveryController, Resume};
use crate::core::types::{
    Approval, ExecutionResult, FaultKind, FeedbackSource, Lesson, PlanSource, RecoveryVerdict,
    Stage, Step, Verdict, VerificationFeedback,
};
use crate::error::{OracleFault, SandboxFault};
use crate::io::cache_store::{PlanCache, now_stamp};
use crate::io::config::{KernelConfig, load_config};
use crate::io::init::KernelPaths;
use crate::io::oracle::{
    AnswerSource, IntentRequest, OracleGateway, PlanRequest, Reasoner, RecoverRequest,
    RemoteReasoner, Transport, VerifyRequest,
};
use crate::io::sandbox::{EnvironmentSpec, SandboxBackend, SandboxManager};
use crate::io::task_log::{TaskRecord, new_task_id, write_task_record};
use crate::usage::{UsageCounters, UsageSnapshot};

/// Lessons passed to the planner per request.
const LESSONS_IN_PROMPT: usize = 5;

/// Cooperative cancellation, checked between pipeline stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a submission produced.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub record: TaskRecord,
    /// `None` when the record could not be written.
    pub record_path: Option<PathBuf>,
}

impl TaskOutcome {
    pub fn task(&self) -> &TaskContext {
        &self.record.task
    }

    pub fn phase(&self) -> Phase {
        self.record.task.phase
    }
}

/// Assembles a [`Kernel`]; every collaborator can be swapped for tests.
pub struct KernelBuilder {
    workspace: PathBuf,
    state_dir: PathBuf,
    config: KernelConfig,
    backend: Option<Box<dyn SandboxBackend>>,
    reasoner: Option<Box<dyn Reasoner>>,
    transport: Option<Box<dyn Transport>>,
    approval: Box<dyn ApprovalChannel>,
}

impl KernelBuilder {
    pub fn new(workspace: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            state_dir: state_dir.into(),
            config: KernelConfig::default(),
            backend: None,
            reasoner: None,
            transport: None,
            approval: Box::new(DenyAll),
        }
    }

    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    /// Sandbox backend; defaults to the one selected in config.
    pub fn backend(mut self, backend: Box<dyn SandboxBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Remote reasoner used ahead of the heuristics.
    pub fn reasoner(mut self, reasoner: Box<dyn Reasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    /// Transport for a [`RemoteReasoner`] built from the oracle config.
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn approval(mut self, approval: Box<dyn ApprovalChannel>) -> Self {
        self.approval = approval;
        self
    }

    pub fn build(self) -> Result<Kernel> {
        let config = self.config;
        config.validate()?;

        std::fs::create_dir_all(&self.workspace)
            .with_context(|| format!("create workspace {}", self.workspace.display()))?;
        let workspace = self
            .workspace
            .canonicalize()
            .with_context(|| format!("resolve workspace {}", self.workspace.display()))?;
        let paths = KernelPaths::new(self.state_dir);

        let usage = Arc::new(UsageCounters::new());
        let oracle = match (self.reasoner, self.transport) {
            (Some(reasoner), _) => OracleGateway::new(Some(reasoner), usage.clone()),
            (None, Some(transport)) => {
                let remote = RemoteReasoner::new(transport, config.oracle.clone(), usage.clone());
                OracleGateway::new(Some(Box::new(remote)), usage.clone())
            }
            (None, None) => OracleGateway::from_config(&config.oracle, &paths.state_dir, usage.clone()),
        };

        let sandbox = match self.backend {
            Some(backend) => SandboxManager::new(
                EnvironmentSpec::from_config(&workspace, &config.sandbox)?,
                config.sandbox.timeout(),
                backend,
            ),
            None => SandboxManager::from_config(&workspace, &config.sandbox)?,
        };

        let cache = PlanCache::open(&paths.cache_path);
        if cache.discarded() > 0 {
            warn!(
                path = %paths.cache_path.display(),
                discarded = cache.discarded(),
                "cache contents discarded on load"
            );
        }

        Ok(Kernel {
            permissions: PermissionGateway::new(&workspace, config.policy.clone()),
            recovery: RecoveryController::new(config.recovery_limits()),
            approval: self.approval,
            workspace,
            paths,
            config,
            oracle,
            cache,
            sandbox,
            usage,
        })
    }
}

/// The task pipeline with its long-lived collaborators.
///
/// `submit` takes `&self`; concurrent submissions share the cache and the
/// sandbox, whose executions are serialized.
pub struct Kernel {
    workspace: PathBuf,
    paths: KernelPaths,
    config: KernelConfig,
    permissions: PermissionGateway,
    oracle: OracleGateway,
    cache: PlanCache,
    sandbox: SandboxManager,
    recovery: RecoveryController,
    approval: Box<dyn ApprovalChannel>,
    usage: Arc<UsageCounters>,
}

/// How a single step attempt ended.
enum StepRun {
    Passed,
    Failed {
        result: Option<ExecutionResult>,
        reason: String,
    },
    /// The task was aborted; nothing further runs.
    Halted,
}

impl Kernel {
    /// Kernel over `workspace` with the config stored in `state_dir`.
    pub fn open(
        workspace: &Path,
        state_dir: &Path,
        approval: Box<dyn ApprovalChannel>,
    ) -> Result<Self> {
        let paths = KernelPaths::new(state_dir);
        let config = load_config(&paths.config_path)?;
        KernelBuilder::new(workspace, state_dir)
            .config(config)
            .approval(approval)
            .build()
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn paths(&self) -> &KernelPaths {
        &self.paths
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }

    pub fn sandbox(&self) -> &SandboxManager {
        &self.sandbox
    }

    pub fn usage(&self) -> UsageSnapshot {
        self.usage.snapshot()
    }

    /// Tear the sandbox down. Returns `false` when it was already stopped.
    pub fn shutdown(&self) -> Result<bool, SandboxFault> {
        self.sandbox.shutdown()
    }

    pub fn submit(&self, raw_input: &str) -> TaskOutcome {
        self.submit_with_cancel(raw_input, &CancelToken::new())
    }

    /// Drive one instruction to a terminal phase and write its task record.
    pub fn submit_with_cancel(&self, raw_input: &str, cancel: &CancelToken) -> TaskOutcome {
        let started = Instant::now();
        let started_at = now_stamp();
        let before = self.usage.snapshot();

        let normalized = normalize(raw_input);
        let fp = fingerprint(&normalized);
        let mut ctx = TaskContext::new(&new_task_id(), raw_input, &fp);
        info!(task_id = %ctx.task_id, fingerprint = %fp, "task received");

        self.drive(&mut ctx, &normalized, cancel);
        if !ctx.is_terminal() {
            ctx.abort("pipeline stopped before a terminal phase", None);
        }
        info!(
            task_id = %ctx.task_id,
            phase = ctx.phase.as_str(),
            replans = ctx.retry_count,
            "task finished"
        );

        let record = TaskRecord {
            task_id: ctx.task_id.clone(),
            started_at,
            finished_at: now_stamp(),
            duration_ms: started.elapsed().as_millis() as u64,
            usage: self.usage.snapshot().since(&before),
            task: ctx,
        };
        let record_path = match write_task_record(&self.paths.tasks_dir, &record) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(err = %e, task_id = %record.task_id, "failed to write task record");
                None
            }
        };
        TaskOutcome {
            record,
            record_path,
        }
    }

    #[instrument(skip_all, fields(task_id = %ctx.task_id))]
    fn drive(&self, ctx: &mut TaskContext, normalized: &str, cancel: &CancelToken) {
        if let Some(entry) = self.cache.lookup_exact(&ctx.fingerprint) {
            self.usage.record_exact_hit();
            info!(plan_steps = entry.plan.len(), "exact cache hit");
            ctx.transition(Phase::Understanding, "exact cache hit: intent restored");
            ctx.apply_intent(&entry.intent);
            if self.cancelled(ctx, cancel, "planning") {
                return;
            }
            ctx.transition(Phase::Planning, "exact cache hit: replaying stored plan");
            if let Err(e) = self.cache.touch(&ctx.fingerprint) {
                warn!(err = %e, "failed to refresh cache entry");
            }
            if !self.adopt(ctx, entry.plan.replayable(), PlanSource::ExactCache) {
                return;
            }
        } else {
            if self.cancelled(ctx, cancel, "understanding") {
                return;
            }
            ctx.transition(Phase::Understanding, "analyzing instruction");
            let answer = self.oracle.understand(&IntentRequest {
                raw_input: ctx.raw_input.clone(),
                confidence_threshold: self.config.confidence_threshold,
            });
            self.note_degraded(ctx, Stage::Intent, None, answer.degraded.as_ref());
            ctx.apply_intent(&answer.value);

            if ctx.confidence < self.config.confidence_threshold {
                info!(confidence = ctx.confidence, "clarification needed");
                ctx.request_clarification();
                return;
            }
            if self.cancelled(ctx, cancel, "planning") {
                return;
            }
            ctx.transition(
                Phase::Planning,
                format!("intent understood with confidence {:.2}", ctx.confidence),
            );

            let normalized_intent = normalize_intent(&ctx.intent);
            let (plan, source) = match self
                .cache
                .lookup_similar(&normalized_intent, self.config.cache.similarity_threshold)
            {
                Some(hit) => {
                    self.usage.record_similar_hit();
                    info!(score = hit.score, from = %hit.entry.fingerprint, "similar cache hit");
                    if let Err(e) = self.cache.touch(&hit.entry.fingerprint) {
                        warn!(err = %e, "failed to refresh cache entry");
                    }
                    (hit.entry.plan.replayable(), PlanSource::SimilarCache)
                }
                None => {
                    self.usage.record_miss();
                    let answer = self.oracle.plan(&PlanRequest {
                        intent: ctx.intent.clone(),
                        constraints: ctx.constraints.clone(),
                        tool_hints: ctx.tool_hints.clone(),
                        lessons: self.cache.recent_lessons(LESSONS_IN_PROMPT),
                    });
                    self.note_degraded(ctx, Stage::Planning, None, answer.degraded.as_ref());
                    let source = match answer.source {
                        AnswerSource::Remote => PlanSource::Oracle,
                        AnswerSource::Heuristic => PlanSource::Heuristic,
                    };
                    (Plan::from_proposal(answer.value), source)
                }
            };
            if !self.adopt(ctx, plan, source) {
                return;
            }
        }

        self.execute(ctx, cancel);

        if ctx.phase == Phase::Success {
            let verified = ctx.verified_plan();
            if let Err(e) =
                self.cache
                    .record_success(&ctx.fingerprint, normalized, &ctx.intent_analysis(), &verified)
            {
                warn!(err = %e, "failed to store plan in cache");
            }
        }
    }

    /// Validate and install `plan`, classifying every step. Returns `false`
    /// when the task was aborted instead.
    fn adopt(&self, ctx: &mut TaskContext, plan: Plan, source: PlanSource) -> bool {
        let errors = validate_plan(&plan);
        if !errors.is_empty() {
            ctx.abort(format!("invalid plan: {}", errors.join("; ")), None);
            return false;
        }
        let ids: Vec<u32> = plan.steps.iter().map(|s| s.step_id).collect();
        let count = plan.len();
        ctx.adopt_plan(plan, source);
        self.classify(ctx, &ids);
        ctx.transition(
            Phase::Executing,
            format!("adopted {count}-step plan from {}", source.as_str()),
        );
        true
    }

    fn classify(&self, ctx: &mut TaskContext, step_ids: &[u32]) {
        for &step_id in step_ids {
            let Some(step) = ctx.plan.step_mut(step_id) else {
                continue;
            };
            let classification = self.permissions.classify(step);
            step.risk = Some(classification.risk);
            step.approval = if classification.risk.requires_approval() {
                Approval::Pending
            } else {
                Approval::NotRequired
            };
            info!(
                step_id,
                risk = classification.risk.as_str(),
                reasons = %classification.summary(),
                "step classified"
            );
            ctx.classifications.push(classification);
        }
    }

    fn execute(&self, ctx: &mut TaskContext, cancel: &CancelToken) {
        let mut cursor = ctx.plan.first_step_id();
        while let Some(step_id) = cursor {
            if ctx.is_terminal() || self.cancelled(ctx, cancel, "next step") {
                return;
            }
            let Some(step) = ctx.plan.step(step_id).cloned() else {
                ctx.abort(format!("step {step_id} vanished from the plan"), None);
                return;
            };

            cursor = match self.run_step(ctx, &step) {
                StepRun::Passed => ctx.plan.next_step_id(step_id),
                StepRun::Halted => return,
                StepRun::Failed { result, reason } => {
                    match self.recover(ctx, &step, result, reason, cancel) {
                        Resume::Retry(id) => Some(id),
                        Resume::Replanned {
                            resume_at,
                            appended,
                        } => {
                            let ids: Vec<u32> = appended.iter().map(|s| s.step_id).collect();
                            self.classify(ctx, &ids);
                            Some(resume_at)
                        }
                        Resume::Stop => return,
                    }
                }
            };
        }

        if !ctx.is_terminal() {
            let verified = ctx
                .feedback
                .values()
                .filter(|f| f.verdict == Verdict::Success)
                .count();
            ctx.succeed(format!(
                "plan revision {} complete, {verified} step(s) verified",
                ctx.plan.revision
            ));
        }
    }

    #[instrument(skip_all, fields(step_id = step.step_id))]
    fn run_step(&self, ctx: &mut TaskContext, step: &Step) -> StepRun {
        let step_id = step.step_id;
        let classification = ctx
            .classifications
            .iter()
            .rev()
            .find(|c| c.step_id == step_id)
            .cloned()
            .unwrap_or_else(|| self.permissions.classify(step));

        if classification.risk.requires_approval() {
            ctx.step_transition(
                Phase::AwaitingApproval,
                step_id,
                format!(
                    "{} step needs approval: {}",
                    classification.risk.as_str(),
                    classification.summary()
                ),
            );
            let granted = self.approval.approve(&ApprovalRequest {
                task_id: &ctx.task_id,
                step,
                classification: &classification,
            });
            if let Some(s) = ctx.plan.step_mut(step_id) {
                s.approval = if granted {
                    Approval::Granted
                } else {
                    Approval::Denied
                };
            }
            if !granted {
                let reason = format!(
                    "approval denied for {} step: {}",
                    classification.risk.as_str(),
                    classification.summary()
                );
                info!(%reason, "step blocked");
                ctx.record_feedback(VerificationFeedback {
                    step_id,
                    verdict: Verdict::Failed,
                    rationale: reason.clone(),
                    source: FeedbackSource::Policy,
                });
                ctx.fault_transition(
                    Phase::NeedsRecovery,
                    Some(step_id),
                    FaultKind::PermissionDenied,
                    reason.clone(),
                );
                return StepRun::Failed {
                    result: None,
                    reason,
                };
            }
            ctx.step_transition(Phase::Executing, step_id, "approval granted");
        }

        let Some(invocation) = derive_invocation(step) else {
            let reason = format!("no executable action for step {step_id} ({})", step.tool);
            ctx.record_feedback(VerificationFeedback {
                step_id,
                verdict: Verdict::Failed,
                rationale: reason.clone(),
                source: FeedbackSource::Deterministic,
            });
            ctx.step_transition(Phase::NeedsRecovery, step_id, reason.clone());
            return StepRun::Failed {
                result: None,
                reason,
            };
        };

        let result = match self.sandbox.execute(step_id, &invocation) {
            Ok(result) => result,
            Err(fault) => {
                ctx.abort(format!("step {step_id}: {fault}"), Some(fault.kind()));
                return StepRun::Halted;
            }
        };
        if result.timed_out {
            ctx.fault_transition(
                Phase::Verifying,
                Some(step_id),
                FaultKind::SandboxTimeout,
                format!("step {step_id} hit the wall-clock limit"),
            );
        } else {
            ctx.step_transition(
                Phase::Verifying,
                step_id,
                format!("exit code {} in {} ms", result.exit_code, result.duration_ms),
            );
        }
        if let Err(e) = ctx.record_result(result.clone()) {
            ctx.abort(e, None);
            return StepRun::Halted;
        }

        let feedback = self.verify(ctx, step, &result);
        let passed = feedback.verdict == Verdict::Success;
        let rationale = feedback.rationale.clone();
        ctx.record_feedback(feedback);

        if passed {
            ctx.step_transition(Phase::Executing, step_id, format!("verified: {rationale}"));
            StepRun::Passed
        } else {
            ctx.step_transition(Phase::NeedsRecovery, step_id, rationale.clone());
            StepRun::Failed {
                result: Some(result),
                reason: rationale,
            }
        }
    }

    /// Deterministic checks first; the semantic check only runs on steps
    /// that passed them, and only when enabled.
    fn verify(&self, ctx: &mut TaskContext, step: &Step, result: &ExecutionResult) -> VerificationFeedback {
        let report = heuristic::verify(step, result);
        if report.verdict == Verdict::Failed || !self.config.semantic_verification {
            return VerificationFeedback {
                step_id: step.step_id,
                verdict: report.verdict,
                rationale: report.rationale,
                source: FeedbackSource::Deterministic,
            };
        }

        let answer = self.oracle.verify(&VerifyRequest {
            step: step.clone(),
            result: result.clone(),
        });
        self.note_degraded(
            ctx,
            Stage::Verification,
            Some(step.step_id),
            answer.degraded.as_ref(),
        );
        VerificationFeedback {
            step_id: step.step_id,
            verdict: answer.value.verdict,
            rationale: answer.value.rationale,
            source: match answer.source {
                AnswerSource::Remote => FeedbackSource::Oracle,
                AnswerSource::Heuristic => FeedbackSource::Heuristic,
            },
        }
    }

    fn recover(
        &self,
        ctx: &mut TaskContext,
        step: &Step,
        result: Option<ExecutionResult>,
        failure: String,
        cancel: &CancelToken,
    ) -> Resume {
        let step_id = step.step_id;
        if let Some(reason) = self.recovery.ceiling_reached(ctx) {
            warn!(%reason, "forcing abort");
            ctx.abort(format!("{reason}; last failure: {failure}"), None);
            return Resume::Stop;
        }
        if self.cancelled(ctx, cancel, "recovery") {
            return Resume::Stop;
        }

        let limits = self.recovery.limits();
        let answer = self.oracle.recover(&RecoverRequest {
            intent: ctx.intent.clone(),
            step: step.clone(),
            result,
            failure,
            retry_available: ctx.step_retry_count(step_id) < limits.max_step_retries,
            replans_left: limits.max_retries.saturating_sub(ctx.retry_count),
        });
        self.note_degraded(ctx, Stage::Recovery, Some(step_id), answer.degraded.as_ref());

        let decision = answer.value;
        let is_replan = decision.verdict == RecoveryVerdict::Replan;
        let rationale = decision.rationale.clone();
        let resume = self.recovery.apply(ctx, step_id, decision);

        if is_replan && let Resume::Replanned { appended, .. } = &resume {
            let lesson = Lesson {
                intent: ctx.intent.clone(),
                rationale,
                new_steps: appended.iter().map(|s| s.description.clone()).collect(),
                recorded_at: now_stamp(),
            };
            if let Err(e) = self.cache.append_lesson(lesson) {
                warn!(err = %e, "failed to record recovery lesson");
            }
        }
        resume
    }

    /// Record a remote oracle failure that the heuristics covered for.
    fn note_degraded(
        &self,
        ctx: &mut TaskContext,
        stage: Stage,
        step_id: Option<u32>,
        fault: Option<&OracleFault>,
    ) {
        if let Some(fault) = fault {
            let phase = ctx.phase;
            ctx.fault_transition(
                phase,
                step_id,
                fault.kind(),
                format!("{} answered by heuristics: {fault}", stage.as_str()),
            );
        }
    }

    fn cancelled(&self, ctx: &mut TaskContext, cancel: &CancelToken, before: &str) -> bool {
        if cancel.is_cancelled() {
            ctx.abort(format!("cancelled before {before}"), None);
            return true;
        }
        false
    }
}
