//! Deterministic producers used when the remote oracle is unavailable.
//!
//! Every function here is pure and total: the same input always yields the
//! same structured response, and none of them can fail. They cover the common
//! create / read / run / delete instructions and otherwise stay conservative
//! (low confidence, ABORT).

use std::sync::LazyLock;

use regex::Regex;

use crate::core::fingerprint::{ActionTag, action_tags};
use crate::core::invocation::{
    content_mention, file_body, file_mention, read_file_command, run_file_command, shell_quote,
    write_file_command,
};
use crate::core::types::{
    ExecutionResult, IntentAnalysis, RecoveryDecision, RecoveryVerdict, Step, StepAction, Verdict,
    VerificationReport,
};

/// Name of the stand-in file a missing-input repair creates.
pub const FALLBACK_FILE: &str = "fallback.txt";

const WORKSPACE_CONSTRAINT: &str = "operate only inside the workspace";

static CLAUSE_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*(?:;|,\s*(?:and\s+)?(?:then\s+)?|\band\s+then\b|\bthen\b|\band\b)\s*")
        .expect("clause regex should be valid")
});

static MISSING_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)no such file|not found|FileNotFoundError|cannot open|does not exist")
        .expect("missing file regex should be valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Read,
    Create,
    Run,
    Delete,
}

fn leading_verb(clause: &str) -> Option<Verb> {
    let first = clause.split_whitespace().next()?.to_lowercase();
    match first.as_str() {
        "read" | "show" | "cat" | "display" | "view" | "open" | "print" => Some(Verb::Read),
        "create" | "write" | "make" | "save" | "generate" => Some(Verb::Create),
        "run" | "execute" | "launch" => Some(Verb::Run),
        "delete" | "remove" | "erase" => Some(Verb::Delete),
        _ => None,
    }
}

/// Split an instruction into clauses that each start with an action verb.
///
/// Fragments without a leading verb are glued back onto the previous clause
/// so "containing salt and pepper" stays whole.
fn clauses(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut last_end = 0;
    let mut pieces = Vec::new();
    for m in CLAUSE_SPLIT_RE.find_iter(text) {
        pieces.push((&text[last_end..m.start()], m.as_str()));
        last_end = m.end();
    }
    pieces.push((&text[last_end..], ""));

    let mut pending_sep = "";
    for (piece, sep) in pieces {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some(prev) if leading_verb(piece).is_none() => {
                prev.push_str(pending_sep);
                prev.push_str(piece);
            }
            _ => out.push(piece.to_string()),
        }
        pending_sep = sep;
    }
    out
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Structured intent from raw text.
pub fn understand(raw_input: &str) -> IntentAnalysis {
    let intent = raw_input.split_whitespace().collect::<Vec<_>>().join(" ");
    let tags = action_tags(&intent);
    let file = file_mention(&intent);

    let mut tools = Vec::new();
    for tag in &tags {
        let tool = match tag {
            ActionTag::Read => "file_reader",
            ActionTag::Create => "file_writer",
            ActionTag::Run => match &file {
                Some(f) if f.ends_with(".py") => "python_interpreter",
                _ => "shell",
            },
            ActionTag::Delete => "file_remover",
        };
        tools.push(tool.to_string());
    }

    let (confidence, questions) = if tags.is_empty() {
        (
            0.4,
            vec!["What should be done: create, read, run or delete something, and which file?".to_string()],
        )
    } else if file.is_none() {
        (0.7, Vec::new())
    } else {
        (0.85, Vec::new())
    };

    IntentAnalysis {
        intent,
        constraints: vec![WORKSPACE_CONSTRAINT.to_string()],
        suggested_tools: tools,
        confidence,
        clarification_questions: questions,
    }
}

/// Ordered steps for `intent`. Never empty.
pub fn plan(intent: &str, tool_hints: &[String]) -> Vec<Step> {
    let mut steps = Vec::new();
    let mut last_file: Option<String> = None;
    let mut last_content: Option<String> = None;

    for clause in clauses(intent) {
        let verb = leading_verb(&clause);
        let file = file_mention(&clause).or_else(|| last_file.clone());
        let id = steps.len() as u32 + 1;

        let step = match (verb, file.as_deref()) {
            (Some(Verb::Create), Some(path)) => {
                let content = content_mention(&clause).unwrap_or_default();
                last_content = (!content.is_empty()).then(|| content.clone());
                Step::new(
                    id,
                    &capitalize(&clause),
                    "file_writer",
                    &format!("{path} exists"),
                )
                .with_target(path)
                .with_action(StepAction::Shell {
                    command: write_file_command(path, &file_body(path, &content)),
                })
            }
            (Some(Verb::Run), Some(path)) => {
                let tool = if path.ends_with(".py") {
                    "python_interpreter"
                } else {
                    "shell"
                };
                let expected = match &last_content {
                    Some(text) => format!("prints {text}"),
                    None => "exits with status 0".to_string(),
                };
                Step::new(id, &format!("Run {path}"), tool, &expected)
                    .with_target(path)
                    .with_action(StepAction::Shell {
                        command: run_file_command(path),
                    })
            }
            (Some(Verb::Read), Some(path)) => Step::new(
                id,
                &format!("Read {path}"),
                "file_reader",
                &format!("contents of {path} are shown"),
            )
            .with_target(path)
            .with_action(StepAction::Shell {
                command: read_file_command(path),
            }),
            (Some(Verb::Delete), Some(path)) => Step::new(
                id,
                &format!("Delete {path}"),
                "file_remover",
                &format!("{path} no longer exists"),
            )
            .with_target(path)
            .with_action(StepAction::Shell {
                command: format!("rm -f -- {}", shell_quote(path)),
            }),
            _ => Step::new(
                id,
                &capitalize(&clause),
                tool_hints.first().map(String::as_str).unwrap_or("shell"),
                "instruction carried out",
            ),
        };
        if let Some(path) = file {
            last_file = Some(path);
        }
        steps.push(step);
    }

    if steps.is_empty() {
        steps.push(Step::new(
            1,
            &capitalize(intent.trim()),
            tool_hints.first().map(String::as_str).unwrap_or("shell"),
            "instruction carried out",
        ));
    }
    steps
}

/// Exit-status check plus a stdout check for "prints X" expectations.
pub fn verify(step: &Step, result: &ExecutionResult) -> VerificationReport {
    if result.timed_out {
        return failed(format!(
            "step {} timed out after {} ms",
            step.step_id, result.duration_ms
        ));
    }
    if result.exit_code != 0 {
        return failed(format!(
            "step {} exited with status {}",
            step.step_id, result.exit_code
        ));
    }
    if let Some(expected) = content_mention(&step.expected_outcome)
        && !result.stdout.contains(&expected)
    {
        return failed(format!("stdout does not contain `{expected}`"));
    }
    VerificationReport {
        verdict: Verdict::Success,
        rationale: format!("step {} exited with status 0", step.step_id),
    }
}

fn failed(rationale: String) -> VerificationReport {
    VerificationReport {
        verdict: Verdict::Failed,
        rationale,
    }
}

/// Recovery proposal for a failed step.
///
/// `retry_available` tells whether the step still has RETRY budget.
pub fn recover(
    step: &Step,
    result: Option<&ExecutionResult>,
    failure: &str,
    retry_available: bool,
) -> RecoveryDecision {
    let Some(result) = result else {
        return RecoveryDecision::abort(format!(
            "step {} could not run: {failure}",
            step.step_id
        ));
    };

    if result.timed_out && retry_available {
        return RecoveryDecision {
            verdict: RecoveryVerdict::Retry,
            rationale: format!("step {} timed out; retrying", step.step_id),
            new_steps: Vec::new(),
        };
    }

    let reads_input = step.tool.contains("reader")
        || leading_verb(&step.description) == Some(Verb::Read);
    if reads_input && MISSING_FILE_RE.is_match(&result.stderr) {
        let missing = step
            .target
            .clone()
            .or_else(|| file_mention(&step.description))
            .unwrap_or_else(|| "the input".to_string());
        if missing != FALLBACK_FILE {
            let fallback = Step::new(
                1,
                &format!("Create {FALLBACK_FILE} as a stand-in for {missing}"),
                "file_writer",
                &format!("{FALLBACK_FILE} exists"),
            )
            .with_target(FALLBACK_FILE)
            .with_action(StepAction::Shell {
                command: write_file_command(FALLBACK_FILE, &format!("placeholder for {missing}")),
            });
            return RecoveryDecision {
                verdict: RecoveryVerdict::Replan,
                rationale: format!("{missing} is missing; creating {FALLBACK_FILE} instead"),
                new_steps: vec![fallback],
            };
        }
    }

    RecoveryDecision::abort(format!(
        "no deterministic repair for step {} ({failure})",
        step.step_id
    ))
}
