//! Stage schemas and reply parsing.
//!
//! Oracle replies are free text that should contain one JSON document. The
//! document is extracted, validated against the stage schema (Draft 2020-12)
//! and only then deserialized, so a reply that parses but violates the
//! contract is still rejected as malformed.

use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde::Deserialize;
use serde_json::Value;

use super::OracleResponse;
use crate::core::types::{
    IntentAnalysis, RecoveryDecision, RecoveryVerdict, Stage, Step, StepAction, VerificationReport,
};

const INTENT_SCHEMA: &str = include_str!("../../../schemas/oracle/intent.schema.json");
const PLAN_SCHEMA: &str = include_str!("../../../schemas/oracle/plan.schema.json");
const VERIFICATION_SCHEMA: &str =
    include_str!("../../../schemas/oracle/verification.schema.json");
const RECOVERY_SCHEMA: &str = include_str!("../../../schemas/oracle/recovery.schema.json");

static SCHEMAS: LazyLock<SchemaSet> = LazyLock::new(SchemaSet::compile);

struct SchemaSet {
    intent: Validator,
    plan: Validator,
    verification: Validator,
    recovery: Validator,
}

impl SchemaSet {
    fn compile() -> Self {
        Self {
            intent: compile(INTENT_SCHEMA),
            plan: compile(PLAN_SCHEMA),
            verification: compile(VERIFICATION_SCHEMA),
            recovery: compile(RECOVERY_SCHEMA),
        }
    }

    fn for_stage(&self, stage: Stage) -> &Validator {
        match stage {
            Stage::Intent => &self.intent,
            Stage::Planning => &self.plan,
            Stage::Verification => &self.verification,
            Stage::Recovery => &self.recovery,
        }
    }
}

fn compile(raw: &str) -> Validator {
    let schema: Value = serde_json::from_str(raw).expect("embedded schema should be valid JSON");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("embedded schema should compile")
}

/// Raw text of the schema a stage reply must satisfy (included in prompts).
pub fn schema_text(stage: Stage) -> &'static str {
    match stage {
        Stage::Intent => INTENT_SCHEMA,
        Stage::Planning => PLAN_SCHEMA,
        Stage::Verification => VERIFICATION_SCHEMA,
        Stage::Recovery => RECOVERY_SCHEMA,
    }
}

/// Step as proposed on the wire; the action is flattened into `command`/`code`.
#[derive(Debug, Deserialize)]
struct WireStep {
    #[serde(default)]
    step_id: Option<u32>,
    description: String,
    tool: String,
    #[serde(default)]
    expected_outcome: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

impl WireStep {
    fn into_step(self, fallback_id: u32) -> Step {
        let mut step = Step::new(
            self.step_id.unwrap_or(fallback_id),
            self.description.trim(),
            self.tool.trim(),
            self.expected_outcome.trim(),
        );
        step.target = self.target.filter(|t| !t.trim().is_empty());
        step.action = match (self.command, self.code) {
            (Some(command), _) => Some(StepAction::Shell { command }),
            (None, Some(code)) => Some(StepAction::Python { code }),
            (None, None) => None,
        };
        step
    }
}

fn into_steps(wire: Vec<WireStep>) -> Vec<Step> {
    wire.into_iter()
        .enumerate()
        .map(|(i, s)| s.into_step(i as u32 + 1))
        .collect()
}

#[derive(Debug, Deserialize)]
struct WireRecovery {
    verdict: RecoveryVerdict,
    rationale: String,
    #[serde(default)]
    new_steps: Vec<WireStep>,
}

/// Parse and validate a reply for `stage`.
///
/// The error string explains what was wrong and is fed back in the strict
/// re-prompt.
pub fn parse_response(stage: Stage, reply: &str) -> Result<OracleResponse, String> {
    let value = extract_json(reply)?;
    let validator = SCHEMAS.for_stage(stage);
    let messages: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(format!(
            "{} reply violates schema: {}",
            stage.as_str(),
            messages.join("; ")
        ));
    }

    let bad = |e: serde_json::Error| format!("{} reply has wrong shape: {e}", stage.as_str());
    let response = match stage {
        Stage::Intent => {
            let analysis: IntentAnalysis = serde_json::from_value(value).map_err(bad)?;
            OracleResponse::Intent(analysis)
        }
        Stage::Planning => {
            let steps: Vec<WireStep> = serde_json::from_value(value).map_err(bad)?;
            OracleResponse::Plan(into_steps(steps))
        }
        Stage::Verification => {
            let report: VerificationReport = serde_json::from_value(value).map_err(bad)?;
            OracleResponse::Verify(report)
        }
        Stage::Recovery => {
            let wire: WireRecovery = serde_json::from_value(value).map_err(bad)?;
            OracleResponse::Recover(RecoveryDecision {
                verdict: wire.verdict,
                rationale: wire.rationale,
                new_steps: into_steps(wire.new_steps),
            })
        }
    };
    Ok(response)
}

/// Pull the JSON document out of a reply that may wrap it in prose or fences.
fn extract_json(reply: &str) -> Result<Value, String> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Err("reply is empty".to_string());
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    let unfenced = strip_fences(trimmed);
    if let Ok(value) = serde_json::from_str::<Value>(unfenced) {
        return Ok(value);
    }
    let start = unfenced
        .find(['{', '['])
        .ok_or_else(|| "reply contains no JSON document".to_string())?;
    let mut stream = serde_json::Deserializer::from_str(&unfenced[start..]).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(format!("reply is not valid JSON: {e}")),
        None => Err("reply contains no JSON document".to_string()),
    }
}

fn strip_fences(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let body = &text[open + 3..];
    let body = body.find('\n').map_or(body, |nl| &body[nl + 1..]);
    match body.rfind("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Verdict;

    #[test]
    fn intent_reply_is_parsed() {
        let reply = r#"{"intent":"list files","constraints":[],"suggested_tools":["shell"],"confidence":0.9,"clarification_questions":[]}"#;
        let OracleResponse::Intent(analysis) =
            parse_response(Stage::Intent, reply).expect("valid")
        else {
            panic!("wrong variant");
        };
        assert_eq!(analysis.intent, "list files");
        assert_eq!(analysis.confidence, 0.9);
    }

    #[test]
    fn confidence_out_of_range_is_rejected() {
        let reply = r#"{"intent":"x","constraints":[],"suggested_tools":[],"confidence":1.5,"clarification_questions":[]}"#;
        let err = parse_response(Stage::Intent, reply).expect_err("invalid");
        assert!(err.contains("violates schema"), "{err}");
    }

    #[test]
    fn fenced_plan_with_prose_is_accepted() {
        let reply = "Here is the plan:\n```json\n[{\"step_id\":1,\"description\":\"List files\",\"tool\":\"shell\",\"expected_outcome\":\"names printed\",\"command\":\"ls\"}]\n```\n";
        let OracleResponse::Plan(steps) = parse_response(Stage::Planning, reply).expect("valid")
        else {
            panic!("wrong variant");
        };
        assert_eq!(steps.len(), 1);
        assert_eq!(
            steps[0].action,
            Some(StepAction::Shell {
                command: "ls".to_string()
            })
        );
    }

    #[test]
    fn plan_step_with_both_command_and_code_is_rejected() {
        let reply = r#"[{"step_id":1,"description":"d","tool":"t","expected_outcome":"e","command":"ls","code":"print(1)"}]"#;
        assert!(parse_response(Stage::Planning, reply).is_err());
    }

    #[test]
    fn empty_plan_is_rejected() {
        assert!(parse_response(Stage::Planning, "[]").is_err());
    }

    #[test]
    fn verification_verdict_must_be_known() {
        let ok = parse_response(
            Stage::Verification,
            r#"{"verdict":"FAILED","rationale":"stdout empty"}"#,
        )
        .expect("valid");
        assert_eq!(
            ok,
            OracleResponse::Verify(VerificationReport {
                verdict: Verdict::Failed,
                rationale: "stdout empty".to_string()
            })
        );
        assert!(
            parse_response(Stage::Verification, r#"{"verdict":"MAYBE","rationale":"?"}"#)
                .is_err()
        );
    }

    #[test]
    fn replan_without_steps_is_rejected() {
        let reply = r#"{"verdict":"REPLAN","rationale":"try again"}"#;
        assert!(parse_response(Stage::Recovery, reply).is_err());
        let reply = r#"{"verdict":"REPLAN","rationale":"r","new_steps":[]}"#;
        assert!(parse_response(Stage::Recovery, reply).is_err());
    }

    #[test]
    fn replan_steps_get_sequential_ids_when_missing() {
        let reply = r#"{"verdict":"REPLAN","rationale":"r","new_steps":[
            {"description":"a","tool":"shell","expected_outcome":"x","command":"true"},
            {"description":"b","tool":"python","expected_outcome":"y","code":"print(1)"}]}"#;
        let OracleResponse::Recover(decision) =
            parse_response(Stage::Recovery, reply).expect("valid")
        else {
            panic!("wrong variant");
        };
        assert_eq!(decision.verdict, RecoveryVerdict::Replan);
        let ids: Vec<u32> = decision.new_steps.iter().map(|s| s.step_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(matches!(
            decision.new_steps[1].action,
            Some(StepAction::Python { .. })
        ));
    }

    #[test]
    fn prose_without_json_is_malformed() {
        let err = parse_response(Stage::Verification, "looks fine to me").expect_err("no json");
        assert!(err.contains("no JSON"), "{err}");
    }
}
