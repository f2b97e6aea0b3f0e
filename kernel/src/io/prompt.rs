//! Prompt rendering for oracle requests.
//!
//! Each stage has a minijinja template whose sections are tagged with
//! `<!-- section:KEY required|droppable -->` markers. When a rendered prompt
//! exceeds the byte budget, droppable sections are removed in a fixed order
//! (lessons and raw output first) before anything required is truncated.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::types::Stage;
use crate::io::oracle::OracleRequest;
use crate::io::oracle::schema::schema_text;

const INTENT_TEMPLATE: &str = include_str!("prompts/intent.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const VERIFY_TEMPLATE: &str = include_str!("prompts/verify.md");
const RECOVER_TEMPLATE: &str = include_str!("prompts/recover.md");

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section marker regex should be valid")
});

/// Drop order when over budget.
const DROP_ORDER: [&str; 5] = ["lessons", "tools", "stdout", "constraints", "stderr"];

fn template_name(stage: Stage) -> &'static str {
    match stage {
        Stage::Intent => "intent",
        Stage::Planning => "plan",
        Stage::Verification => "verify",
        Stage::Recovery => "recover",
    }
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<(String, bool, usize, usize)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                caps[1].to_string(),
                &caps[2] == "required",
                whole.start(),
                whole.end(),
            ))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (key, required, _, body_start)) in markers.iter().enumerate() {
        let body_end = markers
            .get(i + 1)
            .map(|next| next.2)
            .unwrap_or(rendered.len());
        let content = rendered[*body_start..body_end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(total_len(rest));
    if last.content.len() > allowed {
        let before_len = last.content.len();
        let mut cut = allowed.saturating_sub(12);
        while cut > 0 && !last.content.is_char_boundary(cut) {
            cut -= 1;
        }
        last.content.truncate(cut);
        last.content.push_str("\n[truncated]");
        debug!(
            section = %last.key,
            before_len,
            after_len = last.content.len(),
            "truncated prompt section for budget"
        );
    }
}

/// Renders stage prompts within a byte budget.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        let mut env = Environment::new();
        for (name, source) in [
            ("intent", INTENT_TEMPLATE),
            ("plan", PLAN_TEMPLATE),
            ("verify", VERIFY_TEMPLATE),
            ("recover", RECOVER_TEMPLATE),
        ] {
            env.add_template(name, source)
                .expect("embedded prompt template should be valid");
        }
        Self { env, budget_bytes }
    }

    /// Render the prompt for `request`.
    ///
    /// `rejection` switches to the strict variant, quoting why the previous
    /// reply was refused.
    pub fn build(&self, request: &OracleRequest, rejection: Option<&str>) -> Result<String> {
        let stage = request.stage();
        let template = self.env.get_template(template_name(stage))?;
        let schema = schema_text(stage).trim();
        let strict = rejection.is_some();
        let rejection = rejection.unwrap_or_default();

        let rendered = match request {
            OracleRequest::Intent(req) => template.render(context! {
                schema, strict, rejection,
                raw_input => req.raw_input.trim(),
                threshold => req.confidence_threshold,
            }),
            OracleRequest::Plan(req) => template.render(context! {
                schema, strict, rejection,
                intent => req.intent.trim(),
                constraints => &req.constraints,
                tools => &req.tool_hints,
                lessons => &req.lessons,
            }),
            OracleRequest::Verify(req) => template.render(context! {
                schema, strict, rejection,
                step => &req.step,
                result => &req.result,
            }),
            OracleRequest::Recover(req) => template.render(context! {
                schema, strict, rejection,
                intent => req.intent.trim(),
                step => &req.step,
                result => &req.result,
                failure => req.failure.trim(),
                retry_available => req.retry_available,
                replans_left => req.replans_left,
            }),
        }
        .with_context(|| format!("render {} prompt", stage.as_str()))?;

        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}
