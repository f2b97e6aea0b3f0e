//! Permission gateway: pure risk classification of plan steps.
//!
//! A step is classified from its content alone (description, tool name,
//! declared target and action text), the workspace root and the policy
//! tables. Path-like tokens that resolve outside the root make the step
//! DANGEROUS; keyword and tool rules raise it to at least their level.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::path::{is_drive_path, is_within, resolve_in_root};
use crate::core::policy::{KeywordCategory, RiskPolicy};
use crate::core::types::{RiskLevel, Step, StepAction};

/// Result of classifying one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub step_id: u32,
    pub risk: RiskLevel,
    /// Human-readable reasons for any elevation above SAFE.
    pub reasons: Vec<String>,
}

impl Classification {
    pub fn summary(&self) -> String {
        if self.reasons.is_empty() {
            format!("{}: no risk indicators", self.risk.as_str())
        } else {
            format!("{}: {}", self.risk.as_str(), self.reasons.join("; "))
        }
    }
}

struct CompiledRule {
    category: KeywordCategory,
    level: RiskLevel,
    keyword: String,
    pattern: Matcher,
}

enum Matcher {
    Word(Regex),
    Substring(String),
}

impl Matcher {
    fn is_match(&self, haystack_lower: &str) -> bool {
        match self {
            Matcher::Word(re) => re.is_match(haystack_lower),
            Matcher::Substring(needle) => haystack_lower.contains(needle.as_str()),
        }
    }
}

/// Classifier bound to one workspace root and policy.
///
/// Keyword patterns are compiled once; `classify` is deterministic for a
/// given step.
pub struct PermissionGateway {
    root: PathBuf,
    policy: RiskPolicy,
    rules: Vec<CompiledRule>,
}

impl PermissionGateway {
    pub fn new(root: &Path, policy: RiskPolicy) -> Self {
        let rules = policy
            .keyword_rules
            .iter()
            .flat_map(|rule| {
                rule.keywords.iter().map(move |keyword| CompiledRule {
                    category: rule.category,
                    level: rule.level,
                    keyword: keyword.clone(),
                    pattern: compile_keyword(keyword),
                })
            })
            .collect();
        Self {
            root: root.to_path_buf(),
            policy,
            rules,
        }
    }

    pub fn classify(&self, step: &Step) -> Classification {
        let mut risk = RiskLevel::Safe;
        let mut reasons = Vec::new();

        for raw in path_tokens(step) {
            if let Some(reason) = self.path_escape(&raw) {
                risk = RiskLevel::Dangerous;
                reasons.push(reason);
            }
        }

        let haystack = step_text(step).to_lowercase();
        for rule in &self.rules {
            if rule.pattern.is_match(&haystack) {
                risk = risk.max(rule.level);
                reasons.push(format!(
                    "{} keyword `{}`",
                    rule.category.as_str(),
                    rule.keyword
                ));
            }
        }

        let tool = step.tool.trim().to_lowercase();
        if let Some(level) = self.policy.restricted_tools.get(&tool) {
            risk = risk.max(*level);
            reasons.push(format!("restricted tool `{tool}`"));
        }

        Classification {
            step_id: step.step_id,
            risk,
            reasons,
        }
    }

    fn path_escape(&self, raw: &str) -> Option<String> {
        if raw.starts_with('~') {
            return Some(format!("path `{raw}` refers to a home directory"));
        }
        if is_drive_path(raw) {
            return Some(format!("path `{raw}` is a drive path outside the workspace"));
        }
        let resolved = resolve_in_root(&self.root, raw, &self.policy.mount_aliases);
        if is_within(&self.root, &resolved) {
            return None;
        }
        if self
            .policy
            .allowed_external_paths
            .iter()
            .any(|allowed| resolved == *allowed)
        {
            return None;
        }
        Some(format!(
            "path `{raw}` resolves to {} outside the workspace",
            resolved.display()
        ))
    }
}

/// Classify a single step against `root` with `policy`.
pub fn classify(step: &Step, workspace_root: &Path, policy: &RiskPolicy) -> Classification {
    PermissionGateway::new(workspace_root, policy.clone()).classify(step)
}

fn compile_keyword(keyword: &str) -> Matcher {
    let lower = keyword.trim().to_lowercase();
    let wordlike = lower
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ' ');
    if !wordlike {
        return Matcher::Substring(lower);
    }
    let body = lower
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+");
    match Regex::new(&format!(r"(^|[^\w-]){body}($|[^\w-])")) {
        Ok(re) => Matcher::Word(re),
        Err(_) => Matcher::Substring(lower),
    }
}

fn step_text(step: &Step) -> String {
    let mut text = format!("{}\n{}", step.description, step.tool);
    if let Some(target) = &step.target {
        text.push('\n');
        text.push_str(target);
    }
    if let Some(action) = &step.action {
        text.push('\n');
        text.push_str(action_text(action));
    }
    text
}

fn action_text(action: &StepAction) -> &str {
    match action {
        StepAction::Shell { command } => command,
        StepAction::Python { code } => code,
    }
}

/// Extract path-like tokens from every text field of the step.
fn path_tokens(step: &Step) -> Vec<String> {
    let mut tokens = Vec::new();
    if let Some(target) = &step.target {
        let target = target.trim();
        if !target.is_empty() {
            tokens.push(target.to_string());
        }
    }
    for token in step_text(step).split(is_separator) {
        let token = if token == ".." {
            token
        } else {
            token.trim_end_matches(|c: char| matches!(c, '.' | ',' | ':' | '!' | '?'))
        };
        if token.is_empty() || token.contains("://") {
            continue;
        }
        if looks_like_path(token) && !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
    }
    tokens
}

fn is_separator(c: char) -> bool {
    c.is_whitespace()
        || matches!(
            c,
            '"' | '\'' | '`' | ';' | '|' | '&' | '<' | '>' | '(' | ')' | '[' | ']' | '{' | '}'
                | ',' | '='
        )
}

fn looks_like_path(token: &str) -> bool {
    token.starts_with('/')
        || token.starts_with('~')
        || token == ".."
        || token.starts_with("./")
        || token.starts_with("../")
        || is_drive_path(token)
        || token.contains('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> PermissionGateway {
        PermissionGateway::new(Path::new("/ws"), RiskPolicy::default())
    }

    fn step(description: &str) -> Step {
        Step::new(1, description, "file_reader", "contents are shown")
    }

    #[test]
    fn traversal_out_of_root_is_dangerous() {
        let c = gateway().classify(&step("read /ws/sub/../../etc/passwd"));
        assert_eq!(c.risk, RiskLevel::Dangerous);
        assert!(c.reasons[0].contains("/etc/passwd"));
    }

    #[test]
    fn contained_path_without_keywords_is_safe() {
        let c = gateway().classify(&step("read /ws/sub/a.txt"));
        assert_eq!(c.risk, RiskLevel::Safe);
        assert!(c.reasons.is_empty());
    }

    #[test]
    fn relative_paths_resolve_against_root() {
        assert_eq!(
            gateway().classify(&step("read notes/a.txt")).risk,
            RiskLevel::Safe
        );
        assert_eq!(
            gateway().classify(&step("read ../outside.txt")).risk,
            RiskLevel::Dangerous
        );
    }

    #[test]
    fn declared_target_is_checked() {
        let s = step("read the configuration").with_target("/etc/hosts");
        assert_eq!(gateway().classify(&s).risk, RiskLevel::Dangerous);
    }

    #[test]
    fn action_paths_are_checked() {
        let s = step("print a file").with_action(StepAction::Shell {
            command: "cat '/etc/shadow'".to_string(),
        });
        assert_eq!(gateway().classify(&s).risk, RiskLevel::Dangerous);
    }

    #[test]
    fn mount_alias_and_device_paths_are_allowed() {
        let s = step("write output").with_action(StepAction::Shell {
            command: "echo hi > /workspace/out.txt 2>/dev/null".to_string(),
        });
        assert_eq!(gateway().classify(&s).risk, RiskLevel::Safe);
    }

    #[test]
    fn home_and_drive_paths_are_dangerous() {
        assert_eq!(
            gateway().classify(&step("read ~/.ssh/id_rsa")).risk,
            RiskLevel::Dangerous
        );
        assert_eq!(
            gateway().classify(&step(r"read C:\Windows\win.ini")).risk,
            RiskLevel::Dangerous
        );
    }

    #[test]
    fn destructive_keyword_elevates_to_risky() {
        let c = gateway().classify(&step("delete a.txt"));
        assert_eq!(c.risk, RiskLevel::Risky);
        assert!(c.reasons.iter().any(|r| r.contains("destructive")));
    }

    #[test]
    fn keywords_match_whole_words_only() {
        assert_eq!(
            gateway().classify(&step("add a summary to report.md")).risk,
            RiskLevel::Safe
        );
        assert_eq!(
            gateway().classify(&step("read the form")).risk,
            RiskLevel::Safe
        );
    }

    #[test]
    fn privilege_keyword_is_dangerous() {
        let s = step("fix permissions").with_action(StepAction::Shell {
            command: "sudo chown root a.txt".to_string(),
        });
        assert_eq!(gateway().classify(&s).risk, RiskLevel::Dangerous);
    }

    #[test]
    fn urls_are_network_egress_not_paths() {
        let c = gateway().classify(&step("fetch https://example.com/data.json"));
        assert_eq!(c.risk, RiskLevel::Risky);
        assert!(c.reasons.iter().all(|r| !r.starts_with("path")));
    }

    #[test]
    fn restricted_tool_sets_minimum_level() {
        let mut s = step("tidy up");
        s.tool = "system_admin".to_string();
        assert_eq!(gateway().classify(&s).risk, RiskLevel::Dangerous);
    }

    #[test]
    fn classification_is_deterministic() {
        let s = step("delete ../x.txt");
        assert_eq!(gateway().classify(&s), gateway().classify(&s));
        assert_eq!(
            classify(&s, Path::new("/ws"), &RiskPolicy::default()),
            gateway().classify(&s)
        );
    }
}
