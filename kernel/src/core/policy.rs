//! Injectable risk policy tables used by the permission gateway.
//!
//! The policy is plain data: it deserializes from the `[policy]` section of
//! `config.toml` and every field has a default so a partial table still works.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::types::RiskLevel;

/// Category a keyword rule belongs to, recorded in classification reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordCategory {
    Destructive,
    NetworkEgress,
    PrivilegeEscalation,
    Custom,
}

impl KeywordCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            KeywordCategory::Destructive => "destructive",
            KeywordCategory::NetworkEgress => "network egress",
            KeywordCategory::PrivilegeEscalation => "privilege escalation",
            KeywordCategory::Custom => "custom",
        }
    }
}

/// A keyword table elevating matching steps to at least `level`.
///
/// Alphanumeric keywords match on word boundaries (case-insensitive); keywords
/// containing punctuation (`://`, `rm -rf`) match as plain substrings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub category: KeywordCategory,
    pub level: RiskLevel,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskPolicy {
    /// In-sandbox mount points that stand for the workspace root.
    pub mount_aliases: Vec<PathBuf>,

    /// Absolute paths outside the root that steps may reference freely.
    pub allowed_external_paths: Vec<PathBuf>,

    /// Tool names that carry a minimum risk regardless of step content.
    pub restricted_tools: BTreeMap<String, RiskLevel>,

    pub keyword_rules: Vec<KeywordRule>,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            restricted_tools: BTreeMap::from([
                ("network".to_string(), RiskLevel::Risky),
                ("package_manager".to_string(), RiskLevel::Risky),
                ("file_remover".to_string(), RiskLevel::Risky),
                ("system_admin".to_string(), RiskLevel::Dangerous),
            ]),
            mount_aliases: vec![PathBuf::from("/workspace")],
            allowed_external_paths: vec![
                PathBuf::from("/dev/null"),
                PathBuf::from("/dev/stdout"),
                PathBuf::from("/dev/stderr"),
            ],
            keyword_rules: vec![
                KeywordRule {
                    category: KeywordCategory::Destructive,
                    level: RiskLevel::Risky,
                    keywords: words(&[
                        "rm", "rmdir", "delete", "remove", "unlink", "shred", "truncate", "mkfs",
                        "dd", "wipe", "kill", "pkill",
                    ]),
                },
                KeywordRule {
                    category: KeywordCategory::NetworkEgress,
                    level: RiskLevel::Risky,
                    keywords: words(&[
                        "curl",
                        "wget",
                        "ssh",
                        "scp",
                        "rsync",
                        "nc",
                        "netcat",
                        "ftp",
                        "download",
                        "upload",
                        "pip install",
                        "npm install",
                        "apt-get",
                        "://",
                    ]),
                },
                KeywordRule {
                    category: KeywordCategory::PrivilegeEscalation,
                    level: RiskLevel::Dangerous,
                    keywords: words(&[
                        "sudo", "su", "doas", "chmod", "chown", "setuid", "mount", "chroot",
                    ]),
                },
            ],
        }
    }
}

impl RiskPolicy {
    pub fn validate(&self) -> Result<(), String> {
        for rule in &self.keyword_rules {
            if rule.keywords.iter().any(|k| k.trim().is_empty()) {
                return Err(format!(
                    "policy.keyword_rules ({}) contains an empty keyword",
                    rule.category.as_str()
                ));
            }
        }
        for alias in &self.mount_aliases {
            if !alias.is_absolute() {
                return Err(format!(
                    "policy.mount_aliases entry {} must be absolute",
                    alias.display()
                ));
            }
        }
        Ok(())
    }
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}
