//! Kernel configuration stored under `<state_dir>/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::policy::RiskPolicy;
use crate::core::recovery::RecoveryLimits;
use crate::core::types::Tier;

/// Kernel configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    /// REPLAN ceiling per task.
    pub max_retries: u32,

    /// RETRY attempts allowed per step.
    pub max_step_retries: u32,

    /// Intents scored below this retire the task as NEEDS_CLARIFICATION.
    pub confidence_threshold: f64,

    /// Ask the oracle for a semantic verdict after a step exits 0.
    pub semantic_verification: bool,

    pub sandbox: SandboxConfig,
    pub oracle: OracleConfig,
    pub cache: CacheConfig,
    pub policy: RiskPolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackendKind {
    Docker,
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: SandboxBackendKind,
    pub image: String,
    /// Docker-style size (`512m`, `1g`).
    pub memory_limit: String,
    pub cpus: f64,
    /// Allow network access from executed code.
    pub network: bool,
    /// Hard wall-clock limit per execution.
    pub timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackendKind::Docker,
            image: "python:3.10-slim".to_string(),
            memory_limit: "512m".to_string(),
            cpus: 0.5,
            network: false,
            timeout_secs: 30,
            output_limit_bytes: 100_000,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `memory_limit` in bytes.
    pub fn memory_limit_bytes(&self) -> Result<u64> {
        parse_size(&self.memory_limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    /// Command that answers prompts on stdin with JSON on stdout.
    /// Empty means no remote oracle; heuristics are used throughout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Re-dispatches after transient failures (backoff doubles each time).
    pub transient_retries: u32,
    pub backoff_base_ms: u64,
    /// Minimum spacing between dispatches of the same tier.
    pub min_interval_ms: u64,
    pub output_limit_bytes: usize,
    /// Prompts above this size lose their droppable sections first.
    pub prompt_budget_bytes: usize,
    /// Model name passed to the command, keyed by tier name
    /// (`cheap`, `standard`, `premium`).
    pub models: BTreeMap<String, String>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 60,
            transient_retries: 3,
            backoff_base_ms: 5_000,
            min_interval_ms: 0,
            output_limit_bytes: 200_000,
            prompt_budget_bytes: 24_000,
            models: BTreeMap::new(),
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn model_for(&self, tier: Tier) -> Option<&str> {
        self.models.get(tier.as_str()).map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Minimum token similarity for reusing a cached plan.
    pub similarity_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_step_retries: 2,
            confidence_threshold: 0.7,
            semantic_verification: false,
            sandbox: SandboxConfig::default(),
            oracle: OracleConfig::default(),
            cache: CacheConfig::default(),
            policy: RiskPolicy::default(),
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!("confidence_threshold must be within [0, 1]"));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.sandbox.cpus <= 0.0 {
            return Err(anyhow!("sandbox.cpus must be > 0"));
        }
        if self.sandbox.image.trim().is_empty() {
            return Err(anyhow!("sandbox.image must not be empty"));
        }
        self.sandbox
            .memory_limit_bytes()
            .context("sandbox.memory_limit")?;
        if self.oracle.transient_retries > 10 {
            return Err(anyhow!("oracle.transient_retries must be <= 10"));
        }
        if self.oracle.prompt_budget_bytes < 1_024 {
            return Err(anyhow!("oracle.prompt_budget_bytes must be >= 1024"));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if self
            .oracle
            .command
            .first()
            .is_some_and(|program| program.trim().is_empty())
        {
            return Err(anyhow!("oracle.command must start with a program name"));
        }
        if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err(anyhow!("cache.similarity_threshold must be within [0, 1]"));
        }
        self.policy.validate().map_err(|e| anyhow!(e))?;
        Ok(())
    }

    pub fn recovery_limits(&self) -> RecoveryLimits {
        RecoveryLimits {
            max_retries: self.max_retries,
            max_step_retries: self.max_step_retries,
        }
    }
}

/// Parse `512m`, `1g`, `64k` or a plain byte count.
pub fn parse_size(raw: &str) -> Result<u64> {
    let raw = raw.trim().to_lowercase();
    let (digits, multiplier) = match raw.chars().last() {
        Some('k') => (&raw[..raw.len() - 1], 1u64 << 10),
        Some('m') => (&raw[..raw.len() - 1], 1u64 << 20),
        Some('g') => (&raw[..raw.len() - 1], 1u64 << 30),
        _ => (raw.as_str(), 1),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid size `{raw}`"))?;
    if value == 0 {
        return Err(anyhow!("size must be > 0"));
    }
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("size `{raw}` overflows"))
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `KernelConfig::default()`.
pub fn load_config(path: &Path) -> Result<KernelConfig> {
    if !path.exists() {
        let cfg = KernelConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: KernelConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &KernelConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Write `contents` to a sibling temp file, then rename over `path`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp_path = parent.join(format!(
        ".{}.{}.{seq}.tmp",
        file_name.to_string_lossy(),
        std::process::id()
    ));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e).with_context(|| format!("replace {}", path.display()));
    }
    Ok(())
}
