//! Initialization helpers for the kernel state directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{KernelConfig, write_config};

/// Canonical paths within the state directory (default `.kernel/`).
#[derive(Debug, Clone)]
pub struct KernelPaths {
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub cache_path: PathBuf,
    pub tasks_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl KernelPaths {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            config_path: state_dir.join("config.toml"),
            cache_path: state_dir.join("cache.json"),
            tasks_dir: state_dir.join("tasks"),
            gitignore_path: state_dir.join(".gitignore"),
            state_dir,
        }
    }
}

/// Options for `init_kernel`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config.
    pub force: bool,
}

/// Write the default config and create the state and workspace directories.
///
/// Fails if a config already exists unless `options.force` is set. The cache
/// and task records are left alone either way.
pub fn init_kernel(state_dir: &Path, workspace: &Path, options: &InitOptions) -> Result<KernelPaths> {
    let paths = KernelPaths::new(state_dir);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "kernel init: {} exists but is not a directory",
            paths.state_dir.display()
        ));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "kernel init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    create_dir(&paths.state_dir)?;
    create_dir(&paths.tasks_dir)?;
    create_dir(workspace)?;
    write_config(&paths.config_path, &KernelConfig::default())?;
    fs::write(&paths.gitignore_path, STATE_GITIGNORE)
        .with_context(|| format!("write {}", paths.gitignore_path.display()))?;
    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const STATE_GITIGNORE: &str = "tasks/\ncache.json\n";
