//! Task records under `<state_dir>/tasks/`.
//!
//! Every submission that reaches a terminal phase leaves one JSON record with
//! the full task context (plan revisions, transitions with rationales,
//! results, feedback) and the usage it caused.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::context::TaskContext;
use crate::usage::UsageSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: u64,
    /// Counter deltas attributable to this task.
    pub usage: UsageSnapshot,
    pub task: TaskContext,
}

/// Sortable, collision-resistant id: UTC timestamp plus a random suffix.
pub fn new_task_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        suffix.to_lowercase()
    )
}

pub fn task_record_path(tasks_dir: &Path, task_id: &str) -> PathBuf {
    tasks_dir.join(format!("{task_id}.json"))
}

pub fn write_task_record(tasks_dir: &Path, record: &TaskRecord) -> Result<PathBuf> {
    fs::create_dir_all(tasks_dir)
        .with_context(|| format!("create tasks dir {}", tasks_dir.display()))?;
    let path = task_record_path(tasks_dir, &record.task_id);
    let mut buf = serde_json::to_string_pretty(record)?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write task record {}", path.display()))?;
    Ok(path)
}

pub fn read_task_record(path: &Path) -> Result<TaskRecord> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read task record {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Phase;

    #[test]
    fn task_ids_are_unique_and_timestamped() {
        let a = new_task_id();
        let b = new_task_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), "20260101T000000Z-abcdef".len());
        assert!(a.as_bytes()[8] == b'T');
    }

    #[test]
    fn record_round_trips_through_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut task = TaskContext::new("t-1", "list files", "abc");
        task.abort("sandbox unavailable", None);
        let record = TaskRecord {
            task_id: "t-1".to_string(),
            started_at: "2026-01-01T00:00:00Z".to_string(),
            finished_at: "2026-01-01T00:00:01Z".to_string(),
            duration_ms: 1000,
            usage: UsageSnapshot::default(),
            task,
        };

        let path = write_task_record(&temp.path().join("tasks"), &record).expect("write");
        assert!(path.ends_with("tasks/t-1.json"));
        let loaded = read_task_record(&path).expect("read");
        assert_eq!(loaded, record);
        assert_eq!(loaded.task.phase, Phase::Aborted);
        assert_eq!(loaded.task.error.as_deref(), Some("sandbox unavailable"));
    }
}
