//! End-to-end scenarios with the heuristic planner and the local process
//! backend: real files are written and executed inside a temp workspace.
#![cfg(unix)]

use std::fs;
use std::process::Command;
use std::time::{Duration, Instant};

use kernel::approval::DenyAll;
use kernel::context::Phase;
use kernel::core::invocation::Invocation;
use kernel::core::types::{PlanSource, RiskLevel};
use kernel::io::config::{KernelConfig, SandboxBackendKind, SandboxConfig};
use kernel::io::sandbox::{EnvironmentSpec, ProcessBackend, SandboxManager, SandboxState};
use kernel::io::task_log::read_task_record;
use kernel::pipeline::{Kernel, KernelBuilder};
use tempfile::TempDir;

fn process_config() -> KernelConfig {
    let mut cfg = KernelConfig::default();
    cfg.sandbox.backend = SandboxBackendKind::Process;
    cfg.sandbox.timeout_secs = 10;
    cfg
}

fn kernel(temp: &TempDir) -> Kernel {
    KernelBuilder::new(temp.path().join("ws"), temp.path().join(".kernel"))
        .config(process_config())
        .approval(Box::new(DenyAll))
        .build()
        .expect("kernel")
}

fn has_python3() -> bool {
    Command::new("python3")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

#[test]
fn scenario_a_create_python_file_and_run_it() {
    if !has_python3() {
        eprintln!("python3 not available; skipping");
        return;
    }
    let temp = tempfile::tempdir().expect("tempdir");
    let kernel = kernel(&temp);

    let outcome = kernel.submit("create file.py printing X and run it");
    let task = outcome.task();

    assert_eq!(task.phase, Phase::Success, "error: {:?}", task.error);
    assert_eq!(task.retry_count, 0);
    let descriptions: Vec<&str> = task.plan.steps.iter().map(|s| s.description.as_str()).collect();
    assert_eq!(descriptions, vec!["Create file.py printing X", "Run file.py"]);
    assert!(task.plan.steps.iter().all(|s| s.risk == Some(RiskLevel::Safe)));
    assert_eq!(task.results[&2].stdout.trim(), "X");
    assert!(kernel.workspace().join("file.py").is_file());
}

#[test]
fn scenario_a_with_a_shell_script() {
    let temp = tempfile::tempdir().expect("tempdir");
    let kernel = kernel(&temp);

    let outcome = kernel.submit("create hello.sh printing X and run it");
    let task = outcome.task();

    assert_eq!(task.phase, Phase::Success, "error: {:?}", task.error);
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.plan.len(), 2);
    assert_eq!(task.classifications.len(), 2);
    assert_eq!(task.results[&2].stdout.trim(), "X");
}

#[test]
fn scenario_b_missing_input_is_replanned_with_fallback_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let kernel = kernel(&temp);

    let outcome = kernel.submit("read missing.txt");
    let task = outcome.task();

    assert_eq!(task.phase, Phase::Success, "error: {:?}", task.error);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.plan.revision, 1);
    assert_eq!(task.plan_history.len(), 1);
    assert_ne!(task.results[&1].exit_code, 0);
    assert!(task.plan.steps[1].description.contains("fallback.txt"));
    assert!(kernel.workspace().join("fallback.txt").is_file());

    let lessons = kernel.cache().recent_lessons(10);
    assert_eq!(lessons.len(), 1);
    assert!(lessons[0].rationale.contains("missing.txt"));
}

#[test]
fn second_submission_replays_the_cached_plan() {
    let temp = tempfile::tempdir().expect("tempdir");
    let kernel = kernel(&temp);

    let first = kernel.submit("create note.txt containing hello");
    let second = kernel.submit("create  note.txt containing hello.");

    assert_eq!(first.phase(), Phase::Success);
    assert_eq!(second.phase(), Phase::Success);
    assert_eq!(second.task().plan_source, PlanSource::ExactCache);
    let strip = |steps: &[kernel::core::types::Step]| {
        steps
            .iter()
            .map(|s| s.without_runtime_state())
            .collect::<Vec<_>>()
    };
    assert_eq!(
        strip(&first.task().plan.steps),
        strip(&second.task().plan.steps)
    );
    assert_eq!(kernel.usage().exact_hits, 1);
    assert_eq!(
        fs::read_to_string(kernel.workspace().join("note.txt")).expect("note"),
        "hello\n"
    );
}

#[test]
fn changing_only_letter_case_is_not_an_exact_replay() {
    let temp = tempfile::tempdir().expect("tempdir");
    let kernel = kernel(&temp);

    let upper = kernel.submit("create hello.sh printing X and run it");
    let lower = kernel.submit("create hello.sh printing x and run it");

    assert_eq!(upper.phase(), Phase::Success);
    assert_ne!(upper.task().fingerprint, lower.task().fingerprint);
    assert_ne!(lower.task().plan_source, PlanSource::ExactCache);
    assert_eq!(lower.record.usage.exact_hits, 0);
}

#[test]
fn every_task_leaves_a_record() {
    let temp = tempfile::tempdir().expect("tempdir");
    let kernel = kernel(&temp);

    let outcome = kernel.submit("do something nice");

    assert_eq!(outcome.phase(), Phase::NeedsClarification);
    let path = outcome.record_path.expect("record written");
    let record = read_task_record(&path).expect("record");
    assert_eq!(record.task.phase, Phase::NeedsClarification);
    assert!(record.task.error.is_some());
    assert!(kernel.cache().entries().is_empty());
}

#[test]
fn corrupt_cache_is_a_miss_and_gets_rewritten() {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = temp.path().join(".kernel");
    fs::create_dir_all(&state).expect("state dir");
    fs::write(state.join("cache.json"), "{ not json").expect("corrupt cache");
    let kernel = kernel(&temp);
    assert_eq!(kernel.cache().discarded(), 1);

    let outcome = kernel.submit("create a.txt containing hi");

    assert_eq!(outcome.phase(), Phase::Success);
    assert_eq!(outcome.task().plan_source, PlanSource::Heuristic);
    assert_eq!(outcome.record.usage.misses, 1);
    let raw = fs::read_to_string(state.join("cache.json")).expect("cache");
    assert!(serde_json::from_str::<serde_json::Value>(&raw).is_ok());
    assert_eq!(kernel.cache().entries().len(), 1);
}

#[test]
fn shutdown_stops_the_sandbox_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let kernel = kernel(&temp);
    kernel.submit("create a.txt containing hi");
    assert_eq!(kernel.sandbox().state(), SandboxState::Running);

    assert_eq!(kernel.shutdown(), Ok(true));
    assert_eq!(kernel.shutdown(), Ok(false));
    assert_eq!(kernel.sandbox().teardown_count(), 1);
}

#[test]
fn timeout_is_a_result_and_the_sandbox_stays_usable() {
    let temp = tempfile::tempdir().expect("tempdir");
    let spec = EnvironmentSpec::from_config(temp.path(), &SandboxConfig::default()).expect("spec");
    let timeout = Duration::from_millis(300);
    let manager = SandboxManager::new(spec, timeout, Box::new(ProcessBackend::new()));

    let started = Instant::now();
    let result = manager
        .execute(1, &Invocation::Shell("sleep 5".to_string()))
        .expect("timeout is not a fault");
    assert!(result.timed_out);
    assert_ne!(result.exit_code, 0);
    assert!(started.elapsed() < timeout + Duration::from_secs(2));

    let next = manager
        .execute(2, &Invocation::Shell("echo still here".to_string()))
        .expect("sandbox reusable");
    assert!(!next.timed_out);
    assert_eq!(next.stdout.trim(), "still here");
    assert_eq!(manager.state(), SandboxState::Running);
    assert_eq!(manager.teardown_count(), 0);
}
