//! Agent kernel CLI.
//!
//! Submits natural-language instructions to the task pipeline, manages the
//! plan cache and measures cache effectiveness. State lives in `.kernel/`;
//! executed code only sees the workspace directory.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kernel::approval::{ApprovalChannel, ApprovalRequest, AutoApprove, DenyAll};
use kernel::exit_codes;
use kernel::io::cache_store::PlanCache;
use kernel::io::init::{InitOptions, KernelPaths, init_kernel};
use kernel::logging;
use kernel::pipeline::{Kernel, TaskOutcome};
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "kernel",
    version,
    about = "Supervised agent kernel: plan, check, sandbox and verify instructions"
)]
struct Cli {
    #[command(flatten)]
    dirs: Dirs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Dirs {
    /// Directory mounted into the sandbox; the only place steps may touch.
    #[arg(long, global = true, default_value = "sandbox_workspace")]
    workspace: PathBuf,

    /// Directory holding config, cache and task records.
    #[arg(long, global = true, default_value = ".kernel")]
    state_dir: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config and create the workspace.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one instruction to completion.
    Run {
        /// The instruction, e.g. "create hello.py printing hi and run it".
        #[arg(required = true, num_args = 1..)]
        instruction: Vec<String>,

        /// Approve every RISKY and DANGEROUS step without asking.
        #[arg(long, conflicts_with = "deny")]
        yes: bool,

        /// Deny every step that needs approval.
        #[arg(long)]
        deny: bool,

        /// Print the task record as JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },
    /// Inspect or edit the plan cache.
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
    /// Submit the same instruction repeatedly and report oracle savings.
    Stress {
        #[arg(required = true, num_args = 1..)]
        instruction: Vec<String>,

        #[arg(short = 'n', long, default_value_t = 10)]
        iterations: u32,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// List cached plans.
    List,
    /// Drop the entry for a fingerprint.
    Invalidate { fingerprint: String },
}

/// Asks on `prompt`, reads the answer from `input`. Anything but "y"/"yes"
/// denies, and so does a prompt that cannot be shown.
fn ask_approval(
    request: &ApprovalRequest<'_>,
    prompt: &mut impl Write,
    input: &mut impl BufRead,
) -> io::Result<bool> {
    writeln!(
        prompt,
        "step {} [{}] {}\n  reasons: {}\napprove? [y/N] ",
        request.step.step_id,
        request.classification.risk.as_str(),
        request.step.description,
        request.classification.summary()
    )?;
    prompt.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

struct TerminalApproval;

impl ApprovalChannel for TerminalApproval {
    fn approve(&self, request: &ApprovalRequest<'_>) -> bool {
        ask_approval(request, &mut io::stderr().lock(), &mut io::stdin().lock()).unwrap_or_else(
            |e| {
                warn!(err = %e, step_id = request.step.step_id, "approval prompt failed, denying");
                false
            },
        )
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let dirs = cli.dirs;
    match cli.command {
        Command::Init { force } => cmd_init(&dirs, force),
        Command::Run {
            instruction,
            yes,
            deny,
            json,
        } => {
            let approval: Box<dyn ApprovalChannel> = if yes {
                Box::new(AutoApprove)
            } else if deny {
                Box::new(DenyAll)
            } else {
                Box::new(TerminalApproval)
            };
            cmd_run(&dirs, &instruction.join(" "), approval, json)
        }
        Command::Cache { command } => cmd_cache(&dirs, command),
        Command::Stress {
            instruction,
            iterations,
        } => cmd_stress(&dirs, &instruction.join(" "), iterations),
    }
}

fn cmd_init(dirs: &Dirs, force: bool) -> Result<i32> {
    let paths = init_kernel(&dirs.state_dir, &dirs.workspace, &InitOptions { force })?;
    println!("wrote {}", paths.config_path.display());
    println!("workspace {}", dirs.workspace.display());
    Ok(exit_codes::OK)
}

fn cmd_run(
    dirs: &Dirs,
    instruction: &str,
    approval: Box<dyn ApprovalChannel>,
    json: bool,
) -> Result<i32> {
    let kernel = Kernel::open(&dirs.workspace, &dirs.state_dir, approval)?;
    let outcome = kernel.submit(instruction);
    finish(&kernel);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&outcome.record).context("serialize task record")?
        );
    } else {
        print_summary(&outcome);
    }
    Ok(exit_codes::for_phase(outcome.phase()))
}

fn cmd_cache(dirs: &Dirs, command: CacheCommand) -> Result<i32> {
    let cache = PlanCache::open(&KernelPaths::new(&dirs.state_dir).cache_path);
    match command {
        CacheCommand::List => {
            let entries = cache.entries();
            if entries.is_empty() {
                println!("cache is empty");
            }
            for entry in entries {
                println!(
                    "{}  {} step(s)  hits={}  last_used={}  {}",
                    entry.fingerprint,
                    entry.plan.len(),
                    entry.hits,
                    entry.last_used,
                    entry.normalized_input
                );
            }
            Ok(exit_codes::OK)
        }
        CacheCommand::Invalidate { fingerprint } => {
            if cache.invalidate(&fingerprint)? {
                println!("invalidated {fingerprint}");
                Ok(exit_codes::OK)
            } else {
                eprintln!("no cache entry for {fingerprint}");
                Ok(exit_codes::INVALID)
            }
        }
    }
}

fn cmd_stress(dirs: &Dirs, instruction: &str, iterations: u32) -> Result<i32> {
    let kernel = Kernel::open(&dirs.workspace, &dirs.state_dir, Box::new(DenyAll))?;
    let mut calls = Vec::new();
    let mut successes = 0u32;
    for i in 1..=iterations {
        let outcome = kernel.submit(instruction);
        let usage = outcome.record.usage;
        println!(
            "#{i:<3} {:<20} plan={:<13} oracle_calls={} cache(exact={}, similar={})",
            outcome.phase().as_str(),
            outcome.task().plan_source.as_str(),
            usage.remote_calls(),
            usage.exact_hits,
            usage.similar_hits
        );
        if outcome.phase() == kernel::context::Phase::Success {
            successes += 1;
        }
        calls.push(usage.remote_calls());
    }
    finish(&kernel);

    println!("{successes}/{iterations} succeeded");
    if let Some((first, rest)) = calls.split_first()
        && !rest.is_empty()
    {
        let later = rest.iter().sum::<u64>() as f64 / rest.len() as f64;
        if *first > 0 {
            println!(
                "oracle calls: first run {first}, later runs {later:.2} on average ({:.0}% fewer)",
                (1.0 - later / *first as f64) * 100.0
            );
        } else {
            println!("oracle calls: first run 0, later runs {later:.2} on average");
        }
    }
    Ok(exit_codes::OK)
}

/// Tear the sandbox down and report usage on stderr.
fn finish(kernel: &Kernel) {
    if let Err(e) = kernel.shutdown() {
        warn!(err = %e, "sandbox teardown failed");
    }
    eprintln!("{}", kernel.usage());
}

fn print_summary(outcome: &TaskOutcome) {
    let task = outcome.task();
    println!("task {}  fingerprint {}", task.task_id, task.fingerprint);
    println!("intent: {}", task.intent);
    println!(
        "plan (revision {}, from {}):",
        task.plan.revision,
        task.plan_source.as_str()
    );
    for step in &task.plan.steps {
        let risk = step.risk.map(|r| r.as_str()).unwrap_or("-");
        let status = match (task.feedback.get(&step.step_id), task.skipped.get(&step.step_id)) {
            (Some(feedback), _) => format!("{:?}: {}", feedback.verdict, feedback.rationale),
            (None, Some(reason)) => format!("skipped: {reason}"),
            (None, None) => "not run".to_string(),
        };
        println!(
            "  {}. [{}] {}  ({})",
            step.step_id, risk, step.description, status
        );
        if let Some(result) = task.results.get(&step.step_id)
            && !result.stdout.trim().is_empty()
        {
            for line in result.stdout.trim_end().lines() {
                println!("     | {line}");
            }
        }
    }
    println!("phase: {}", task.phase.as_str());
    if let Some(reason) = &task.error {
        println!("reason: {reason}");
    }
    if task.retry_count > 0 {
        println!("replans: {}", task.retry_count);
    }
    if let Some(path) = &outcome.record_path {
        println!("record: {}", display_path(path));
    }
}

fn display_path(path: &Path) -> String {
    std::env::current_dir()
        .ok()
        .and_then(|cwd| path.strip_prefix(cwd).ok().map(Path::to_path_buf))
        .unwrap_or_else(|| path.to_path_buf())
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel::core::permission::Classification;
    use kernel::core::types::{RiskLevel, Step};

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn answer(prompt: &mut impl Write, reply: &str) -> io::Result<bool> {
        let step = Step::new(1, "Delete old.txt", "shell", "gone");
        let classification = Classification {
            step_id: 1,
            risk: RiskLevel::Risky,
            reasons: vec!["destructive keyword 'delete'".to_string()],
        };
        let request = ApprovalRequest {
            task_id: "t",
            step: &step,
            classification: &classification,
        };
        ask_approval(&request, prompt, &mut reply.as_bytes())
    }

    #[test]
    fn only_yes_approves() {
        let mut shown = Vec::new();
        assert!(answer(&mut shown, "y\n").expect("answer"));
        assert!(answer(&mut Vec::new(), "YES\n").expect("answer"));
        assert!(!answer(&mut Vec::new(), "sure\n").expect("answer"));
        assert!(!answer(&mut Vec::new(), "").expect("answer"));
        let shown = String::from_utf8(shown).expect("utf8");
        assert!(shown.contains("step 1 [RISKY] Delete old.txt"));
    }

    #[test]
    fn unwritable_prompt_is_an_error_not_an_answer() {
        assert!(answer(&mut BrokenPipe, "y\n").is_err());
    }

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["kernel", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
        assert_eq!(cli.dirs.state_dir, PathBuf::from(".kernel"));
        assert_eq!(cli.dirs.workspace, PathBuf::from("sandbox_workspace"));
    }

    #[test]
    fn parse_run_joins_instruction_words() {
        let cli = Cli::parse_from([
            "kernel",
            "--workspace",
            "/tmp/ws",
            "run",
            "read",
            "notes.txt",
            "--yes",
        ]);
        match cli.command {
            Command::Run {
                instruction, yes, ..
            } => {
                assert_eq!(instruction.join(" "), "read notes.txt");
                assert!(yes);
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.dirs.workspace, PathBuf::from("/tmp/ws"));
    }

    #[test]
    fn yes_and_deny_conflict() {
        assert!(Cli::try_parse_from(["kernel", "run", "x", "--yes", "--deny"]).is_err());
    }

    #[test]
    fn parse_cache_invalidate_and_stress() {
        let cli = Cli::parse_from(["kernel", "cache", "invalidate", "abc123"]);
        assert!(matches!(
            cli.command,
            Command::Cache {
                command: CacheCommand::Invalidate { ref fingerprint }
            } if fingerprint == "abc123"
        ));

        let cli = Cli::parse_from(["kernel", "stress", "read", "a.txt", "-n", "3"]);
        assert!(matches!(cli.command, Command::Stress { iterations: 3, .. }));
    }
}
