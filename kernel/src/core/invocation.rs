//! Deriving a concrete sandbox invocation from a plan step.
//!
//! Steps from the planner may carry an explicit [`StepAction`]. When they do
//! not, a small deterministic derivation maps well-known tools and verbs
//! (read / write / run) plus a file name found in the description to a shell
//! command. Anything else has no invocation and fails before the sandbox.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{Step, StepAction};

/// What the sandbox runs for a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Passed to `sh -c`.
    Shell(String),
    /// Passed to `python3 -c`.
    Python(String),
}

impl Invocation {
    pub fn kind(&self) -> &'static str {
        match self {
            Invocation::Shell(_) => "shell",
            Invocation::Python(_) => "python",
        }
    }
}

impl From<&StepAction> for Invocation {
    fn from(action: &StepAction) -> Self {
        match action {
            StepAction::Shell { command } => Invocation::Shell(command.clone()),
            StepAction::Python { code } => Invocation::Python(code.clone()),
        }
    }
}

static FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\./)?[A-Za-z0-9_\-][A-Za-z0-9_\-./]*\.[A-Za-z0-9]{1,8}\b")
        .expect("file regex should be valid")
});

static CONTENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(?:that prints|printing|prints|print|containing|with content|with text|saying)\s+(?:"([^"]*)"|'([^']*)'|(.+?))\s*$"#,
    )
    .expect("content regex should be valid")
});

/// First file-like token (`name.ext`) in `text`.
pub fn file_mention(text: &str) -> Option<String> {
    FILE_RE
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches('.'))
        .find(|s| !s.contains("://") && !s.chars().all(|c| c.is_ascii_digit() || c == '.'))
        .map(str::to_string)
}

/// Literal payload after "printing", "containing" and similar phrases.
pub fn content_mention(text: &str) -> Option<String> {
    let caps = CONTENT_RE.captures(text)?;
    let value = caps
        .get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))?
        .as_str()
        .trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub fn read_file_command(path: &str) -> String {
    format!("cat -- {}", shell_quote(path))
}

pub fn write_file_command(path: &str, contents: &str) -> String {
    format!(
        "printf '%s\\n' {} > {}",
        shell_quote(contents),
        shell_quote(path)
    )
}

/// Interpreter chosen by extension.
pub fn run_file_command(path: &str) -> String {
    let quoted = shell_quote(path);
    if path.ends_with(".py") {
        format!("python3 {quoted}")
    } else if path.ends_with(".sh") {
        format!("sh {quoted}")
    } else if path.starts_with('/') {
        quoted
    } else {
        format!("./{}", shell_quote(path.trim_start_matches("./")))
    }
}

/// Body written for a "create X printing Y" request.
///
/// Python files get a `print` call so running them emits the text.
pub fn file_body(path: &str, content: &str) -> String {
    if path.ends_with(".py") {
        format!("print({content:?})")
    } else if path.ends_with(".sh") {
        format!("echo {}", shell_quote(content))
    } else {
        content.to_string()
    }
}

enum FileOp {
    Write,
    Run,
    Read,
}

/// Invocation for `step`, or `None` when nothing runnable can be derived.
pub fn derive_invocation(step: &Step) -> Option<Invocation> {
    if let Some(action) = &step.action {
        return Some(Invocation::from(action));
    }

    let description = step.description.as_str();
    let path = step
        .target
        .clone()
        .or_else(|| file_mention(description))?;
    let tool = step.tool.to_lowercase();
    let verb = description.to_lowercase();
    let starts = |words: &[&str]| words.iter().any(|w| verb.starts_with(w));

    // The leading verb outranks the tool; a generic shell tool says nothing
    // about what to do with the file.
    let kind = if starts(&["create", "write", "save"]) {
        FileOp::Write
    } else if starts(&["run", "execute"]) {
        FileOp::Run
    } else if starts(&["read", "show", "cat", "display"]) {
        FileOp::Read
    } else if tool.contains("writer") {
        FileOp::Write
    } else if tool.contains("interpreter") {
        FileOp::Run
    } else if tool.contains("reader") {
        FileOp::Read
    } else if tool == "shell" {
        FileOp::Run
    } else {
        return None;
    };

    let command = match kind {
        FileOp::Write => {
            let content = content_mention(description).unwrap_or_default();
            write_file_command(&path, &file_body(&path, &content))
        }
        FileOp::Run => run_file_command(&path),
        FileOp::Read => read_file_command(&path),
    };
    Some(Invocation::Shell(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_action_wins() {
        let step = Step::new(1, "read a.txt", "file_reader", "contents").with_action(
            StepAction::Python {
                code: "print(1)".to_string(),
            },
        );
        assert_eq!(
            derive_invocation(&step),
            Some(Invocation::Python("print(1)".to_string()))
        );
    }

    #[test]
    fn reader_tool_derives_cat() {
        let step = Step::new(1, "Read missing.txt", "file_reader", "contents shown");
        assert_eq!(
            derive_invocation(&step),
            Some(Invocation::Shell("cat -- 'missing.txt'".to_string()))
        );
    }

    #[test]
    fn writer_tool_derives_printf_with_python_print() {
        let step = Step::new(1, "Create file.py printing X", "file_writer", "file exists");
        assert_eq!(
            derive_invocation(&step),
            Some(Invocation::Shell(
                r#"printf '%s\n' 'print("X")' > 'file.py'"#.to_string()
            ))
        );
    }

    #[test]
    fn interpreter_derives_python3() {
        let step = Step::new(2, "Run file.py", "python_interpreter", "prints X");
        assert_eq!(
            derive_invocation(&step),
            Some(Invocation::Shell("python3 'file.py'".to_string()))
        );
    }

    #[test]
    fn leading_verb_outranks_generic_shell_tool() {
        let read = Step::new(1, "Read notes.txt", "shell", "contents shown");
        assert_eq!(
            derive_invocation(&read),
            Some(Invocation::Shell("cat -- 'notes.txt'".to_string()))
        );
        let run = Step::new(2, "Execute build.sh", "shell", "build passes");
        assert_eq!(
            derive_invocation(&run),
            Some(Invocation::Shell("sh 'build.sh'".to_string()))
        );
    }

    #[test]
    fn generic_shell_tool_without_a_verb_runs_the_file() {
        let step = Step::new(1, "notes.bin then check", "shell", "done");
        assert_eq!(
            derive_invocation(&step),
            Some(Invocation::Shell("./'notes.bin'".to_string()))
        );
    }

    #[test]
    fn run_file_command_quotes_every_path() {
        assert_eq!(run_file_command("my tool.bin"), "./'my tool.bin'");
        assert_eq!(run_file_command("./a;rm.bin"), "./'a;rm.bin'");
        assert_eq!(run_file_command("/ws/app.bin"), "'/ws/app.bin'");
    }

    #[test]
    fn nothing_derivable_without_a_file() {
        let step = Step::new(1, "Think about the problem", "generic", "insight");
        assert_eq!(derive_invocation(&step), None);
    }

    #[test]
    fn content_mention_handles_quotes() {
        assert_eq!(
            content_mention("create a.txt containing \"hello world\""),
            Some("hello world".to_string())
        );
        assert_eq!(
            content_mention("create file.py printing X"),
            Some("X".to_string())
        );
        assert_eq!(content_mention("create file.py"), None);
    }

    #[test]
    fn file_mention_skips_numbers() {
        assert_eq!(file_mention("version 1.2 of notes.md"), Some("notes.md".to_string()));
        assert_eq!(file_mention("nothing here"), None);
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
