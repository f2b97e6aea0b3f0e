//! Stable exit codes for kernel CLI commands.

use crate::context::Phase;

/// Command succeeded; for `run`, the task reached SUCCESS.
pub const OK: i32 = 0;
/// Invalid config, state directory or arguments, or another error.
pub const INVALID: i32 = 1;
/// `kernel run` ended ABORTED.
pub const ABORTED: i32 = 2;
/// `kernel run` ended NEEDS_CLARIFICATION.
pub const NEEDS_CLARIFICATION: i32 = 3;

/// Exit code for a task that finished in `phase`.
pub fn for_phase(phase: Phase) -> i32 {
    match phase {
        Phase::Success => OK,
        Phase::NeedsClarification => NEEDS_CLARIFICATION,
        _ => ABORTED,
    }
}
