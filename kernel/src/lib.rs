//! Agent kernel: turns natural-language instructions into verified sandbox
//! executions.
//!
//! A submission is understood, planned, checked against the permission
//! policy, executed step by step in a resident sandbox, verified and, when
//! something fails, recovered within fixed bounds. The architecture keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (fingerprints, plans, risk
//!   classification, recovery bounds, heuristics). No I/O.
//! - **[`io`]**: Side effects (config, oracle transport, sandbox backends,
//!   plan cache, task records). Each boundary sits behind a trait so tests
//!   can script it.
//!
//! [`pipeline`] wires the two together behind [`pipeline::Kernel`].

pub mod approval;
pub mod context;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod usage;
