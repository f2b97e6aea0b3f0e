//! Deterministic, pure logic shared by the kernel pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod fingerprint;
pub mod heuristic;
pub mod invocation;
pub mod path;
pub mod permission;
pub mod plan;
pub mod policy;
pub mod recovery;
pub mod types;
