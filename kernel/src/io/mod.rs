//! Side-effecting boundaries of the kernel.

pub mod cache_store;
pub mod config;
pub mod init;
pub mod oracle;
pub mod process;
pub mod prompt;
pub mod sandbox;
pub mod task_log;
