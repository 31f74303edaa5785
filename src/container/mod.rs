//! Per-user container ownership
//!
//! The manager owns the `user -> container` mapping: lookup, create, attach,
//! exec, stats, and the idle reaper. Creation/config, exec plumbing, and
//! stats math live in their own files.

mod create;
mod exec;
mod manager;
mod stats;

pub use exec::{ExecOptions, ExecStream, ShellOptions};
pub use manager::{ContainerInfo, ContainerManager, UserConfig};
pub use stats::ContainerStats;
