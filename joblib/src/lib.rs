//! Server-side job tracking: start commands through the spawn helper, read them back through the
//! link helper.

pub mod errors;
pub mod runner;
mod tracker;
pub mod types;

pub use runner::{CommandRunner, CommandSpec, ProcessHandle, ProcessRunner};
pub use tracker::{JobTracker, LINK_HELPER, SPAWN_HELPER};
