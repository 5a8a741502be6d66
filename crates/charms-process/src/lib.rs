//! Subprocess execution for charms-builder
//!
//! Every external collaborator (git, charmcraft, lxc) is driven through the
//! [`Runner`] trait. The system implementation:
//! - captures stdout/stderr verbatim
//! - bounds each invocation by an optional deadline
//! - watches shared cancellation flags and terminates the child's whole
//!   process group (SIGTERM, then SIGKILL after a grace period)

mod command;
mod runner;

pub use command::CommandSpec;
pub use runner::{
    ProcessError, ProcessOutput, ProcessResult, RunControl, Runner, SystemRunner, Termination,
};
