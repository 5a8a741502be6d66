//! Run reporting
//!
//! - `failure`: status, failure taxonomy, exit codes
//! - `task_report`: one (charm, base) outcome
//! - `run_report`: the aggregate written to `runs/<run_id>/report.json`

mod failure;
mod run_report;
mod task_report;

pub use failure::{ExitCode, ExitCodeAggregator, FailureKind, Status};
pub use run_report::{RunReport, TeardownWarning, REPORT_FILE};
pub use task_report::{tail_lines, TaskReport, DIAGNOSTIC_LINES};
