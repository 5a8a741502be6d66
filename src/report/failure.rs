//! Task status, failure taxonomy and stable exit codes

use std::fmt;

use serde::{Deserialize, Serialize};

/// Task/run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Built and artifacts collected
    Success,
    /// Attempted and failed
    Failed,
    /// Never attempted: sync or resolution failed first
    Skipped,
    /// Not attempted or interrupted because the run was cancelled
    Cancelled,
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Success => "success",
            Status::Failed => "failed",
            Status::Skipped => "skipped",
            Status::Cancelled => "cancelled",
        };
        f.pad(s)
    }
}

/// Failure kind - categorizes the cause of a non-successful task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Working copy could not be cloned or updated
    Sync,
    /// No provisioning path for the base
    UnresolvedBase,
    /// Isolated environment failed to come up
    Provision,
    /// Packaging tool exited non-zero
    Build,
    /// Build exceeded its deadline
    Timeout,
    /// Run was cancelled
    Cancelled,
    /// Artifacts missing or could not be copied out
    Artifacts,
}

impl FailureKind {
    /// Human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            FailureKind::Sync => "Repository sync failed",
            FailureKind::UnresolvedBase => "No provisioning path for base",
            FailureKind::Provision => "Isolated environment failed to start",
            FailureKind::Build => "Packaging tool failed",
            FailureKind::Timeout => "Build timed out",
            FailureKind::Cancelled => "Cancelled",
            FailureKind::Artifacts => "Artifact collection failed",
        }
    }

    /// Status of a task that ended with this failure
    pub fn status(&self) -> Status {
        match self {
            FailureKind::Sync | FailureKind::UnresolvedBase => Status::Skipped,
            FailureKind::Cancelled => Status::Cancelled,
            _ => Status::Failed,
        }
    }
}

/// Stable process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    /// Every resolved task succeeded
    Success = 0,
    /// Bad configuration or usage
    Config = 1,
    /// At least one task failed or was skipped
    TaskFailures = 2,
    /// Run cancelled by signal
    Cancelled = 80,
}

impl ExitCode {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::Success),
            1 => Some(ExitCode::Config),
            2 => Some(ExitCode::TaskFailures),
            80 => Some(ExitCode::Cancelled),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }
}

/// Folds task statuses into a run status.
///
/// Cancelled wins over failed/skipped, which win over success.
#[derive(Debug, Default)]
pub struct ExitCodeAggregator {
    any_failed: bool,
    any_cancelled: bool,
}

impl ExitCodeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, status: Status) {
        match status {
            Status::Success => {}
            Status::Failed | Status::Skipped => self.any_failed = true,
            Status::Cancelled => self.any_cancelled = true,
        }
    }

    pub fn status(&self) -> Status {
        if self.any_cancelled {
            Status::Cancelled
        } else if self.any_failed {
            Status::Failed
        } else {
            Status::Success
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self.status() {
            Status::Success => ExitCode::Success,
            Status::Cancelled => ExitCode::Cancelled,
            Status::Failed | Status::Skipped => ExitCode::TaskFailures,
        }
    }
}
