//! Per-task outcome record

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::failure::{FailureKind, Status};
use crate::resolve::Mode;

/// Lines of combined tool output kept on a failed task
pub const DIAGNOSTIC_LINES: usize = 200;

/// Outcome of one (charm, base) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub charm: String,

    /// `<name>-<channel>`
    pub base: String,

    pub status: Status,

    /// Unset when the task never got as far as resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Revision of the working copy the task built from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<PathBuf>,

    /// Tail of the tool output, kept on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,

    /// Isolated instance the task ran in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,

    /// Stopping the instance failed; it may still be running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teardown_warning: Option<String>,

    pub duration_ms: u64,
}

impl TaskReport {
    fn new(charm: &str, base: &str, status: Status) -> Self {
        Self {
            charm: charm.to_string(),
            base: base.to_string(),
            status,
            mode: None,
            image: None,
            revision: None,
            failure_kind: None,
            error: None,
            artifacts: Vec::new(),
            diagnostics: None,
            instance: None,
            teardown_warning: None,
            duration_ms: 0,
        }
    }

    pub fn success(charm: &str, base: &str, artifacts: Vec<PathBuf>) -> Self {
        Self {
            artifacts,
            ..Self::new(charm, base, Status::Success)
        }
    }

    /// A task that ended with `kind`; status follows from the kind
    pub fn failure(charm: &str, base: &str, kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            failure_kind: Some(kind),
            error: Some(error.into()),
            ..Self::new(charm, base, kind.status())
        }
    }

    /// Never attempted because the run was cancelled first
    pub fn cancelled(charm: &str, base: &str) -> Self {
        Self::failure(charm, base, FailureKind::Cancelled, "run cancelled before the task started")
    }

    pub fn with_mode(mut self, mode: Mode, image: Option<&str>) -> Self {
        self.mode = Some(mode);
        self.image = image.map(str::to_string);
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Keep the last [`DIAGNOSTIC_LINES`] lines of `output`
    pub fn with_diagnostics(mut self, output: &str) -> Self {
        let tail = tail_lines(output, DIAGNOSTIC_LINES);
        self.diagnostics = (!tail.is_empty()).then_some(tail);
        self
    }

    pub fn with_instance(mut self, instance: Option<String>) -> Self {
        self.instance = instance;
        self
    }

    pub fn with_teardown_warning(mut self, warning: Option<String>) -> Self {
        self.teardown_warning = warning;
        self
    }

    /// One line for the human report
    pub fn line(&self) -> String {
        let mode = self.mode.map(|m| m.to_string()).unwrap_or_else(|| "-".to_string());
        let mut line = format!("{:<10} {}/{} ({})", self.status, self.charm, self.base, mode);
        match self.status {
            Status::Success => line.push_str(&format!(": {} artifact(s)", self.artifacts.len())),
            _ => {
                if let Some(ref err) = self.error {
                    line.push_str(&format!(": {}", err));
                }
            }
        }
        if let Some(ref warning) = self.teardown_warning {
            line.push_str(&format!(" [teardown: {}]", warning));
        }
        line
    }
}

/// Last `n` lines of `text`
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
