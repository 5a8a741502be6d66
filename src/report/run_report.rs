//! Run report (`<workdir>/runs/<run_id>/report.json`)

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::failure::{ExitCode, ExitCodeAggregator, Status};
use super::task_report::TaskReport;
use crate::config::ConfigSource;

/// File name of the report inside the run directory
pub const REPORT_FILE: &str = "report.json";

/// An instance that may have been left running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeardownWarning {
    pub charm: String,
    pub base: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub detail: String,
}

/// Aggregated outcome of a build run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,

    pub created_at: DateTime<Utc>,

    /// Aggregated status
    pub status: Status,

    /// Process exit code for this run
    pub exit_code: i32,

    pub task_count: usize,

    pub succeeded: usize,

    pub failed: usize,

    pub skipped: usize,

    pub cancelled: usize,

    /// Wall-clock duration of the entire run in milliseconds
    pub duration_ms: u64,

    /// Every (charm, base) pair in matrix order
    pub tasks: Vec<TaskReport>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teardown_warnings: Vec<TeardownWarning>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_sources: Vec<ConfigSource>,

    pub human_summary: String,
}

impl RunReport {
    /// Aggregate task reports
    pub fn from_tasks(run_id: impl Into<String>, tasks: Vec<TaskReport>, duration_ms: u64) -> Self {
        let mut aggregator = ExitCodeAggregator::new();
        let (mut succeeded, mut failed, mut skipped, mut cancelled) = (0, 0, 0, 0);

        for task in &tasks {
            aggregator.add(task.status);
            match task.status {
                Status::Success => succeeded += 1,
                Status::Failed => failed += 1,
                Status::Skipped => skipped += 1,
                Status::Cancelled => cancelled += 1,
            }
        }

        let teardown_warnings = tasks
            .iter()
            .filter_map(|t| {
                t.teardown_warning.as_ref().map(|detail| TeardownWarning {
                    charm: t.charm.clone(),
                    base: t.base.clone(),
                    instance: t.instance.clone(),
                    detail: detail.clone(),
                })
            })
            .collect();

        let status = aggregator.status();
        let human_summary =
            Self::generate_human_summary(status, tasks.len(), succeeded, failed, skipped, cancelled);

        Self {
            run_id: run_id.into(),
            created_at: Utc::now(),
            status,
            exit_code: aggregator.exit_code().as_i32(),
            task_count: tasks.len(),
            succeeded,
            failed,
            skipped,
            cancelled,
            duration_ms,
            tasks,
            teardown_warnings,
            config_sources: Vec::new(),
            human_summary,
        }
    }

    /// Add warnings for instances not attributable to a task report
    pub fn with_teardown_warnings(mut self, warnings: impl IntoIterator<Item = TeardownWarning>) -> Self {
        self.teardown_warnings.extend(warnings);
        self
    }

    pub fn with_config_sources(mut self, sources: Vec<ConfigSource>) -> Self {
        self.config_sources = sources;
        self
    }

    fn generate_human_summary(
        status: Status,
        task_count: usize,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        cancelled: usize,
    ) -> String {
        match status {
            Status::Success if task_count == 0 => "No tasks selected".to_string(),
            Status::Success => format!("Run succeeded: {}/{} tasks built", succeeded, task_count),
            Status::Failed | Status::Skipped => format!(
                "Run failed: {} succeeded, {} failed, {} skipped",
                succeeded, failed, skipped
            ),
            Status::Cancelled => format!(
                "Run cancelled: {} succeeded, {} failed, {} skipped, {} cancelled",
                succeeded, failed, skipped, cancelled
            ),
        }
    }

    pub fn exit_code_enum(&self) -> Option<ExitCode> {
        ExitCode::from_i32(self.exit_code)
    }

    /// Human-readable report: one line per task, warnings, summary
    pub fn render(&self) -> String {
        let mut out = String::new();
        for task in &self.tasks {
            out.push_str(&task.line());
            out.push('\n');
        }
        for warning in &self.teardown_warnings {
            out.push_str(&format!(
                "warning: {}/{}: instance {} may still be running: {}\n",
                warning.charm,
                warning.base,
                warning.instance.as_deref().unwrap_or("?"),
                warning.detail
            ));
        }
        out.push_str(&self.human_summary);
        out.push('\n');
        out
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// `<runsdir>/<run_id>/report.json`
    pub fn path_in(&self, runsdir: &Path) -> PathBuf {
        runsdir.join(&self.run_id).join(REPORT_FILE)
    }

    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json().map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("JSON error: {}", e))
        })?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)
    }

    pub fn from_file(path: &Path) -> io::Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("JSON error: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::failure::FailureKind;
    use super::*;
    use crate::resolve::Mode;
    use tempfile::TempDir;

    fn native_success() -> TaskReport {
        TaskReport::success("slurmd", "ubuntu-22.04", vec![PathBuf::from("/out/slurmd.charm")])
            .with_mode(Mode::Native, None)
    }

    fn manual_failure() -> TaskReport {
        TaskReport::failure("slurmd", "centos-7", FailureKind::Build, "exit code 1")
            .with_mode(Mode::Manual, Some("images:centos/7"))
    }

    #[test]
    fn test_all_success() {
        let report = RunReport::from_tasks("run-1", vec![native_success()], 10);
        assert_eq!(report.status, Status::Success);
        assert_eq!(report.exit_code, 0);
        assert_eq!(report.succeeded, 1);
    }

    #[test]
    fn test_one_success_one_failure() {
        let report = RunReport::from_tasks("run-1", vec![native_success(), manual_failure()], 10);
        assert_eq!(report.status, Status::Failed);
        assert_eq!(report.exit_code, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.human_summary, "Run failed: 1 succeeded, 1 failed, 0 skipped");
    }

    #[test]
    fn test_skipped_fails_run() {
        let skipped = TaskReport::failure("slurmd", "fedora-40", FailureKind::UnresolvedBase, "no image");
        let report = RunReport::from_tasks("run-1", vec![native_success(), skipped], 10);
        assert_eq!(report.exit_code, 2);
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_empty_run_succeeds() {
        let report = RunReport::from_tasks("run-1", Vec::new(), 0);
        assert_eq!(report.exit_code_enum(), Some(ExitCode::Success));
        assert_eq!(report.human_summary, "No tasks selected");
    }

    #[test]
    fn test_teardown_warnings_collected() {
        let task = native_success()
            .with_instance(Some("charms-builder-x".to_string()))
            .with_teardown_warning(Some("stop timed out".to_string()));
        let report = RunReport::from_tasks("run-1", vec![task], 10);

        assert_eq!(report.status, Status::Success);
        assert_eq!(report.teardown_warnings.len(), 1);
        assert!(report.render().contains("charms-builder-x may still be running"));
    }

    #[test]
    fn test_extra_teardown_warnings_rendered() {
        let report = RunReport::from_tasks("run-1", vec![native_success()], 10).with_teardown_warnings([
            TeardownWarning {
                charm: "slurmd".to_string(),
                base: "centos-7".to_string(),
                instance: Some("charms-builder-slurmd-centos-7-0000abcd".to_string()),
                detail: "instance busy".to_string(),
            },
        ]);

        assert_eq!(report.exit_code, 0);
        assert_eq!(report.teardown_warnings.len(), 1);
        assert!(report
            .render()
            .contains("slurmd/centos-7: instance charms-builder-slurmd-centos-7-0000abcd may still be running"));
    }

    #[test]
    fn test_write_and_read_file() {
        let dir = TempDir::new().unwrap();
        let report = RunReport::from_tasks("01run", vec![native_success(), manual_failure()], 10);

        let path = report.path_in(dir.path());
        report.write_to_file(&path).unwrap();
        assert!(path.ends_with("01run/report.json"));

        let loaded = RunReport::from_file(&path).unwrap();
        assert_eq!(loaded.run_id, "01run");
        assert_eq!(loaded.tasks, report.tasks);
    }
}
