//! Isolation runtime seam
//!
//! The operations the provider needs from a container runtime. Every call
//! blocks until the runtime reports back or the [`RunControl`] deadline
//! passes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use charms_process::{ProcessError, ProcessOutput, RunControl};
use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{op}: {detail}")]
    Failed { op: &'static str, detail: String },

    #[error("{op}: timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("{op}: cancelled")]
    Cancelled { op: &'static str },

    #[error("{op}: instance '{instance}' not found")]
    NotFound { op: &'static str, instance: String },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl RuntimeError {
    /// Classify a finished runtime command; `Ok` only for exit 0
    pub fn check(op: &'static str, output: ProcessOutput) -> RuntimeResult<ProcessOutput> {
        if output.timed_out() {
            Err(RuntimeError::Timeout {
                op,
                after: output.duration,
            })
        } else if output.cancelled() {
            Err(RuntimeError::Cancelled { op })
        } else if output.success() {
            Ok(output)
        } else {
            let stderr = output.stderr.trim();
            let detail = if stderr.is_empty() {
                output.describe()
            } else {
                stderr.to_string()
            };
            Err(RuntimeError::Failed { op, detail })
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RuntimeError::Timeout { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound { .. })
    }
}

/// Instance to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    /// Discarded entirely on stop
    pub ephemeral: bool,
    /// Instance configuration keys
    pub config: Vec<(String, String)>,
}

/// Read-only or writable host directory attached to an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDevice {
    pub name: String,
    pub source: PathBuf,
    pub path: PathBuf,
    pub readonly: bool,
}

/// Command to run inside an instance
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    /// Numeric uid; `None` runs as root
    pub user: Option<u32>,
    pub group: Option<u32>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ExecSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn as_user(mut self, uid: u32, gid: u32) -> Self {
        self.user = Some(uid);
        self.group = Some(gid);
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

pub trait IsolationRuntime: Send + Sync {
    fn launch(&self, spec: &LaunchSpec, control: &RunControl) -> RuntimeResult<()>;

    fn add_disk(&self, instance: &str, device: &DiskDevice, control: &RunControl) -> RuntimeResult<()>;

    /// Run a command; a non-zero exit is returned, not raised
    fn exec(&self, instance: &str, spec: &ExecSpec, control: &RunControl) -> RuntimeResult<ProcessOutput>;

    /// File names (not paths) in `dir` inside the instance
    fn list_dir(&self, instance: &str, dir: &Path, control: &RunControl) -> RuntimeResult<Vec<String>>;

    /// Copy `src` inside the instance to `dest` on the host
    fn pull_file(&self, instance: &str, src: &Path, dest: &Path, control: &RunControl) -> RuntimeResult<()>;

    fn stop(&self, instance: &str, control: &RunControl) -> RuntimeResult<()>;

    /// Running instance names starting with `prefix`
    fn list_instances(&self, prefix: &str, control: &RunControl) -> RuntimeResult<Vec<String>>;
}
