//! Build executor
//!
//! Runs the packaging tool for one [`BuildTask`] and collects what it
//! produced into `<charmsdir>/<charm>/<base>/`:
//!
//! - **native**: the tool runs on the host in the working copy, retried up
//!   to `native_attempts` times; fresh `*.charm` files for the base are
//!   copied out of the working copy.
//! - **manual**: an isolated environment is acquired for the task, the tool
//!   runs in destructive mode inside the merge view as the mapped user, and
//!   artifacts are pulled out before the environment is released.
//!
//! Each invocation is bounded by the build timeout. The full tool output
//! goes to `build.log` next to the artifacts.

pub mod artifacts;
pub mod charmcraft;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use charms_process::{CommandSpec, ProcessError, Runner};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::isolation::{
    EnvironmentGuard, ExecSpec, IdentityMapping, IsolationProvider, ProvisionError, ProvisionErrorKind,
    RuntimeError, TeardownError,
};
use crate::report::{FailureKind, TaskReport};
use crate::resolve::Provisioning;
use crate::task::BuildTask;

pub use charmcraft::{Charmcraft, PackagingTool};

/// File the tool output is written to, per task output directory
pub const BUILD_LOG: &str = "build.log";

/// Filesystem timestamps may trail the wall clock slightly
const MTIME_SLACK: Duration = Duration::from_secs(1);

pub type BuildOutcome<T> = Result<T, BuildError>;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{task}: packaging tool failed ({status})")]
    Tool { task: String, status: String },

    #[error("{task}: build timed out after {after:?}")]
    Timeout { task: String, after: Duration },

    #[error("{task}: build cancelled")]
    Cancelled { task: String },

    #[error("{task}: {source}")]
    Provision {
        task: String,
        #[source]
        source: ProvisionError,
    },

    #[error("{task}: {source}")]
    Runtime {
        task: String,
        #[source]
        source: RuntimeError,
    },

    #[error("{task}: {source}")]
    Spawn {
        task: String,
        #[source]
        source: ProcessError,
    },

    #[error("{task}: artifacts: {detail}")]
    Artifacts { task: String, detail: String },

    #[error("{task}: {source}")]
    Io {
        task: String,
        #[source]
        source: io::Error,
    },
}

impl BuildError {
    pub fn kind(&self) -> FailureKind {
        match self {
            BuildError::Tool { .. } | BuildError::Spawn { .. } => FailureKind::Build,
            BuildError::Timeout { .. } => FailureKind::Timeout,
            BuildError::Cancelled { .. } => FailureKind::Cancelled,
            BuildError::Provision { source, .. } => match source.kind {
                ProvisionErrorKind::Timeout => FailureKind::Timeout,
                ProvisionErrorKind::Cancelled => FailureKind::Cancelled,
                ProvisionErrorKind::Failed => FailureKind::Provision,
            },
            BuildError::Runtime { source, .. } if source.is_timeout() => FailureKind::Timeout,
            BuildError::Runtime { .. } => FailureKind::Build,
            BuildError::Artifacts { .. } | BuildError::Io { .. } => FailureKind::Artifacts,
        }
    }
}

/// Outcome of one task
#[derive(Debug)]
pub struct BuildResult {
    pub task: BuildTask,
    pub outcome: BuildOutcome<()>,
    /// Copied to the output directory; may be non-empty on failure
    pub artifacts: Vec<PathBuf>,
    /// Combined tool output, verbatim
    pub output: String,
    pub instance: Option<String>,
    pub teardown: Option<TeardownError>,
    pub duration: Duration,
}

impl BuildResult {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn to_report(&self) -> TaskReport {
        let charm = &self.task.charm.name;
        let base = self.task.base.series();
        let report = match self.outcome {
            Ok(()) => TaskReport::success(charm, &base, self.artifacts.clone()),
            Err(ref e) => TaskReport::failure(charm, &base, e.kind(), e.to_string())
                .with_diagnostics(&self.output),
        };
        let report = report
            .with_mode(self.task.mode(), self.task.provisioning.image())
            .with_duration_ms(self.duration.as_millis() as u64)
            .with_instance(self.instance.clone())
            .with_teardown_warning(self.teardown.as_ref().map(|t| t.detail.clone()));
        match self.task.revision {
            Some(ref rev) => report.with_revision(rev.clone()),
            None => report,
        }
    }
}

/// Everything a task's build accumulates along the way
#[derive(Default)]
struct Scratch {
    output: String,
    instance: Option<String>,
    teardown: Option<TeardownError>,
}

pub struct BuildExecutor {
    runner: Arc<dyn Runner>,
    provider: IsolationProvider,
    tool: Box<dyn PackagingTool>,
    identity: IdentityMapping,
    charmsdir: PathBuf,
    native_attempts: u32,
}

impl BuildExecutor {
    pub fn new(
        runner: Arc<dyn Runner>,
        provider: IsolationProvider,
        identity: IdentityMapping,
        charmsdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            provider,
            tool: Box::new(Charmcraft::new()),
            identity,
            charmsdir: charmsdir.into(),
            native_attempts: 2,
        }
    }

    pub fn with_tool(mut self, tool: Box<dyn PackagingTool>) -> Self {
        self.tool = tool;
        self
    }

    pub fn with_native_attempts(mut self, attempts: u32) -> Self {
        self.native_attempts = attempts.max(1);
        self
    }

    pub fn provider(&self) -> &IsolationProvider {
        &self.provider
    }

    /// `<charmsdir>/<charm>/<base>`
    pub fn output_dir(&self, task: &BuildTask) -> PathBuf {
        self.charmsdir.join(&task.charm.name).join(task.base.series())
    }

    pub fn run(&self, task: &BuildTask) -> BuildResult {
        let started = Instant::now();
        let mut scratch = Scratch::default();
        info!(charm = %task.charm.name, base = %task.base, mode = %task.mode(), "build started");

        let out_dir = self.output_dir(task);
        let outcome = fs::create_dir_all(&out_dir)
            .map_err(|source| BuildError::Io {
                task: task.id(),
                source,
            })
            .and_then(|()| match task.provisioning {
                Provisioning::Native { bases_index } => {
                    self.run_native(task, bases_index, &out_dir, &mut scratch)
                }
                Provisioning::Manual { ref image } => {
                    self.run_manual(task, image, &out_dir, &mut scratch)
                }
            });

        if let Err(e) = fs::write(out_dir.join(BUILD_LOG), &scratch.output) {
            warn!(task = %task.id(), error = %e, "could not write build log");
        }

        let (outcome, artifacts) = match outcome {
            Ok(artifacts) => (Ok(()), artifacts),
            Err(e) => (Err(e), Vec::new()),
        };
        let duration = started.elapsed();
        match outcome {
            Ok(()) => info!(
                charm = %task.charm.name,
                base = %task.base,
                artifacts = artifacts.len(),
                secs = duration.as_secs_f64(),
                "build succeeded"
            ),
            Err(ref e) => error!(charm = %task.charm.name, base = %task.base, error = %e, "build failed"),
        }

        BuildResult {
            task: task.clone(),
            outcome,
            artifacts,
            output: scratch.output,
            instance: scratch.instance,
            teardown: scratch.teardown,
            duration,
        }
    }

    fn run_native(
        &self,
        task: &BuildTask,
        bases_index: Option<usize>,
        out_dir: &Path,
        scratch: &mut Scratch,
    ) -> BuildOutcome<Vec<PathBuf>> {
        let argv = self.tool.native_argv(bases_index);
        let spec = CommandSpec::new(self.tool.program())
            .args(argv.iter().skip(1).cloned())
            .current_dir(&task.working_copy);
        let control = self.provider.deadlines().build();

        let mut last_status = String::new();
        for attempt in 1..=self.native_attempts {
            if control.is_cancelled() {
                return Err(BuildError::Cancelled { task: task.id() });
            }
            debug!(task = %task.id(), attempt, command = %spec, "running packaging tool");
            let since = SystemTime::now() - MTIME_SLACK;
            let output = self.runner.run(&spec, &control).map_err(|source| BuildError::Spawn {
                task: task.id(),
                source,
            })?;
            scratch.output.push_str(&output.combined());

            if output.timed_out() {
                return Err(BuildError::Timeout {
                    task: task.id(),
                    after: output.duration,
                });
            }
            if output.cancelled() {
                return Err(BuildError::Cancelled { task: task.id() });
            }
            if output.success() {
                let artifacts = artifacts::collect_native(&task.working_copy, &task.base, since, out_dir)
                    .map_err(|source| BuildError::Io {
                        task: task.id(),
                        source,
                    })?;
                return require_artifacts(task, artifacts);
            }

            last_status = output.describe();
            if attempt < self.native_attempts {
                warn!(task = %task.id(), attempt, status = %last_status, "packaging failed, retrying");
            }
        }

        Err(BuildError::Tool {
            task: task.id(),
            status: last_status,
        })
    }

    fn run_manual(
        &self,
        task: &BuildTask,
        image: &str,
        out_dir: &Path,
        scratch: &mut Scratch,
    ) -> BuildOutcome<Vec<PathBuf>> {
        let guard = self
            .provider
            .acquire(&task.charm.name, &task.base, image, &task.working_copy, &self.identity)
            .map_err(|source| {
                scratch.instance = Some(source.instance.clone());
                scratch.teardown = source.teardown.clone();
                BuildError::Provision {
                    task: task.id(),
                    source,
                }
            })?;
        scratch.instance = Some(guard.env().instance().to_string());

        let built = self.build_in(&guard, task, scratch);

        // The writable layer disappears on release: copy out first, whatever the outcome.
        let pulled = artifacts::pull_manual(&guard, &task.base, out_dir, &guard.copy_control());

        if let Err(e) = guard.release() {
            scratch.teardown = Some(e);
        }

        match (built, pulled) {
            (Err(e), Ok(partial)) => {
                if !partial.is_empty() {
                    debug!(task = %task.id(), count = partial.len(), "kept artifacts of failed build");
                }
                Err(e)
            }
            (Err(e), Err(copy)) => {
                warn!(task = %task.id(), error = %copy, "copy-back after failed build also failed");
                Err(e)
            }
            (Ok(()), Ok(artifacts)) => require_artifacts(task, artifacts),
            (Ok(()), Err(copy)) => Err(BuildError::Artifacts {
                task: task.id(),
                detail: copy.to_string(),
            }),
        }
    }

    fn build_in(&self, guard: &EnvironmentGuard<'_>, task: &BuildTask, scratch: &mut Scratch) -> BuildOutcome<()> {
        let env = guard.env();
        let mode = env.destructive_mode().ok_or_else(|| BuildError::Runtime {
            task: task.id(),
            source: RuntimeError::Failed {
                op: "exec",
                detail: format!("environment not running ({})", env.state()),
            },
        })?;

        let spec = ExecSpec::new(self.tool.destructive_argv(mode))
            .as_user(self.identity.uid, self.identity.gid)
            .current_dir(env.build_root())
            .env("HOME", self.identity.home.display().to_string());
        debug!(task = %task.id(), instance = %env.instance(), argv = ?spec.argv, "running packaging tool in instance");

        match guard.exec(&spec, &self.provider.deadlines().build()) {
            Ok(output) => {
                scratch.output.push_str(&output.combined());
                if output.success() {
                    Ok(())
                } else {
                    Err(BuildError::Tool {
                        task: task.id(),
                        status: output.describe(),
                    })
                }
            }
            Err(RuntimeError::Timeout { after, .. }) => Err(BuildError::Timeout {
                task: task.id(),
                after,
            }),
            Err(RuntimeError::Cancelled { .. }) => Err(BuildError::Cancelled { task: task.id() }),
            Err(source) => Err(BuildError::Runtime {
                task: task.id(),
                source,
            }),
        }
    }
}

fn require_artifacts(task: &BuildTask, artifacts: Vec<PathBuf>) -> BuildOutcome<Vec<PathBuf>> {
    if artifacts.is_empty() {
        Err(BuildError::Artifacts {
            task: task.id(),
            detail: "packaging tool succeeded but produced no artifacts".to_string(),
        })
    } else {
        Ok(artifacts)
    }
}
