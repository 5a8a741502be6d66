//! Task scheduler
//!
//! A run has two pooled phases:
//!
//! 1. **sync**: every selected charm's working copy is synchronized once.
//!    This is the only serialization point; nothing for a charm proceeds
//!    until its sync has finished.
//! 2. **build**: each (charm, base) pair whose sync and resolution both
//!    succeeded becomes a [`BuildTask`] driven end-to-end by one worker.
//!
//! Pairs that never became a task are reported as skipped with the
//! originating error. Reports keep the charm-major matrix order.

pub mod pool;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use charms_process::{Runner, SystemRunner};
use tracing::{info, warn};

use crate::base::Base;
use crate::charm::Charm;
use crate::config::BuilderConfig;
use crate::executor::BuildExecutor;
use crate::isolation::{IdentityMapping, IsolationProvider, IsolationRuntime, LxcRuntime};
use crate::report::{FailureKind, RunReport, TaskReport, TeardownWarning};
use crate::resolve::BaseResolver;
use crate::selection::NameFilter;
use crate::sync::{GitCli, SyncOutcome, SyncResult, Synchronizer, Vcs};
use crate::task::BuildTask;
use crate::timeout::Deadlines;

pub use pool::run_pool;

/// Which charms and bases a run covers
#[derive(Debug, Clone)]
pub struct Selection {
    pub charms: NameFilter,
    /// Matched against `<name>-<channel>`
    pub bases: NameFilter,
}

impl Selection {
    pub fn all() -> Self {
        Self {
            charms: NameFilter::all(),
            bases: NameFilter::all(),
        }
    }

    pub fn charms(filter: NameFilter) -> Self {
        Self {
            charms: filter,
            bases: NameFilter::all(),
        }
    }
}

impl Default for Selection {
    fn default() -> Self {
        Self::all()
    }
}

/// The external tools a run talks to
#[derive(Clone)]
pub struct Collaborators {
    pub runner: Arc<dyn Runner>,
    pub vcs: Arc<dyn Vcs>,
    pub runtime: Arc<dyn IsolationRuntime>,
}

impl Collaborators {
    /// `git`, `charmcraft` and `lxc` on the host
    pub fn system() -> Self {
        let runner: Arc<dyn Runner> = Arc::new(SystemRunner::new());
        Self {
            vcs: Arc::new(GitCli::new(Arc::clone(&runner))),
            runtime: Arc::new(LxcRuntime::new(Arc::clone(&runner))),
            runner,
        }
    }
}

/// A pair between sync/resolution and execution
enum Planned {
    Ready(BuildTask),
    Done(TaskReport),
}

pub struct Scheduler {
    synchronizer: Synchronizer,
    resolver: BaseResolver,
    executor: BuildExecutor,
    deadlines: Deadlines,
    jobs: usize,
    run_id: String,
}

impl Scheduler {
    pub fn new(
        synchronizer: Synchronizer,
        resolver: BaseResolver,
        executor: BuildExecutor,
        deadlines: Deadlines,
        jobs: usize,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            synchronizer,
            resolver,
            executor,
            deadlines,
            jobs: jobs.max(1),
            run_id: run_id.into(),
        }
    }

    /// Wire every component from a validated configuration
    pub fn from_config(
        config: &BuilderConfig,
        tools: Collaborators,
        deadlines: Deadlines,
        identity: IdentityMapping,
        run_id: impl Into<String>,
    ) -> Self {
        let run_id = run_id.into();
        let synchronizer = Synchronizer::new(tools.vcs, config.reposdir(), deadlines.clone());
        let provider = IsolationProvider::new(
            tools.runtime,
            deadlines.clone(),
            config.build.scratch,
            run_id.clone(),
        );
        let executor = BuildExecutor::new(tools.runner, provider, identity, &config.charmsdir)
            .with_native_attempts(config.build.native_attempts);
        Self::new(
            synchronizer,
            BaseResolver::from_config(config),
            executor,
            deadlines,
            config.build.jobs,
            run_id,
        )
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    pub fn executor(&self) -> &BuildExecutor {
        &self.executor
    }

    /// Build the selected part of `charms × bases`
    pub fn run(&self, charms: &[Charm], bases: &[Base], selection: &Selection) -> RunReport {
        let started = Instant::now();
        let charms: Vec<&Charm> = selection.charms.select_charms(charms);
        let bases: Vec<&Base> = selection.bases.select_bases(bases);
        info!(
            run_id = %self.run_id,
            charms = charms.len(),
            bases = bases.len(),
            charm_filter = ?selection.charms.patterns(),
            base_filter = ?selection.bases.patterns(),
            jobs = self.jobs,
            "run started"
        );

        let tasks = if charms.is_empty() || bases.is_empty() {
            Vec::new()
        } else {
            let synced = self.sync_all(&charms);
            let planned = self.plan(&charms, &bases, &synced);
            self.execute(planned)
        };

        let dropped = self
            .executor
            .provider()
            .take_unreported()
            .into_iter()
            .map(|u| TeardownWarning {
                charm: u.charm,
                base: u.base,
                instance: Some(u.error.instance),
                detail: u.error.detail,
            });
        let report = RunReport::from_tasks(
            self.run_id.clone(),
            tasks,
            started.elapsed().as_millis() as u64,
        )
        .with_teardown_warnings(dropped);
        info!(
            run_id = %self.run_id,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "run finished"
        );
        report
    }

    fn sync_all(&self, charms: &[&Charm]) -> Vec<SyncResult<SyncOutcome>> {
        info!(charms = charms.len(), "sync phase");
        run_pool(self.jobs, charms, |charm| self.synchronizer.sync(charm))
    }

    /// Resolve every pair of a synced charm; everything else is settled here
    fn plan(
        &self,
        charms: &[&Charm],
        bases: &[&Base],
        synced: &[SyncResult<SyncOutcome>],
    ) -> Vec<Planned> {
        let mut planned = Vec::with_capacity(charms.len() * bases.len());
        for (charm, sync) in charms.iter().zip(synced) {
            let outcome = match sync {
                Ok(outcome) => outcome,
                Err(e) => {
                    let kind = if e.is_cancelled() {
                        FailureKind::Cancelled
                    } else {
                        FailureKind::Sync
                    };
                    for base in bases {
                        planned.push(Planned::Done(TaskReport::failure(
                            &charm.name,
                            &base.series(),
                            kind,
                            e.to_string(),
                        )));
                    }
                    continue;
                }
            };

            let working_copy: PathBuf = self.synchronizer.working_copy(&charm.name);
            for base in bases {
                match self.resolver.resolve(charm, base, &working_copy) {
                    Ok(provisioning) => planned.push(Planned::Ready(BuildTask {
                        charm: (*charm).clone(),
                        base: (*base).clone(),
                        provisioning,
                        working_copy: working_copy.clone(),
                        revision: Some(outcome.revision().to_string()),
                    })),
                    Err(e) => {
                        warn!(charm = %charm.name, base = %base, error = %e, "skipping");
                        planned.push(Planned::Done(
                            TaskReport::failure(
                                &charm.name,
                                &base.series(),
                                FailureKind::UnresolvedBase,
                                e.to_string(),
                            )
                            .with_revision(outcome.revision()),
                        ));
                    }
                }
            }
        }
        planned
    }

    fn execute(&self, planned: Vec<Planned>) -> Vec<TaskReport> {
        let ready = planned
            .iter()
            .filter(|p| matches!(p, Planned::Ready(_)))
            .count();
        info!(tasks = ready, "build phase");

        run_pool(self.jobs, &planned, |item| match item {
            Planned::Done(report) => report.clone(),
            Planned::Ready(task) if self.deadlines.is_cancelled() => {
                TaskReport::cancelled(&task.charm.name, &task.base.series())
                    .with_mode(task.mode(), task.provisioning.image())
            }
            Planned::Ready(task) => self.executor.run(task).to_report(),
        })
    }
}
