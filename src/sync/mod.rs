//! Repository synchronizer
//!
//! Keeps `<workdir>/repos/<charm>` at the charm's requested revision:
//! clone when no working copy exists, update in place otherwise. A failed
//! sync removes only that charm's tasks from the run.
//!
//! At most one sync runs per charm at a time (see [`lock`]); different
//! charms sync concurrently.

pub mod git;
pub mod lock;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use charms_process::RunControl;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::charm::Charm;
use crate::timeout::Deadlines;

pub use git::GitCli;
pub use lock::{CharmLock, LockError, LockRegistry};

pub type SyncResult<T> = Result<T, SyncError>;

/// Why a working copy could not be brought to its requested revision
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{charm}: remote unreachable: {detail}")]
    Unreachable { charm: String, detail: String },

    #[error("{charm}: reference '{reference}' not found")]
    RefNotFound { charm: String, reference: String },

    #[error("{charm}: working copy cannot be reconciled: {detail}")]
    Unreconcilable { charm: String, detail: String },

    #[error("{charm}: sync timed out after {after:?}")]
    Timeout { charm: String, after: Duration },

    #[error("{charm}: sync cancelled")]
    Cancelled { charm: String },

    #[error("{charm}: working copy lock: {source}")]
    Lock {
        charm: String,
        #[source]
        source: LockError,
    },

    #[error("{charm}: {source}")]
    Io {
        charm: String,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub fn charm(&self) -> &str {
        match self {
            SyncError::Unreachable { charm, .. }
            | SyncError::RefNotFound { charm, .. }
            | SyncError::Unreconcilable { charm, .. }
            | SyncError::Timeout { charm, .. }
            | SyncError::Cancelled { charm }
            | SyncError::Lock { charm, .. }
            | SyncError::Io { charm, .. } => charm,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled { .. })
    }
}

/// What a successful sync did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SyncOutcome {
    Cloned { revision: String },
    Updated { from: String, to: String },
    UpToDate { revision: String },
}

impl SyncOutcome {
    pub fn revision(&self) -> &str {
        match self {
            SyncOutcome::Cloned { revision } | SyncOutcome::UpToDate { revision } => revision,
            SyncOutcome::Updated { to, .. } => to,
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Cloned { revision } => write!(f, "cloned at {}", short(revision)),
            SyncOutcome::Updated { from, to } => {
                write!(f, "updated {}..{}", short(from), short(to))
            }
            SyncOutcome::UpToDate { revision } => write!(f, "up to date at {}", short(revision)),
        }
    }
}

fn short(revision: &str) -> &str {
    revision.get(..12).unwrap_or(revision)
}

/// Version control collaborator: "clone" and "update to ref".
pub trait Vcs: Send + Sync {
    /// Create a working copy of `charm` at `dest`, which does not exist yet
    fn clone_repo(&self, charm: &Charm, dest: &Path, control: &RunControl) -> SyncResult<String>;

    /// Bring the existing working copy at `dest` to the charm's reference.
    /// Returns `(before, after)` revisions.
    fn update(
        &self,
        charm: &Charm,
        dest: &Path,
        control: &RunControl,
    ) -> SyncResult<(String, String)>;
}

/// Drives a [`Vcs`] under per-charm serialization
pub struct Synchronizer {
    vcs: Arc<dyn Vcs>,
    reposdir: PathBuf,
    deadlines: Deadlines,
    locks: LockRegistry,
}

impl Synchronizer {
    pub fn new(vcs: Arc<dyn Vcs>, reposdir: impl Into<PathBuf>, deadlines: Deadlines) -> Self {
        Self {
            vcs,
            reposdir: reposdir.into(),
            deadlines,
            locks: LockRegistry::new(),
        }
    }

    /// Where `charm`'s working copy lives
    pub fn working_copy(&self, charm: &str) -> PathBuf {
        self.reposdir.join(charm)
    }

    /// Ensure the working copy exists at the requested revision
    pub fn sync(&self, charm: &Charm) -> SyncResult<SyncOutcome> {
        let mutex = self.locks.get(&charm.name);
        let _guard = mutex.lock().unwrap_or_else(|e| e.into_inner());
        let control = self.deadlines.sync();

        if control.is_cancelled() {
            return Err(SyncError::Cancelled {
                charm: charm.name.clone(),
            });
        }

        let _file_lock = CharmLock::acquire(&self.reposdir, &charm.name, self.deadlines.config().sync())
            .map_err(|source| SyncError::Lock {
                charm: charm.name.clone(),
                source,
            })?;

        let dest = self.working_copy(&charm.name);
        let result = if dest.exists() {
            info!(charm = %charm.name, "updating working copy");
            self.vcs
                .update(charm, &dest, &control)
                .map(|(from, to)| {
                    if from == to {
                        SyncOutcome::UpToDate { revision: to }
                    } else {
                        SyncOutcome::Updated { from, to }
                    }
                })
        } else {
            info!(charm = %charm.name, repo = %charm.repo, "cloning");
            self.vcs
                .clone_repo(charm, &dest, &control)
                .map(|revision| SyncOutcome::Cloned { revision })
        };

        match result {
            Ok(ref outcome) => info!(charm = %charm.name, "{}", outcome),
            Err(ref e) => warn!(charm = %charm.name, error = %e, "sync failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockVcs;
    use crate::timeout::TimeoutConfig;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use tempfile::TempDir;

    fn synchronizer(vcs: Arc<MockVcs>, dir: &TempDir) -> Synchronizer {
        Synchronizer::new(
            vcs,
            dir.path().join("repos"),
            Deadlines::detached(TimeoutConfig::default()),
        )
    }

    fn charm() -> Charm {
        Charm::new("slurmd", "https://example.com/slurmd.git")
    }

    #[test]
    fn test_first_sync_clones_once() {
        let dir = TempDir::new().unwrap();
        let vcs = Arc::new(MockVcs::new());
        vcs.set_remote("slurmd", None, "rev-1");
        let sync = synchronizer(Arc::clone(&vcs), &dir);

        let outcome = sync.sync(&charm()).unwrap();

        assert_eq!(outcome, SyncOutcome::Cloned { revision: "rev-1".to_string() });
        assert_eq!(vcs.clone_count("slurmd"), 1);
        assert_eq!(vcs.update_count("slurmd"), 0);
        assert!(sync.working_copy("slurmd").is_dir());
    }

    #[test]
    fn test_existing_copy_updates_once() {
        let dir = TempDir::new().unwrap();
        let vcs = Arc::new(MockVcs::new());
        vcs.set_remote("slurmd", None, "rev-1");
        let sync = synchronizer(Arc::clone(&vcs), &dir);
        sync.sync(&charm()).unwrap();

        vcs.set_remote("slurmd", None, "rev-2");
        let outcome = sync.sync(&charm()).unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Updated {
                from: "rev-1".to_string(),
                to: "rev-2".to_string()
            }
        );
        assert_eq!(vcs.clone_count("slurmd"), 1);
        assert_eq!(vcs.update_count("slurmd"), 1);
        assert_eq!(vcs.checked_out("slurmd").as_deref(), Some("rev-2"));
    }

    #[test]
    fn test_repeat_sync_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let vcs = Arc::new(MockVcs::new());
        vcs.set_remote("slurmd", None, "rev-1");
        let sync = synchronizer(Arc::clone(&vcs), &dir);

        sync.sync(&charm()).unwrap();
        let outcome = sync.sync(&charm()).unwrap();

        assert_eq!(outcome, SyncOutcome::UpToDate { revision: "rev-1".to_string() });
        assert_eq!(outcome.revision(), "rev-1");
    }

    #[test]
    fn test_unknown_reference() {
        let dir = TempDir::new().unwrap();
        let vcs = Arc::new(MockVcs::new());
        vcs.set_remote("slurmd", None, "rev-1");
        let sync = synchronizer(Arc::clone(&vcs), &dir);

        let err = sync.sync(&charm().with_reference("no-such-branch")).unwrap_err();
        assert!(matches!(err, SyncError::RefNotFound { .. }));
        assert_eq!(err.charm(), "slurmd");
    }

    #[test]
    fn test_unreachable_remote() {
        let dir = TempDir::new().unwrap();
        let vcs = Arc::new(MockVcs::new());
        let sync = synchronizer(vcs, &dir);

        let err = sync.sync(&charm()).unwrap_err();
        assert!(matches!(err, SyncError::Unreachable { .. }));
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let vcs = Arc::new(MockVcs::new());
        vcs.set_remote("slurmd", None, "rev-1");
        let cancel = Arc::new(AtomicBool::new(false));
        let deadlines = Deadlines::new(
            TimeoutConfig::default(),
            Arc::clone(&cancel),
            Arc::new(AtomicBool::new(false)),
        );
        let sync = Synchronizer::new(Arc::clone(&vcs) as Arc<dyn Vcs>, dir.path().join("repos"), deadlines);

        cancel.store(true, Ordering::SeqCst);
        assert!(sync.sync(&charm()).unwrap_err().is_cancelled());
        assert_eq!(vcs.clone_count("slurmd"), 0);
    }

    #[test]
    fn test_same_charm_never_syncs_concurrently() {
        let dir = TempDir::new().unwrap();
        let vcs = Arc::new(MockVcs::new().with_delay(Duration::from_millis(30)));
        vcs.set_remote("slurmd", None, "rev-1");
        vcs.set_remote("slurmctld", None, "rev-a");
        let sync = synchronizer(Arc::clone(&vcs), &dir);
        let other = Charm::new("slurmctld", "https://example.com/slurmctld.git");

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| sync.sync(&charm()).unwrap());
                s.spawn(|| sync.sync(&other).unwrap());
            }
        });

        assert_eq!(vcs.max_concurrent("slurmd"), 1);
        assert_eq!(vcs.max_concurrent("slurmctld"), 1);
        assert_eq!(vcs.clone_count("slurmd"), 1);
        assert_eq!(vcs.update_count("slurmd"), 3);
    }
}
