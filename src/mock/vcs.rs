//! In-memory version control collaborator
//!
//! Remotes are registered per charm name with a default revision, optional
//! named references and the files a working copy contains. Clones write
//! those files to disk so builds have something to read.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use charms_process::RunControl;

use crate::charm::Charm;
use crate::sync::{SyncError, SyncResult, Vcs};

#[derive(Debug, Default, Clone)]
struct Remote {
    default_revision: String,
    refs: HashMap<String, String>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct State {
    remotes: HashMap<String, Remote>,
    checked_out: HashMap<String, String>,
    dirty: HashSet<String>,
    clones: HashMap<String, usize>,
    updates: HashMap<String, usize>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

#[derive(Default)]
pub struct MockVcs {
    state: Mutex<State>,
    delay: Option<Duration>,
}

impl MockVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every clone and update
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register or move a remote. `reference` of `None` moves the default branch.
    pub fn set_remote(&self, charm: &str, reference: Option<&str>, revision: &str) {
        let mut state = self.lock();
        let remote = state.remotes.entry(charm.to_string()).or_default();
        match reference {
            Some(r) => {
                remote.refs.insert(r.to_string(), revision.to_string());
            }
            None => remote.default_revision = revision.to_string(),
        }
    }

    /// Files every working copy of `charm` contains
    pub fn set_file(&self, charm: &str, path: &str, contents: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        let remote = state.remotes.entry(charm.to_string()).or_default();
        remote.files.insert(path.to_string(), contents.into());
    }

    /// Make the working copy unreconcilable on the next update
    pub fn set_dirty(&self, charm: &str) {
        self.lock().dirty.insert(charm.to_string());
    }

    pub fn clone_count(&self, charm: &str) -> usize {
        self.lock().clones.get(charm).copied().unwrap_or(0)
    }

    pub fn update_count(&self, charm: &str) -> usize {
        self.lock().updates.get(charm).copied().unwrap_or(0)
    }

    pub fn checked_out(&self, charm: &str) -> Option<String> {
        self.lock().checked_out.get(charm).cloned()
    }

    /// Most clones/updates of `charm` seen running at the same time
    pub fn max_concurrent(&self, charm: &str) -> usize {
        self.lock().max_in_flight.get(charm).copied().unwrap_or(0)
    }

    fn enter(&self, charm: &str) {
        let mut state = self.lock();
        let current = {
            let n = state.in_flight.entry(charm.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        let max = state.max_in_flight.entry(charm.to_string()).or_insert(0);
        *max = (*max).max(current);
    }

    fn exit(&self, charm: &str) {
        if let Some(n) = self.lock().in_flight.get_mut(charm) {
            *n = n.saturating_sub(1);
        }
    }

    /// Revision and files `charm`'s reference points at
    fn resolve(&self, charm: &Charm) -> SyncResult<(String, BTreeMap<String, Vec<u8>>)> {
        let state = self.lock();
        let remote = state
            .remotes
            .get(&charm.name)
            .ok_or_else(|| SyncError::Unreachable {
                charm: charm.name.clone(),
                detail: format!("could not read from remote repository '{}'", charm.repo),
            })?;
        let revision = match charm.reference {
            Some(ref r) => remote.refs.get(r).cloned().ok_or_else(|| SyncError::RefNotFound {
                charm: charm.name.clone(),
                reference: r.clone(),
            })?,
            None => remote.default_revision.clone(),
        };
        Ok((revision, remote.files.clone()))
    }

    fn write_files(charm: &str, dest: &Path, files: &BTreeMap<String, Vec<u8>>) -> SyncResult<()> {
        let io = |source: std::io::Error| SyncError::Io {
            charm: charm.to_string(),
            source,
        };
        fs::create_dir_all(dest).map_err(io)?;
        for (path, contents) in files {
            let target = dest.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(io)?;
            }
            fs::write(&target, contents).map_err(io)?;
        }
        Ok(())
    }

    fn with_tracking<T>(&self, charm: &str, f: impl FnOnce() -> SyncResult<T>) -> SyncResult<T> {
        self.enter(charm);
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let result = f();
        self.exit(charm);
        result
    }
}

impl Vcs for MockVcs {
    fn clone_repo(&self, charm: &Charm, dest: &Path, _control: &RunControl) -> SyncResult<String> {
        self.with_tracking(&charm.name, || {
            let (revision, files) = self.resolve(charm)?;
            Self::write_files(&charm.name, dest, &files)?;

            let mut state = self.lock();
            *state.clones.entry(charm.name.clone()).or_insert(0) += 1;
            state.checked_out.insert(charm.name.clone(), revision.clone());
            Ok(revision)
        })
    }

    fn update(&self, charm: &Charm, dest: &Path, _control: &RunControl) -> SyncResult<(String, String)> {
        self.with_tracking(&charm.name, || {
            if self.lock().dirty.contains(&charm.name) {
                return Err(SyncError::Unreconcilable {
                    charm: charm.name.clone(),
                    detail: "local changes would be overwritten".to_string(),
                });
            }
            let (revision, files) = self.resolve(charm)?;
            Self::write_files(&charm.name, dest, &files)?;

            let mut state = self.lock();
            *state.updates.entry(charm.name.clone()).or_insert(0) += 1;
            let before = state
                .checked_out
                .insert(charm.name.clone(), revision.clone())
                .unwrap_or_default();
            Ok((before, revision))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_clone_writes_files() {
        let dir = TempDir::new().unwrap();
        let vcs = MockVcs::new();
        vcs.set_remote("slurmd", None, "rev-1");
        vcs.set_file("slurmd", "charmcraft.yaml", "type: charm\n");
        vcs.set_file("slurmd", "src/charm.py", "print()\n");

        let dest = dir.path().join("slurmd");
        let rev = vcs
            .clone_repo(&Charm::new("slurmd", "r"), &dest, &RunControl::default())
            .unwrap();

        assert_eq!(rev, "rev-1");
        assert!(dest.join("src/charm.py").is_file());
    }

    #[test]
    fn test_reference_resolution() {
        let dir = TempDir::new().unwrap();
        let vcs = MockVcs::new();
        vcs.set_remote("slurmd", None, "main-rev");
        vcs.set_remote("slurmd", Some("release"), "rel-rev");

        let charm = Charm::new("slurmd", "r").with_reference("release");
        let rev = vcs
            .clone_repo(&charm, &dir.path().join("slurmd"), &RunControl::default())
            .unwrap();
        assert_eq!(rev, "rel-rev");
    }

    #[test]
    fn test_dirty_update_rejected() {
        let dir = TempDir::new().unwrap();
        let vcs = MockVcs::new();
        vcs.set_remote("slurmd", None, "rev-1");
        let charm = Charm::new("slurmd", "r");
        vcs.clone_repo(&charm, &dir.path().join("slurmd"), &RunControl::default())
            .unwrap();

        vcs.set_dirty("slurmd");
        let err = vcs
            .update(&charm, &dir.path().join("slurmd"), &RunControl::default())
            .unwrap_err();
        assert!(matches!(err, SyncError::Unreconcilable { .. }));
        assert_eq!(vcs.update_count("slurmd"), 0);
    }
}
