//! Artifact discovery and copy-out
//!
//! Artifacts are `*.charm` files named `<charm>_<base>-<arch>.charm`
//! (multi-base packs repeat the `_<base>-<arch>` part).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use charms_process::RunControl;
use tracing::debug;

use crate::base::Base;
use crate::isolation::{EnvironmentGuard, RuntimeError, RuntimeResult};

pub const ARTIFACT_EXTENSION: &str = ".charm";

pub fn is_artifact(file_name: &str) -> bool {
    file_name.ends_with(ARTIFACT_EXTENSION) && file_name.len() > ARTIFACT_EXTENSION.len()
}

/// Charm name of an artifact file: everything before the first `_`
pub fn charm_name(file_name: &str) -> Option<&str> {
    if !is_artifact(file_name) {
        return None;
    }
    let stem = &file_name[..file_name.len() - ARTIFACT_EXTENSION.len()];
    match stem.split_once('_') {
        Some((name, _)) if !name.is_empty() => Some(name),
        _ => None,
    }
}

/// True if the artifact file name carries `base`
pub fn built_for(file_name: &str, base: &Base) -> bool {
    if !is_artifact(file_name) {
        return false;
    }
    let stem = &file_name[..file_name.len() - ARTIFACT_EXTENSION.len()];
    let series = base.series();
    stem.split('_')
        .skip(1)
        .any(|part| part == series || part.starts_with(&format!("{}-", series)))
}

/// Copy this base's artifacts written since `since` from the working copy
/// into `out_dir`. The working copy keeps its files: manual tasks of the
/// same charm may be using it as an overlay lower layer.
pub fn collect_native(
    working_copy: &Path,
    base: &Base,
    since: SystemTime,
    out_dir: &Path,
) -> io::Result<Vec<PathBuf>> {
    let mut collected = Vec::new();
    for entry in fs::read_dir(working_copy)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !built_for(&name, base) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if modified < since {
            debug!(artifact = %name, "ignoring artifact from an earlier build");
            continue;
        }
        let dest = out_dir.join(&name);
        fs::copy(entry.path(), &dest)?;
        collected.push(dest);
    }
    collected.sort();
    Ok(collected)
}

/// Pull this base's artifacts the build wrote inside the environment.
///
/// The overlay's upper directory holds exactly the files written during the
/// build, so anything already in the host working copy is never picked up
/// unless the build rewrote it.
pub fn pull_manual(
    guard: &EnvironmentGuard<'_>,
    base: &Base,
    out_dir: &Path,
    control: &RunControl,
) -> RuntimeResult<Vec<PathBuf>> {
    let upper = match guard.env().overlay() {
        Some(overlay) => overlay.upper.as_path(),
        None => {
            return Err(RuntimeError::Failed {
                op: "list directory",
                detail: format!("{}: no overlay mounted", guard.env().instance()),
            })
        }
    };
    let mut pulled = Vec::new();
    for name in guard.list_dir(upper, control)? {
        if !built_for(&name, base) {
            continue;
        }
        let dest = out_dir.join(&name);
        guard.pull_file(&upper.join(&name), &dest, control)?;
        pulled.push(dest);
    }
    pulled.sort();
    Ok(pulled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_charm_name() {
        assert_eq!(charm_name("slurmd_ubuntu-22.04-amd64.charm"), Some("slurmd"));
        assert_eq!(charm_name("mysql-router_centos-7-amd64.charm"), Some("mysql-router"));
        assert_eq!(charm_name("README.md"), None);
        assert_eq!(charm_name("nounderscore.charm"), None);
    }

    #[test]
    fn test_built_for() {
        let ubuntu = Base::new("ubuntu", "22.04");
        assert!(built_for("slurmd_ubuntu-22.04-amd64.charm", &ubuntu));
        assert!(built_for("slurmd_ubuntu-20.04-amd64_ubuntu-22.04-amd64.charm", &ubuntu));
        assert!(!built_for("slurmd_ubuntu-20.04-amd64.charm", &ubuntu));
        assert!(!built_for("slurmd_centos-7-amd64.charm", &ubuntu));

        let centos = Base::new("centos", "7");
        assert!(!built_for("slurmd_centos-7.9-amd64.charm", &centos));
        assert!(built_for("slurmd_centos-7-amd64.charm", &centos));
    }

    #[test]
    fn test_collect_native_copies_matching() {
        let repo = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::write(repo.path().join("slurmd_ubuntu-22.04-amd64.charm"), b"new").unwrap();
        fs::write(repo.path().join("slurmd_ubuntu-20.04-amd64.charm"), b"other base").unwrap();
        fs::write(repo.path().join("charmcraft.yaml"), b"").unwrap();

        let since = SystemTime::now() - Duration::from_secs(60);
        let collected =
            collect_native(repo.path(), &Base::new("ubuntu", "22.04"), since, out.path()).unwrap();

        assert_eq!(collected, vec![out.path().join("slurmd_ubuntu-22.04-amd64.charm")]);
        assert!(repo.path().join("slurmd_ubuntu-22.04-amd64.charm").exists());
        assert!(!out.path().join("slurmd_ubuntu-20.04-amd64.charm").exists());
    }

    #[test]
    fn test_collect_native_ignores_stale() {
        let repo = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::write(repo.path().join("slurmd_ubuntu-22.04-amd64.charm"), b"old").unwrap();

        let since = SystemTime::now() + Duration::from_secs(60);
        let collected =
            collect_native(repo.path(), &Base::new("ubuntu", "22.04"), since, out.path()).unwrap();
        assert!(collected.is_empty());
    }
}
