//! Writable overlay over the read-only source inside an instance
//!
//! ```text
//! <scratch>/<instance>-overlay/upper   modifications
//! <scratch>/<instance>-overlay/work    overlayfs bookkeeping
//! <scratch>/<instance>-overlay/merge   lower + upper, bound back over the source path
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::ScratchBacking;

pub const MEMORY_SCRATCH: &str = "/dev/shm";
pub const DISK_SCRATCH: &str = "/var/tmp";

pub fn scratch_root(backing: ScratchBacking) -> &'static Path {
    match backing {
        ScratchBacking::Memory => Path::new(MEMORY_SCRATCH),
        ScratchBacking::Disk => Path::new(DISK_SCRATCH),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayLayout {
    pub backing: ScratchBacking,
    pub lower: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merge: PathBuf,
}

impl OverlayLayout {
    pub fn new(backing: ScratchBacking, instance: &str, lower: &Path) -> Self {
        let root = scratch_root(backing).join(format!("{}-overlay", instance));
        Self {
            backing,
            lower: lower.to_path_buf(),
            upper: root.join("upper"),
            work: root.join("work"),
            merge: root.join("merge"),
        }
    }

    pub fn mount_options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lower.display(),
            self.upper.display(),
            self.work.display()
        )
    }

    pub fn mkdir_argv(&self) -> Vec<String> {
        vec![
            "mkdir".to_string(),
            "-p".to_string(),
            self.upper.display().to_string(),
            self.work.display().to_string(),
            self.merge.display().to_string(),
        ]
    }

    pub fn mount_argv(&self) -> Vec<String> {
        vec![
            "mount".to_string(),
            "-t".to_string(),
            "overlay".to_string(),
            "overlay".to_string(),
            "-o".to_string(),
            self.mount_options(),
            self.merge.display().to_string(),
        ]
    }

    /// Bind the merge view over the source path so the build sees it there
    pub fn bind_argv(&self) -> Vec<String> {
        vec![
            "mount".to_string(),
            "--bind".to_string(),
            self.merge.display().to_string(),
            self.lower.display().to_string(),
        ]
    }
}

/// Probe for a usable memory scratch area
pub fn memory_probe_argv() -> Vec<String> {
    ["test", "-d", MEMORY_SCRATCH, "-a", "-w", MEMORY_SCRATCH]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
