//! Shared harness for integration tests
//!
//! Wires a scheduler to in-memory collaborators (MockVcs, MockRunner,
//! MockRuntime) over a temporary workdir.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use charms_builder::config::{BaseEntry, BuilderConfig, CharmEntry};
use charms_builder::isolation::IdentityMapping;
use charms_builder::mock::{MockBuild, MockRunner, MockRuntime, MockVcs, PackagerCall};
use charms_builder::scheduler::{Collaborators, Scheduler, Selection};
use charms_builder::timeout::Deadlines;
use charms_builder::RunReport;
use charms_process::{CommandSpec, ProcessOutput};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use walkdir::WalkDir;

pub const RUN_ID: &str = "01test";

pub struct Harness {
    pub dir: TempDir,
    pub config: BuilderConfig,
    pub runner: Arc<MockRunner>,
    pub vcs: Arc<MockVcs>,
    pub runtime: Arc<MockRuntime>,
    pub cancel: Arc<AtomicBool>,
}

impl Harness {
    pub fn new(runtime: MockRuntime) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = BuilderConfig::default();
        config.workdir = dir.path().to_path_buf();
        config.charmsdir = dir.path().join("charms");
        config.build.jobs = 4;
        config.build.native_attempts = 1;

        Self {
            dir,
            config,
            runner: Arc::new(MockRunner::new()),
            vcs: Arc::new(MockVcs::new()),
            runtime: Arc::new(runtime),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a charm in the config and its remote in the mock VCS
    pub fn charm(mut self, name: &str) -> Self {
        self.config.charms.insert(
            name.to_string(),
            CharmEntry {
                repo: format!("https://example.com/{}.git", name),
                branch: None,
            },
        );
        self.vcs.set_remote(name, None, &format!("{}-rev1", name));
        self.vcs.set_file(name, "src/charm.py", format!("# {}\n", name));
        self.vcs.set_file(name, "metadata.yaml", format!("name: {}\n", name));
        self
    }

    pub fn base(mut self, name: &str, channel: &str, image: Option<&str>) -> Self {
        self.config.bases.push(BaseEntry {
            name: name.to_string(),
            channel: channel.to_string(),
            image: image.map(str::to_string),
        });
        self
    }

    pub fn scheduler(&self) -> Scheduler {
        let deadlines = Deadlines::new(
            self.config.timeouts(),
            Arc::clone(&self.cancel),
            Arc::new(AtomicBool::new(false)),
        );
        let tools = Collaborators {
            runner: self.runner.clone(),
            vcs: self.vcs.clone(),
            runtime: self.runtime.clone(),
        };
        Scheduler::from_config(
            &self.config,
            tools,
            deadlines,
            IdentityMapping::new(1000, 1000, "builder", "builder"),
            RUN_ID,
        )
    }

    pub fn run(&self, selection: &Selection) -> RunReport {
        self.scheduler()
            .run(&self.config.charms(), &self.config.bases(), selection)
    }

    pub fn working_copy(&self, charm: &str) -> PathBuf {
        self.config.reposdir().join(charm)
    }

    pub fn output_dir(&self, charm: &str, series: &str) -> PathBuf {
        self.config.charmsdir.join(charm).join(series)
    }
}

/// Native packaging tool: packs `<charm>_ubuntu-22.04-amd64.charm` into its cwd
pub fn native_pack(spec: &CommandSpec) -> ProcessOutput {
    let cwd = spec.cwd.clone().unwrap_or_default();
    let charm = cwd
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    fs::write(cwd.join(format!("{}_ubuntu-22.04-amd64.charm", charm)), b"native").unwrap();
    ProcessOutput::exited(0, format!("Packed {}\n", charm), "")
}

/// `images:centos/7` -> `centos-7`
pub fn series_of(image: &str) -> String {
    image.rsplit(':').next().unwrap_or(image).replace('/', "-")
}

/// In-instance packaging tool: packs `<charm>_<series>-amd64.charm` into the
/// instance's writable layer
pub fn manual_pack(call: &PackagerCall<'_>) -> MockBuild {
    let charm = call
        .source
        .and_then(|s| s.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = format!("{}_{}-amd64.charm", charm, series_of(call.image));
    MockBuild::success(vec![(name, call.instance.as_bytes().to_vec())])
}

/// Digest of every file's relative path and contents below `root`
pub fn tree_digest(root: &Path) -> String {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.unwrap();
        let rel = entry.path().strip_prefix(root).unwrap();
        hasher.update(rel.to_string_lossy().as_bytes());
        if entry.file_type().is_file() {
            hasher.update(fs::read(entry.path()).unwrap());
        }
    }
    hex::encode(hasher.finalize())
}
