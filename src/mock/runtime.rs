//! In-memory isolation runtime
//!
//! Each instance keeps its own writable layer in memory; read-only disk
//! devices are served from the host directory they attach. Once an overlay
//! mount command runs, the layer is also visible under its `upperdir`.
//! Stopping an instance discards its layer. Launches, stops and executed
//! commands are recorded for assertions.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;

use charms_process::{ProcessOutput, RunControl, Termination};

use super::failure::{FailureConfig, FailureInjector, RuntimeOp};
use crate::isolation::{DiskDevice, ExecSpec, IsolationRuntime, LaunchSpec, RuntimeError, RuntimeResult};

/// What the packaging tool sees when invoked inside an instance
pub struct PackagerCall<'a> {
    pub instance: &'a str,
    pub image: &'a str,
    pub spec: &'a ExecSpec,
    /// Host directory backing the build's working directory, if attached
    pub source: Option<&'a Path>,
}

/// Scripted packaging tool result
#[derive(Debug, Clone)]
pub struct MockBuild {
    pub output: ProcessOutput,
    /// Files written into the working directory's writable layer
    pub files: Vec<(String, Vec<u8>)>,
}

impl MockBuild {
    pub fn success(files: Vec<(String, Vec<u8>)>) -> Self {
        Self {
            output: ProcessOutput::exited(0, "Packed\n", ""),
            files,
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            output: ProcessOutput::exited(code, "", stderr),
            files: Vec::new(),
        }
    }

    pub fn timed_out() -> Self {
        let mut output = ProcessOutput::exited(0, "", "");
        output.code = None;
        output.termination = Termination::TimedOut;
        Self {
            output,
            files: Vec::new(),
        }
    }
}

type Packager = dyn Fn(&PackagerCall<'_>) -> MockBuild + Send + Sync;

#[derive(Debug)]
struct Instance {
    image: String,
    disks: Vec<DiskDevice>,
    layer: BTreeMap<PathBuf, Vec<u8>>,
    /// (upperdir, lowerdir) of the mounted overlay
    overlay: Option<(PathBuf, PathBuf)>,
}

impl Instance {
    /// Host path behind `path` through a disk device
    fn host_path(&self, path: &Path) -> Option<PathBuf> {
        self.disks.iter().find_map(|d| {
            path.strip_prefix(&d.path)
                .ok()
                .map(|rel| d.source.join(rel))
        })
    }

    /// Path in the merged view for a path under the overlay's upper dir
    fn upper_to_merged(&self, path: &Path) -> Option<PathBuf> {
        let (upper, lower) = self.overlay.as_ref()?;
        path.strip_prefix(upper).ok().map(|rel| lower.join(rel))
    }
}

/// (upperdir, lowerdir) from `mount -t overlay overlay -o <options> <merge>`
fn overlay_dirs(argv: &[String]) -> Option<(PathBuf, PathBuf)> {
    if argv.get(1).map(String::as_str) != Some("-t") || argv.get(2).map(String::as_str) != Some("overlay") {
        return None;
    }
    let options = argv.iter().position(|a| a == "-o").and_then(|i| argv.get(i + 1))?;
    let option = |key: &str| {
        options
            .split(',')
            .find_map(|kv| kv.strip_prefix(key))
            .map(PathBuf::from)
    };
    Some((option("upperdir=")?, option("lowerdir=")?))
}

#[derive(Debug, Default)]
struct State {
    instances: HashMap<String, Instance>,
    launches: Vec<LaunchSpec>,
    stop_attempts: Vec<String>,
    execs: Vec<(String, ExecSpec)>,
    pulls: Vec<(String, PathBuf)>,
    failures: FailureInjector,
}

pub struct MockRuntime {
    state: Mutex<State>,
    packager_program: String,
    packager: Option<Box<Packager>>,
    existing_identity: bool,
    builds_in_flight: AtomicUsize,
    max_builds_in_flight: AtomicUsize,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            packager_program: "charmcraft".to_string(),
            packager: None,
            existing_identity: false,
            builds_in_flight: AtomicUsize::new(0),
            max_builds_in_flight: AtomicUsize::new(0),
        }
    }

    /// Script the packaging tool
    pub fn with_packager<F>(mut self, packager: F) -> Self
    where
        F: Fn(&PackagerCall<'_>) -> MockBuild + Send + Sync + 'static,
    {
        self.packager = Some(Box::new(packager));
        self
    }

    /// Images already contain the build user and group
    pub fn with_existing_identity(mut self) -> Self {
        self.existing_identity = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn inject(&self, op: RuntimeOp, config: FailureConfig) {
        self.lock().failures.inject(op, config);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Launches that created an instance
    pub fn launch_specs(&self) -> Vec<LaunchSpec> {
        self.lock().launches.clone()
    }

    pub fn launch_count(&self) -> usize {
        self.lock().launches.len()
    }

    /// Stop calls, successful or not
    pub fn stop_count(&self) -> usize {
        self.lock().stop_attempts.len()
    }

    pub fn stops_of(&self, instance: &str) -> usize {
        self.lock().stop_attempts.iter().filter(|s| *s == instance).count()
    }

    pub fn running_instances(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().instances.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn disks(&self, instance: &str) -> Vec<DiskDevice> {
        self.lock()
            .instances
            .get(instance)
            .map(|i| i.disks.clone())
            .unwrap_or_default()
    }

    /// Files in an instance's writable layer
    pub fn layer_files(&self, instance: &str) -> Vec<PathBuf> {
        self.lock()
            .instances
            .get(instance)
            .map(|i| i.layer.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Executed commands whose argv[0] is `program`
    pub fn exec_count(&self, program: &str) -> usize {
        self.lock()
            .execs
            .iter()
            .filter(|(_, spec)| spec.argv.first().map(String::as_str) == Some(program))
            .count()
    }

    pub fn execs(&self) -> Vec<(String, ExecSpec)> {
        self.lock().execs.clone()
    }

    pub fn pull_count(&self) -> usize {
        self.lock().pulls.len()
    }

    /// Most packaging runs seen at the same time
    pub fn max_concurrent_builds(&self) -> usize {
        self.max_builds_in_flight.load(Ordering::SeqCst)
    }

    /// Consult the injector; sleeps for any delay outside the lock
    fn failure(&self, op: &RuntimeOp) -> Option<FailureConfig> {
        let config = self.lock().failures.check(op)?;
        if let Some(delay) = config.delay {
            thread::sleep(delay);
        }
        if config.is_delay_only() {
            None
        } else {
            Some(config)
        }
    }

    fn fail(op: &RuntimeOp, config: &FailureConfig) -> RuntimeError {
        if config.timeout {
            RuntimeError::Timeout {
                op: op.name(),
                after: config.delay.unwrap_or_default(),
            }
        } else if config.cancelled {
            RuntimeError::Cancelled { op: op.name() }
        } else {
            RuntimeError::Failed {
                op: op.name(),
                detail: config.message.clone(),
            }
        }
    }

    fn not_running(op: &'static str, instance: &str) -> RuntimeError {
        RuntimeError::NotFound {
            op,
            instance: instance.to_string(),
        }
    }

    fn run_packager(&self, instance: &str, spec: &ExecSpec) -> RuntimeResult<ProcessOutput> {
        let (image, source) = {
            let state = self.lock();
            let inst = state
                .instances
                .get(instance)
                .ok_or_else(|| Self::not_running("exec", instance))?;
            let source = spec.cwd.as_deref().and_then(|cwd| inst.host_path(cwd));
            (inst.image.clone(), source)
        };

        let in_flight = self.builds_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_builds_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let build = match self.packager {
            Some(ref packager) => packager(&PackagerCall {
                instance,
                image: &image,
                spec,
                source: source.as_deref(),
            }),
            None => MockBuild::success(Vec::new()),
        };

        self.builds_in_flight.fetch_sub(1, Ordering::SeqCst);

        if build.output.timed_out() {
            return Err(RuntimeError::Timeout {
                op: "exec",
                after: build.output.duration,
            });
        }

        let cwd = spec.cwd.clone().unwrap_or_else(|| PathBuf::from("/root"));
        let mut state = self.lock();
        let inst = state
            .instances
            .get_mut(instance)
            .ok_or_else(|| Self::not_running("exec", instance))?;
        for (name, bytes) in build.files {
            inst.layer.insert(cwd.join(name), bytes);
        }
        Ok(build.output)
    }
}

impl IsolationRuntime for MockRuntime {
    fn launch(&self, spec: &LaunchSpec, _control: &RunControl) -> RuntimeResult<()> {
        let injected = self.failure(&RuntimeOp::Launch);
        if let Some(ref config) = injected {
            if !config.after_effect {
                return Err(Self::fail(&RuntimeOp::Launch, config));
            }
        }
        let mut state = self.lock();
        if state.instances.contains_key(&spec.name) {
            return Err(RuntimeError::Failed {
                op: "launch",
                detail: format!("instance '{}' already exists", spec.name),
            });
        }
        state.instances.insert(
            spec.name.clone(),
            Instance {
                image: spec.image.clone(),
                disks: Vec::new(),
                layer: BTreeMap::new(),
                overlay: None,
            },
        );
        state.launches.push(spec.clone());
        match injected {
            Some(config) => Err(Self::fail(&RuntimeOp::Launch, &config)),
            None => Ok(()),
        }
    }

    fn add_disk(&self, instance: &str, device: &DiskDevice, _control: &RunControl) -> RuntimeResult<()> {
        if let Some(config) = self.failure(&RuntimeOp::AddDisk) {
            return Err(Self::fail(&RuntimeOp::AddDisk, &config));
        }
        let mut state = self.lock();
        let inst = state
            .instances
            .get_mut(instance)
            .ok_or_else(|| Self::not_running("add disk device", instance))?;
        inst.disks.push(device.clone());
        Ok(())
    }

    fn exec(&self, instance: &str, spec: &ExecSpec, _control: &RunControl) -> RuntimeResult<ProcessOutput> {
        self.lock().execs.push((instance.to_string(), spec.clone()));
        let program = spec.argv.first().cloned().unwrap_or_default();

        let command_op = RuntimeOp::Command(program.clone());
        let injected = self
            .failure(&command_op)
            .map(|c| (command_op, c))
            .or_else(|| self.failure(&RuntimeOp::Exec).map(|c| (RuntimeOp::Exec, c)));
        if let Some((op, config)) = injected {
            return match config.exit_code {
                Some(code) => Ok(ProcessOutput::exited(code, "", config.message)),
                None => Err(Self::fail(&op, &config)),
            };
        }

        {
            let mut state = self.lock();
            let inst = state
                .instances
                .get_mut(instance)
                .ok_or_else(|| Self::not_running("exec", instance))?;
            if program == "mount" {
                if let Some(dirs) = overlay_dirs(&spec.argv) {
                    inst.overlay = Some(dirs);
                }
            }
        }

        if program == self.packager_program {
            return self.run_packager(instance, spec);
        }
        if program == "getent" && !self.existing_identity {
            return Ok(ProcessOutput::exited(2, "", ""));
        }
        Ok(ProcessOutput::exited(0, "", ""))
    }

    fn list_dir(&self, instance: &str, dir: &Path, _control: &RunControl) -> RuntimeResult<Vec<String>> {
        if let Some(config) = self.failure(&RuntimeOp::ListDir) {
            return Err(Self::fail(&RuntimeOp::ListDir, &config));
        }
        let state = self.lock();
        let inst = state
            .instances
            .get(instance)
            .ok_or_else(|| Self::not_running("list directory", instance))?;

        let mut names = BTreeSet::new();
        if let Some(merged) = inst.upper_to_merged(dir) {
            for path in inst.layer.keys() {
                if path.parent() == Some(merged.as_path()) {
                    if let Some(name) = path.file_name() {
                        names.insert(name.to_string_lossy().to_string());
                    }
                }
            }
            return Ok(names.into_iter().collect());
        }
        if let Some(host) = inst.host_path(dir) {
            if let Ok(entries) = fs::read_dir(host) {
                for entry in entries.flatten() {
                    names.insert(entry.file_name().to_string_lossy().to_string());
                }
            }
        }
        for path in inst.layer.keys() {
            if path.parent() == Some(dir) {
                if let Some(name) = path.file_name() {
                    names.insert(name.to_string_lossy().to_string());
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    fn pull_file(&self, instance: &str, src: &Path, dest: &Path, _control: &RunControl) -> RuntimeResult<()> {
        if let Some(config) = self.failure(&RuntimeOp::PullFile) {
            return Err(Self::fail(&RuntimeOp::PullFile, &config));
        }
        let mut state = self.lock();
        let inst = state
            .instances
            .get(instance)
            .ok_or_else(|| Self::not_running("pull file", instance))?;

        let target = if dest.is_dir() {
            match src.file_name() {
                Some(name) => dest.join(name),
                None => dest.to_path_buf(),
            }
        } else {
            dest.to_path_buf()
        };

        let io_err = |e: std::io::Error| RuntimeError::Failed {
            op: "pull file",
            detail: e.to_string(),
        };
        let merged = inst.upper_to_merged(src);
        if let Some(bytes) = inst.layer.get(merged.as_deref().unwrap_or(src)) {
            fs::write(&target, bytes).map_err(io_err)?;
        } else if merged.is_some() {
            return Err(RuntimeError::Failed {
                op: "pull file",
                detail: format!("{}: no such file", src.display()),
            });
        } else if let Some(host) = inst.host_path(src) {
            fs::copy(host, &target).map_err(io_err)?;
        } else {
            return Err(RuntimeError::Failed {
                op: "pull file",
                detail: format!("{}: no such file", src.display()),
            });
        }
        state.pulls.push((instance.to_string(), src.to_path_buf()));
        Ok(())
    }

    fn stop(&self, instance: &str, _control: &RunControl) -> RuntimeResult<()> {
        self.lock().stop_attempts.push(instance.to_string());
        if let Some(config) = self.failure(&RuntimeOp::Stop) {
            return Err(Self::fail(&RuntimeOp::Stop, &config));
        }
        match self.lock().instances.remove(instance) {
            Some(_) => Ok(()),
            None => Err(Self::not_running("stop", instance)),
        }
    }

    fn list_instances(&self, prefix: &str, _control: &RunControl) -> RuntimeResult<Vec<String>> {
        if let Some(config) = self.failure(&RuntimeOp::ListInstances) {
            return Err(Self::fail(&RuntimeOp::ListInstances, &config));
        }
        Ok(self
            .running_instances()
            .into_iter()
            .filter(|n| n.starts_with(prefix))
            .collect())
    }
}
