//! Isolation provider
//!
//! Creates ephemeral instances for manual provisioning and guarantees they
//! are stopped again. An acquired environment presents the charm's working
//! copy at its host path inside the instance:
//!
//! 1. the working copy is attached read-only (`SOURCE_BOUND`)
//! 2. an overlay with upper/work dirs on scratch storage is mounted over it
//!    and the merge view is bound back onto the same path (`OVERLAY_MOUNTED`)
//! 3. the invoking user and group are created inside (`IDENTITY_CONFIGURED`)
//!
//! The host copy is never written: the only writable layer lives inside the
//! instance and disappears with it.
//!
//! [`IsolationProvider::release`] stops the instance once. Provisioning
//! failures stop the half-built instance before returning, and
//! [`EnvironmentGuard`] releases on drop, so every launched instance is
//! stopped on every exit path. Stop failures on the drop path are kept by
//! the provider until [`IsolationProvider::take_unreported`] collects them.

pub mod identity;
pub mod lxc;
pub mod naming;
pub mod overlay;
pub mod runtime;
pub mod state;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use charms_process::{ProcessOutput, RunControl};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::base::Base;
use crate::config::ScratchBacking;
use crate::timeout::Deadlines;

pub use identity::IdentityMapping;
pub use lxc::LxcRuntime;
pub use naming::{instance_name, is_managed, new_nonce, INSTANCE_PREFIX};
pub use overlay::OverlayLayout;
pub use runtime::{DiskDevice, ExecSpec, IsolationRuntime, LaunchSpec, RuntimeError, RuntimeResult};
pub use state::{EnvState, StateError};

/// Instance config key carrying the run id
pub const RUN_ID_KEY: &str = "user.charms-builder.run";

/// Device name of the read-only source attachment
pub const SOURCE_DEVICE: &str = "charmsrc";

pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionErrorKind {
    Failed,
    Timeout,
    Cancelled,
}

/// The environment could not be brought up; fatal to the owning task only
#[derive(Debug, Error)]
#[error("{instance}: {step} failed: {detail}")]
pub struct ProvisionError {
    pub instance: String,
    pub step: &'static str,
    pub detail: String,
    pub kind: ProvisionErrorKind,
    /// Stopping the half-provisioned instance also failed
    pub teardown: Option<TeardownError>,
}

impl ProvisionError {
    fn new(instance: &str, step: &'static str, err: RuntimeError) -> Self {
        let kind = match err {
            RuntimeError::Timeout { .. } => ProvisionErrorKind::Timeout,
            RuntimeError::Cancelled { .. } => ProvisionErrorKind::Cancelled,
            _ => ProvisionErrorKind::Failed,
        };
        Self {
            instance: instance.to_string(),
            step,
            detail: err.to_string(),
            kind,
            teardown: None,
        }
    }

    fn cancelled(instance: &str, step: &'static str) -> Self {
        Self {
            instance: instance.to_string(),
            step,
            detail: "cancellation requested".to_string(),
            kind: ProvisionErrorKind::Cancelled,
            teardown: None,
        }
    }
}

/// Stopping an instance failed; it may still be running
#[derive(Debug, Clone, Error, Serialize)]
#[error("{instance}: stop failed: {detail}")]
pub struct TeardownError {
    pub instance: String,
    pub detail: String,
}

/// Permission to run the packaging tool in destructive mode.
///
/// Only obtainable from a fully provisioned [`IsolatedEnvironment`].
#[derive(Debug, Clone, Copy)]
pub struct DestructiveMode {
    _private: (),
}

/// Stop failure of an environment released by [`EnvironmentGuard`]'s drop
#[derive(Debug, Clone)]
pub struct UnreportedTeardown {
    pub charm: String,
    pub base: String,
    pub error: TeardownError,
}

/// One ephemeral instance, owned by the provider that created it
#[derive(Debug)]
pub struct IsolatedEnvironment {
    charm: String,
    base: String,
    instance: String,
    image: String,
    build_root: PathBuf,
    overlay: Option<OverlayLayout>,
    identity: IdentityMapping,
    state: EnvState,
}

impl IsolatedEnvironment {
    pub fn charm(&self) -> &str {
        &self.charm
    }

    /// Series of the base this environment builds for
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Source path inside the instance; the merge view once mounted
    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    pub fn overlay(&self) -> Option<&OverlayLayout> {
        self.overlay.as_ref()
    }

    pub fn identity(&self) -> &IdentityMapping {
        &self.identity
    }

    pub fn state(&self) -> EnvState {
        self.state
    }

    pub fn destructive_mode(&self) -> Option<DestructiveMode> {
        (self.state == EnvState::Running).then_some(DestructiveMode { _private: () })
    }

    fn transition(&mut self, to: EnvState) -> Result<(), StateError> {
        if !self.state.can_transition_to(to) {
            return Err(StateError {
                from: self.state,
                to,
            });
        }
        debug!(instance = %self.instance, from = %self.state, to = %to, "environment transition");
        self.state = to;
        Ok(())
    }
}

/// An instance stopped by `clean`
#[derive(Debug)]
pub struct ReapedInstance {
    pub name: String,
    pub result: Result<(), TeardownError>,
}

pub struct IsolationProvider {
    runtime: Arc<dyn IsolationRuntime>,
    deadlines: Deadlines,
    scratch: ScratchBacking,
    run_id: String,
    unreported: Mutex<Vec<UnreportedTeardown>>,
}

impl IsolationProvider {
    pub fn new(
        runtime: Arc<dyn IsolationRuntime>,
        deadlines: Deadlines,
        scratch: ScratchBacking,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            deadlines,
            scratch,
            run_id: run_id.into(),
            unreported: Mutex::new(Vec::new()),
        }
    }

    pub fn deadlines(&self) -> &Deadlines {
        &self.deadlines
    }

    /// Launch and provision an instance for one (charm, base) task
    pub fn acquire(
        &self,
        charm: &str,
        base: &Base,
        image: &str,
        build_root: &Path,
        identity: &IdentityMapping,
    ) -> ProvisionResult<EnvironmentGuard<'_>> {
        let instance = instance_name(charm, &base.series(), &new_nonce());
        let control = self.deadlines.provision();

        if control.is_cancelled() {
            return Err(ProvisionError::cancelled(&instance, EnvState::Created.step()));
        }

        let launch = LaunchSpec {
            name: instance.clone(),
            image: image.to_string(),
            ephemeral: true,
            config: vec![
                ("raw.idmap".to_string(), identity.raw_idmap()),
                (RUN_ID_KEY.to_string(), self.run_id.clone()),
            ],
        };
        if let Err(e) = self.runtime.launch(&launch, &control) {
            let mut err = ProvisionError::new(&instance, EnvState::Created.step(), e);
            // the daemon may still create the instance after the client gave up
            warn!(instance = %instance, error = %err, "launch failed, stopping any partial instance");
            err.teardown = self.stop_instance(&instance).err();
            return Err(err);
        }
        info!(charm, base = %base, instance = %instance, image, "instance launched");

        let mut env = IsolatedEnvironment {
            charm: charm.to_string(),
            base: base.series(),
            instance,
            image: image.to_string(),
            build_root: build_root.to_path_buf(),
            overlay: None,
            identity: identity.clone(),
            state: EnvState::Created,
        };

        match self.provision(&mut env, &control) {
            Ok(()) => Ok(EnvironmentGuard {
                provider: self,
                env,
            }),
            Err(mut err) => {
                warn!(instance = %env.instance, error = %err, "provisioning failed, stopping instance");
                err.teardown = self.release(&mut env).err();
                Err(err)
            }
        }
    }

    fn provision(&self, env: &mut IsolatedEnvironment, control: &RunControl) -> ProvisionResult<()> {
        let steps = [
            EnvState::SourceBound,
            EnvState::OverlayMounted,
            EnvState::IdentityConfigured,
            EnvState::Running,
        ];
        for target in steps {
            if control.is_cancelled() {
                return Err(ProvisionError::cancelled(&env.instance, target.step()));
            }
            self.step(env, target, control)
                .map_err(|e| ProvisionError::new(&env.instance, target.step(), e))?;
            env.transition(target).map_err(|e| ProvisionError {
                instance: env.instance.clone(),
                step: target.step(),
                detail: e.to_string(),
                kind: ProvisionErrorKind::Failed,
                teardown: None,
            })?;
        }
        Ok(())
    }

    fn step(&self, env: &mut IsolatedEnvironment, target: EnvState, control: &RunControl) -> RuntimeResult<()> {
        match target {
            EnvState::SourceBound => {
                let device = DiskDevice {
                    name: SOURCE_DEVICE.to_string(),
                    source: env.build_root.clone(),
                    path: env.build_root.clone(),
                    readonly: true,
                };
                self.runtime.add_disk(&env.instance, &device, control)
            }
            EnvState::OverlayMounted => {
                let backing = self.usable_scratch(&env.instance, control)?;
                let layout = OverlayLayout::new(backing, &env.instance, &env.build_root);
                self.exec_checked(&env.instance, "create overlay dirs", layout.mkdir_argv(), control)?;
                self.exec_checked(&env.instance, "mount overlay", layout.mount_argv(), control)?;
                self.exec_checked(&env.instance, "bind merge view", layout.bind_argv(), control)?;
                env.overlay = Some(layout);
                Ok(())
            }
            EnvState::IdentityConfigured => {
                let identity = env.identity.clone();
                if !self.getent(&env.instance, "group", identity.gid, control)? {
                    self.exec_checked(&env.instance, "groupadd", identity.groupadd_argv(), control)?;
                }
                if !self.getent(&env.instance, "passwd", identity.uid, control)? {
                    self.exec_checked(&env.instance, "useradd", identity.useradd_argv(), control)?;
                } else {
                    debug!(instance = %env.instance, uid = identity.uid, "user already present in image");
                }
                Ok(())
            }
            EnvState::Running | EnvState::Created | EnvState::Released => Ok(()),
        }
    }

    /// Memory scratch if the instance has a writable `/dev/shm`, else disk
    fn usable_scratch(&self, instance: &str, control: &RunControl) -> RuntimeResult<ScratchBacking> {
        if self.scratch == ScratchBacking::Disk {
            return Ok(ScratchBacking::Disk);
        }
        let probe = self
            .runtime
            .exec(instance, &ExecSpec::new(overlay::memory_probe_argv()), control)?;
        if probe.success() {
            Ok(ScratchBacking::Memory)
        } else {
            warn!(instance, "no writable {} in instance, overlay falls back to disk", overlay::MEMORY_SCRATCH);
            Ok(ScratchBacking::Disk)
        }
    }

    /// True if `id` already has an entry in `database` inside the instance
    fn getent(&self, instance: &str, database: &str, id: u32, control: &RunControl) -> RuntimeResult<bool> {
        let spec = ExecSpec::new(["getent".to_string(), database.to_string(), id.to_string()]);
        Ok(self.runtime.exec(instance, &spec, control)?.success())
    }

    fn exec_checked(
        &self,
        instance: &str,
        op: &'static str,
        argv: Vec<String>,
        control: &RunControl,
    ) -> RuntimeResult<ProcessOutput> {
        let output = self.runtime.exec(instance, &ExecSpec::new(argv), control)?;
        RuntimeError::check(op, output)
    }

    /// Stop the instance. Idempotent: a released environment is not stopped twice.
    pub fn release(&self, env: &mut IsolatedEnvironment) -> Result<(), TeardownError> {
        if env.state.is_terminal() {
            return Ok(());
        }
        let result = self.stop_instance(&env.instance);
        env.state = EnvState::Released;
        result
    }

    /// Stop `instance` on the detached teardown deadline; an instance the
    /// runtime does not know is already gone
    fn stop_instance(&self, instance: &str) -> Result<(), TeardownError> {
        match self.runtime.stop(instance, &self.deadlines.teardown()) {
            Ok(()) => {
                info!(instance, "instance stopped");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(instance, "instance already gone");
                Ok(())
            }
            Err(e) => {
                warn!(instance, error = %e, "instance may have leaked");
                Err(TeardownError {
                    instance: instance.to_string(),
                    detail: e.to_string(),
                })
            }
        }
    }

    /// Drain stop failures recorded when a guard released on drop
    pub fn take_unreported(&self) -> Vec<UnreportedTeardown> {
        let mut unreported = self.unreported.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *unreported)
    }

    fn record_unreported(&self, env: &IsolatedEnvironment, error: TeardownError) {
        self.unreported
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(UnreportedTeardown {
                charm: env.charm.clone(),
                base: env.base.clone(),
                error,
            });
    }

    /// Stop every running instance this tool created
    pub fn reap_leaked(&self) -> RuntimeResult<Vec<ReapedInstance>> {
        let names = self
            .runtime
            .list_instances(INSTANCE_PREFIX, &self.deadlines.teardown())?;

        Ok(names
            .into_iter()
            .filter(|name| is_managed(name))
            .map(|name| {
                let result = self.stop_instance(&name);
                ReapedInstance { name, result }
            })
            .collect())
    }
}

/// Scoped ownership of an acquired environment; releases on drop
pub struct EnvironmentGuard<'a> {
    provider: &'a IsolationProvider,
    env: IsolatedEnvironment,
}

impl<'a> EnvironmentGuard<'a> {
    pub fn env(&self) -> &IsolatedEnvironment {
        &self.env
    }

    pub fn exec(&self, spec: &ExecSpec, control: &RunControl) -> RuntimeResult<ProcessOutput> {
        self.provider.runtime.exec(&self.env.instance, spec, control)
    }

    pub fn list_dir(&self, dir: &Path, control: &RunControl) -> RuntimeResult<Vec<String>> {
        self.provider.runtime.list_dir(&self.env.instance, dir, control)
    }

    pub fn pull_file(&self, src: &Path, dest: &Path, control: &RunControl) -> RuntimeResult<()> {
        self.provider.runtime.pull_file(&self.env.instance, src, dest, control)
    }

    /// Copy-back deadline: the provisioning bound, detached from cancellation
    pub fn copy_control(&self) -> RunControl {
        self.provider.deadlines.teardown()
    }

    pub fn release(mut self) -> Result<(), TeardownError> {
        self.provider.release(&mut self.env)
    }
}

impl Drop for EnvironmentGuard<'_> {
    fn drop(&mut self) {
        if !self.env.state.is_terminal() {
            if let Err(error) = self.provider.release(&mut self.env) {
                self.provider.record_unreported(&self.env, error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FailureConfig, MockRuntime, RuntimeOp};
    use crate::timeout::TimeoutConfig;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn provider(runtime: Arc<MockRuntime>) -> IsolationProvider {
        IsolationProvider::new(
            runtime,
            Deadlines::detached(TimeoutConfig::default()),
            ScratchBacking::Memory,
            "01test",
        )
    }

    fn identity() -> IdentityMapping {
        IdentityMapping::new(1000, 1000, "builder", "builder")
    }

    fn centos() -> Base {
        Base::new("centos", "7")
    }

    #[test]
    fn test_acquire_reaches_running() {
        let src = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let provider = provider(Arc::clone(&runtime));

        let guard = provider
            .acquire("slurmd", &centos(), "images:centos/7", src.path(), &identity())
            .unwrap();

        let env = guard.env();
        assert_eq!(env.state(), EnvState::Running);
        assert!(env.instance().starts_with("charms-builder-slurmd-centos-7-"));
        assert!(env.destructive_mode().is_some());
        assert_eq!(env.overlay().unwrap().backing, ScratchBacking::Memory);

        let launch = &runtime.launch_specs()[0];
        assert!(launch.ephemeral);
        assert!(launch.config.contains(&(RUN_ID_KEY.to_string(), "01test".to_string())));
        assert!(launch.config.iter().any(|(k, v)| k == "raw.idmap" && v == "uid 1000 1000\ngid 1000 1000"));

        let disks = runtime.disks(env.instance());
        assert_eq!(disks.len(), 1);
        assert!(disks[0].readonly);
        assert_eq!(disks[0].source, src.path());

        guard.release().unwrap();
        assert_eq!(runtime.stop_count(), 1);
    }

    #[test]
    fn test_drop_releases_once() {
        let src = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let provider = provider(Arc::clone(&runtime));

        {
            let _guard = provider
                .acquire("slurmd", &centos(), "images:centos/7", src.path(), &identity())
                .unwrap();
        }
        assert_eq!(runtime.stop_count(), 1);
        assert!(runtime.running_instances().is_empty());
    }

    #[test]
    fn test_drop_keeps_stop_failure_for_the_report() {
        let src = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let provider = provider(Arc::clone(&runtime));

        let instance = {
            let guard = provider
                .acquire("slurmd", &centos(), "images:centos/7", src.path(), &identity())
                .unwrap();
            runtime.inject(RuntimeOp::Stop, FailureConfig::error("instance busy"));
            let name = guard.env().instance().to_string();
            name
        };

        let unreported = provider.take_unreported();
        assert_eq!(unreported.len(), 1);
        assert_eq!(unreported[0].charm, "slurmd");
        assert_eq!(unreported[0].base, "centos-7");
        assert_eq!(unreported[0].error.instance, instance);
        assert!(unreported[0].error.detail.contains("instance busy"));
        assert!(provider.take_unreported().is_empty());
    }

    #[test]
    fn test_explicit_release_failure_not_recorded_again() {
        let src = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let provider = provider(Arc::clone(&runtime));

        let guard = provider
            .acquire("slurmd", &centos(), "images:centos/7", src.path(), &identity())
            .unwrap();
        runtime.inject(RuntimeOp::Stop, FailureConfig::error("instance busy"));

        assert!(guard.release().is_err());
        assert!(provider.take_unreported().is_empty());
        assert_eq!(runtime.stop_count(), 1);
    }

    #[test]
    fn test_explicit_release_not_repeated_on_drop() {
        let src = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let provider = provider(Arc::clone(&runtime));

        let guard = provider
            .acquire("slurmd", &centos(), "images:centos/7", src.path(), &identity())
            .unwrap();
        guard.release().unwrap();

        assert_eq!(runtime.stop_count(), 1);
    }

    #[test]
    fn test_launch_failure_nothing_to_stop() {
        let src = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        runtime.inject(RuntimeOp::Launch, FailureConfig::error("image not found"));
        let provider = provider(Arc::clone(&runtime));

        let err = provider
            .acquire("slurmd", &centos(), "images:nope/7", src.path(), &identity())
            .err()
            .unwrap();

        assert_eq!(err.step, "launch");
        assert_eq!(err.kind, ProvisionErrorKind::Failed);
        assert!(err.teardown.is_none());
        assert_eq!(runtime.launch_count(), 0);
        assert!(runtime.running_instances().is_empty());
    }

    fn launch_gives_up(config: FailureConfig, kind: ProvisionErrorKind) {
        let src = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        runtime.inject(RuntimeOp::Launch, config.after_effect());
        let provider = provider(Arc::clone(&runtime));

        let err = provider
            .acquire("slurmd", &centos(), "images:centos/7", src.path(), &identity())
            .err()
            .unwrap();

        assert_eq!(err.kind, kind);
        assert!(err.teardown.is_none());
        assert_eq!(runtime.launch_count(), 1);
        assert_eq!(runtime.stops_of(&err.instance), 1);
        assert!(runtime.running_instances().is_empty());
    }

    #[test]
    fn test_launch_timeout_stops_created_instance() {
        launch_gives_up(FailureConfig::timeout(), ProvisionErrorKind::Timeout);
    }

    #[test]
    fn test_launch_cancelled_stops_created_instance() {
        launch_gives_up(FailureConfig::cancelled(), ProvisionErrorKind::Cancelled);
    }

    #[test]
    fn test_launch_timeout_with_failed_stop_reports_teardown() {
        let src = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        runtime.inject(RuntimeOp::Launch, FailureConfig::timeout().after_effect());
        runtime.inject(RuntimeOp::Stop, FailureConfig::error("instance busy"));
        let provider = provider(Arc::clone(&runtime));

        let err = provider
            .acquire("slurmd", &centos(), "images:centos/7", src.path(), &identity())
            .err()
            .unwrap();

        let teardown = err.teardown.unwrap();
        assert_eq!(teardown.instance, err.instance);
        assert!(teardown.detail.contains("instance busy"));
    }

    #[test]
    fn test_mount_failure_stops_instance() {
        let src = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        runtime.inject(RuntimeOp::command("mount"), FailureConfig::exit(32, "mount: permission denied"));
        let provider = provider(Arc::clone(&runtime));

        let err = provider
            .acquire("slurmd", &centos(), "images:centos/7", src.path(), &identity())
            .err()
            .unwrap();

        assert_eq!(err.step, "mount overlay");
        assert!(err.detail.contains("permission denied"));
        assert!(err.teardown.is_none());
        assert_eq!(runtime.launch_count(), 1);
        assert_eq!(runtime.stop_count(), 1);
    }

    #[test]
    fn test_teardown_failure_reported_with_provision_error() {
        let src = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        runtime.inject(RuntimeOp::AddDisk, FailureConfig::error("no such path"));
        runtime.inject(RuntimeOp::Stop, FailureConfig::error("instance busy"));
        let provider = provider(Arc::clone(&runtime));

        let err = provider
            .acquire("slurmd", &centos(), "images:centos/7", src.path(), &identity())
            .err()
            .unwrap();

        assert_eq!(err.step, "bind source");
        assert!(err.teardown.unwrap().detail.contains("instance busy"));
    }

    #[test]
    fn test_memory_scratch_falls_back_to_disk() {
        let src = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        runtime.inject(RuntimeOp::command("test"), FailureConfig::exit(1, ""));
        let provider = provider(Arc::clone(&runtime));

        let guard = provider
            .acquire("slurmd", &centos(), "images:centos/7", src.path(), &identity())
            .unwrap();
        let overlay = guard.env().overlay().unwrap();
        assert_eq!(overlay.backing, ScratchBacking::Disk);
        assert!(overlay.upper.starts_with("/var/tmp"));
    }

    #[test]
    fn test_existing_identity_not_recreated() {
        let src = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new().with_existing_identity());
        let provider = provider(Arc::clone(&runtime));

        let _guard = provider
            .acquire("slurmd", &centos(), "images:centos/7", src.path(), &identity())
            .unwrap();

        assert_eq!(runtime.exec_count("useradd"), 0);
        assert_eq!(runtime.exec_count("groupadd"), 0);
    }

    #[test]
    fn test_identity_created_when_missing() {
        let src = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let provider = provider(Arc::clone(&runtime));

        let _guard = provider
            .acquire("slurmd", &centos(), "images:centos/7", src.path(), &identity())
            .unwrap();

        assert_eq!(runtime.exec_count("groupadd"), 1);
        assert_eq!(runtime.exec_count("useradd"), 1);
    }

    #[test]
    fn test_cancelled_before_launch() {
        let src = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let cancel = Arc::new(AtomicBool::new(false));
        let deadlines = Deadlines::new(
            TimeoutConfig::default(),
            Arc::clone(&cancel),
            Arc::new(AtomicBool::new(false)),
        );
        let provider = IsolationProvider::new(runtime.clone(), deadlines, ScratchBacking::Memory, "run");
        cancel.store(true, Ordering::SeqCst);

        let err = provider
            .acquire("slurmd", &centos(), "images:centos/7", src.path(), &identity())
            .err()
            .unwrap();
        assert_eq!(err.kind, ProvisionErrorKind::Cancelled);
        assert_eq!(runtime.launch_count(), 0);
    }

    #[test]
    fn test_release_runs_under_cancellation() {
        let src = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let cancel = Arc::new(AtomicBool::new(false));
        let abort = Arc::new(AtomicBool::new(false));
        let deadlines = Deadlines::new(TimeoutConfig::default(), Arc::clone(&cancel), Arc::clone(&abort));
        let provider = IsolationProvider::new(runtime.clone(), deadlines, ScratchBacking::Memory, "run");

        let guard = provider
            .acquire("slurmd", &centos(), "images:centos/7", src.path(), &identity())
            .unwrap();
        cancel.store(true, Ordering::SeqCst);
        abort.store(true, Ordering::SeqCst);

        guard.release().unwrap();
        assert_eq!(runtime.stop_count(), 1);
    }

    #[test]
    fn test_concurrent_names_unique() {
        let src = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let provider = provider(Arc::clone(&runtime));

        let guards: Vec<_> = (0..20)
            .map(|_| {
                provider
                    .acquire("slurmd", &centos(), "images:centos/7", src.path(), &identity())
                    .unwrap()
            })
            .collect();

        let mut names: Vec<&str> = guards.iter().map(|g| g.env().instance()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 20);
    }

    #[test]
    fn test_reap_leaked() {
        let src = TempDir::new().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        runtime.inject(RuntimeOp::Stop, FailureConfig::error("busy").with_fail_count(1));
        let provider = provider(Arc::clone(&runtime));

        let guard = provider
            .acquire("slurmd", &centos(), "images:centos/7", src.path(), &identity())
            .unwrap();
        let leaked = guard.env().instance().to_string();
        assert!(guard.release().is_err());
        assert_eq!(runtime.running_instances(), vec![leaked.clone()]);

        let reaped = provider.reap_leaked().unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].name, leaked);
        assert!(reaped[0].result.is_ok());
        assert!(runtime.running_instances().is_empty());
    }
}
