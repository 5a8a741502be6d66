//! Manual provisioning: read-only source, guaranteed release, independent
//! overlays for concurrent tasks of one charm.

mod fixtures;

use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use charms_builder::isolation::{EnvState, IdentityMapping, IsolationProvider};
use charms_builder::mock::{FailureConfig, MockBuild, MockRuntime, RuntimeOp};
use charms_builder::scheduler::Selection;
use charms_builder::timeout::{Deadlines, TimeoutConfig};
use charms_builder::{Base, BuildExecutor, BuildTask, Charm, FailureKind, NameFilter, Provisioning, Status};
use fixtures::{manual_pack, tree_digest, Harness};
use tempfile::TempDir;

#[test]
fn test_source_is_byte_identical_after_manual_builds() {
    let h = Harness::new(MockRuntime::new().with_packager(manual_pack))
        .charm("slurmd")
        .base("centos", "7", Some("images:centos/7"));
    h.run(&Selection::all());
    let before = tree_digest(&h.working_copy("slurmd"));

    let ok = h.run(&Selection::all());
    assert_eq!(ok.succeeded, 1, "{}", ok.render());
    assert_eq!(tree_digest(&h.working_copy("slurmd")), before);

    h.runtime
        .inject(RuntimeOp::command("charmcraft"), FailureConfig::exit(1, "missing dependency"));
    let failed = h.run(&Selection::all());
    assert_eq!(failed.failed, 1);
    assert_eq!(tree_digest(&h.working_copy("slurmd")), before);
}

#[test]
fn test_build_runs_in_source_path_of_ephemeral_instance() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&calls);
    let runtime = MockRuntime::new().with_packager(move |call| {
        seen.lock().unwrap().push((
            call.instance.to_string(),
            call.source.map(|p| p.to_path_buf()),
            call.spec.user,
        ));
        manual_pack(call)
    });
    let h = Harness::new(runtime)
        .charm("slurmd")
        .base("centos", "7", Some("images:centos/7"));

    let report = h.run(&Selection::all());
    assert_eq!(report.succeeded, 1, "{}", report.render());

    let (instance, source, user) = calls.lock().unwrap()[0].clone();
    assert!(instance.starts_with("charms-builder-slurmd-centos-7-"));
    assert_eq!(source, Some(h.working_copy("slurmd")));
    assert_eq!(user, Some(1000));
    assert!(h.runtime.running_instances().is_empty());

    let launches = h.runtime.launch_specs();
    assert!(launches[0].ephemeral);
    assert!(launches[0]
        .config
        .iter()
        .any(|(k, v)| k == "raw.idmap" && v.contains("uid 1000 1000")));
}

struct Executor {
    _dir: TempDir,
    runtime: Arc<MockRuntime>,
    executor: BuildExecutor,
    task: BuildTask,
}

fn executor(runtime: MockRuntime) -> Executor {
    let dir = TempDir::new().unwrap();
    let repo = dir.path().join("repos/slurmd");
    fs::create_dir_all(&repo).unwrap();
    fs::write(repo.join("charmcraft.yaml"), "type: charm\n").unwrap();

    let runtime = Arc::new(runtime);
    let provider = IsolationProvider::new(
        runtime.clone(),
        Deadlines::detached(TimeoutConfig::default()),
        Default::default(),
        "run",
    );
    let executor = BuildExecutor::new(
        Arc::new(charms_builder::mock::MockRunner::new()),
        provider,
        IdentityMapping::new(1000, 1000, "builder", "builder"),
        dir.path().join("charms"),
    );
    let task = BuildTask {
        charm: Charm::new("slurmd", "https://example.com/slurmd.git"),
        base: Base::new("centos", "7"),
        provisioning: Provisioning::Manual {
            image: "images:centos/7".to_string(),
        },
        working_copy: repo,
        revision: None,
    };
    Executor {
        _dir: dir,
        runtime,
        executor,
        task,
    }
}

#[test]
fn test_release_exactly_once_across_injected_failures() {
    let fx = executor(MockRuntime::new().with_packager(manual_pack));
    let injections = [
        (RuntimeOp::Launch, FailureConfig::error("image not found")),
        (RuntimeOp::Launch, FailureConfig::timeout().after_effect()),
        (RuntimeOp::Launch, FailureConfig::cancelled().after_effect()),
        (RuntimeOp::AddDisk, FailureConfig::error("disk device exists")),
        (RuntimeOp::command("mount"), FailureConfig::exit(32, "mount: permission denied")),
        (RuntimeOp::command("useradd"), FailureConfig::exit(9, "useradd: uid in use")),
        (RuntimeOp::command("charmcraft"), FailureConfig::exit(1, "lint failed")),
        (RuntimeOp::command("charmcraft"), FailureConfig::timeout()),
        (RuntimeOp::ListDir, FailureConfig::error("not a directory")),
        (RuntimeOp::PullFile, FailureConfig::error("no space left on device")),
        (RuntimeOp::Stop, FailureConfig::error("instance busy")),
    ];

    for i in 0..100 {
        let (op, config) = injections[i % injections.len()].clone();
        fx.runtime.clear_failures();
        fx.runtime.inject(op.clone(), config);

        let result = fx.executor.run(&fx.task);
        assert!(!result.succeeded() || op == RuntimeOp::Stop, "run {} with {:?}", i, op);
    }

    let launches = fx.runtime.launch_specs();
    let names: HashSet<String> = launches.iter().map(|l| l.name.clone()).collect();
    assert_eq!(names.len(), launches.len(), "instance names must be unique");
    assert!(!launches.is_empty());
    for name in &names {
        assert_eq!(fx.runtime.stops_of(name), 1, "{} stopped more or less than once", name);
    }
    let leaked: Vec<String> = fx
        .runtime
        .running_instances()
        .into_iter()
        .filter(|n| fx.runtime.stops_of(n) == 0)
        .collect();
    assert!(leaked.is_empty(), "never stopped: {:?}", leaked);
}

#[test]
fn test_fresh_artifact_replaces_stale_copy_in_working_copy() {
    let fx = executor(MockRuntime::new().with_packager(manual_pack));
    let stale = fx.task.working_copy.join("slurmd_centos-7-amd64.charm");
    fs::write(&stale, b"stale").unwrap();

    let result = fx.executor.run(&fx.task);

    assert!(result.succeeded(), "{:?}", result.outcome);
    assert_eq!(result.artifacts.len(), 1);
    let instance = fx.runtime.launch_specs()[0].name.clone();
    assert_eq!(fs::read_to_string(&result.artifacts[0]).unwrap(), instance);
    assert_eq!(fs::read(&stale).unwrap(), b"stale");
}

#[test]
fn test_timeout_is_reported_and_released() {
    let fx = executor(MockRuntime::new().with_packager(|_| MockBuild::timed_out()));

    let result = fx.executor.run(&fx.task);

    let report = result.to_report();
    assert_eq!(report.failure_kind, Some(FailureKind::Timeout));
    assert_eq!(report.status, Status::Failed);
    assert_eq!(fx.runtime.stop_count(), 1);
    assert!(fx.runtime.running_instances().is_empty());
}

#[test]
fn test_stop_failure_is_a_warning_not_a_failure() {
    let fx = executor(MockRuntime::new().with_packager(manual_pack));
    fx.runtime.inject(RuntimeOp::Stop, FailureConfig::error("instance busy"));

    let result = fx.executor.run(&fx.task);

    assert!(result.succeeded(), "{:?}", result.outcome);
    assert!(result.teardown.is_some());
    let report = result.to_report();
    assert_eq!(report.status, Status::Success);
    assert!(report.teardown_warning.unwrap().contains("instance busy"));
}

#[test]
fn test_same_charm_different_bases_run_concurrently() {
    let layers = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&layers);
    let runtime = MockRuntime::new().with_packager(move |call| {
        thread::sleep(Duration::from_millis(50));
        seen.lock().unwrap().push(call.instance.to_string());
        manual_pack(call)
    });
    let h = Harness::new(runtime)
        .charm("slurmd")
        .base("centos", "7", Some("images:centos/7"))
        .base("rockylinux", "9", Some("images:rockylinux/9"));

    let report = h.run(&Selection::charms(NameFilter::new(["slurmd"]).unwrap()));

    assert_eq!(report.succeeded, 2, "{}", report.render());
    assert_eq!(h.runtime.max_concurrent_builds(), 2);

    let instances = layers.lock().unwrap().clone();
    assert_eq!(instances.len(), 2);
    assert_ne!(instances[0], instances[1]);

    let centos = h.output_dir("slurmd", "centos-7").join("slurmd_centos-7-amd64.charm");
    let rocky = h
        .output_dir("slurmd", "rockylinux-9")
        .join("slurmd_rockylinux-9-amd64.charm");
    assert!(instances.contains(&fs::read_to_string(&centos).unwrap()));
    assert!(instances.contains(&fs::read_to_string(&rocky).unwrap()));
    assert_ne!(fs::read(&centos).unwrap(), fs::read(&rocky).unwrap());
    assert!(!h.output_dir("slurmd", "centos-7").join("slurmd_rockylinux-9-amd64.charm").exists());
}

#[test]
fn test_environment_states_are_ordered() {
    let states = [
        EnvState::Created,
        EnvState::SourceBound,
        EnvState::OverlayMounted,
        EnvState::IdentityConfigured,
        EnvState::Running,
        EnvState::Released,
    ];
    for pair in states.windows(2) {
        assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
    }
    assert!(!EnvState::Created.can_transition_to(EnvState::Running));
}
