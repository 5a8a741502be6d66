//! LXD (`lxc` CLI) implementation of [`IsolationRuntime`]

use std::path::Path;
use std::sync::Arc;

use charms_process::{CommandSpec, ProcessOutput, RunControl, Runner};

use super::runtime::{DiskDevice, ExecSpec, IsolationRuntime, LaunchSpec, RuntimeError, RuntimeResult};

pub struct LxcRuntime {
    runner: Arc<dyn Runner>,
    program: String,
}

impl LxcRuntime {
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Self {
            runner,
            program: "lxc".to_string(),
        }
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.program)
    }

    fn run(&self, op: &'static str, spec: CommandSpec, control: &RunControl) -> RuntimeResult<ProcessOutput> {
        let output = self.runner.run(&spec, control)?;
        RuntimeError::check(op, output)
    }

    pub fn launch_command(&self, spec: &LaunchSpec) -> CommandSpec {
        let mut cmd = self.command().args(["launch", spec.image.as_str(), spec.name.as_str()]);
        if spec.ephemeral {
            cmd = cmd.arg("-e");
        }
        for (key, value) in &spec.config {
            cmd = cmd.arg("-c").arg(format!("{}={}", key, value));
        }
        cmd
    }

    pub fn exec_command(&self, instance: &str, spec: &ExecSpec) -> CommandSpec {
        let mut cmd = self.command().args(["exec", instance]);
        if let Some(uid) = spec.user {
            cmd = cmd.arg("--user").arg(uid.to_string());
        }
        if let Some(gid) = spec.group {
            cmd = cmd.arg("--group").arg(gid.to_string());
        }
        if let Some(ref cwd) = spec.cwd {
            cmd = cmd.arg("--cwd").arg(cwd.display().to_string());
        }
        for (key, value) in &spec.env {
            cmd = cmd.arg("--env").arg(format!("{}={}", key, value));
        }
        cmd.arg("--").args(spec.argv.iter().cloned())
    }
}

impl IsolationRuntime for LxcRuntime {
    fn launch(&self, spec: &LaunchSpec, control: &RunControl) -> RuntimeResult<()> {
        self.run("launch", self.launch_command(spec), control).map(|_| ())
    }

    fn add_disk(&self, instance: &str, device: &DiskDevice, control: &RunControl) -> RuntimeResult<()> {
        let mut cmd = self
            .command()
            .args(["config", "device", "add", instance, device.name.as_str(), "disk"])
            .arg(format!("source={}", device.source.display()))
            .arg(format!("path={}", device.path.display()));
        if device.readonly {
            cmd = cmd.arg("readonly=true");
        }
        self.run("add disk device", cmd, control).map(|_| ())
    }

    fn exec(&self, instance: &str, spec: &ExecSpec, control: &RunControl) -> RuntimeResult<ProcessOutput> {
        let output = self.runner.run(&self.exec_command(instance, spec), control)?;
        if output.timed_out() {
            return Err(RuntimeError::Timeout {
                op: "exec",
                after: output.duration,
            });
        }
        if output.cancelled() {
            return Err(RuntimeError::Cancelled { op: "exec" });
        }
        Ok(output)
    }

    fn list_dir(&self, instance: &str, dir: &Path, control: &RunControl) -> RuntimeResult<Vec<String>> {
        let spec = ExecSpec::new(["ls", "-1", "-A"]).current_dir(dir);
        let output = self.exec(instance, &spec, control)?;
        let output = RuntimeError::check("list directory", output)?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn pull_file(&self, instance: &str, src: &Path, dest: &Path, control: &RunControl) -> RuntimeResult<()> {
        let cmd = self
            .command()
            .args(["file", "pull"])
            .arg(format!("{}{}", instance, src.display()))
            .arg(dest.display().to_string());
        self.run("pull file", cmd, control).map(|_| ())
    }

    fn stop(&self, instance: &str, control: &RunControl) -> RuntimeResult<()> {
        match self.run("stop", self.command().args(["stop", instance, "-f"]), control) {
            Ok(_) => Ok(()),
            Err(RuntimeError::Failed { op, detail }) if detail.to_lowercase().contains("not found") => {
                Err(RuntimeError::NotFound {
                    op,
                    instance: instance.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn list_instances(&self, prefix: &str, control: &RunControl) -> RuntimeResult<Vec<String>> {
        let output = self.run(
            "list instances",
            self.command().args(["list", "--format", "csv", "--columns", "n"]),
            control,
        )?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(prefix))
            .map(str::to_string)
            .collect())
    }
}
