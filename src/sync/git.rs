//! `git` command-line implementation of [`Vcs`]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use charms_process::{CommandSpec, ProcessOutput, RunControl, Runner};
use tracing::debug;

use super::{SyncError, SyncResult, Vcs};
use crate::charm::Charm;

/// Runs the `git` binary through a [`Runner`]
pub struct GitCli {
    runner: Arc<dyn Runner>,
    program: String,
}

impl GitCli {
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Self {
            runner,
            program: "git".to_string(),
        }
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.program).env("GIT_TERMINAL_PROMPT", "0")
    }

    fn in_repo(&self, dest: &Path) -> CommandSpec {
        self.command().current_dir(dest)
    }

    fn run(&self, charm: &Charm, spec: CommandSpec, control: &RunControl) -> SyncResult<ProcessOutput> {
        let output = self
            .runner
            .run(&spec, control)
            .map_err(|e| SyncError::Unreachable {
                charm: charm.name.clone(),
                detail: e.to_string(),
            })?;

        if output.timed_out() {
            return Err(SyncError::Timeout {
                charm: charm.name.clone(),
                after: output.duration,
            });
        }
        if output.cancelled() {
            return Err(SyncError::Cancelled {
                charm: charm.name.clone(),
            });
        }
        Ok(output)
    }

    /// Run and require exit 0, mapping failures through `classify`
    fn run_ok(&self, charm: &Charm, spec: CommandSpec, control: &RunControl) -> SyncResult<ProcessOutput> {
        let output = self.run(charm, spec, control)?;
        if output.success() {
            Ok(output)
        } else {
            Err(classify(charm, &output))
        }
    }

    fn head(&self, charm: &Charm, dest: &Path, control: &RunControl) -> SyncResult<String> {
        let output = self.run_ok(charm, self.in_repo(dest).args(["rev-parse", "HEAD"]), control)?;
        Ok(output.stdout.trim().to_string())
    }

    /// True if `refs/<kind>/<name>` exists locally
    fn has_ref(&self, charm: &Charm, dest: &Path, full_ref: &str, control: &RunControl) -> SyncResult<bool> {
        let output = self.run(
            charm,
            self.in_repo(dest).args(["rev-parse", "--verify", "--quiet", full_ref]),
            control,
        )?;
        Ok(output.success())
    }
}

/// Map git's stderr to the sync error taxonomy
fn classify(charm: &Charm, output: &ProcessOutput) -> SyncError {
    let stderr = output.stderr.trim();
    let detail = if stderr.is_empty() {
        output.describe()
    } else {
        stderr.lines().last().unwrap_or(stderr).to_string()
    };

    let lower = stderr.to_lowercase();
    if (lower.contains("remote branch") && lower.contains("not found"))
        || lower.contains("could not find remote branch")
        || lower.contains("did not match any")
    {
        SyncError::RefNotFound {
            charm: charm.name.clone(),
            reference: charm.reference.clone().unwrap_or_default(),
        }
    } else if lower.contains("would be overwritten")
        || lower.contains("not possible to fast-forward")
        || lower.contains("diverging branches")
        || lower.contains("not a git repository")
    {
        SyncError::Unreconcilable {
            charm: charm.name.clone(),
            detail,
        }
    } else {
        SyncError::Unreachable {
            charm: charm.name.clone(),
            detail,
        }
    }
}

impl Vcs for GitCli {
    fn clone_repo(&self, charm: &Charm, dest: &Path, control: &RunControl) -> SyncResult<String> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|source| SyncError::Io {
                charm: charm.name.clone(),
                source,
            })?;
        }

        let mut spec = self.command().arg("clone");
        if let Some(ref reference) = charm.reference {
            spec = spec.args(["-b", reference.as_str()]);
        }
        spec = spec.arg("--").arg(&charm.repo).arg(dest.to_string_lossy());

        if let Err(e) = self.run_ok(charm, spec, control) {
            // git removes its own partial clone; a kill mid-transfer may not
            if dest.exists() {
                let _ = fs::remove_dir_all(dest);
            }
            return Err(e);
        }
        self.head(charm, dest, control)
    }

    fn update(&self, charm: &Charm, dest: &Path, control: &RunControl) -> SyncResult<(String, String)> {
        let before = self.head(charm, dest, control)?;

        let status = self.run_ok(
            charm,
            self.in_repo(dest)
                .args(["status", "--porcelain", "--untracked-files=no"]),
            control,
        )?;
        if !status.stdout.trim().is_empty() {
            return Err(SyncError::Unreconcilable {
                charm: charm.name.clone(),
                detail: "uncommitted local modifications".to_string(),
            });
        }

        self.run_ok(
            charm,
            self.in_repo(dest).args(["fetch", "--prune", "--tags", "origin"]),
            control,
        )?;

        match charm.reference {
            None => {
                self.run_ok(charm, self.in_repo(dest).args(["pull", "--ff-only"]), control)?;
            }
            Some(ref reference) => {
                let remote_branch = format!("refs/remotes/origin/{}", reference);
                let tag = format!("refs/tags/{}", reference);

                if self.has_ref(charm, dest, &remote_branch, control)? {
                    debug!(charm = %charm.name, reference, "updating branch");
                    self.run_ok(charm, self.in_repo(dest).args(["checkout", reference.as_str()]), control)?;
                    self.run_ok(
                        charm,
                        self.in_repo(dest)
                            .args(["merge", "--ff-only"])
                            .arg(format!("origin/{}", reference)),
                        control,
                    )?;
                } else if self.has_ref(charm, dest, &tag, control)? {
                    debug!(charm = %charm.name, reference, "checking out tag");
                    self.run_ok(
                        charm,
                        self.in_repo(dest).args(["checkout", "--detach"]).arg(&tag),
                        control,
                    )?;
                } else {
                    return Err(SyncError::RefNotFound {
                        charm: charm.name.clone(),
                        reference: reference.clone(),
                    });
                }
            }
        }

        let after = self.head(charm, dest, control)?;
        Ok((before, after))
    }
}
