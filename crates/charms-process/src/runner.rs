use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::command::CommandSpec;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default grace period between SIGTERM and SIGKILL
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// Errors from running a subprocess.
///
/// A non-zero exit is NOT an error; it is reported through [`ProcessOutput`].
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type ProcessResult<T> = Result<T, ProcessError>;

/// How the process came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own
    Exited,
    /// Killed because the deadline passed
    TimedOut,
    /// Killed because cancellation was requested
    Cancelled,
}

/// Captured result of a finished process
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub termination: Termination,
}

impl ProcessOutput {
    /// Output of a process that exited with `code`
    pub fn exited(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            signal: None,
            stdout: stdout.into(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
            termination: Termination::Exited,
        }
    }

    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.code == Some(0)
    }

    pub fn timed_out(&self) -> bool {
        self.termination == Termination::TimedOut
    }

    pub fn cancelled(&self) -> bool {
        self.termination == Termination::Cancelled
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }

    /// Short description of the exit for diagnostics
    pub fn describe(&self) -> String {
        match self.termination {
            Termination::TimedOut => format!("timed out after {:.1}s", self.duration.as_secs_f64()),
            Termination::Cancelled => "cancelled".to_string(),
            Termination::Exited => match (self.code, self.signal) {
                (Some(code), _) => format!("exit code {}", code),
                (None, Some(sig)) => format!("killed by signal {}", sig),
                (None, None) => "unknown exit status".to_string(),
            },
        }
    }
}

/// Limits and cancellation hooks for one invocation.
#[derive(Debug, Clone)]
pub struct RunControl {
    /// Maximum wall-clock time
    pub timeout: Option<Duration>,
    /// Set when a graceful stop is requested
    pub cancel: Option<Arc<AtomicBool>>,
    /// Set when termination must skip the grace period
    pub abort: Option<Arc<AtomicBool>>,
    /// Time between SIGTERM and SIGKILL
    pub grace: Duration,
}

impl Default for RunControl {
    fn default() -> Self {
        Self {
            timeout: None,
            cancel: None,
            abort: None,
            grace: DEFAULT_GRACE,
        }
    }
}

impl RunControl {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = Some(flag);
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Same cancellation hooks, different deadline
    pub fn derive(&self, timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn is_aborted(&self) -> bool {
        self.abort
            .as_ref()
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

/// Runs commands to completion.
pub trait Runner: Send + Sync {
    fn run(&self, spec: &CommandSpec, control: &RunControl) -> ProcessResult<ProcessOutput>;
}

/// Runs commands as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }

    fn spawn(spec: &CommandSpec) -> ProcessResult<Child> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref cwd) = spec.cwd {
            command.current_dir(cwd);
        }

        // Own process group so termination reaches grandchildren holding our pipes
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        command.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })
    }

    fn capture<R: Read + Send + 'static>(stream: Option<R>) -> JoinHandle<String> {
        thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut stream) = stream {
                let _ = stream.read_to_end(&mut buf);
            }
            String::from_utf8_lossy(&buf).into_owned()
        })
    }

    /// SIGTERM the group, wait out the grace period, then SIGKILL.
    fn terminate(child: &mut Child, control: &RunControl) -> io::Result<ExitStatus> {
        signal_group(child, false);

        let start = Instant::now();
        while start.elapsed() < control.grace && !control.is_aborted() {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            thread::sleep(POLL_INTERVAL);
        }

        warn!(pid = child.id(), "process did not exit after SIGTERM, killing");
        signal_group(child, true);
        let _ = child.kill();
        child.wait()
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, kill: bool) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = if kill { Signal::SIGKILL } else { Signal::SIGTERM };
    let _ = killpg(Pid::from_raw(child.id() as i32), signal);
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _kill: bool) {}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

impl Runner for SystemRunner {
    fn run(&self, spec: &CommandSpec, control: &RunControl) -> ProcessResult<ProcessOutput> {
        debug!(command = %spec, cwd = ?spec.cwd, "running");
        let start = Instant::now();

        let mut child = Self::spawn(spec)?;
        let stdout = Self::capture(child.stdout.take());
        let stderr = Self::capture(child.stderr.take());

        let (status, termination) = loop {
            if let Some(status) = child.try_wait()? {
                break (status, Termination::Exited);
            }
            if control.is_cancelled() || control.is_aborted() {
                break (Self::terminate(&mut child, control)?, Termination::Cancelled);
            }
            if let Some(timeout) = control.timeout {
                if start.elapsed() >= timeout {
                    break (Self::terminate(&mut child, control)?, Termination::TimedOut);
                }
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        Ok(ProcessOutput {
            code: status.code(),
            signal: exit_signal(&status),
            stdout,
            stderr,
            duration: start.elapsed(),
            termination,
        })
    }
}
