//! Failure injection for the mock runtime
//!
//! Supports configurable failures and delays per runtime operation.

use std::collections::HashMap;
use std::time::Duration;

/// Runtime operation a failure can be attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuntimeOp {
    Launch,
    AddDisk,
    /// Any command executed inside an instance
    Exec,
    /// Commands whose argv[0] matches
    Command(String),
    ListDir,
    PullFile,
    Stop,
    ListInstances,
}

impl RuntimeOp {
    pub fn command(program: impl Into<String>) -> Self {
        RuntimeOp::Command(program.into())
    }

    pub fn name(&self) -> &'static str {
        match self {
            RuntimeOp::Launch => "launch",
            RuntimeOp::AddDisk => "add disk device",
            RuntimeOp::Exec | RuntimeOp::Command(_) => "exec",
            RuntimeOp::ListDir => "list directory",
            RuntimeOp::PullFile => "pull file",
            RuntimeOp::Stop => "stop",
            RuntimeOp::ListInstances => "list instances",
        }
    }
}

/// Failure configuration for an operation
#[derive(Debug, Clone)]
pub struct FailureConfig {
    /// Message returned as the error detail (or stderr for exec)
    pub message: String,
    /// For exec: exit with this code instead of a runtime error
    pub exit_code: Option<i32>,
    /// Fail as a timeout
    pub timeout: bool,
    /// Fail as cancelled
    pub cancelled: bool,
    /// The operation still takes effect before the failure is reported
    pub after_effect: bool,
    /// Delay before responding
    pub delay: Option<Duration>,
    /// Number of times to fail before succeeding (None = always fail)
    pub fail_count: Option<u32>,
}

impl FailureConfig {
    /// The operation itself fails
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_code: None,
            timeout: false,
            cancelled: false,
            after_effect: false,
            delay: None,
            fail_count: None,
        }
    }

    /// The executed command exits non-zero
    pub fn exit(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::error(stderr)
        }
    }

    pub fn timeout() -> Self {
        Self {
            timeout: true,
            ..Self::error("timed out")
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::error("cancelled")
        }
    }

    /// Report the failure only after the operation has happened, like a
    /// client killed while the daemon finishes the request
    pub fn after_effect(mut self) -> Self {
        self.after_effect = true;
        self
    }

    /// Only add delay; the operation still succeeds
    pub fn delay(duration: Duration) -> Self {
        Self {
            delay: Some(duration),
            ..Self::error("")
        }
    }

    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = Some(count);
        self
    }

    /// True if this config only delays
    pub fn is_delay_only(&self) -> bool {
        self.delay.is_some()
            && self.message.is_empty()
            && self.exit_code.is_none()
            && !self.timeout
            && !self.cancelled
    }
}

/// Per-operation failure table
#[derive(Debug, Default)]
pub struct FailureInjector {
    configs: HashMap<RuntimeOp, FailureConfig>,
    call_counts: HashMap<RuntimeOp, u32>,
}

impl FailureInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&mut self, op: RuntimeOp, config: FailureConfig) {
        self.configs.insert(op.clone(), config);
        self.call_counts.insert(op, 0);
    }

    pub fn clear(&mut self) {
        self.configs.clear();
        self.call_counts.clear();
    }

    pub fn clear_op(&mut self, op: &RuntimeOp) {
        self.configs.remove(op);
        self.call_counts.remove(op);
    }

    /// The failure to apply to this call, if any
    pub fn check(&mut self, op: &RuntimeOp) -> Option<FailureConfig> {
        let config = self.configs.get(op)?;
        let count = self.call_counts.entry(op.clone()).or_insert(0);
        *count += 1;

        if let Some(fail_limit) = config.fail_count {
            if *count > fail_limit {
                return None;
            }
        }
        Some(config.clone())
    }
}
