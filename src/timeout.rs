//! Timeout policy
//!
//! Every external invocation is bounded:
//! - `build_seconds`: one packaging tool run (native or destructive)
//! - `sync_seconds`: one clone or update of a working copy
//! - `provision_seconds`: each isolation runtime step (launch, mount, stop)
//!
//! Exceeding a bound is a task-local failure; the subprocess is terminated
//! and any acquired environment still goes through release.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use charms_process::RunControl;

/// Upper bound on any configured timeout (one day)
pub const MAX_TIMEOUT_SECONDS: u64 = 86400;

/// Timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Maximum wall-clock time per build (default: 3600)
    pub build_seconds: u64,

    /// Maximum wall-clock time per repository sync (default: 600)
    pub sync_seconds: u64,

    /// Maximum wall-clock time per provisioning step (default: 300)
    pub provision_seconds: u64,

    /// Time between SIGTERM and SIGKILL (default: 10)
    pub grace_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            build_seconds: 3600,
            sync_seconds: 600,
            provision_seconds: 300,
            grace_seconds: 10,
        }
    }
}

/// Timeout validation errors
#[derive(Debug, thiserror::Error)]
pub enum TimeoutValidationError {
    #[error("{field} must be in (0, {max}], got {value}")]
    OutOfBounds {
        field: &'static str,
        value: u64,
        max: u64,
    },
}

impl TimeoutConfig {
    /// Validate bounds: every timeout in (0, 86400], grace in [0, 300]
    pub fn validate(&self) -> Result<(), TimeoutValidationError> {
        for (field, value) in [
            ("timeout_seconds", self.build_seconds),
            ("sync_timeout_seconds", self.sync_seconds),
            ("provision_timeout_seconds", self.provision_seconds),
        ] {
            if value == 0 || value > MAX_TIMEOUT_SECONDS {
                return Err(TimeoutValidationError::OutOfBounds {
                    field,
                    value,
                    max: MAX_TIMEOUT_SECONDS,
                });
            }
        }

        if self.grace_seconds > 300 {
            return Err(TimeoutValidationError::OutOfBounds {
                field: "grace_seconds",
                value: self.grace_seconds,
                max: 300,
            });
        }

        Ok(())
    }

    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build_seconds)
    }

    pub fn sync(&self) -> Duration {
        Duration::from_secs(self.sync_seconds)
    }

    pub fn provision(&self) -> Duration {
        Duration::from_secs(self.provision_seconds)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }
}

/// Cancellation hooks shared by every subprocess of a run.
///
/// Derives a [`RunControl`] per invocation with the matching deadline.
#[derive(Debug, Clone)]
pub struct Deadlines {
    config: TimeoutConfig,
    cancel: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
}

impl Deadlines {
    pub fn new(config: TimeoutConfig, cancel: Arc<AtomicBool>, abort: Arc<AtomicBool>) -> Self {
        Self {
            config,
            cancel,
            abort,
        }
    }

    /// Deadlines with private, never-set cancellation flags
    pub fn detached(config: TimeoutConfig) -> Self {
        Self::new(
            config,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
        )
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// A graceful stop of the run has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn control(&self, timeout: Duration) -> RunControl {
        RunControl::with_timeout(timeout)
            .cancel_flag(Arc::clone(&self.cancel))
            .abort_flag(Arc::clone(&self.abort))
            .grace(self.config.grace())
    }

    pub fn build(&self) -> RunControl {
        self.control(self.config.build())
    }

    pub fn sync(&self) -> RunControl {
        self.control(self.config.sync())
    }

    pub fn provision(&self) -> RunControl {
        self.control(self.config.provision())
    }

    /// Teardown ignores both flags: it must run even while the run is cancelling.
    pub fn teardown(&self) -> RunControl {
        RunControl::with_timeout(self.config.provision()).grace(self.config.grace())
    }
}
