//! charms-builder - build charms for every configured base
//!
//! Synchronizes each charm's source repository, decides per (charm, base)
//! whether the packaging tool can build natively or the base needs a
//! manually provisioned isolated environment, runs the builds on a bounded
//! worker pool and aggregates the outcome into a single run report.

pub mod base;
pub mod catalog;
pub mod charm;
pub mod config;
pub mod executor;
pub mod isolation;
pub mod mock;
pub mod report;
pub mod resolve;
pub mod scheduler;
pub mod selection;
pub mod signal;
pub mod sync;
pub mod task;
pub mod timeout;

pub use base::Base;
pub use charm::Charm;
pub use config::{BuilderConfig, ConfigError, EffectiveConfig};
pub use executor::{BuildError, BuildExecutor, BuildResult};
pub use isolation::{IdentityMapping, IsolationProvider, IsolationRuntime, ProvisionError, TeardownError};
pub use report::{ExitCode, FailureKind, RunReport, Status, TaskReport};
pub use resolve::{BaseResolver, Mode, Provisioning, ResolveError};
pub use scheduler::{Collaborators, Scheduler, Selection};
pub use selection::NameFilter;
pub use sync::{SyncError, SyncOutcome, Synchronizer, Vcs};
pub use task::BuildTask;
pub use timeout::{Deadlines, TimeoutConfig};

/// Fresh run id: a lowercase ULID
pub fn generate_run_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}
