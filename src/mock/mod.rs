//! Test doubles for the external collaborators
//!
//! - [`MockRunner`]: scripted subprocess runner for git, charmcraft and lxc
//!   command lines
//! - [`MockVcs`]: in-memory remotes behind the [`Vcs`](crate::sync::Vcs) seam
//! - [`MockRuntime`]: in-memory instances behind the
//!   [`IsolationRuntime`](crate::isolation::IsolationRuntime) seam, with a
//!   scripted packaging tool and per-operation failure injection
//!
//! Used by the unit tests and by the integration tests under `tests/`.

mod failure;
mod runner;
mod runtime;
mod vcs;

pub use failure::{FailureConfig, FailureInjector, RuntimeOp};
pub use runner::MockRunner;
pub use runtime::{MockBuild, MockRuntime, PackagerCall};
pub use vcs::MockVcs;
