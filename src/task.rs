//! Build tasks: one resolved (charm, base) pair

use std::fmt;
use std::path::PathBuf;

use crate::base::Base;
use crate::charm::Charm;
use crate::resolve::{Mode, Provisioning};

/// Created by the scheduler once sync and resolution both succeeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTask {
    pub charm: Charm,
    pub base: Base,
    pub provisioning: Provisioning,
    /// The charm's working copy; read-only from here on
    pub working_copy: PathBuf,
    /// Revision the working copy was synced to
    pub revision: Option<String>,
}

impl BuildTask {
    pub fn mode(&self) -> Mode {
        self.provisioning.mode()
    }

    /// `<charm>/<name>-<channel>`
    pub fn id(&self) -> String {
        format!("{}/{}", self.charm.name, self.base.series())
    }
}

impl fmt::Display for BuildTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id(), self.mode())
    }
}
