//! Charms: the named packages being built

use std::fmt;

use serde::{Deserialize, Serialize};

/// A charm as configured: a name and where its source lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charm {
    /// Unique name; also the working copy directory name
    pub name: String,

    /// Source repository URL
    pub repo: String,

    /// Branch or tag; `None` means the remote's default branch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl Charm {
    pub fn new(name: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repo: repo.into(),
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

impl fmt::Display for Charm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reference {
            Some(ref r) => write!(f, "{}@{}", self.name, r),
            None => write!(f, "{}", self.name),
        }
    }
}
