//! Base resolver
//!
//! Decides per (charm, base) whether the packaging tool can build natively
//! or the base needs manual provisioning, and which image to provision.
//!
//! A charm whose `charmcraft.yaml` lists `bases` is only built for those;
//! any other base is an [`ResolveError::UnresolvedBase`] whatever its mode.
//!
//! Precedence:
//! 1. An explicit image on the base always means manual provisioning.
//! 2. Natively supported bases build natively, passing the declared index.
//! 3. Everything else is looked up through [`ImageLookup`]; no answer is an
//!    [`ResolveError::UnresolvedBase`] for that pair only.

pub mod charmcraft_yaml;
pub mod images;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::base::Base;
use crate::charm::Charm;
use crate::config::BuilderConfig;

pub use charmcraft_yaml::{BaseDeclaration, CharmcraftBases, CharmcraftError, CHARMCRAFT_FILE};
pub use images::{ChainLookup, ImageLookup, ImageTable, StableNaming};

pub type ResolveResult<T> = Result<T, ResolveError>;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{charm}/{base}: unresolved base: {reason}")]
    UnresolvedBase {
        charm: String,
        base: String,
        reason: String,
    },

    #[error("{charm}: {source}")]
    Charmcraft {
        charm: String,
        #[source]
        source: CharmcraftError,
    },
}

/// Provisioning mode of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Native,
    Manual,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Native => write!(f, "native"),
            Mode::Manual => write!(f, "manual"),
        }
    }
}

/// Resolved provisioning for one (charm, base) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Provisioning {
    Native {
        /// `--bases-index` to pass, if the charm declares bases
        #[serde(skip_serializing_if = "Option::is_none")]
        bases_index: Option<usize>,
    },
    Manual {
        image: String,
    },
}

impl Provisioning {
    pub fn mode(&self) -> Mode {
        match self {
            Provisioning::Native { .. } => Mode::Native,
            Provisioning::Manual { .. } => Mode::Manual,
        }
    }

    pub fn image(&self) -> Option<&str> {
        match self {
            Provisioning::Manual { image } => Some(image),
            Provisioning::Native { .. } => None,
        }
    }
}

pub struct BaseResolver {
    native: Vec<Base>,
    lookup: Box<dyn ImageLookup>,
}

impl BaseResolver {
    pub fn new(native: Vec<Base>, lookup: Box<dyn ImageLookup>) -> Self {
        Self { native, lookup }
    }

    /// `[images]` table first, then the stable naming scheme
    pub fn from_config(config: &BuilderConfig) -> Self {
        let lookup = ChainLookup::new()
            .with(ImageTable::new(config.images.clone()))
            .with(StableNaming);
        Self::new(config.native_bases(), Box::new(lookup))
    }

    pub fn supports_natively(&self, base: &Base) -> bool {
        self.native.iter().any(|n| n.same_series(base))
    }

    pub fn resolve(&self, charm: &Charm, base: &Base, working_copy: &Path) -> ResolveResult<Provisioning> {
        let unresolved = |reason: &str| ResolveError::UnresolvedBase {
            charm: charm.name.clone(),
            base: base.series(),
            reason: reason.to_string(),
        };

        let declared = CharmcraftBases::load(working_copy).map_err(|source| ResolveError::Charmcraft {
            charm: charm.name.clone(),
            source,
        })?;
        let bases_index = match declared {
            CharmcraftBases::Undeclared => None,
            CharmcraftBases::Declared(_) => Some(
                declared
                    .index_of(base)
                    .ok_or_else(|| unresolved("not declared in charmcraft.yaml bases"))?,
            ),
        };

        let provisioning = if let Some(ref image) = base.image {
            Provisioning::Manual {
                image: image.clone(),
            }
        } else if self.supports_natively(base) {
            Provisioning::Native { bases_index }
        } else {
            let image = self
                .lookup
                .lookup(base)
                .ok_or_else(|| unresolved("no native support and no provisioning image"))?;
            Provisioning::Manual { image }
        };

        debug!(charm = %charm.name, base = %base, mode = %provisioning.mode(), "resolved");
        Ok(provisioning)
    }
}
