//! `bases` section of a charm's `charmcraft.yaml`
//!
//! Both forms are accepted:
//!
//! ```yaml
//! bases:
//!   - name: ubuntu
//!     channel: "22.04"
//!   - build-on:
//!       - name: ubuntu
//!         channel: "20.04"
//!     run-on:
//!       - name: ubuntu
//!         channel: "20.04"
//! ```

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Deserializer};

use crate::base::Base;

pub const CHARMCRAFT_FILE: &str = "charmcraft.yaml";

#[derive(Debug, thiserror::Error)]
pub enum CharmcraftError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Platform {
    pub name: String,
    #[serde(deserialize_with = "channel_string")]
    pub channel: String,
    #[serde(default)]
    pub architectures: Vec<String>,
}

impl Platform {
    fn matches(&self, base: &Base) -> bool {
        self.name == base.name && self.channel == base.channel
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BaseDeclaration {
    Long {
        #[serde(rename = "build-on")]
        build_on: Vec<Platform>,
        #[serde(rename = "run-on", default)]
        run_on: Vec<Platform>,
    },
    Short(Platform),
}

impl BaseDeclaration {
    /// A long-form entry matches on its build-on platforms
    pub fn matches(&self, base: &Base) -> bool {
        match self {
            BaseDeclaration::Short(platform) => platform.matches(base),
            BaseDeclaration::Long { build_on, .. } => build_on.iter().any(|p| p.matches(base)),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CharmcraftFile {
    #[serde(default)]
    bases: Option<Vec<BaseDeclaration>>,
}

fn channel_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "channel must be a string, got {:?}",
            other
        ))),
    }
}

/// Declared bases of one charm
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CharmcraftBases {
    /// No `charmcraft.yaml`, or no `bases` key in it
    Undeclared,
    Declared(Vec<BaseDeclaration>),
}

impl CharmcraftBases {
    pub fn load(charm_dir: &Path) -> Result<Self, CharmcraftError> {
        let path = charm_dir.join(CHARMCRAFT_FILE);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CharmcraftBases::Undeclared),
            Err(source) => {
                return Err(CharmcraftError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        Self::parse(&contents).map_err(|source| CharmcraftError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(CharmcraftBases::Undeclared);
        }
        let file: CharmcraftFile = serde_yaml::from_str(contents)?;
        Ok(match file.bases {
            Some(bases) => CharmcraftBases::Declared(bases),
            None => CharmcraftBases::Undeclared,
        })
    }

    /// Position of the first entry matching `base`
    pub fn index_of(&self, base: &Base) -> Option<usize> {
        match self {
            CharmcraftBases::Undeclared => None,
            CharmcraftBases::Declared(bases) => bases.iter().position(|b| b.matches(base)),
        }
    }
}
