//! Typed configuration schema
//!
//! ```toml
//! workdir = "/srv/charms-builder"
//! charmsdir = "charms"
//!
//! [charms.slurmctld]
//! repo = "https://github.com/example/slurmctld-operator"
//! branch = "main"
//!
//! [[bases]]
//! name = "ubuntu"
//! channel = "22.04"
//!
//! [[bases]]
//! name = "rockylinux"
//! channel = "9"
//! image = "images:rockylinux/9/cloud"
//!
//! [build]
//! jobs = 4
//! timeout_seconds = 3600
//! scratch = "memory"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use super::defaults::BuiltinDefaults;
use super::effective::ConfigError;
use crate::base::Base;
use crate::charm::Charm;
use crate::timeout::TimeoutConfig;

/// Where overlay upper/work directories live inside an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScratchBacking {
    /// `/dev/shm` (tmpfs) when available, falling back to disk
    #[default]
    Memory,
    /// `/var/tmp` on the instance's root filesystem
    Disk,
}

impl fmt::Display for ScratchBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScratchBacking::Memory => write!(f, "memory"),
            ScratchBacking::Disk => write!(f, "disk"),
        }
    }
}

impl FromStr for ScratchBacking {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "tmpfs" => Ok(ScratchBacking::Memory),
            "disk" => Ok(ScratchBacking::Disk),
            _ => Err(ConfigError::ValidationError(format!(
                "invalid scratch backing '{}': expected memory or disk",
                s
            ))),
        }
    }
}

/// `[charms.<name>]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharmEntry {
    pub repo: String,

    /// Empty strings are treated as unset
    #[serde(default, alias = "ref", skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// `[[bases]]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseEntry {
    pub name: String,

    /// YAML configs often carry unquoted channels (`channel: 22.04`)
    #[serde(deserialize_with = "string_or_number")]
    pub channel: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// `[build]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSettings {
    pub jobs: usize,
    pub timeout_seconds: u64,
    pub sync_timeout_seconds: u64,
    pub provision_timeout_seconds: u64,
    pub native_attempts: u32,
    pub scratch: ScratchBacking,
    pub grace_seconds: u64,
}

/// The fully merged configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub workdir: PathBuf,
    pub charmsdir: PathBuf,
    #[serde(default)]
    pub charms: BTreeMap<String, CharmEntry>,
    #[serde(default)]
    pub bases: Vec<BaseEntry>,
    /// `"<name>-<channel>" = "<image>"` lookups
    #[serde(default)]
    pub images: BTreeMap<String, String>,
    pub native_bases: Vec<String>,
    pub build: BuildSettings,
}

/// Built-in defaults with no charms or bases
impl Default for BuilderConfig {
    fn default() -> Self {
        let defaults = BuiltinDefaults::default();
        Self {
            workdir: PathBuf::from(defaults.workdir),
            charmsdir: PathBuf::from(defaults.charmsdir),
            charms: BTreeMap::new(),
            bases: Vec::new(),
            images: BTreeMap::new(),
            native_bases: defaults.native_bases,
            build: BuildSettings {
                jobs: defaults.jobs,
                timeout_seconds: defaults.timeout_seconds,
                sync_timeout_seconds: defaults.sync_timeout_seconds,
                provision_timeout_seconds: defaults.provision_timeout_seconds,
                native_attempts: defaults.native_attempts,
                scratch: defaults.scratch.parse().unwrap_or_default(),
                grace_seconds: defaults.grace_seconds,
            },
        }
    }
}

impl BuilderConfig {
    /// Directory holding all working copies
    pub fn reposdir(&self) -> PathBuf {
        self.workdir.join("repos")
    }

    /// Directory for run reports
    pub fn runsdir(&self) -> PathBuf {
        self.workdir.join("runs")
    }

    /// All configured charms, sorted by name
    pub fn charms(&self) -> Vec<Charm> {
        self.charms
            .iter()
            .map(|(name, entry)| Charm {
                name: name.clone(),
                repo: entry.repo.clone(),
                reference: entry
                    .branch
                    .as_ref()
                    .filter(|b| !b.trim().is_empty())
                    .cloned(),
            })
            .collect()
    }

    /// All configured bases, in configuration order
    pub fn bases(&self) -> Vec<Base> {
        self.bases
            .iter()
            .map(|b| Base {
                name: b.name.clone(),
                channel: b.channel.clone(),
                image: b.image.clone().filter(|i| !i.trim().is_empty()),
            })
            .collect()
    }

    /// Bases the packaging tool supports natively
    pub fn native_bases(&self) -> Vec<Base> {
        self.native_bases
            .iter()
            .filter_map(|s| Base::parse_series(s).ok())
            .collect()
    }

    pub fn timeouts(&self) -> TimeoutConfig {
        TimeoutConfig {
            build_seconds: self.build.timeout_seconds,
            sync_seconds: self.build.sync_timeout_seconds,
            provision_seconds: self.build.provision_timeout_seconds,
            grace_seconds: self.build.grace_seconds,
        }
    }

    /// Make relative paths absolute against `root`
    pub fn absolutize(&mut self, root: &Path) {
        if self.workdir.is_relative() {
            self.workdir = root.join(&self.workdir);
        }
        if self.charmsdir.is_relative() {
            self.charmsdir = root.join(&self.charmsdir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, entry) in &self.charms {
            if name.is_empty() || name.contains('/') || name.starts_with('.') {
                return Err(ConfigError::ValidationError(format!(
                    "invalid charm name '{}'",
                    name
                )));
            }
            if entry.repo.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "charm '{}': repo must not be empty",
                    name
                )));
            }
        }

        let mut seen = HashSet::new();
        for base in &self.bases {
            if base.name.is_empty() || base.channel.is_empty() {
                return Err(ConfigError::ValidationError(
                    "bases entries need both name and channel".to_string(),
                ));
            }
            let series = format!("{}-{}", base.name, base.channel);
            if !seen.insert(series.clone()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate base '{}'",
                    series
                )));
            }
        }

        for series in self.native_bases.iter().chain(self.images.keys()) {
            Base::parse_series(series)
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }

        if self.build.jobs == 0 {
            return Err(ConfigError::ValidationError(
                "build.jobs must be at least 1".to_string(),
            ));
        }
        if self.build.native_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "build.native_attempts must be at least 1".to_string(),
            ));
        }

        self.timeouts()
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}
