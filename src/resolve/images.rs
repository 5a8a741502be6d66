//! Provisioning image lookup for bases without native support

use std::collections::BTreeMap;

use crate::base::Base;

/// Maps a base to an isolation image reference
pub trait ImageLookup: Send + Sync {
    fn lookup(&self, base: &Base) -> Option<String>;
}

/// Explicit `"<name>-<channel>" = "<image>"` entries from configuration
#[derive(Debug, Clone, Default)]
pub struct ImageTable {
    entries: BTreeMap<String, String>,
}

impl ImageTable {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }
}

impl ImageLookup for ImageTable {
    fn lookup(&self, base: &Base) -> Option<String> {
        self.entries
            .get(&base.series())
            .filter(|image| !image.trim().is_empty())
            .cloned()
    }
}

/// Well-known remote naming for common distributions
#[derive(Debug, Clone, Copy, Default)]
pub struct StableNaming;

impl ImageLookup for StableNaming {
    fn lookup(&self, base: &Base) -> Option<String> {
        match base.name.as_str() {
            "ubuntu" => Some(format!("ubuntu:{}", base.channel)),
            "almalinux" | "centos" | "debian" | "fedora" | "rockylinux" => {
                Some(format!("images:{}/{}", base.name, base.channel))
            }
            _ => None,
        }
    }
}

/// First answer wins
#[derive(Default)]
pub struct ChainLookup {
    lookups: Vec<Box<dyn ImageLookup>>,
}

impl ChainLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, lookup: impl ImageLookup + 'static) -> Self {
        self.lookups.push(Box::new(lookup));
        self
    }
}

impl ImageLookup for ChainLookup {
    fn lookup(&self, base: &Base) -> Option<String> {
        self.lookups.iter().find_map(|l| l.lookup(base))
    }
}
