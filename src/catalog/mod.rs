//! Listing queries over the configuration and the output directory
//!
//! Built charms are discovered from artifact file names
//! (`<name>_<base>-<arch>.charm`) anywhere below the output directory.

use std::collections::BTreeSet;
use std::path::Path;

use walkdir::WalkDir;

use crate::base::Base;
use crate::config::BuilderConfig;
use crate::executor::artifacts;
use crate::selection::NameFilter;

/// Configured charm names matching `filter`, sorted
pub fn list(config: &BuilderConfig, filter: &NameFilter) -> Vec<String> {
    config
        .charms()
        .iter()
        .filter(|charm| filter.is_match(&charm.name))
        .map(|charm| charm.name.clone())
        .collect()
}

/// Charm names with at least one artifact under `charmsdir`.
///
/// With `series`, only artifacts built for that base count.
pub fn list_built(charmsdir: &Path, series: Option<&Base>, filter: &NameFilter) -> Vec<String> {
    let mut names = BTreeSet::new();
    for entry in WalkDir::new(charmsdir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let file_name = entry.file_name().to_string_lossy();
        let Some(name) = artifacts::charm_name(&file_name) else {
            continue;
        };
        if let Some(base) = series {
            if !artifacts::built_for(&file_name, base) {
                continue;
            }
        }
        if filter.is_match(name) {
            names.insert(name.to_string());
        }
    }
    names.into_iter().collect()
}

/// Configured charms that have no artifact yet
pub fn list_missing(config: &BuilderConfig, series: Option<&Base>, filter: &NameFilter) -> Vec<String> {
    let built: BTreeSet<String> = list_built(&config.charmsdir, series, filter)
        .into_iter()
        .collect();
    list(config, filter)
        .into_iter()
        .filter(|name| !built.contains(name))
        .collect()
}

/// Every configured base as `<name>-<channel>`, sorted
pub fn list_series(config: &BuilderConfig) -> Vec<String> {
    let series: BTreeSet<String> = config.bases().iter().map(Base::series).collect();
    series.into_iter().collect()
}
