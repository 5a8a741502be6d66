//! Name selection for charms and bases
//!
//! Callers pass zero or more literals or glob patterns. Matching is
//! case-sensitive against the full name. No patterns selects everything;
//! patterns that match nothing select nothing, which is not an error.

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::base::Base;
use crate::charm::Charm;

/// Errors building a filter
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

/// A set of literals/glob patterns matched against whole names
#[derive(Debug, Clone)]
pub struct NameFilter {
    patterns: Vec<String>,
    glob_set: Option<GlobSet>,
}

impl NameFilter {
    /// Filter that matches every name
    pub fn all() -> Self {
        Self {
            patterns: Vec::new(),
            glob_set: None,
        }
    }

    pub fn new<I, S>(patterns: I) -> Result<Self, SelectionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns: Vec<String> = patterns
            .into_iter()
            .map(|p| p.as_ref().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if patterns.is_empty() {
            return Ok(Self::all());
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let glob = Glob::new(pattern).map_err(|source| SelectionError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
        }
        let glob_set = builder
            .build()
            .map_err(|source| SelectionError::InvalidPattern {
                pattern: patterns.join(" "),
                source,
            })?;

        Ok(Self {
            patterns,
            glob_set: Some(glob_set),
        })
    }

    /// True when no patterns were given
    pub fn is_unfiltered(&self) -> bool {
        self.glob_set.is_none()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_match(&self, name: &str) -> bool {
        match self.glob_set {
            Some(ref set) => set.is_match(name),
            None => true,
        }
    }

    pub fn select_charms<'a>(&self, charms: &'a [Charm]) -> Vec<&'a Charm> {
        charms.iter().filter(|c| self.is_match(&c.name)).collect()
    }

    /// Bases are matched by their `<name>-<channel>` series string
    pub fn select_bases<'a>(&self, bases: &'a [Base]) -> Vec<&'a Base> {
        bases.iter().filter(|b| self.is_match(&b.series())).collect()
    }
}

impl Default for NameFilter {
    fn default() -> Self {
        Self::all()
    }
}
