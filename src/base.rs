//! Target bases ("series")
//!
//! A base is identified by `name` + `channel` (e.g. `ubuntu` / `22.04`) and
//! is written on the command line and in reports as `<name>-<channel>`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors parsing a series string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BaseError {
    #[error("invalid series '{0}': expected <name>-<channel>")]
    InvalidSeries(String),
}

/// A target platform/channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Base {
    pub name: String,
    pub channel: String,
    /// Provisioning image override; always wins over native support
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl Base {
    pub fn new(name: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel: channel.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// `<name>-<channel>`
    pub fn series(&self) -> String {
        format!("{}-{}", self.name, self.channel)
    }

    /// Same name and channel (image override ignored)
    pub fn same_series(&self, other: &Base) -> bool {
        self.name == other.name && self.channel == other.channel
    }

    /// Parse `<name>-<channel>`, splitting on the first `-`
    pub fn parse_series(series: &str) -> Result<Base, BaseError> {
        match series.split_once('-') {
            Some((name, channel)) if !name.is_empty() && !channel.is_empty() => {
                Ok(Base::new(name, channel))
            }
            _ => Err(BaseError::InvalidSeries(series.to_string())),
        }
    }
}

impl fmt::Display for Base {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.channel)
    }
}
