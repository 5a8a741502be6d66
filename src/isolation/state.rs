//! Environment lifecycle
//!
//! CREATED → SOURCE_BOUND → OVERLAY_MOUNTED → IDENTITY_CONFIGURED → RUNNING → RELEASED
//!
//! Any non-terminal state may go straight to RELEASED (teardown after a
//! failed step).

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvState {
    /// Instance launched, nothing attached
    Created,
    /// Working copy attached read-only
    SourceBound,
    /// Writable overlay mounted over the source
    OverlayMounted,
    /// Build user and group exist inside the instance
    IdentityConfigured,
    /// Ready for the build
    Running,
    /// Stopped and discarded
    Released,
}

impl EnvState {
    pub fn can_transition_to(&self, target: EnvState) -> bool {
        match (self, target) {
            (EnvState::Created, EnvState::SourceBound) => true,
            (EnvState::SourceBound, EnvState::OverlayMounted) => true,
            (EnvState::OverlayMounted, EnvState::IdentityConfigured) => true,
            (EnvState::IdentityConfigured, EnvState::Running) => true,

            (EnvState::Released, _) => false,
            (_, EnvState::Released) => true,

            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EnvState::Released)
    }

    /// Provisioning step that leads into this state
    pub fn step(&self) -> &'static str {
        match self {
            EnvState::Created => "launch",
            EnvState::SourceBound => "bind source",
            EnvState::OverlayMounted => "mount overlay",
            EnvState::IdentityConfigured => "configure identity",
            EnvState::Running => "start",
            EnvState::Released => "release",
        }
    }
}

impl fmt::Display for EnvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvState::Created => "CREATED",
            EnvState::SourceBound => "SOURCE_BOUND",
            EnvState::OverlayMounted => "OVERLAY_MOUNTED",
            EnvState::IdentityConfigured => "IDENTITY_CONFIGURED",
            EnvState::Running => "RUNNING",
            EnvState::Released => "RELEASED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid environment transition from {from} to {to}")]
pub struct StateError {
    pub from: EnvState,
    pub to: EnvState,
}
