//! Built-in defaults (layer 1)

use serde::{Deserialize, Serialize};

/// Config file looked up when `-c` is not given
pub const DEFAULT_CONFIG_PATH: &str = "charms-builder.toml";

/// Fallback for deployments still carrying the YAML config
pub const LEGACY_CONFIG_PATH: &str = "charms-builder.yaml";

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Working directory; repositories live under `<workdir>/repos`
    pub workdir: String,

    /// Output directory for built charms
    pub charmsdir: String,

    /// Worker pool size
    pub jobs: usize,

    /// Per-build timeout in seconds (default: 3600)
    pub timeout_seconds: u64,

    /// Per-repository sync timeout in seconds (default: 600)
    pub sync_timeout_seconds: u64,

    /// Timeout for each provisioning step (launch, mount, stop) in seconds
    pub provision_timeout_seconds: u64,

    /// Attempts for a native pack before giving up (default: 2)
    pub native_attempts: u32,

    /// Overlay scratch backing (default: "memory")
    pub scratch: String,

    /// Seconds between SIGTERM and SIGKILL on cancellation
    pub grace_seconds: u64,

    /// Bases the packaging tool builds without manual provisioning
    pub native_bases: Vec<String>,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        let jobs = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(4);

        Self {
            workdir: ".".to_string(),
            charmsdir: "charms".to_string(),
            jobs,
            timeout_seconds: 3600,
            sync_timeout_seconds: 600,
            provision_timeout_seconds: 300,
            native_attempts: 2,
            scratch: "memory".to_string(),
            grace_seconds: 10,
            native_bases: vec![
                "ubuntu-20.04".to_string(),
                "ubuntu-22.04".to_string(),
                "ubuntu-24.04".to_string(),
            ],
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "workdir": self.workdir,
            "charmsdir": self.charmsdir,
            "charms": {},
            "bases": [],
            "images": {},
            "native_bases": self.native_bases,
            "build": {
                "jobs": self.jobs,
                "timeout_seconds": self.timeout_seconds,
                "sync_timeout_seconds": self.sync_timeout_seconds,
                "provision_timeout_seconds": self.provision_timeout_seconds,
                "native_attempts": self.native_attempts,
                "scratch": self.scratch,
                "grace_seconds": self.grace_seconds
            }
        })
    }
}
