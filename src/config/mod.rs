//! Configuration for charms-builder
//!
//! Three layers, later layers win:
//! 1. Built-in defaults
//! 2. Configuration file (`charms-builder.toml`, or YAML for older deployments)
//! 3. CLI flags

mod defaults;
mod effective;
mod merge;
mod schema;

pub use defaults::{BuiltinDefaults, DEFAULT_CONFIG_PATH, LEGACY_CONFIG_PATH};
pub use effective::{resolve_config_path, ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig};
pub use merge::{merge_layers, overlay};
pub use schema::{BaseEntry, BuildSettings, BuilderConfig, CharmEntry, ScratchBacking};
