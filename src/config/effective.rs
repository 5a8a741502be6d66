//! Effective configuration with provenance
//!
//! Records the merged configuration plus where each layer came from, so a
//! run report can say exactly which file (and which bytes) produced it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use super::defaults::{BuiltinDefaults, DEFAULT_CONFIG_PATH, LEGACY_CONFIG_PATH};
use super::merge::merge_layers;
use super::schema::BuilderConfig;

/// Origin of a configuration layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Cli,
}

/// A contributing layer with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 of the raw file bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Merged, validated configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub created_at: DateTime<Utc>,
    pub config: BuilderConfig,
    /// Contributing layers in precedence order
    pub sources: Vec<ConfigSource>,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Pick the configuration file: explicit path, else the TOML default, else
/// the legacy YAML file if only that one exists.
pub fn resolve_config_path(explicit: Option<PathBuf>, cwd: &Path) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    let toml_path = cwd.join(DEFAULT_CONFIG_PATH);
    let yaml_path = cwd.join(LEGACY_CONFIG_PATH);
    if !toml_path.exists() && yaml_path.exists() {
        yaml_path
    } else {
        toml_path
    }
}

impl EffectiveConfig {
    /// Build the effective config.
    ///
    /// Relative `workdir`/`charmsdir` resolve against `cwd`, whichever layer
    /// they came from.
    pub fn build(
        config_path: &Path,
        cli_overrides: Option<Value>,
        cwd: &Path,
    ) -> Result<Self, ConfigError> {
        let mut layers = vec![BuiltinDefaults::default().to_value()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path.to_path_buf()));
        }
        let (value, digest) = Self::load_file(config_path)?;
        layers.push(value);
        sources.push(ConfigSource {
            origin: ConfigOrigin::File,
            path: Some(config_path.to_string_lossy().to_string()),
            digest: Some(digest),
        });

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let merged = merge_layers(layers);
        let mut config: BuilderConfig = serde_json::from_value(merged)
            .map_err(|e| ConfigError::ParseError(format!("schema error: {}", e)))?;
        config.absolutize(cwd);
        config.validate()?;

        Ok(Self {
            created_at: Utc::now(),
            config,
            sources,
        })
    }

    /// Parse a config file (TOML, or YAML by extension) and digest its bytes
    fn load_file(path: &Path) -> Result<(Value, String), ConfigError> {
        let bytes = fs::read(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());

        let contents = String::from_utf8(bytes)
            .map_err(|e| ConfigError::ParseError(format!("Invalid UTF-8: {}", e)))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        let value = if is_yaml {
            let yaml: serde_yaml::Value = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(format!("YAML parse error: {}", e)))?;
            serde_json::to_value(yaml)
                .map_err(|e| ConfigError::ParseError(format!("YAML conversion error: {}", e)))?
        } else {
            let toml_value: toml::Value = toml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;
            Self::toml_to_json(toml_value)
        };

        Ok((value, digest))
    }

    fn toml_to_json(toml: toml::Value) -> Value {
        match toml {
            toml::Value::String(s) => Value::String(s),
            toml::Value::Integer(i) => Value::Number(i.into()),
            toml::Value::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            toml::Value::Boolean(b) => Value::Bool(b),
            toml::Value::Datetime(dt) => Value::String(dt.to_string()),
            toml::Value::Array(arr) => Value::Array(arr.into_iter().map(Self::toml_to_json).collect()),
            toml::Value::Table(table) => Value::Object(
                table
                    .into_iter()
                    .map(|(k, v)| (k, Self::toml_to_json(v)))
                    .collect(),
            ),
        }
    }

    /// Digest of the configuration file layer, if any
    pub fn file_digest(&self) -> Option<&str> {
        self.sources
            .iter()
            .find(|s| s.origin == ConfigOrigin::File)
            .and_then(|s| s.digest.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScratchBacking;
    use std::io::Write;
    use tempfile::{Builder, TempDir};

    const TOML_CONFIG: &str = r#"
workdir = "work"

[charms.slurmctld]
repo = "https://example.com/slurmctld.git"
branch = "main"

[charms.slurmd]
repo = "https://example.com/slurmd.git"

[[bases]]
name = "ubuntu"
channel = "22.04"

[[bases]]
name = "centos"
channel = "7"
image = "images:centos/7"

[build]
timeout_seconds = 900
"#;

    fn write_config(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_toml() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "charms-builder.toml", TOML_CONFIG);

        let effective = EffectiveConfig::build(&path, None, dir.path()).unwrap();
        let config = &effective.config;

        assert_eq!(config.charms().len(), 2);
        assert_eq!(config.bases().len(), 2);
        assert_eq!(config.build.timeout_seconds, 900);
        // Untouched defaults survive the merge
        assert_eq!(config.build.native_attempts, 2);
        assert_eq!(config.build.scratch, ScratchBacking::Memory);
        assert_eq!(config.workdir, dir.path().join("work"));
        assert_eq!(config.charmsdir, dir.path().join("charms"));
    }

    #[test]
    fn test_load_legacy_yaml() {
        let dir = TempDir::new().unwrap();
        let yaml = "workdir: .\ncharmsdir: out\ncharms:\n  slurmd:\n    repo: https://example.com/slurmd.git\n    branch:\nbases:\n  - name: ubuntu\n    channel: 22.04\n";
        let path = write_config(&dir, "charms-builder.yaml", yaml);

        let effective = EffectiveConfig::build(&path, None, dir.path()).unwrap();
        let config = &effective.config;

        assert_eq!(config.charms()[0].reference, None);
        assert_eq!(config.bases()[0].series(), "ubuntu-22.04");
        assert_eq!(config.charmsdir, dir.path().join("out"));
    }

    #[test]
    fn test_cli_overrides_win() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "charms-builder.toml", TOML_CONFIG);
        let cli = serde_json::json!({
            "charmsdir": "/tmp/out",
            "build": {"jobs": 1, "timeout_seconds": null}
        });

        let effective = EffectiveConfig::build(&path, Some(cli), dir.path()).unwrap();

        assert_eq!(effective.config.charmsdir, PathBuf::from("/tmp/out"));
        assert_eq!(effective.config.build.jobs, 1);
        assert_eq!(effective.config.build.timeout_seconds, 900);
        assert_eq!(effective.sources.len(), 3);
        assert_eq!(effective.sources[2].origin, ConfigOrigin::Cli);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = EffectiveConfig::build(&dir.path().join("nope.toml"), None, dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_validation_error_surfaces() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "bad.toml", "[build]\ntimeout_seconds = 0\n");
        let err = EffectiveConfig::build(&path, None, dir.path()).unwrap_err();
        assert!(err.to_string().contains("timeout_seconds"));
    }

    #[test]
    fn test_digest_recorded() {
        let file = Builder::new().suffix(".toml").tempfile().unwrap();
        fs::write(file.path(), TOML_CONFIG).unwrap();
        let cwd = file.path().parent().unwrap();

        let effective = EffectiveConfig::build(file.path(), None, cwd).unwrap();
        let digest = effective.file_digest().unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(effective.sources[0].origin, ConfigOrigin::Builtin);
    }

    #[test]
    fn test_resolve_config_path_prefers_toml() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            resolve_config_path(None, dir.path()),
            dir.path().join(DEFAULT_CONFIG_PATH)
        );

        write_config(&dir, LEGACY_CONFIG_PATH, "charms: {}\n");
        assert_eq!(
            resolve_config_path(None, dir.path()),
            dir.path().join(LEGACY_CONFIG_PATH)
        );

        write_config(&dir, DEFAULT_CONFIG_PATH, "");
        assert_eq!(
            resolve_config_path(None, dir.path()),
            dir.path().join(DEFAULT_CONFIG_PATH)
        );

        let explicit = PathBuf::from("/etc/charms-builder.toml");
        assert_eq!(resolve_config_path(Some(explicit.clone()), dir.path()), explicit);
    }
}
