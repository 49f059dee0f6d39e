//! Configuration I/O (YAML/Env loading)

use super::{ConfigError, ConfigResult, RunnerConfig, StorageBackend};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const SUPPORTED_VERSIONS: &[u64] = &[1];

/// YAML Schema v1 (export side)
#[derive(Serialize)]
struct ConfigExportV1<'a> {
    version: u64,
    #[serde(flatten)]
    config: &'a RunnerConfig,
}

impl RunnerConfig {
    /// Load, apply `NPSA_*` environment overrides, validate.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let mut doc: serde_yaml::Value = serde_yaml::from_str(content)?;

        // Version check before the body is interpreted
        let version = match doc.as_mapping_mut() {
            Some(map) => map.remove("version"),
            None => None,
        };
        let version = match version {
            Some(v) => v.as_u64().ok_or(ConfigError::MissingVersion)?,
            None => return Err(ConfigError::MissingVersion),
        };
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        Ok(serde_yaml::from_value(doc)?)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        let export = ConfigExportV1 {
            version: 1,
            config: self,
        };
        serde_yaml::to_string(&export).map_err(ConfigError::Yaml)
    }

    /// Apply environment overrides through `lookup` (injectable for tests).
    pub fn apply_env_from<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("NPSA_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("NPSA_RUNS_DIR") {
            self.runs_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("NPSA_CATALOG_DIR") {
            self.catalog.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("NPSA_PARALLELISM") {
            self.pool.parallelism = parse_env("NPSA_PARALLELISM", &v)?;
        }
        if let Some(v) = lookup("NPSA_UNIT_TIMEOUT_SECS") {
            self.unit.timeout_secs = parse_env("NPSA_UNIT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("NPSA_STORAGE_BACKEND") {
            self.storage.backend = StorageBackend::from_str(&v)?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> ConfigResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, format!("'{}': {}", raw, e)))
}
