//! Runner configuration
//!
//! Defaults → versioned YAML file → `NPSA_*` environment overrides → validation.
//!
//! ```yaml
//! version: 1
//! state_dir: ./state
//! runs_dir: ./runs
//! catalog:
//!   dir: ./assets/data/state_counties
//! pool:
//!   parallelism: 1
//!   cancel_policy: drain
//! unit:
//!   timeout_secs: 7200
//! worker:
//!   program: python3
//!   args: ["Pipeline.py", "--state", "{domain}", "--county", "{unit}", "--output", "{artifact}"]
//! ```

mod error;
mod io;

pub use error::{ConfigError, ConfigResult};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const MAX_PARALLELISM: usize = 64;

/// Where run state is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    File,
    Sqlite,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::File => "file",
            StorageBackend::Sqlite => "sqlite",
        }
    }

    pub fn from_str(s: &str) -> ConfigResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageBackend::File),
            "sqlite" => Ok(StorageBackend::Sqlite),
            other => Err(ConfigError::invalid(
                "storage.backend",
                format!("unknown backend '{}', expected file or sqlite", other),
            )),
        }
    }
}

/// What happens to already-dispatched units when a run is cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// Dispatched units run to completion (or timeout) and are recorded
    Drain,
    /// Dispatched units are torn down immediately and not recorded as completed
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    pub dir: PathBuf,
    /// Preferred variant suffix: `<domain>_<variant>.txt` wins when it exists
    pub variant: Option<String>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./assets/data/state_counties"),
            variant: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: StorageBackend,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Concurrent workers; 1 runs units strictly one after another
    pub parallelism: usize,
    /// Settle time between dispatches so the previous worker's cleanup finishes
    pub dispatch_pause_ms: u64,
    pub cancel_policy: CancelPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            dispatch_pause_ms: 2_000,
            cancel_policy: CancelPolicy::Drain,
        }
    }
}

impl PoolConfig {
    pub fn dispatch_pause(&self) -> Duration {
        Duration::from_millis(self.dispatch_pause_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UnitConfig {
    pub timeout_secs: u64,
    pub teardown_grace_ms: u64,
    pub track_interval_ms: u64,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 7_200,
            teardown_grace_ms: 3_000,
            track_interval_ms: 1_000,
        }
    }
}

impl UnitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    pub fn track_interval(&self) -> Duration {
        Duration::from_millis(self.track_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Persist after every K unit completions
    pub every: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { every: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregationConfig {
    pub wait_secs: u64,
    pub poll_ms: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            wait_secs: 30,
            poll_ms: 1_000,
        }
    }
}

impl AggregationConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FinalizeConfig {
    pub cooldown_secs: u64,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self { cooldown_secs: 120 }
    }
}

impl FinalizeConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EtaConfig {
    /// Used until the first unit of a run has finished
    pub default_unit_secs: u64,
    /// Number of most recent unit timings averaged for the estimate
    pub window: usize,
}

impl Default for EtaConfig {
    fn default() -> Self {
        Self {
            // 101 counties in 19h47m on a sequential production run
            default_unit_secs: 705,
            window: 20,
        }
    }
}

/// External per-unit pipeline command
///
/// `args` and `env` values may contain `{domain}`, `{unit}`, `{run_id}`,
/// `{artifact}` and `{report}` placeholders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerCommandConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    pub state_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub catalog: CatalogConfig,
    pub storage: StorageConfig,
    pub pool: PoolConfig,
    pub unit: UnitConfig,
    pub checkpoint: CheckpointConfig,
    pub aggregation: AggregationConfig,
    pub finalize: FinalizeConfig,
    pub eta: EtaConfig,
    pub worker: Option<WorkerCommandConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./state"),
            runs_dir: PathBuf::from("./runs"),
            catalog: CatalogConfig::default(),
            storage: StorageConfig::default(),
            pool: PoolConfig::default(),
            unit: UnitConfig::default(),
            checkpoint: CheckpointConfig::default(),
            aggregation: AggregationConfig::default(),
            finalize: FinalizeConfig::default(),
            eta: EtaConfig::default(),
            worker: None,
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if !(1..=MAX_PARALLELISM).contains(&self.pool.parallelism) {
            return Err(ConfigError::range_with_hint(
                "pool.parallelism",
                self.pool.parallelism,
                1,
                MAX_PARALLELISM,
                "Use 1 for sequential processing",
            ));
        }
        if self.pool.parallelism > num_cpus::get() {
            warn!(
                "pool.parallelism ({}) exceeds available cores ({}); each worker drives its own browser",
                self.pool.parallelism,
                num_cpus::get()
            );
        }
        if self.unit.timeout_secs == 0 {
            return Err(ConfigError::range_with_hint(
                "unit.timeout_secs",
                0,
                1,
                u64::MAX,
                "A unit needs a positive wall-clock limit",
            ));
        }
        if self.checkpoint.every == 0 {
            return Err(ConfigError::range_with_hint(
                "checkpoint.every",
                0,
                1,
                usize::MAX,
                "Use 1 to persist after every unit",
            ));
        }
        if self.eta.window == 0 {
            return Err(ConfigError::range_with_hint(
                "eta.window",
                0,
                1,
                usize::MAX,
                "",
            ));
        }
        if self.aggregation.poll_ms == 0 {
            return Err(ConfigError::range_with_hint(
                "aggregation.poll_ms",
                0,
                1,
                u64::MAX,
                "",
            ));
        }
        if let Some(worker) = &self.worker {
            if worker.program.trim().is_empty() {
                return Err(ConfigError::invalid("worker.program", "must not be empty"));
            }
        }
        if let Some(variant) = &self.catalog.variant {
            if variant.is_empty() || variant.contains(['/', '\\', '.']) {
                return Err(ConfigError::invalid(
                    "catalog.variant",
                    format!("'{}' is not a plain file-name suffix", variant),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RunnerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pool.parallelism, 1);
        assert_eq!(config.pool.cancel_policy, CancelPolicy::Drain);
        assert_eq!(config.checkpoint.every, 1);
        assert_eq!(config.eta.default_unit_secs, 705);
    }

    #[test]
    fn test_parallelism_bounds() {
        let mut config = RunnerConfig::default();
        config.pool.parallelism = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Range { .. })));

        config.pool.parallelism = MAX_PARALLELISM + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_checkpoint_cadence_rejected() {
        let mut config = RunnerConfig::default();
        config.checkpoint.every = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_worker_program_rejected() {
        let mut config = RunnerConfig::default();
        config.worker = Some(WorkerCommandConfig::default());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_catalog_variant_must_be_plain() {
        let mut config = RunnerConfig::default();
        config.catalog.variant = Some("../top50".to_string());
        assert!(config.validate().is_err());

        config.catalog.variant = Some("top50".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_storage_backend_parse() {
        assert_eq!(StorageBackend::from_str("SQLite").unwrap(), StorageBackend::Sqlite);
        assert_eq!(StorageBackend::from_str("file").unwrap(), StorageBackend::File);
        assert!(StorageBackend::from_str("redis").is_err());
    }
}
