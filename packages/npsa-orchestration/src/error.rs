use npsa_storage::StorageError;
use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run is already active: {0}")]
    RunAlreadyActive(String),

    #[error("Run already completed: {0}")]
    RunAlreadyCompleted(String),

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Aggregation failed: {0}")]
    Aggregation(String),

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn catalog<E: std::fmt::Display>(e: E) -> Self {
        Self::Catalog(e.to_string())
    }

    pub fn aggregation<E: std::fmt::Display>(e: E) -> Self {
        Self::Aggregation(e.to_string())
    }
}

/// Why a unit did not succeed
///
/// Unit- and pool-level failures are data carried on the unit result; they never
/// surface as an [`OrchestratorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The pipeline reported an error or exited unsuccessfully
    Pipeline,
    /// The unit hit its hard wall-clock timeout
    Timeout,
    /// The worker could not be started, crashed, or died from a signal
    WorkerCrashed,
    /// The unit was force-stopped by cancellation; it does not count as completed
    Aborted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Pipeline => "pipeline",
            FailureKind::Timeout => "timeout",
            FailureKind::WorkerCrashed => "worker_crashed",
            FailureKind::Aborted => "aborted",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pipeline" => Ok(FailureKind::Pipeline),
            "timeout" => Ok(FailureKind::Timeout),
            "worker_crashed" => Ok(FailureKind::WorkerCrashed),
            "aborted" => Ok(FailureKind::Aborted),
            _ => Err(OrchestratorError::serialization(format!(
                "Invalid failure kind: {}",
                s
            ))),
        }
    }

    /// Pool-level failures happen around the pipeline rather than inside it.
    pub fn is_pool_level(&self) -> bool {
        matches!(self, FailureKind::Timeout | FailureKind::WorkerCrashed)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
