//! Unit execution
//!
//! A [`UnitExecutor`] runs exactly one unit and always returns a [`UnitResult`]:
//! pipeline errors, panics, crashes and timeouts are converted to data and never
//! escape to the pool.
//!
//! - [`ProcessExecutor`]: one disposable OS process per unit, torn down afterwards
//! - [`InProcessExecutor`]: runs a [`UnitPipeline`] on the runtime; for embedded
//!   pipelines and tests

mod in_process;
mod process;

pub use in_process::{InProcessExecutor, PipelineReport, UnitPipeline};
pub use process::{ProcessExecutor, WorkerReport, REPORT_FILE_NAME};

use crate::artifacts::UNIT_NO_CHANNEL_ARTIFACT_NAME;
use crate::error::{FailureKind, Result};
use crate::record::{read_records, write_records, RecordCounts};
use async_trait::async_trait;
use npsa_storage::RunId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Everything a worker needs to process one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRequest {
    pub run_id: RunId,
    pub domain: String,
    pub unit_id: String,
    /// Where the unit's contacts must end up
    pub artifact_path: PathBuf,
}

/// Outcome of one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub unit_id: String,
    pub success: bool,
    pub record_count: usize,
    pub records_with_channel: usize,
    pub records_without_channel: usize,
    pub artifact_path: Option<PathBuf>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl UnitResult {
    pub fn succeeded(
        unit_id: impl Into<String>,
        counts: RecordCounts,
        artifact_path: PathBuf,
        duration: Duration,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            success: true,
            record_count: counts.total,
            records_with_channel: counts.with_channel,
            records_without_channel: counts.without_channel,
            artifact_path: Some(artifact_path),
            error: None,
            failure: None,
            duration,
        }
    }

    pub fn failed(
        unit_id: impl Into<String>,
        kind: FailureKind,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            success: false,
            record_count: 0,
            records_with_channel: 0,
            records_without_channel: 0,
            artifact_path: None,
            error: Some(error.into()),
            failure: Some(kind),
            duration,
        }
    }

    /// Aborted units are not done; a later resume runs them again.
    pub fn counts_as_completed(&self) -> bool {
        self.failure != Some(FailureKind::Aborted)
    }
}

/// Runs one unit in an isolated, disposable worker
#[async_trait]
pub trait UnitExecutor: Send + Sync {
    /// Execute `request`. `abort` is cancelled when dispatched units must be
    /// force-stopped; the executor then tears the worker down and reports
    /// [`FailureKind::Aborted`].
    async fn execute(&self, request: UnitRequest, abort: CancellationToken) -> UnitResult;
}

/// Make sure the unit artifact sits at its canonical path and count its records.
///
/// A pipeline may report a different output file; it is copied into place. A
/// successful unit without any output gets an empty artifact so it is recognised
/// as done after a crash.
pub(crate) async fn collect_artifact(
    request: &UnitRequest,
    reported: Option<PathBuf>,
) -> Result<RecordCounts> {
    let target = request.artifact_path.clone();
    let unit_id = request.unit_id.clone();

    let counts = tokio::task::spawn_blocking(move || -> Result<RecordCounts> {
        if let Some(reported) = reported.filter(|p| p.as_path() != target.as_path()) {
            if reported.is_file() {
                let records = read_records(&reported)?;
                write_records(&target, &records)?;
            } else {
                warn!(
                    "Unit {}: reported artifact {} does not exist",
                    unit_id,
                    reported.display()
                );
            }
        }

        if !target.is_file() {
            write_records(&target, &[])?;
        }
        Ok(RecordCounts::of(&read_records(&target)?))
    })
    .await
    .map_err(|e| anyhow::anyhow!("artifact task failed: {}", e))??;

    Ok(counts)
}

pub(crate) fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Remove the unit artifact and its no-channel side file.
pub(crate) fn clear_unit_outputs(artifact_path: &Path) -> std::io::Result<()> {
    remove_if_exists(artifact_path)?;
    match artifact_path.parent() {
        Some(dir) => remove_if_exists(&dir.join(UNIT_NO_CHANNEL_ARTIFACT_NAME)),
        None => Ok(()),
    }
}

/// Drop whatever a failed or aborted attempt left behind. Only successful units
/// may have an artifact on disk.
pub(crate) fn discard_partial_outputs(result: &UnitResult, artifact_path: &Path) {
    if result.success {
        return;
    }
    if let Err(e) = clear_unit_outputs(artifact_path) {
        warn!(
            "Unit {}: cannot remove partial output {}: {}",
            result.unit_id,
            artifact_path.display(),
            e
        );
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
