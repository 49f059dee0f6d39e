use super::{
    clear_unit_outputs, collect_artifact, discard_partial_outputs, UnitExecutor, UnitRequest,
    UnitResult,
};
use crate::error::FailureKind;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What the per-unit pipeline reports back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub record_count: usize,
    /// Output file if the pipeline did not write to `UnitRequest::artifact_path`
    pub artifact_path: Option<PathBuf>,
}

/// The opaque per-unit extraction pipeline
///
/// Must be callable repeatedly and independently per unit.
#[async_trait]
pub trait UnitPipeline: Send + Sync {
    async fn process(&self, request: &UnitRequest) -> anyhow::Result<PipelineReport>;

    /// Release whatever the pipeline holds for this unit (browser sessions, temp dirs).
    /// Called after every attempt, including failed and timed-out ones.
    async fn release(&self, _request: &UnitRequest) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Runs a [`UnitPipeline`] as a task on the current runtime
///
/// Panics, errors and timeouts become failed results. There is no OS-level
/// isolation; production runs use [`super::ProcessExecutor`].
pub struct InProcessExecutor {
    pipeline: Arc<dyn UnitPipeline>,
    timeout: Duration,
}

impl InProcessExecutor {
    pub fn new(pipeline: Arc<dyn UnitPipeline>, timeout: Duration) -> Self {
        Self { pipeline, timeout }
    }
}

#[async_trait]
impl UnitExecutor for InProcessExecutor {
    async fn execute(&self, request: UnitRequest, abort: CancellationToken) -> UnitResult {
        let started = Instant::now();
        let unit_id = request.unit_id.clone();

        // Output of an earlier attempt must not pass for this one
        if let Err(e) = clear_unit_outputs(&request.artifact_path) {
            return UnitResult::failed(
                &unit_id,
                FailureKind::WorkerCrashed,
                format!("cannot prepare unit directory: {}", e),
                started.elapsed(),
            );
        }

        let mut task = {
            let pipeline = self.pipeline.clone();
            let request = request.clone();
            tokio::spawn(async move { pipeline.process(&request).await })
        };

        let outcome = tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(report)) => Ok(report),
                Ok(Err(e)) => Err((FailureKind::Pipeline, format!("{:#}", e))),
                Err(e) if e.is_panic() => {
                    Err((FailureKind::WorkerCrashed, format!("pipeline panicked: {}", e)))
                }
                Err(e) => Err((FailureKind::WorkerCrashed, e.to_string())),
            },
            _ = tokio::time::sleep(self.timeout) => {
                task.abort();
                Err((
                    FailureKind::Timeout,
                    format!("unit exceeded timeout of {}s", self.timeout.as_secs()),
                ))
            }
            _ = abort.cancelled() => {
                task.abort();
                Err((FailureKind::Aborted, "unit aborted by cancellation".to_string()))
            }
        };

        // An aborted task may still be mid-write until it is dropped
        if !task.is_finished() {
            task.abort();
            let _ = task.await;
        }

        if let Err(e) = self.pipeline.release(&request).await {
            warn!("Unit {}: pipeline release failed: {:#}", unit_id, e);
        }

        let result = match outcome {
            Ok(report) => match collect_artifact(&request, report.artifact_path).await {
                Ok(counts) => {
                    if counts.total != report.record_count {
                        info!(
                            "Unit {}: pipeline reported {} records, artifact has {}",
                            unit_id, report.record_count, counts.total
                        );
                    }
                    UnitResult::succeeded(
                        &unit_id,
                        counts,
                        request.artifact_path.clone(),
                        started.elapsed(),
                    )
                }
                Err(e) => UnitResult::failed(
                    &unit_id,
                    FailureKind::Pipeline,
                    format!("unreadable artifact: {}", e),
                    started.elapsed(),
                ),
            },
            Err((kind, message)) => UnitResult::failed(&unit_id, kind, message, started.elapsed()),
        };
        discard_partial_outputs(&result, &request.artifact_path);
        result
    }
}
