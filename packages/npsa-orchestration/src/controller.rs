//! Run controller: drives one run from its unit phase to a terminal state
//!
//! ```text
//! running ──all units accounted for──▶ finalizing ──cooldown──▶ completed
//!    │
//!    ├──cancellation──▶ cancelled
//!    └──catalog / store / aggregation failure──▶ error
//! ```

use crate::aggregator::Aggregator;
use crate::catalog::UnitCatalog;
use crate::checkpoint::{reconcile, CheckpointManager};
use crate::config::RunnerConfig;
use crate::error::{FailureKind, OrchestratorError, Result};
use crate::executor::{UnitExecutor, UnitRequest, UnitResult};
use crate::notify::{RunNotifier, RunSummary};
use crate::pool::{PoolOptions, ResultSink, WorkerPool};
use crate::registry::RunHandle;
use crate::run::{EtaPolicy, Run, RunStateMachine};
use async_trait::async_trait;
use npsa_storage::{Checkpoint, RunStatus, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Tunables shared by every controller of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub pool: PoolOptions,
    pub checkpoint_every: usize,
    pub cooldown: Duration,
    pub eta: EtaPolicy,
}

impl ControllerSettings {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            pool: PoolOptions::from(&config.pool),
            checkpoint_every: config.checkpoint.every,
            cooldown: config.finalize.cooldown(),
            eta: EtaPolicy {
                default_unit: Duration::from_secs(config.eta.default_unit_secs),
                window: config.eta.window,
            },
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default())
    }
}

/// Collaborators of a controller
pub struct RunServices {
    pub store: Arc<dyn StateStore>,
    pub catalog: Arc<dyn UnitCatalog>,
    pub executor: Arc<dyn UnitExecutor>,
    pub aggregator: Arc<Aggregator>,
    pub notifier: Arc<dyn RunNotifier>,
    pub settings: ControllerSettings,
}

#[derive(Debug, Clone)]
pub enum StartMode {
    Fresh,
    Resume(Checkpoint),
}

impl StartMode {
    fn verb(&self) -> &'static str {
        match self {
            StartMode::Fresh => "starting",
            StartMode::Resume(_) => "resuming",
        }
    }
}

enum UnitPhase {
    AllAccountedFor,
    Cancelled,
}

pub struct RunController {
    handle: Arc<RunHandle>,
    services: Arc<RunServices>,
    checkpoints: Arc<CheckpointManager>,
}

impl RunController {
    pub fn new(handle: Arc<RunHandle>, services: Arc<RunServices>) -> Self {
        let checkpoints = Arc::new(CheckpointManager::new(
            services.store.clone(),
            services.settings.checkpoint_every,
        ));
        handle.attach_writer(checkpoints.clone());
        Self {
            handle,
            services,
            checkpoints,
        }
    }

    pub fn handle(&self) -> &Arc<RunHandle> {
        &self.handle
    }

    /// Drive the run to a terminal state and return it. Never fails: controller
    /// errors end the run in [`RunStatus::Error`].
    pub async fn drive(&self, mode: StartMode) -> RunStatus {
        let outcome = match self.run_units(mode).await {
            Ok(UnitPhase::AllAccountedFor) => self.finalize().await,
            Ok(UnitPhase::Cancelled) => {
                self.finish_cancelled().await;
                Ok(())
            }
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            self.finish_error(e).await;
        }

        let status = self.handle.status();
        self.handle.mark_finished();
        debug!("Run {}: controller stopped in {}", self.handle.run_id(), status);
        status
    }

    async fn run_units(&self, mode: StartMode) -> Result<UnitPhase> {
        let run_id = self.handle.run_id().clone();
        let domain = self.handle.lock().domain.clone();
        let layout = self.services.aggregator.layout().clone();

        let units = self.services.catalog.load_units(&domain).await?;
        let checkpoint = match &mode {
            StartMode::Fresh => None,
            StartMode::Resume(checkpoint) => Some(checkpoint),
        };
        let reconciled = reconcile(&units, checkpoint, |u| layout.has_unit_artifact(&run_id, u));
        for unit in &reconciled.recovered {
            info!(
                "Run {}: unit {} has an artifact but no checkpoint entry, treating as done",
                run_id, unit
            );
        }

        // Successful units always leave an artifact; a completed unit without one failed
        let failed_before: Vec<String> = reconciled
            .completed
            .iter()
            .filter(|u| !layout.has_unit_artifact(&run_id, u))
            .cloned()
            .collect();

        let total = units.len();
        let remaining = {
            let mut run = self.handle.lock();
            run.units = Arc::new(units);
            run.restore_completed(reconciled.completed);
            run.restore_failed(failed_before);
            run.message = format!("{} of {} units remaining", run.remaining().len(), total);
            run.remaining()
        };
        info!(
            "Run {}: {} {} with {} units ({} from checkpoint, {} recovered, {} remaining)",
            run_id,
            mode.verb(),
            domain,
            total,
            reconciled.from_checkpoint,
            reconciled.recovered.len(),
            remaining.len()
        );

        self.checkpoints.persist(|| self.handle.projection()).await?;

        if !remaining.is_empty() {
            let requests: Vec<UnitRequest> = remaining
                .into_iter()
                .map(|unit_id| UnitRequest {
                    run_id: run_id.clone(),
                    domain: domain.clone(),
                    artifact_path: layout.unit_artifact(&run_id, &unit_id),
                    unit_id,
                })
                .collect();

            let pool = WorkerPool::new(self.services.executor.clone(), self.services.settings.pool);
            let summary = pool.run(requests, self.handle.cancel_token(), self).await;
            debug!(
                "Run {}: pool finished ({} dispatched, {} skipped)",
                run_id, summary.dispatched, summary.skipped
            );
        }

        let run = self.handle.lock();
        if run.all_accounted_for() {
            Ok(UnitPhase::AllAccountedFor)
        } else if self.handle.cancel_token().is_cancelled() {
            Ok(UnitPhase::Cancelled)
        } else {
            Err(OrchestratorError::Other(anyhow::anyhow!(
                "{} unit(s) neither completed nor failed",
                run.remaining().len()
            )))
        }
    }

    async fn finalize(&self) -> Result<()> {
        let run_id = self.handle.run_id().clone();
        self.checkpoints
            .persist_best_effort(|| self.handle.projection())
            .await;

        let (domain, units, failed) = {
            let run = self.handle.lock();
            (run.domain.clone(), run.units.clone(), run.failed.clone())
        };
        let outcome = self
            .services
            .aggregator
            .aggregate(&run_id, &domain, &units, &failed)
            .await?;

        {
            let mut run = self.handle.lock();
            run.records_found = outcome.counts.total;
            run.records_with_channel = outcome.counts.with_channel;
            run.records_without_channel = outcome.counts.without_channel;
            RunStateMachine::new(&mut run).finalize(outcome.final_artifact_path.clone())?;
        }
        self.save_metadata().await;

        let cooldown = self.services.settings.cooldown;
        info!(
            "Run {}: running -> finalizing, completing in {}s",
            run_id,
            cooldown.as_secs()
        );
        tokio::time::sleep(cooldown).await;

        let summary = {
            let mut run = self.handle.lock();
            RunStateMachine::new(&mut run).complete()?;
            summary_of(&run)
        };
        self.save_metadata().await;
        info!(
            "Run {}: finalizing -> completed ({} records, {} with email)",
            run_id, summary.records, summary.records_with_channel
        );

        match self.services.notifier.run_completed(&summary).await {
            Ok(()) => info!("Run {}: completion notification sent", run_id),
            Err(e) => warn!("Run {}: completion notification failed: {:#}", run_id, e),
        }
        Ok(())
    }

    async fn finish_cancelled(&self) {
        let run_id = self.handle.run_id();
        {
            let mut run = self.handle.lock();
            if let Err(e) = RunStateMachine::new(&mut run).cancel() {
                warn!("Run {}: {}", run_id, e);
            }
        }

        let (checkpoint, _) = self.handle.projection();
        if self
            .checkpoints
            .persist_best_effort(|| self.handle.projection())
            .await
        {
            info!(
                "Run {}: running -> cancelled, checkpoint holds {}/{} units",
                run_id,
                checkpoint.completed_units.len(),
                checkpoint.total_units
            );
        } else {
            warn!("Run {}: running -> cancelled, checkpoint not saved", run_id);
        }
    }

    async fn finish_error(&self, e: OrchestratorError) {
        let run_id = self.handle.run_id();
        error!("Run {} failed: {}", run_id, e);
        {
            let mut run = self.handle.lock();
            if let Err(transition) = RunStateMachine::new(&mut run).fail(e.to_string()) {
                warn!("Run {}: {}", run_id, transition);
            }
        }
        self.checkpoints
            .persist_best_effort(|| self.handle.projection())
            .await;
    }

    async fn save_metadata(&self) {
        if let Err(e) = self.checkpoints.save_metadata(|| self.handle.metadata()).await {
            warn!("Run {}: metadata write failed: {}", self.handle.run_id(), e);
        }
    }
}

#[async_trait]
impl ResultSink for RunController {
    async fn on_dispatch(&self, request: &UnitRequest) {
        self.handle.lock().mark_dispatched(&request.unit_id);
        info!("Run {}: unit {} started", request.run_id, request.unit_id);
    }

    async fn on_result(&self, result: UnitResult) {
        let run_id = self.handle.run_id();
        let secs = result.duration.as_secs_f64();
        match (result.success, result.failure) {
            (true, _) => info!(
                "Run {}: unit {} finished in {:.1}s with {} records ({} with email)",
                run_id, result.unit_id, secs, result.record_count, result.records_with_channel
            ),
            (false, Some(FailureKind::Aborted)) => warn!(
                "Run {}: unit {} aborted after {:.1}s, left for resume",
                run_id, result.unit_id, secs
            ),
            (false, kind) => warn!(
                "Run {}: unit {} failed ({}) after {:.1}s: {}",
                run_id,
                result.unit_id,
                kind.unwrap_or(FailureKind::Pipeline),
                secs,
                result.error.as_deref().unwrap_or("unknown error")
            ),
        }

        let progress = {
            let mut run = self.handle.lock();
            run.record_result(&result)
                .then(|| (run.completed.len(), run.units.len(), run.eta()))
        };

        if let Some((done, total, eta)) = progress {
            info!(
                "Run {}: {}/{} units done, ETA {}m",
                run_id,
                done,
                total,
                eta.as_secs() / 60
            );
            self.checkpoints
                .on_completion(|| self.handle.projection())
                .await;
        }
    }
}

fn summary_of(run: &Run) -> RunSummary {
    let finished = run.completed_at.unwrap_or(run.updated_at);
    RunSummary {
        run_id: run.run_id.clone(),
        domain: run.domain.clone(),
        units_processed: run.completed.len(),
        total_units: run.units.len(),
        failed_units: run.failed.len(),
        records: run.records_found,
        records_with_channel: run.records_with_channel,
        records_without_channel: run.records_without_channel,
        final_artifact_path: run.final_artifact_path.clone(),
        duration: (finished - run.created_at).to_std().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactLayout;
    use crate::catalog::StaticCatalog;
    use crate::config::AggregationConfig;
    use crate::executor::{InProcessExecutor, PipelineReport, UnitPipeline};
    use crate::notify::LogNotifier;
    use crate::record::{write_records, Record};
    use npsa_storage::{MemoryStateStore, RunId};
    use tempfile::TempDir;

    struct OneRecord;

    #[async_trait]
    impl UnitPipeline for OneRecord {
        async fn process(&self, request: &UnitRequest) -> anyhow::Result<PipelineReport> {
            let record = Record {
                first_name: request.unit_id.clone(),
                last_name: "Doe".to_string(),
                contact_channel: Some(format!("{}@example.org", request.unit_id)),
                ..Default::default()
            };
            write_records(&request.artifact_path, &[record])?;
            Ok(PipelineReport {
                record_count: 1,
                artifact_path: None,
            })
        }
    }

    fn services(dir: &TempDir, catalog: StaticCatalog) -> (Arc<RunServices>, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        let aggregator = Aggregator::new(
            ArtifactLayout::new(dir.path()),
            &AggregationConfig {
                wait_secs: 0,
                poll_ms: 10,
            },
        );
        let settings = ControllerSettings {
            pool: PoolOptions {
                dispatch_pause: Duration::ZERO,
                ..PoolOptions::default()
            },
            cooldown: Duration::ZERO,
            ..ControllerSettings::default()
        };
        let services = RunServices {
            store: store.clone(),
            catalog: Arc::new(catalog),
            executor: Arc::new(InProcessExecutor::new(
                Arc::new(OneRecord),
                Duration::from_secs(60),
            )),
            aggregator: Arc::new(aggregator),
            notifier: Arc::new(LogNotifier),
            settings,
        };
        (Arc::new(services), store)
    }

    fn handle(id: &str) -> Arc<RunHandle> {
        let run = Run::new(RunId::parse(id).unwrap(), "ohio", Vec::new(), 1, EtaPolicy::default());
        Arc::new(RunHandle::new(run, None))
    }

    #[tokio::test]
    async fn test_fresh_run_completes() {
        let dir = TempDir::new().unwrap();
        let (services, store) = services(&dir, StaticCatalog::new(["A", "B"]));
        let controller = RunController::new(handle("r1"), services);

        assert_eq!(controller.drive(StartMode::Fresh).await, RunStatus::Completed);

        let run_id = RunId::parse("r1").unwrap();
        let meta = store.load_metadata(&run_id).await.unwrap().unwrap();
        assert_eq!(meta.status, RunStatus::Completed);
        assert_eq!(meta.records_found, 2);
        assert!(meta.final_artifact_path.is_some());
        assert!(controller.handle().is_finished());
    }

    #[tokio::test]
    async fn test_catalog_failure_ends_in_error() {
        let dir = TempDir::new().unwrap();
        let (services, store) = services(&dir, StaticCatalog::new(Vec::<String>::new()));
        let controller = RunController::new(handle("r1"), services);

        assert_eq!(controller.drive(StartMode::Fresh).await, RunStatus::Error);

        let run_id = RunId::parse("r1").unwrap();
        let meta = store.load_metadata(&run_id).await.unwrap().unwrap();
        assert_eq!(meta.status, RunStatus::Error);
        assert!(meta.error.unwrap().contains("No units"));
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch() {
        let dir = TempDir::new().unwrap();
        let (services, store) = services(&dir, StaticCatalog::new(["A", "B"]));
        let h = handle("r1");
        h.request_cancel();
        let controller = RunController::new(h, services);

        assert_eq!(controller.drive(StartMode::Fresh).await, RunStatus::Cancelled);

        let run_id = RunId::parse("r1").unwrap();
        let ck = store.load_checkpoint(&run_id).await.unwrap().unwrap();
        assert!(ck.completed_units.is_empty());
        assert_eq!(ck.total_units, 2);
    }
}
