use crate::aggregator::Aggregator;
use crate::artifacts::ArtifactLayout;
use crate::catalog::{normalize_domain, FileCatalog};
use crate::config::{ConfigError, RunnerConfig, StorageBackend};
use crate::controller::{ControllerSettings, RunController, RunServices, StartMode};
use crate::error::{OrchestratorError, Result};
use crate::executor::ProcessExecutor;
use crate::notify::LogNotifier;
use crate::registry::{RunHandle, RunRegistry};
use crate::run::{Run, RunSnapshot};
use crate::teardown::ProcessTreeTeardown;
use npsa_storage::{FileStateStore, RunId, RunStatus, SqliteStateStore, StateStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

const SQLITE_FILE: &str = "npsa_state.db";

/// Entry point for whatever triggers and observes runs
///
/// Every operation maps onto the run registry (live runs) or the state store
/// (history). Without run services the orchestrator only serves history.
pub struct RunOrchestrator {
    store: Arc<dyn StateStore>,
    layout: ArtifactLayout,
    registry: Arc<RunRegistry>,
    services: Option<Arc<RunServices>>,
}

impl RunOrchestrator {
    pub fn new(services: RunServices, registry: Arc<RunRegistry>) -> Self {
        Self {
            store: services.store.clone(),
            layout: services.aggregator.layout().clone(),
            registry,
            services: Some(Arc::new(services)),
        }
    }

    /// History operations only; starting or resuming runs fails.
    pub fn read_only(store: Arc<dyn StateStore>, layout: ArtifactLayout) -> Self {
        Self {
            store,
            layout,
            registry: Arc::new(RunRegistry::new()),
            services: None,
        }
    }

    /// Production wiring: configured store, file catalog, one OS process per unit.
    pub fn from_config(config: &RunnerConfig) -> Result<Self> {
        let store = open_store(config)?;
        let layout = ArtifactLayout::new(&config.runs_dir);

        let Some(worker) = config.worker.clone() else {
            return Ok(Self::read_only(store, layout));
        };

        let teardown = Arc::new(ProcessTreeTeardown::new(config.unit.teardown_grace()));
        let catalog =
            FileCatalog::new(&config.catalog.dir).with_variant(config.catalog.variant.clone());
        let services = RunServices {
            store,
            catalog: Arc::new(catalog),
            executor: Arc::new(ProcessExecutor::new(worker, config.unit.clone(), teardown)),
            aggregator: Arc::new(Aggregator::new(layout, &config.aggregation)),
            notifier: Arc::new(LogNotifier),
            settings: ControllerSettings::from_config(config),
        };
        Ok(Self::new(services, Arc::new(RunRegistry::new())))
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    fn services(&self) -> Result<&Arc<RunServices>> {
        self.services.as_ref().ok_or_else(|| {
            ConfigError::invalid("worker.program", "no worker command configured").into()
        })
    }

    /// Start a new run over every unit of `domain`.
    pub async fn start_run(&self, domain: &str) -> Result<RunId> {
        let services = self.services()?;
        let domain = domain.trim();
        normalize_domain(domain)?;

        let run_id = RunId::parse(Uuid::new_v4().to_string())?;
        let run = Run::new(
            run_id.clone(),
            domain,
            Vec::new(),
            services.settings.pool.parallelism,
            services.settings.eta,
        );
        let handle = Arc::new(RunHandle::new(run, None));
        self.registry.register(handle.clone())?;

        if let Err(e) = self.store.save_metadata(&handle.metadata()).await {
            self.registry.remove(&run_id);
            return Err(e.into());
        }

        info!("Run {}: created for {}", run_id, domain);
        self.spawn_controller(services.clone(), handle, StartMode::Fresh);
        Ok(run_id)
    }

    /// Continue a stopped run from its checkpoint. Units already done are never
    /// executed again.
    pub async fn resume_run(&self, run_id: &RunId) -> Result<()> {
        let services = self.services()?;
        if self.registry.is_active(run_id) {
            return Err(OrchestratorError::RunAlreadyActive(run_id.to_string()));
        }

        let meta = self
            .store
            .load_metadata(run_id)
            .await?
            .filter(|m| !m.deleted)
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;
        if meta.status == RunStatus::Completed {
            return Err(OrchestratorError::RunAlreadyCompleted(run_id.to_string()));
        }
        let checkpoint = self
            .store
            .load_checkpoint(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::CheckpointNotFound(run_id.to_string()))?;

        let mut run = Run::new(
            run_id.clone(),
            checkpoint.domain.clone(),
            Vec::new(),
            services.settings.pool.parallelism,
            services.settings.eta,
        );
        run.created_at = meta.created_at;
        info!(
            "Run {}: resume requested from {} ({}/{} units in checkpoint)",
            run_id,
            meta.status,
            checkpoint.completed_units.len(),
            checkpoint.total_units
        );

        let handle = Arc::new(RunHandle::new(run, Some(meta)));
        self.registry.register(handle.clone())?;
        self.spawn_controller(services.clone(), handle, StartMode::Resume(checkpoint));
        Ok(())
    }

    /// Raise the cooperative cancellation flag of a running run.
    pub fn cancel_run(&self, run_id: &RunId) -> Result<()> {
        let handle = self
            .registry
            .get(run_id)
            .filter(|h| !h.is_finished())
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;

        let status = handle.status();
        if status != RunStatus::Running {
            return Err(OrchestratorError::InvalidStateTransition {
                from: status.to_string(),
                to: RunStatus::Cancelled.to_string(),
            });
        }
        handle.request_cancel();
        info!("Run {}: cancellation requested", run_id);
        Ok(())
    }

    /// Live view when the run is known to this process, persisted view otherwise.
    pub async fn status(&self, run_id: &RunId) -> Result<RunSnapshot> {
        if let Some(handle) = self.registry.get(run_id) {
            return Ok(handle.snapshot());
        }
        let meta = self
            .store
            .load_metadata(run_id)
            .await?
            .filter(|m| !m.deleted)
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;
        Ok(RunSnapshot::from_metadata(&meta))
    }

    /// Run history, newest first.
    pub async fn list_runs(&self, include_deleted: bool) -> Result<Vec<RunSnapshot>> {
        let mut runs: Vec<RunSnapshot> = self
            .store
            .list_metadata(include_deleted)
            .await?
            .iter()
            .map(|meta| match self.registry.get(&meta.run_id) {
                Some(handle) => handle.snapshot(),
                None => RunSnapshot::from_metadata(meta),
            })
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    /// Soft delete: the history record stays, flagged as deleted.
    pub async fn delete_run(&self, run_id: &RunId) -> Result<()> {
        if self.registry.is_active(run_id) {
            return Err(OrchestratorError::RunAlreadyActive(run_id.to_string()));
        }
        let mut meta = self
            .store
            .load_metadata(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;

        meta.deleted = true;
        meta.touch();
        self.store.save_metadata(&meta).await?;
        self.registry.remove(run_id);
        info!("Run {}: deleted", run_id);
        Ok(())
    }

    pub async fn archive_run(&self, run_id: &RunId, archived: bool) -> Result<()> {
        let mut meta = self
            .store
            .load_metadata(run_id)
            .await?
            .filter(|m| !m.deleted)
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;

        match self.registry.get(run_id) {
            Some(handle) => {
                handle.set_archived(archived);
                handle.persist_metadata(self.store.as_ref()).await?;
            }
            None => {
                meta.archived = archived;
                meta.touch();
                self.store.save_metadata(&meta).await?;
            }
        }
        Ok(())
    }

    /// Path of the final artifact; only available once the run is finalizing or
    /// completed and the file exists.
    pub async fn final_artifact(&self, run_id: &RunId) -> Result<PathBuf> {
        let snapshot = self.status(run_id).await?;
        if !matches!(
            snapshot.status,
            RunStatus::Finalizing | RunStatus::Completed
        ) {
            return Err(OrchestratorError::Artifact(format!(
                "Run {} has no final artifact yet ({})",
                run_id, snapshot.status
            )));
        }

        let path = snapshot
            .final_artifact_path
            .unwrap_or_else(|| self.layout.final_artifact(run_id, &snapshot.domain));
        if !path.is_file() {
            return Err(OrchestratorError::Artifact(format!(
                "Final artifact of run {} is missing: {}",
                run_id,
                path.display()
            )));
        }
        Ok(path)
    }

    /// Wait for the controller of `run_id` to stop; returns the final status.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunStatus> {
        let handle = self
            .registry
            .get(run_id)
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;
        handle.wait_finished().await;
        Ok(handle.status())
    }

    fn spawn_controller(
        &self,
        services: Arc<RunServices>,
        handle: Arc<RunHandle>,
        mode: StartMode,
    ) {
        let controller = RunController::new(handle.clone(), services);
        tokio::spawn(async move {
            let driven = tokio::spawn(async move { controller.drive(mode).await }).await;
            if let Err(e) = driven {
                error!("Run {}: controller task failed: {}", handle.run_id(), e);
                handle.mark_finished();
            }
        });
    }
}

fn open_store(config: &RunnerConfig) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.storage.backend {
        StorageBackend::File => Arc::new(FileStateStore::open(&config.state_dir)?),
        StorageBackend::Sqlite => {
            Arc::new(SqliteStateStore::open(config.state_dir.join(SQLITE_FILE))?)
        }
    };
    Ok(store)
}
