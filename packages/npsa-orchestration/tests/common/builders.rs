use super::ScriptedPipeline;
use npsa_orchestration::config::AggregationConfig;
use npsa_orchestration::{
    Aggregator, ArtifactLayout, CancelPolicy, ControllerSettings, InProcessExecutor, LogNotifier,
    PoolOptions, RunId, RunNotifier, RunOrchestrator, RunRegistry, RunServices, RunStatus,
    StateStore, StaticCatalog,
};
use npsa_storage::MemoryStateStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Everything that survives a simulated process restart: the run directory and
/// the state store.
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<dyn StateStore>,
    pub units: Vec<String>,
    pub parallelism: usize,
    pub cancel_policy: CancelPolicy,
    pub checkpoint_every: usize,
    pub notifier: Arc<dyn RunNotifier>,
}

impl Harness {
    pub fn new(units: &[&str]) -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            store: Arc::new(MemoryStateStore::new()),
            units: super::units(units),
            parallelism: 1,
            cancel_policy: CancelPolicy::Drain,
            checkpoint_every: 1,
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn cancel_policy(mut self, policy: CancelPolicy) -> Self {
        self.cancel_policy = policy;
        self
    }

    pub fn checkpoint_every(mut self, every: usize) -> Self {
        self.checkpoint_every = every;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn RunNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn layout(&self) -> ArtifactLayout {
        ArtifactLayout::new(self.dir.path())
    }

    pub fn services(&self, pipeline: Arc<ScriptedPipeline>) -> RunServices {
        let aggregator = Aggregator::new(
            self.layout(),
            &AggregationConfig {
                wait_secs: 0,
                poll_ms: 10,
            },
        );
        RunServices {
            store: self.store.clone(),
            catalog: Arc::new(StaticCatalog::new(self.units.clone())),
            executor: Arc::new(InProcessExecutor::new(pipeline, Duration::from_secs(600))),
            aggregator: Arc::new(aggregator),
            notifier: self.notifier.clone(),
            settings: ControllerSettings {
                pool: PoolOptions {
                    parallelism: self.parallelism,
                    dispatch_pause: Duration::ZERO,
                    cancel_policy: self.cancel_policy,
                },
                checkpoint_every: self.checkpoint_every,
                cooldown: Duration::ZERO,
                ..ControllerSettings::default()
            },
        }
    }

    /// A fresh process: new registry, same store and run directory.
    pub fn orchestrator(
        &self,
        pipeline: Arc<ScriptedPipeline>,
        registry: Arc<RunRegistry>,
    ) -> RunOrchestrator {
        RunOrchestrator::new(self.services(pipeline), registry)
    }
}

pub async fn start_and_wait(orchestrator: &RunOrchestrator, domain: &str) -> (RunId, RunStatus) {
    let run_id = orchestrator.start_run(domain).await.unwrap();
    let status = orchestrator.wait(&run_id).await.unwrap();
    (run_id, status)
}

pub async fn resume_and_wait(orchestrator: &RunOrchestrator, run_id: &RunId) -> RunStatus {
    orchestrator.resume_run(run_id).await.unwrap();
    orchestrator.wait(run_id).await.unwrap()
}
