/*
 * NPSA Orchestration - batch run orchestrator for per-county lead extraction
 *
 * Runs one long batch job per domain (state) over its ordered units (counties):
 * - Run state machine (running → finalizing → completed | error | cancelled)
 * - Checkpoint/resume with artifact reconciliation
 * - Worker pool, one disposable OS process per unit with process-tree teardown
 * - Aggregation of unit artifacts with deterministic dedup
 *
 * The per-unit extraction pipeline, enrichment and notification are external
 * collaborators behind traits.
 */

// Public modules
pub mod aggregator;
pub mod artifacts;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod dedup;
pub mod enrich;
pub mod error;
pub mod executor;
pub mod notify;
pub mod orchestrator;
pub mod pool;
pub mod record;
pub mod registry;
pub mod run;
pub mod teardown;

// Re-exports
pub use aggregator::{AggregationOutcome, Aggregator};
pub use artifacts::ArtifactLayout;
pub use catalog::{FileCatalog, StaticCatalog, UnitCatalog};
pub use checkpoint::{reconcile, CheckpointManager, Reconciliation};
pub use config::{CancelPolicy, ConfigError, RunnerConfig, StorageBackend};
pub use controller::{ControllerSettings, RunController, RunServices, StartMode};
pub use dedup::{dedup_records, Deduped};
pub use enrich::{Enricher, StaticEnricher};
pub use error::{FailureKind, OrchestratorError, Result};
pub use executor::{
    InProcessExecutor, PipelineReport, ProcessExecutor, UnitExecutor, UnitPipeline, UnitRequest,
    UnitResult,
};
pub use notify::{LogNotifier, RunNotifier, RunSummary};
pub use orchestrator::RunOrchestrator;
pub use pool::{PoolOptions, PoolSummary, ResultSink, WorkerPool};
pub use record::{Record, RecordCounts};
pub use registry::{RunHandle, RunRegistry};
pub use run::{EtaPolicy, Run, RunSnapshot, RunStateMachine};
pub use teardown::{IsolationTeardown, NoopTeardown, ProcessTreeTeardown, WorkerHandle};

pub use npsa_storage::{Checkpoint, RunId, RunMetadata, RunStatus, StateStore};
