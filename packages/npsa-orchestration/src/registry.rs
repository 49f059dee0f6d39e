//! Registry of runs known to this process
//!
//! Created once at startup and passed by reference to whatever drives runs. Entries
//! stay after a run finishes so its last live state remains observable; they are
//! only removed by a soft delete.

use crate::checkpoint::CheckpointManager;
use crate::error::{OrchestratorError, Result};
use crate::run::{Run, RunSnapshot};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use npsa_storage::{Checkpoint, RunId, RunMetadata, RunStatus, StateStore};
use parking_lot::{Mutex, MutexGuard};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Shared handle on one run
///
/// The live [`Run`] is only mutated under its lock, which is never held across
/// an await point.
pub struct RunHandle {
    run_id: RunId,
    state: Mutex<Run>,
    /// Persisted record the run started from; supplies creation time and flags
    previous: Mutex<Option<RunMetadata>>,
    /// Writer of the controller driving this run; every persisted write goes
    /// through it once attached
    writer: OnceLock<Arc<CheckpointManager>>,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl RunHandle {
    pub fn new(run: Run, previous: Option<RunMetadata>) -> Self {
        Self {
            run_id: run.run_id.clone(),
            state: Mutex::new(run),
            previous: Mutex::new(previous),
            writer: OnceLock::new(),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Run> {
        self.state.lock()
    }

    pub fn status(&self) -> RunStatus {
        self.state.lock().status
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let run = self.state.lock();
        let previous = self.previous.lock();
        let mut snapshot = run.snapshot();
        if let Some(meta) = previous.as_ref() {
            snapshot.archived = meta.archived;
            snapshot.deleted = meta.deleted;
        }
        snapshot
    }

    /// Current checkpoint and metadata projection, taken atomically.
    pub fn projection(&self) -> (Checkpoint, RunMetadata) {
        let run = self.state.lock();
        let previous = self.previous.lock();
        (run.checkpoint(), run.metadata(previous.as_ref()))
    }

    pub fn metadata(&self) -> RunMetadata {
        self.projection().1
    }

    pub fn set_archived(&self, archived: bool) {
        // Same lock order as `projection`: state, then previous
        let run = self.state.lock();
        let mut previous = self.previous.lock();
        match previous.as_mut() {
            Some(meta) => meta.archived = archived,
            None => {
                let mut meta = run.metadata(None);
                meta.archived = archived;
                *previous = Some(meta);
            }
        }
    }

    pub(crate) fn attach_writer(&self, writer: Arc<CheckpointManager>) {
        if self.writer.set(writer).is_err() {
            warn!("Run {}: writer already attached", self.run_id);
        }
    }

    /// Persist the current metadata, serialized with the controller's writes.
    /// The projection is taken under the writer lock, so it is never older than
    /// a write that precedes it.
    pub async fn persist_metadata(&self, store: &dyn StateStore) -> Result<()> {
        match self.writer.get() {
            Some(writer) => writer.save_metadata(|| self.metadata()).await,
            None => Ok(store.save_metadata(&self.metadata()).await?),
        }
    }

    /// Raise the cooperative cancellation flag.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Resolves once the controller driving this run has stopped.
    pub async fn wait_finished(&self) {
        self.finished.cancelled().await
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.cancel();
    }
}

#[derive(Default)]
pub struct RunRegistry {
    runs: DashMap<RunId, Arc<RunHandle>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle`, replacing a finished entry for the same id. Fails while
    /// another controller still drives that run.
    pub fn register(&self, handle: Arc<RunHandle>) -> Result<()> {
        match self.runs.entry(handle.run_id().clone()) {
            Entry::Occupied(entry) if !entry.get().is_finished() => Err(
                OrchestratorError::RunAlreadyActive(handle.run_id().to_string()),
            ),
            Entry::Occupied(mut entry) => {
                entry.insert(handle);
                Ok(())
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
                Ok(())
            }
        }
    }

    pub fn get(&self, run_id: &RunId) -> Option<Arc<RunHandle>> {
        self.runs.get(run_id).map(|entry| entry.value().clone())
    }

    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.get(run_id).map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Runs whose controller is still going
    pub fn active(&self) -> Vec<Arc<RunHandle>> {
        self.runs
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn remove(&self, run_id: &RunId) -> Option<Arc<RunHandle>> {
        self.runs.remove(run_id).map(|(_, handle)| handle)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::EtaPolicy;

    fn handle(id: &str) -> Arc<RunHandle> {
        let run = Run::new(
            RunId::parse(id).unwrap(),
            "ohio",
            vec!["A".to_string()],
            1,
            EtaPolicy::default(),
        );
        Arc::new(RunHandle::new(run, None))
    }

    #[test]
    fn test_register_refuses_active_duplicate() {
        let registry = RunRegistry::new();
        registry.register(handle("r1")).unwrap();

        assert!(matches!(
            registry.register(handle("r1")),
            Err(OrchestratorError::RunAlreadyActive(_))
        ));
        assert_eq!(registry.active().len(), 1);
    }

    #[test]
    fn test_finished_entry_can_be_replaced() {
        let registry = RunRegistry::new();
        let first = handle("r1");
        registry.register(first.clone()).unwrap();
        first.mark_finished();

        assert!(!registry.is_active(first.run_id()));
        let second = handle("r1");
        registry.register(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&registry.get(first.run_id()).unwrap(), &second));
    }

    #[test]
    fn test_archive_flag_flows_into_projection() {
        let h = handle("r1");
        h.set_archived(true);
        assert!(h.metadata().archived);
        h.set_archived(false);
        assert!(!h.metadata().archived);
    }

    #[tokio::test]
    async fn test_wait_finished() {
        let h = handle("r1");
        let waiter = {
            let h = h.clone();
            tokio::spawn(async move { h.wait_finished().await })
        };
        h.mark_finished();
        waiter.await.unwrap();
        assert!(h.is_finished());
    }
}
