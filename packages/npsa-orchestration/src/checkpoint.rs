use crate::error::Result;
use npsa_storage::{Checkpoint, RunMetadata, StateStore};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct WriterState {
    since_last_write: usize,
    /// A previous write failed; retry on the next completion regardless of cadence
    retry_pending: bool,
}

/// Checkpoint manager
///
/// Serializes all checkpoint/metadata writers of a run and applies the persist
/// cadence. The snapshot to write is taken while the writer lock is held, so a
/// slower writer can never replace a newer checkpoint with an older one.
pub struct CheckpointManager {
    store: Arc<dyn StateStore>,
    every: usize,
    writer: Mutex<WriterState>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn StateStore>, every: usize) -> Self {
        Self {
            store,
            every: every.max(1),
            writer: Mutex::new(WriterState::default()),
        }
    }

    /// Record one completion; persists when the cadence is reached or a previous
    /// write failed. Write failures are logged, never returned.
    pub async fn on_completion<F>(&self, snapshot: F) -> bool
    where
        F: FnOnce() -> (Checkpoint, RunMetadata) + Send,
    {
        let mut state = self.writer.lock().await;
        state.since_last_write += 1;
        if state.since_last_write < self.every && !state.retry_pending {
            return false;
        }

        let (checkpoint, meta) = snapshot();
        self.write_locked(&mut state, &checkpoint, &meta).await
    }

    /// Persist now, regardless of cadence.
    pub async fn persist<F>(&self, snapshot: F) -> Result<()>
    where
        F: FnOnce() -> (Checkpoint, RunMetadata) + Send,
    {
        let mut state = self.writer.lock().await;
        let (checkpoint, meta) = snapshot();

        let written = async {
            self.store.save_checkpoint(&checkpoint).await?;
            self.store.save_metadata(&meta).await
        }
        .await;

        match written {
            Ok(()) => {
                state.since_last_write = 0;
                state.retry_pending = false;
                Ok(())
            }
            Err(e) => {
                state.retry_pending = true;
                Err(e.into())
            }
        }
    }

    /// [`persist`](Self::persist), logging instead of returning the error.
    pub async fn persist_best_effort<F>(&self, snapshot: F) -> bool
    where
        F: FnOnce() -> (Checkpoint, RunMetadata) + Send,
    {
        let mut state = self.writer.lock().await;
        let (checkpoint, meta) = snapshot();
        self.write_locked(&mut state, &checkpoint, &meta).await
    }

    /// Metadata only (status changes after the unit phase, display flags)
    pub async fn save_metadata<F>(&self, snapshot: F) -> Result<()>
    where
        F: FnOnce() -> RunMetadata + Send,
    {
        let _state = self.writer.lock().await;
        let meta = snapshot();
        self.store.save_metadata(&meta).await?;
        Ok(())
    }

    async fn write_locked(
        &self,
        state: &mut WriterState,
        checkpoint: &Checkpoint,
        meta: &RunMetadata,
    ) -> bool {
        if let Err(e) = self.store.save_checkpoint(checkpoint).await {
            warn!(
                "Run {}: checkpoint write failed, retrying on next completion: {}",
                checkpoint.run_id, e
            );
            state.retry_pending = true;
            return false;
        }
        if let Err(e) = self.store.save_metadata(meta).await {
            warn!(
                "Run {}: metadata write failed, retrying on next completion: {}",
                meta.run_id, e
            );
            state.retry_pending = true;
            return false;
        }

        debug!(
            "Run {}: checkpoint saved ({}/{} units)",
            checkpoint.run_id,
            checkpoint.completed_units.len(),
            checkpoint.total_units
        );
        state.since_last_write = 0;
        state.retry_pending = false;
        true
    }
}

/// Result of reconciling a checkpoint against the unit artifacts on disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub completed: HashSet<String>,
    pub from_checkpoint: usize,
    /// Units whose artifact exists although the checkpoint does not list them
    pub recovered: Vec<String>,
}

/// An existing unit artifact is authoritative: the unit counts as completed even
/// if the checkpoint write for it never happened.
pub fn reconcile<F>(
    units: &[String],
    checkpoint: Option<&Checkpoint>,
    has_artifact: F,
) -> Reconciliation
where
    F: Fn(&str) -> bool,
{
    let known: HashSet<&String> = units.iter().collect();
    let mut completed: HashSet<String> = checkpoint
        .map(|ck| {
            ck.completed_units
                .iter()
                .filter(|u| known.contains(u))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    let from_checkpoint = completed.len();

    let mut recovered = Vec::new();
    for unit in units {
        if !completed.contains(unit) && has_artifact(unit) {
            completed.insert(unit.clone());
            recovered.push(unit.clone());
        }
    }

    Reconciliation {
        completed,
        from_checkpoint,
        recovered,
    }
}
