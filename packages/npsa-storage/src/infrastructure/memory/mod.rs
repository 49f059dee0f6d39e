//! In-memory StateStore (tests and embedding)

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{sort_newest_first, Checkpoint, RunId, RunMetadata, StateStore};
use crate::Result;

#[derive(Default)]
struct Records {
    checkpoints: HashMap<RunId, Checkpoint>,
    metadata: HashMap<RunId, RunMetadata>,
}

/// Process-local store; records vanish with the process.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    records: Arc<Mutex<Records>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.records
            .lock()
            .checkpoints
            .insert(checkpoint.run_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint>> {
        Ok(self.records.lock().checkpoints.get(run_id).cloned())
    }

    async fn save_metadata(&self, meta: &RunMetadata) -> Result<()> {
        self.records
            .lock()
            .metadata
            .insert(meta.run_id.clone(), meta.clone());
        Ok(())
    }

    async fn load_metadata(&self, run_id: &RunId) -> Result<Option<RunMetadata>> {
        Ok(self.records.lock().metadata.get(run_id).cloned())
    }

    async fn list_metadata(&self, include_deleted: bool) -> Result<Vec<RunMetadata>> {
        let mut runs: Vec<RunMetadata> = self
            .records
            .lock()
            .metadata
            .values()
            .filter(|m| include_deleted || !m.deleted)
            .cloned()
            .collect();
        sort_newest_first(&mut runs);
        Ok(runs)
    }
}
