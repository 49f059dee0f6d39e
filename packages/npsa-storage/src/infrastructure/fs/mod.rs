//! File-backed StateStore
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<run_id>/checkpoint.json
//! <root>/<run_id>/metadata.json
//! ```
//!
//! Each record is written to a temporary file in the same directory, fsynced and
//! renamed over the target, so readers only ever see complete records.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::domain::{sort_newest_first, Checkpoint, RunId, RunMetadata, StateStore};
use crate::{Result, StorageError};

const CHECKPOINT_FILE: &str = "checkpoint.json";
const METADATA_FILE: &str = "metadata.json";

/// JSON files on local disk, one directory per run
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            StorageError::io(format!("Cannot create state dir {}: {}", root.display(), e))
                .with_source(e)
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(root: &Path, run_id: &RunId) -> PathBuf {
        root.join(run_id.as_str())
    }

    async fn blocking<T, F>(f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| StorageError::io(format!("Storage task failed: {}", e)))?
    }
}

/// Write `value` as JSON to `path` via write-then-rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| StorageError::io(format!("No parent directory for {}", path.display())))?;
    fs::create_dir_all(dir)?;

    let bytes = serde_json::to_vec_pretty(value)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StorageError::from(e.error))?;

    // Make the rename itself durable; not every platform allows fsync on a directory.
    if let Ok(dir_handle) = fs::File::open(dir) {
        let _ = dir_handle.sync_all();
    }
    Ok(())
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = Self::run_dir(&self.root, &checkpoint.run_id).join(CHECKPOINT_FILE);
        let checkpoint = checkpoint.clone();
        Self::blocking(move || write_json_atomic(&path, &checkpoint)).await
    }

    async fn load_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint>> {
        let path = Self::run_dir(&self.root, run_id).join(CHECKPOINT_FILE);
        Self::blocking(move || read_json(&path)).await
    }

    async fn save_metadata(&self, meta: &RunMetadata) -> Result<()> {
        let path = Self::run_dir(&self.root, &meta.run_id).join(METADATA_FILE);
        let meta = meta.clone();
        Self::blocking(move || write_json_atomic(&path, &meta)).await
    }

    async fn load_metadata(&self, run_id: &RunId) -> Result<Option<RunMetadata>> {
        let path = Self::run_dir(&self.root, run_id).join(METADATA_FILE);
        Self::blocking(move || read_json(&path)).await
    }

    async fn list_metadata(&self, include_deleted: bool) -> Result<Vec<RunMetadata>> {
        let root = self.root.clone();
        Self::blocking(move || {
            let mut runs = Vec::new();
            for entry in fs::read_dir(&root)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if !RunId::is_valid(name) {
                    continue;
                }

                match read_json::<RunMetadata>(&entry.path().join(METADATA_FILE)) {
                    Ok(Some(meta)) if include_deleted || !meta.deleted => runs.push(meta),
                    Ok(_) => {}
                    Err(e) => warn!("Skipping unreadable metadata for run {}: {}", name, e),
                }
            }
            sort_newest_first(&mut runs);
            Ok(runs)
        })
        .await
    }
}
