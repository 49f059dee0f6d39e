//! SQLite adapter for StateStore
//!
//! One row per record; each row carries the JSON-encoded record so the schema
//! stays stable while the record types evolve (the record's `schema_version`
//! travels inside the body). Writes are single-statement upserts and therefore
//! atomic per record.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{sort_newest_first, Checkpoint, RunId, RunMetadata, StateStore};
use crate::{Result, StorageError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    run_id     TEXT PRIMARY KEY,
    body       TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS run_metadata (
    run_id     TEXT PRIMARY KEY,
    body       TEXT NOT NULL,
    deleted    INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
"#;

/// SQLite-backed store; the connection is shared behind a mutex.
#[derive(Clone)]
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| StorageError::database(format!("SQLite task failed: {}", e)))?
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let run_id = checkpoint.run_id.to_string();
        let body = serde_json::to_string(checkpoint)?;
        let updated_at = checkpoint.updated_at.to_rfc3339();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO checkpoints (run_id, body, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(run_id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
                params![run_id, body, updated_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint>> {
        let run_id = run_id.to_string();
        let body: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT body FROM checkpoints WHERE run_id = ?1",
                        params![run_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;

        body.map(|b| serde_json::from_str(&b).map_err(StorageError::from))
            .transpose()
    }

    async fn save_metadata(&self, meta: &RunMetadata) -> Result<()> {
        let run_id = meta.run_id.to_string();
        let body = serde_json::to_string(meta)?;
        let deleted = meta.deleted;
        let created_at = meta.created_at.to_rfc3339();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO run_metadata (run_id, body, deleted, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(run_id) DO UPDATE SET body = excluded.body, deleted = excluded.deleted",
                params![run_id, body, deleted, created_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_metadata(&self, run_id: &RunId) -> Result<Option<RunMetadata>> {
        let run_id = run_id.to_string();
        let body: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT body FROM run_metadata WHERE run_id = ?1",
                        params![run_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;

        body.map(|b| serde_json::from_str(&b).map_err(StorageError::from))
            .transpose()
    }

    async fn list_metadata(&self, include_deleted: bool) -> Result<Vec<RunMetadata>> {
        let bodies: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT body FROM run_metadata WHERE ?1 OR deleted = 0")?;
                let rows = stmt.query_map(params![include_deleted], |row| row.get(0))?;
                let mut bodies = Vec::new();
                for row in rows {
                    bodies.push(row?);
                }
                Ok(bodies)
            })
            .await?;

        let mut runs = bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(StorageError::from))
            .collect::<Result<Vec<RunMetadata>>>()?;
        sort_newest_first(&mut runs);
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RunStatus;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_checkpoint_upsert() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let run_id = RunId::parse("sql-1").unwrap();
        let units: Vec<String> = ["A", "B"].iter().map(|s| s.to_string()).collect();

        let mut done = HashSet::new();
        done.insert("A".to_string());
        store
            .save_checkpoint(&Checkpoint::from_completed(run_id.clone(), "ohio", &units, &done))
            .await
            .unwrap();

        done.insert("B".to_string());
        store
            .save_checkpoint(&Checkpoint::from_completed(run_id.clone(), "ohio", &units, &done))
            .await
            .unwrap();

        let loaded = store.load_checkpoint(&run_id).await.unwrap().unwrap();
        assert_eq!(loaded.next_index, 2);
        assert_eq!(loaded.completed_units.len(), 2);
    }

    #[tokio::test]
    async fn test_metadata_soft_delete_visibility() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let mut meta = RunMetadata::new(RunId::parse("sql-2").unwrap(), "ohio", 4);
        store.save_metadata(&meta).await.unwrap();
        assert_eq!(store.list_metadata(false).await.unwrap().len(), 1);

        meta.deleted = true;
        meta.status = RunStatus::Cancelled;
        store.save_metadata(&meta).await.unwrap();

        assert!(store.list_metadata(false).await.unwrap().is_empty());
        let all = store.list_metadata(true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_file_database_persists_across_opens() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state").join("runs.sqlite");
        let run_id = RunId::parse("sql-3").unwrap();

        {
            let store = SqliteStateStore::open(&path).unwrap();
            store
                .save_metadata(&RunMetadata::new(run_id.clone(), "iowa", 99))
                .await
                .unwrap();
        }

        let reopened = SqliteStateStore::open(&path).unwrap();
        let meta = reopened.load_metadata(&run_id).await.unwrap().unwrap();
        assert_eq!(meta.total_units, 99);
    }
}
