//! Domain layer for the run state store
//!
//! # Records
//!
//! - `Checkpoint`: which units of a run are done, plus a resume cursor
//! - `RunMetadata`: long-lived run history (status, counts, final artifact)
//!
//! Both are keyed by a validated [`RunId`]. Nothing outside this module is allowed
//! to turn a raw string into a storage key or path.
//!
//! # Port Trait
//!
//! - `StateStore`: durable, atomic read/write of both record kinds
//!
//! # Examples
//!
//! ```rust,ignore
//! use npsa_storage::{Checkpoint, RunId, StateStore};
//!
//! async fn example(store: impl StateStore) -> npsa_storage::Result<()> {
//!     let run_id = RunId::parse("8f14e45f-ea3c-4d2e-9a1b-5c2d7e0f1a2b")?;
//!     let units = vec!["Adams".to_string(), "Brown".to_string()];
//!     let done = ["Adams".to_string()].into_iter().collect();
//!
//!     let checkpoint = Checkpoint::from_completed(run_id.clone(), "ohio", &units, &done);
//!     store.save_checkpoint(&checkpoint).await?;
//!
//!     let loaded = store.load_checkpoint(&run_id).await?;
//!     assert_eq!(loaded.unwrap().next_index, 1);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::{Result, StorageError};

/// Current on-disk schema version for both record kinds.
pub const SCHEMA_VERSION: u32 = 1;

const RUN_ID_MAX_LEN: usize = 64;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

// ═══════════════════════════════════════════════════════════════════════════
// Run identifier
// ═══════════════════════════════════════════════════════════════════════════

/// Validated run identifier
///
/// Accepts 1..=64 ASCII characters from `[A-Za-z0-9_-]`, starting with an
/// alphanumeric. Dots and path separators are rejected, so a `RunId` can be
/// joined onto a directory without escaping it.
///
/// ```rust
/// use npsa_storage::RunId;
///
/// assert!(RunId::parse("3f2a9c1e-0b7d-4e55-8a61-2d9f0c4b7e10").is_ok());
/// assert!(RunId::parse("../../etc/passwd").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    pub fn parse(raw: impl AsRef<str>) -> Result<Self> {
        let raw = raw.as_ref();
        if Self::is_valid(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(StorageError::invalid_run_id(raw))
        }
    }

    pub fn is_valid(raw: &str) -> bool {
        let mut chars = raw.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphanumeric() => {}
            _ => return false,
        }
        raw.len() <= RUN_ID_MAX_LEN
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RunId {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self> {
        RunId::parse(value)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Run status
// ═══════════════════════════════════════════════════════════════════════════

/// Run lifecycle status
///
/// `running → finalizing → completed`, `running → error`, `running → cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finalizing,
    Completed,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Finalizing => "finalizing",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "finalizing" => Ok(RunStatus::Finalizing),
            "completed" => Ok(RunStatus::Completed),
            "error" => Ok(RunStatus::Error),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(StorageError::serialization(format!(
                "Invalid run status: {}",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Error | RunStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Running, RunStatus::Finalizing)
                | (RunStatus::Running, RunStatus::Error)
                | (RunStatus::Running, RunStatus::Cancelled)
                | (RunStatus::Finalizing, RunStatus::Completed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Checkpoint
// ═══════════════════════════════════════════════════════════════════════════

/// Durable record of which units of a run are done
///
/// `completed_units` is kept in catalog order. `next_index` is the length of the
/// contiguous completed prefix of the unit list; it is a resume hint only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub run_id: RunId,
    pub domain: String,
    pub completed_units: Vec<String>,
    pub next_index: usize,
    pub total_units: usize,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Build a checkpoint from the unit list and the set of completed units.
    ///
    /// Entries of `completed` that are not in `units` are dropped.
    pub fn from_completed(
        run_id: RunId,
        domain: impl Into<String>,
        units: &[String],
        completed: &HashSet<String>,
    ) -> Self {
        let completed_units: Vec<String> = units
            .iter()
            .filter(|u| completed.contains(*u))
            .cloned()
            .collect();

        Self {
            schema_version: SCHEMA_VERSION,
            run_id,
            domain: domain.into(),
            completed_units,
            next_index: contiguous_prefix(units, completed),
            total_units: units.len(),
            updated_at: Utc::now(),
        }
    }

    pub fn completed_set(&self) -> HashSet<String> {
        self.completed_units.iter().cloned().collect()
    }
}

/// Length of the longest prefix of `units` whose members are all in `completed`.
pub fn contiguous_prefix(units: &[String], completed: &HashSet<String>) -> usize {
    units
        .iter()
        .take_while(|u| completed.contains(*u))
        .count()
}

// ═══════════════════════════════════════════════════════════════════════════
// Run metadata
// ═══════════════════════════════════════════════════════════════════════════

/// Long-lived run history record
///
/// Never physically deleted by normal operations; `deleted` is a soft-delete flag
/// and `archived` a display flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub run_id: RunId,
    pub status: RunStatus,
    pub domain: String,
    pub completed_units: usize,
    #[serde(default)]
    pub failed_units: usize,
    pub total_units: usize,
    #[serde(default)]
    pub records_found: usize,
    #[serde(default)]
    pub records_with_channel: usize,
    #[serde(default)]
    pub records_without_channel: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub final_artifact_path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub archived: bool,
}

impl RunMetadata {
    /// Fresh metadata for a run that is just starting
    pub fn new(run_id: RunId, domain: impl Into<String>, total_units: usize) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            run_id,
            status: RunStatus::Running,
            domain: domain.into(),
            completed_units: 0,
            failed_units: 0,
            total_units,
            records_found: 0,
            records_with_channel: 0,
            records_without_channel: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            final_artifact_path: None,
            error: None,
            deleted: false,
            archived: false,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait
// ═══════════════════════════════════════════════════════════════════════════

/// Durable storage for checkpoints and run metadata
///
/// Every write is atomic per record: a reader observes either the previous or the
/// new record, never a partial one. Implementations must tolerate concurrent use
/// by independent runs.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist (replace) the checkpoint of `checkpoint.run_id`.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Load a run's checkpoint; `Ok(None)` when none was ever written.
    async fn load_checkpoint(&self, run_id: &RunId) -> Result<Option<Checkpoint>>;

    /// Persist (replace) the metadata of `meta.run_id`.
    async fn save_metadata(&self, meta: &RunMetadata) -> Result<()>;

    /// Load a run's metadata; `Ok(None)` when unknown.
    async fn load_metadata(&self, run_id: &RunId) -> Result<Option<RunMetadata>>;

    /// All known runs, newest first. Soft-deleted runs only when `include_deleted`.
    async fn list_metadata(&self, include_deleted: bool) -> Result<Vec<RunMetadata>>;
}

/// Newest-first ordering shared by every backend's `list_metadata`.
pub(crate) fn sort_newest_first(runs: &mut [RunMetadata]) {
    runs.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.run_id.cmp(&b.run_id))
    });
}
