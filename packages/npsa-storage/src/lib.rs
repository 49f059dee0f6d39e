//! Run state storage for the county batch runner
//!
//! Two record kinds are persisted per run, both keyed by a validated [`RunId`]:
//!
//! 1. **Checkpoint**: completed units plus a resume cursor, rewritten after unit
//!    completions so a restarted run skips finished work.
//! 2. **RunMetadata**: status, counts, final artifact location. Outlives the
//!    in-memory run; "delete" only sets a flag.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use npsa_storage::{FileStateStore, RunId, RunMetadata, StateStore};
//!
//! let store = FileStateStore::open("./state")?;
//! let run_id = RunId::parse("0b9c5a52-8f2e-4d0a-9c61-7e3f1d2a4b58")?;
//! store.save_metadata(&RunMetadata::new(run_id.clone(), "ohio", 88)).await?;
//!
//! for run in store.list_metadata(false).await? {
//!     println!("{} {} {}/{}", run.run_id, run.status, run.completed_units, run.total_units);
//! }
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    contiguous_prefix, Checkpoint, RunId, RunMetadata, RunStatus, StateStore, SCHEMA_VERSION,
};
pub use infrastructure::{FileStateStore, MemoryStateStore};

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteStateStore;
