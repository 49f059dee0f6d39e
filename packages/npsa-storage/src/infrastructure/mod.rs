//! Infrastructure layer - StateStore adapters
//!
//! - `fs`: JSON files with write-then-rename (default backend)
//! - `sqlite`: single SQLite database (feature `sqlite`)
//! - `memory`: process-local, for tests

pub mod fs;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use fs::FileStateStore;
pub use memory::MemoryStateStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStateStore;
