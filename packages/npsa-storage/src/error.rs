//! Error types for npsa-storage

use std::fmt;
use thiserror::Error;

/// Storage error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Database errors (SQLite)
    Database,
    /// Serialization/deserialization errors
    Serialization,
    /// Run identifier rejected before any path or key was derived from it
    InvalidRunId,
    /// I/O errors
    Io,
    /// Configuration errors
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Database => "database",
            ErrorKind::Serialization => "serialization",
            ErrorKind::InvalidRunId => "invalid_run_id",
            ErrorKind::Io => "io",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage error type
#[derive(Debug, Error)]
#[error("[{kind}] {message}")]
pub struct StorageError {
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub kind: ErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    // Convenience constructors
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn invalid_run_id(run_id: impl AsRef<str>) -> Self {
        Self::new(
            ErrorKind::InvalidRunId,
            format!("Invalid run id: {:?}", run_id.as_ref()),
        )
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }
}

// SQLite error conversions
#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::database(format!("SQLite error: {}", err)).with_source(err)
    }
}

// JSON error conversions
impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::serialization(format!("JSON error: {}", err)).with_source(err)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::io(format!("I/O error: {}", err)).with_source(err)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, StorageError>;
