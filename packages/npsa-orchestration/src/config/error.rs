//! Configuration error types

use thiserror::Error;

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Range validation error
    #[error("Invalid range for field '{field}': {value} not in {min}..={max}. {hint}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
        hint: String,
    },

    /// Missing version field in YAML
    #[error("Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    /// Unsupported version
    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u64, supported: Vec<u64> },

    /// Field holds a value that is not a range problem (bad enum, empty command, unparsable env)
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    /// Create a range error with a hint
    pub fn range_with_hint(
        field: impl Into<String>,
        value: impl ToString,
        min: impl ToString,
        max: impl ToString,
        hint: impl Into<String>,
    ) -> Self {
        Self::Range {
            field: field.into(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            hint: hint.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
