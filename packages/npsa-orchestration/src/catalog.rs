//! Unit catalog: the ordered list of work units for a domain

use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Source of the unit list for a domain
///
/// Loaded once at run start; the returned order is the run's canonical unit order.
#[async_trait]
pub trait UnitCatalog: Send + Sync {
    async fn load_units(&self, domain: &str) -> Result<Vec<String>>;
}

/// Normalize a domain name into its catalog key (`"New York"` → `"new_york"`).
///
/// Rejects anything that could escape the catalog directory.
pub fn normalize_domain(domain: &str) -> Result<String> {
    let key = domain.trim().to_lowercase().replace(' ', "_");
    if key.is_empty() {
        return Err(OrchestratorError::catalog("Domain must not be empty"));
    }
    if key.contains('/') || key.contains('\\') || key.contains("..") || key.contains('\0') {
        return Err(OrchestratorError::catalog(format!(
            "Invalid domain name: {}",
            domain
        )));
    }
    Ok(key)
}

/// Parse catalog text: one unit per line, `#` comments and blanks skipped,
/// duplicates dropped (first occurrence keeps its position).
pub fn parse_units(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| seen.insert(line.to_string()))
        .map(str::to_string)
        .collect()
}

/// `<dir>/<domain>.txt`, or `<dir>/<domain>_<variant>.txt` when a variant is
/// configured and that file exists.
pub struct FileCatalog {
    dir: PathBuf,
    variant: Option<String>,
}

impl FileCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            variant: None,
        }
    }

    pub fn with_variant(mut self, variant: Option<String>) -> Self {
        self.variant = variant;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn resolve(&self, key: &str) -> PathBuf {
        if let Some(variant) = &self.variant {
            let preferred = self.dir.join(format!("{}_{}.txt", key, variant));
            if preferred.is_file() {
                return preferred;
            }
            debug!(
                "Catalog variant {} not found, using {}.txt",
                preferred.display(),
                key
            );
        }
        self.dir.join(format!("{}.txt", key))
    }
}

#[async_trait]
impl UnitCatalog for FileCatalog {
    async fn load_units(&self, domain: &str) -> Result<Vec<String>> {
        let key = normalize_domain(domain)?;
        let path = self.resolve(&key);

        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            OrchestratorError::catalog(format!(
                "Cannot read unit catalog {}: {}",
                path.display(),
                e
            ))
        })?;

        let units = parse_units(&content);
        if units.is_empty() {
            return Err(OrchestratorError::catalog(format!(
                "No units found for domain '{}' in {}",
                domain,
                path.display()
            )));
        }

        debug!("Loaded {} units for {} from {}", units.len(), domain, path.display());
        Ok(units)
    }
}

/// Fixed in-memory catalog, one unit list for every domain
pub struct StaticCatalog {
    units: Vec<String>,
}

impl StaticCatalog {
    pub fn new<I, S>(units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            units: units.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl UnitCatalog for StaticCatalog {
    async fn load_units(&self, domain: &str) -> Result<Vec<String>> {
        if self.units.is_empty() {
            return Err(OrchestratorError::catalog(format!(
                "No units found for domain '{}'",
                domain
            )));
        }
        Ok(self.units.clone())
    }
}
