//! Completion notification port

use async_trait::async_trait;
use npsa_storage::RunId;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Summary handed to the notifier when a run completes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub domain: String,
    pub units_processed: usize,
    pub total_units: usize,
    pub failed_units: usize,
    pub records: usize,
    pub records_with_channel: usize,
    pub records_without_channel: usize,
    pub final_artifact_path: Option<PathBuf>,
    pub duration: Duration,
}

impl RunSummary {
    pub fn subject(&self) -> String {
        format!(
            "Run {} for {} completed: {} leads ({} with email)",
            self.run_id, self.domain, self.records, self.records_with_channel
        )
    }
}

#[async_trait]
pub trait RunNotifier: Send + Sync {
    /// Invoked at most once per run. Errors are logged by the caller.
    async fn run_completed(&self, summary: &RunSummary) -> anyhow::Result<()>;
}

/// Writes the summary to the log
pub struct LogNotifier;

#[async_trait]
impl RunNotifier for LogNotifier {
    async fn run_completed(&self, summary: &RunSummary) -> anyhow::Result<()> {
        let secs = summary.duration.as_secs();
        info!(
            "{} | units {}/{} ({} failed) | {}h{:02}m | artifact {}",
            summary.subject(),
            summary.units_processed,
            summary.total_units,
            summary.failed_units,
            secs / 3600,
            (secs % 3600) / 60,
            summary
                .final_artifact_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string())
        );
        Ok(())
    }
}
