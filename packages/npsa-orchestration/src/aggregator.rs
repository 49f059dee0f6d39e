//! Aggregation: merge every unit artifact of a run into the final artifact
//!
//! Units are read in catalog order so the result never depends on the order in
//! which units happened to finish.

use crate::artifacts::ArtifactLayout;
use crate::config::AggregationConfig;
use crate::dedup::{dedup_records, name_and_source_key, DedupKey, Deduped};
use crate::enrich::Enricher;
use crate::error::{OrchestratorError, Result};
use crate::record::{read_records, write_records, Record, RecordCounts};
use npsa_storage::RunId;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationOutcome {
    pub final_artifact_path: PathBuf,
    pub counts: RecordCounts,
    /// Units whose artifact never appeared within the wait bound
    pub missing_units: Vec<String>,
    pub enriched: usize,
}

pub struct Aggregator {
    layout: ArtifactLayout,
    wait: Duration,
    poll: Duration,
    enricher: Option<Arc<dyn Enricher>>,
}

impl Aggregator {
    pub fn new(layout: ArtifactLayout, config: &AggregationConfig) -> Self {
        Self {
            layout,
            wait: config.wait(),
            poll: config.poll(),
            enricher: None,
        }
    }

    pub fn with_enricher(mut self, enricher: Option<Arc<dyn Enricher>>) -> Self {
        self.enricher = enricher;
        self
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Merge, dedup and write the final artifact.
    ///
    /// `failed` units are neither waited for nor read.
    pub async fn aggregate(
        &self,
        run_id: &RunId,
        domain: &str,
        units: &[String],
        failed: &BTreeSet<String>,
    ) -> Result<AggregationOutcome> {
        let missing_units = self.wait_for_artifacts(run_id, units, failed).await;
        if !missing_units.is_empty() {
            warn!(
                "Run {}: aggregating without {} unit artifact(s): {}",
                run_id,
                missing_units.len(),
                missing_units.join(", ")
            );
        }

        let records = self.load_all(run_id, units, failed).await?;
        let loaded = records.len();
        let mut deduped = dedup_records(records);
        debug!(
            "Run {}: {} records loaded, {} after dedup",
            run_id,
            loaded,
            deduped.len()
        );

        let mut enriched = 0;
        if let Some(enricher) = &self.enricher {
            if !deduped.without_channel.is_empty() {
                match enricher
                    .enrich(domain, deduped.without_channel.clone())
                    .await
                {
                    Ok(resolved) => {
                        enriched = resolved.iter().filter(|r| r.has_channel()).count();
                        deduped = merge_enriched(deduped, resolved);
                        info!(
                            "Run {}: enricher {} resolved {} contact(s)",
                            run_id,
                            enricher.name(),
                            enriched
                        );
                    }
                    Err(e) => warn!(
                        "Run {}: enricher {} failed, continuing without it: {:#}",
                        run_id,
                        enricher.name(),
                        e
                    ),
                }
            }
        }

        let final_records = deduped.into_records();
        let counts = RecordCounts::of(&final_records);
        let final_artifact_path = self.layout.final_artifact(run_id, domain);

        let target = final_artifact_path.clone();
        tokio::task::spawn_blocking(move || write_records(&target, &final_records))
            .await
            .map_err(OrchestratorError::aggregation)??;

        info!(
            "Run {}: final artifact {} ({} records, {} with email, {} without)",
            run_id,
            final_artifact_path.display(),
            counts.total,
            counts.with_channel,
            counts.without_channel
        );

        Ok(AggregationOutcome {
            final_artifact_path,
            counts,
            missing_units,
            enriched,
        })
    }

    /// Poll until every expected artifact exists or the bound is hit; returns the
    /// units still missing.
    async fn wait_for_artifacts(
        &self,
        run_id: &RunId,
        units: &[String],
        failed: &BTreeSet<String>,
    ) -> Vec<String> {
        let deadline = Instant::now() + self.wait;
        loop {
            let missing: Vec<String> = units
                .iter()
                .filter(|u| !failed.contains(*u) && !self.layout.has_unit_artifact(run_id, u))
                .cloned()
                .collect();

            if missing.is_empty() || Instant::now() >= deadline {
                return missing;
            }
            debug!(
                "Run {}: waiting for {} unit artifact(s)",
                run_id,
                missing.len()
            );
            let left = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.poll.min(left)).await;
        }
    }

    async fn load_all(
        &self,
        run_id: &RunId,
        units: &[String],
        failed: &BTreeSet<String>,
    ) -> Result<Vec<Record>> {
        let paths: Vec<(String, PathBuf, PathBuf)> = units
            .iter()
            .filter(|u| !failed.contains(*u))
            .map(|u| {
                (
                    u.clone(),
                    self.layout.unit_artifact(run_id, u),
                    self.layout.unit_no_channel_artifact(run_id, u),
                )
            })
            .collect();
        let run = run_id.clone();

        tokio::task::spawn_blocking(move || {
            let mut all = Vec::new();
            for (unit, main, no_channel) in paths {
                for path in [main, no_channel] {
                    if !path.is_file() {
                        continue;
                    }
                    // One unreadable artifact must not sink the whole run
                    match read_records(&path) {
                        Ok(records) => all.extend(records),
                        Err(e) => warn!(
                            "Run {}: skipping unreadable artifact of {} ({}): {}",
                            run,
                            unit,
                            path.display(),
                            e
                        ),
                    }
                }
            }
            all
        })
        .await
        .map_err(OrchestratorError::aggregation)
    }
}

/// Enriched records leave the channel-less partition and join the channel
/// partition, which is deduplicated again. A resolved record replaces only the
/// record with the same name at the same source.
fn merge_enriched(deduped: Deduped, resolved: Vec<Record>) -> Deduped {
    let resolved: Vec<Record> = resolved.into_iter().filter(|r| r.has_channel()).collect();
    let resolved_keys: BTreeSet<DedupKey> = resolved.iter().map(name_and_source_key).collect();

    let without_channel = deduped
        .without_channel
        .into_iter()
        .filter(|r| !resolved_keys.contains(&name_and_source_key(r)));

    dedup_records(
        deduped
            .with_channel
            .into_iter()
            .chain(resolved)
            .chain(without_channel),
    )
}
