use crate::error::{FailureKind, OrchestratorError, Result};
use crate::executor::UnitResult;
use chrono::{DateTime, Utc};
use npsa_storage::{Checkpoint, RunId, RunMetadata, RunStatus};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// ETA inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EtaPolicy {
    pub default_unit: Duration,
    pub window: usize,
}

impl Default for EtaPolicy {
    fn default() -> Self {
        Self {
            default_unit: Duration::from_secs(705),
            window: 20,
        }
    }
}

/// Live, in-memory state of one run
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: RunId,
    pub domain: String,
    pub units: Arc<Vec<String>>,
    pub status: RunStatus,
    pub completed: HashSet<String>,
    pub failed: BTreeSet<String>,
    /// Units currently held by a worker
    pub in_flight: BTreeSet<String>,
    /// Unit dispatched most recently, while it is still running
    pub current_unit: Option<String>,
    /// Units finished in this session (excludes units restored from a checkpoint)
    pub processed_this_session: usize,
    pub records_found: usize,
    pub records_with_channel: usize,
    pub records_without_channel: usize,
    pub unit_records: BTreeMap<String, usize>,
    pub timings: VecDeque<Duration>,
    pub message: String,
    pub parallelism: usize,
    pub eta: EtaPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub final_artifact_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl Run {
    pub fn new(
        run_id: RunId,
        domain: impl Into<String>,
        units: Vec<String>,
        parallelism: usize,
        eta: EtaPolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            domain: domain.into(),
            units: Arc::new(units),
            status: RunStatus::Running,
            completed: HashSet::new(),
            failed: BTreeSet::new(),
            in_flight: BTreeSet::new(),
            current_unit: None,
            processed_this_session: 0,
            records_found: 0,
            records_with_channel: 0,
            records_without_channel: 0,
            unit_records: BTreeMap::new(),
            timings: VecDeque::new(),
            message: "Starting".to_string(),
            parallelism: parallelism.max(1),
            eta,
            created_at: now,
            updated_at: now,
            completed_at: None,
            final_artifact_path: None,
            error: None,
        }
    }

    /// Mark units as already done (checkpoint or artifact reconciliation).
    /// Unknown unit ids are ignored.
    pub fn restore_completed<I: IntoIterator<Item = String>>(&mut self, units: I) {
        let known: HashSet<&String> = self.units.iter().collect();
        let restored: Vec<String> = units.into_iter().filter(|u| known.contains(u)).collect();
        self.completed.extend(restored);
    }

    /// Mark restored units that failed in an earlier session.
    pub fn restore_failed<I: IntoIterator<Item = String>>(&mut self, units: I) {
        let restored: Vec<String> = units
            .into_iter()
            .filter(|u| self.completed.contains(u))
            .collect();
        self.failed.extend(restored);
    }

    pub fn remaining(&self) -> Vec<String> {
        self.units
            .iter()
            .filter(|u| !self.completed.contains(*u))
            .cloned()
            .collect()
    }

    pub fn all_accounted_for(&self) -> bool {
        self.units.iter().all(|u| self.completed.contains(u))
    }

    pub fn mark_dispatched(&mut self, unit_id: &str) {
        self.in_flight.insert(unit_id.to_string());
        self.current_unit = Some(unit_id.to_string());
        self.message = format!("Processing {}", unit_id);
        self.updated_at = Utc::now();
    }

    /// Fold a unit result into the live state. Returns `true` when the unit newly
    /// joined `completed`. Failed units count as completed; aborted ones do not.
    pub fn record_result(&mut self, result: &UnitResult) -> bool {
        self.in_flight.remove(&result.unit_id);
        if self.current_unit.as_deref() == Some(result.unit_id.as_str()) {
            self.current_unit = None;
        }
        self.updated_at = Utc::now();

        if !result.counts_as_completed() {
            self.message = format!("{} aborted", result.unit_id);
            return false;
        }
        if !self.units.contains(&result.unit_id) || self.completed.contains(&result.unit_id) {
            return false;
        }

        self.completed.insert(result.unit_id.clone());
        self.processed_this_session += 1;
        self.timings.push_back(result.duration);
        while self.timings.len() > self.eta.window.max(1) {
            self.timings.pop_front();
        }

        if result.success {
            self.records_found += result.record_count;
            self.records_with_channel += result.records_with_channel;
            self.records_without_channel += result.records_without_channel;
            self.unit_records
                .insert(result.unit_id.clone(), result.record_count);
            self.message = format!(
                "{} finished with {} records",
                result.unit_id, result.record_count
            );
        } else {
            self.failed.insert(result.unit_id.clone());
            self.unit_records.insert(result.unit_id.clone(), 0);
            self.message = format!(
                "{} failed ({})",
                result.unit_id,
                result.failure.unwrap_or(FailureKind::Pipeline)
            );
        }
        true
    }

    pub fn average_unit_time(&self) -> Option<Duration> {
        if self.timings.is_empty() {
            return None;
        }
        let total: Duration = self.timings.iter().sum();
        Some(total / self.timings.len() as u32)
    }

    /// `ceil(remaining / parallelism) × rolling average`; zero unless running.
    pub fn eta(&self) -> Duration {
        if self.status != RunStatus::Running {
            return Duration::ZERO;
        }
        let remaining = self.units.len().saturating_sub(self.completed.len());
        if remaining == 0 {
            return Duration::ZERO;
        }
        let waves = remaining.div_ceil(self.parallelism) as u32;
        self.average_unit_time().unwrap_or(self.eta.default_unit) * waves
    }

    pub fn progress_percent(&self) -> f64 {
        if self.units.is_empty() {
            return 0.0;
        }
        (self.completed.len() as f64 / self.units.len() as f64 * 1000.0).round() / 10.0
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::from_completed(
            self.run_id.clone(),
            self.domain.clone(),
            &self.units,
            &self.completed,
        )
    }

    /// Project live state onto the persisted history record, keeping the display
    /// flags and creation time of `previous`.
    pub fn metadata(&self, previous: Option<&RunMetadata>) -> RunMetadata {
        let mut meta = RunMetadata::new(self.run_id.clone(), self.domain.clone(), self.units.len());
        meta.status = self.status;
        meta.completed_units = self.completed.len();
        meta.failed_units = self.failed.len();
        meta.records_found = self.records_found;
        meta.records_with_channel = self.records_with_channel;
        meta.records_without_channel = self.records_without_channel;
        meta.created_at = self.created_at;
        meta.completed_at = self.completed_at;
        meta.final_artifact_path = self
            .final_artifact_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        meta.error = self.error.clone();
        if let Some(previous) = previous {
            meta.created_at = previous.created_at;
            meta.deleted = previous.deleted;
            meta.archived = previous.archived;
        }
        meta.touch();
        meta
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.to_string(),
            domain: self.domain.clone(),
            status: self.status,
            progress_percent: self.progress_percent(),
            units_processed: self.completed.len(),
            total_units: self.units.len(),
            failed_units: self.failed.len(),
            current_unit: self.current_unit.clone(),
            in_flight: self.in_flight.iter().cloned().collect(),
            message: self.message.clone(),
            records_found: self.records_found,
            records_with_channel: self.records_with_channel,
            records_without_channel: self.records_without_channel,
            unit_records: self.unit_records.clone(),
            avg_unit_secs: self.average_unit_time().map(|d| d.as_secs_f64()),
            eta_secs: self.eta().as_secs(),
            parallelism: self.parallelism,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            final_artifact_path: self.final_artifact_path.clone(),
            error: self.error.clone(),
            archived: false,
            deleted: false,
        }
    }
}

/// Read-only view of a run for status queries
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub domain: String,
    pub status: RunStatus,
    pub progress_percent: f64,
    pub units_processed: usize,
    pub total_units: usize,
    pub failed_units: usize,
    pub current_unit: Option<String>,
    pub in_flight: Vec<String>,
    pub message: String,
    pub records_found: usize,
    pub records_with_channel: usize,
    pub records_without_channel: usize,
    pub unit_records: BTreeMap<String, usize>,
    pub avg_unit_secs: Option<f64>,
    pub eta_secs: u64,
    pub parallelism: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub final_artifact_path: Option<PathBuf>,
    pub error: Option<String>,
    pub archived: bool,
    pub deleted: bool,
}

impl RunSnapshot {
    /// View of a run known only from its persisted metadata
    pub fn from_metadata(meta: &RunMetadata) -> Self {
        let progress_percent = if meta.total_units == 0 {
            0.0
        } else {
            (meta.completed_units as f64 / meta.total_units as f64 * 1000.0).round() / 10.0
        };
        Self {
            run_id: meta.run_id.to_string(),
            domain: meta.domain.clone(),
            status: meta.status,
            progress_percent,
            units_processed: meta.completed_units,
            total_units: meta.total_units,
            failed_units: meta.failed_units,
            current_unit: None,
            in_flight: Vec::new(),
            message: meta.error.clone().unwrap_or_default(),
            records_found: meta.records_found,
            records_with_channel: meta.records_with_channel,
            records_without_channel: meta.records_without_channel,
            unit_records: BTreeMap::new(),
            avg_unit_secs: None,
            eta_secs: 0,
            parallelism: 0,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
            completed_at: meta.completed_at,
            final_artifact_path: meta.final_artifact_path.as_ref().map(PathBuf::from),
            error: meta.error.clone(),
            archived: meta.archived,
            deleted: meta.deleted,
        }
    }
}

/// Run state machine for transitions
///
/// `running → finalizing → completed`, `running → error`, `running → cancelled`.
pub struct RunStateMachine<'a> {
    run: &'a mut Run,
}

impl<'a> RunStateMachine<'a> {
    pub fn new(run: &'a mut Run) -> Self {
        Self { run }
    }

    fn transition(&mut self, to: RunStatus) -> Result<()> {
        if !self.run.status.can_transition_to(to) {
            return Err(OrchestratorError::InvalidStateTransition {
                from: self.run.status.to_string(),
                to: to.to_string(),
            });
        }
        self.run.status = to;
        self.run.updated_at = Utc::now();
        Ok(())
    }

    /// Transition: RUNNING → FINALIZING
    pub fn finalize(&mut self, final_artifact: PathBuf) -> Result<()> {
        self.transition(RunStatus::Finalizing)?;
        self.run.final_artifact_path = Some(final_artifact);
        self.run.in_flight.clear();
        self.run.message = "Finalizing".to_string();
        Ok(())
    }

    /// Transition: FINALIZING → COMPLETED
    pub fn complete(&mut self) -> Result<()> {
        self.transition(RunStatus::Completed)?;
        self.run.completed_at = Some(self.run.updated_at);
        self.run.message = "Completed".to_string();
        Ok(())
    }

    /// Transition: RUNNING → ERROR
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(RunStatus::Error)?;
        let error = error.into();
        self.run.message = format!("Error: {}", error);
        self.run.error = Some(error);
        self.run.in_flight.clear();
        Ok(())
    }

    /// Transition: RUNNING → CANCELLED
    pub fn cancel(&mut self) -> Result<()> {
        self.transition(RunStatus::Cancelled)?;
        self.run.message = "Cancelled".to_string();
        self.run.in_flight.clear();
        Ok(())
    }
}
