use async_trait::async_trait;
use npsa_orchestration::record::write_records;
use npsa_orchestration::{PipelineReport, Record, RunRegistry, UnitPipeline, UnitRequest};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub fn contact(first: &str, last: &str, email: Option<&str>, source: &str) -> Record {
    Record {
        first_name: first.to_string(),
        last_name: last.to_string(),
        title: "Principal".to_string(),
        contact_channel: email.map(str::to_string),
        phone: String::new(),
        org_name: String::new(),
        source_locator: source.to_string(),
    }
}

pub fn units(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone)]
pub enum Step {
    Records(Vec<Record>),
    Fail(String),
    /// Never returns on its own
    Hang,
    /// Writes the records, then errors
    WriteThenFail(Vec<Record>, String),
    /// Writes the records, then never returns
    WriteThenHang(Vec<Record>),
}

/// Per-unit pipeline driven by a script
///
/// Unscripted units succeed with no records. Every call is recorded.
#[derive(Default)]
pub struct ScriptedPipeline {
    steps: HashMap<String, Step>,
    delays: HashMap<String, Duration>,
    cancel_on: Option<(String, Arc<RunRegistry>)>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(mut self, unit: &str, records: Vec<Record>) -> Self {
        self.steps.insert(unit.to_string(), Step::Records(records));
        self
    }

    pub fn fail(mut self, unit: &str, message: &str) -> Self {
        self.steps
            .insert(unit.to_string(), Step::Fail(message.to_string()));
        self
    }

    pub fn hang(mut self, unit: &str) -> Self {
        self.steps.insert(unit.to_string(), Step::Hang);
        self
    }

    pub fn fail_after_writing(mut self, unit: &str, records: Vec<Record>, message: &str) -> Self {
        self.steps.insert(
            unit.to_string(),
            Step::WriteThenFail(records, message.to_string()),
        );
        self
    }

    pub fn hang_after_writing(mut self, unit: &str, records: Vec<Record>) -> Self {
        self.steps
            .insert(unit.to_string(), Step::WriteThenHang(records));
        self
    }

    pub fn delay(mut self, unit: &str, delay: Duration) -> Self {
        self.delays.insert(unit.to_string(), delay);
        self
    }

    /// Raise the run's cancellation flag as soon as `unit` starts.
    pub fn cancel_on(mut self, unit: &str, registry: Arc<RunRegistry>) -> Self {
        self.cancel_on = Some((unit.to_string(), registry));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, unit: &str) -> usize {
        self.calls.lock().iter().filter(|u| *u == unit).count()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl UnitPipeline for ScriptedPipeline {
    async fn process(&self, request: &UnitRequest) -> anyhow::Result<PipelineReport> {
        self.calls.lock().push(request.unit_id.clone());

        if let Some((unit, registry)) = &self.cancel_on {
            if *unit == request.unit_id {
                if let Some(handle) = registry.get(&request.run_id) {
                    handle.request_cancel();
                }
            }
        }

        if let Some(delay) = self.delays.get(&request.unit_id) {
            tokio::time::sleep(*delay).await;
        }

        match self.steps.get(&request.unit_id) {
            Some(Step::Records(records)) => {
                write_records(&request.artifact_path, records)?;
                Ok(PipelineReport {
                    record_count: records.len(),
                    artifact_path: None,
                })
            }
            Some(Step::Fail(message)) => anyhow::bail!("{}", message),
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Ok(PipelineReport::default())
            }
            Some(Step::WriteThenFail(records, message)) => {
                write_records(&request.artifact_path, records)?;
                anyhow::bail!("{}", message)
            }
            Some(Step::WriteThenHang(records)) => {
                write_records(&request.artifact_path, records)?;
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Ok(PipelineReport::default())
            }
            None => Ok(PipelineReport::default()),
        }
    }
}
