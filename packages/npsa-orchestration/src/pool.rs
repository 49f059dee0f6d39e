//! Worker pool: bounded fan-out of units to a [`UnitExecutor`]
//!
//! Results are handed to the [`ResultSink`] in completion order. Cancellation is
//! cooperative and polled before every dispatch; what happens to units already
//! running depends on [`CancelPolicy`].

use crate::config::{CancelPolicy, PoolConfig};
use crate::error::FailureKind;
use crate::executor::{UnitExecutor, UnitRequest, UnitResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Receives every unit result as soon as the unit finishes
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn on_result(&self, result: UnitResult);

    /// Called right before a unit is handed to a worker.
    async fn on_dispatch(&self, _request: &UnitRequest) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub parallelism: usize,
    pub dispatch_pause: Duration,
    pub cancel_policy: CancelPolicy,
}

impl From<&PoolConfig> for PoolOptions {
    fn from(config: &PoolConfig) -> Self {
        Self {
            parallelism: config.parallelism,
            dispatch_pause: config.dispatch_pause(),
            cancel_policy: config.cancel_policy,
        }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    pub dispatched: usize,
    pub finished: usize,
    /// Units never handed to a worker because cancellation was raised
    pub skipped: usize,
    pub cancelled: bool,
}

pub struct WorkerPool {
    executor: Arc<dyn UnitExecutor>,
    options: PoolOptions,
}

impl WorkerPool {
    pub fn new(executor: Arc<dyn UnitExecutor>, options: PoolOptions) -> Self {
        let parallelism = options.parallelism.max(1);
        Self {
            executor,
            options: PoolOptions {
                parallelism,
                ..options
            },
        }
    }

    pub fn parallelism(&self) -> usize {
        self.options.parallelism
    }

    /// Execute `requests` and feed each result to `sink`. Returns once every
    /// dispatched unit has reported back.
    pub async fn run(
        &self,
        requests: Vec<UnitRequest>,
        cancel: &CancellationToken,
        sink: &dyn ResultSink,
    ) -> PoolSummary {
        let mut pending = requests.into_iter();
        let mut running: JoinSet<UnitResult> = JoinSet::new();
        let mut summary = PoolSummary::default();

        // Only the abort policy forwards cancellation into running units
        let abort = CancellationToken::new();
        let _abort_guard = match self.options.cancel_policy {
            CancelPolicy::Abort => Some(spawn_abort_forwarder(cancel.clone(), abort.clone())),
            CancelPolicy::Drain => None,
        };

        loop {
            while running.len() < self.options.parallelism && !cancel.is_cancelled() {
                let Some(request) = pending.next() else {
                    break;
                };

                if summary.dispatched > 0 && !self.options.dispatch_pause.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.dispatch_pause) => {}
                        _ = cancel.cancelled() => {}
                    }
                    if cancel.is_cancelled() {
                        summary.skipped += 1;
                        break;
                    }
                }

                sink.on_dispatch(&request).await;
                debug!("Dispatching unit {} ({} running)", request.unit_id, running.len());
                running.spawn(execute_isolated(
                    self.executor.clone(),
                    request,
                    abort.clone(),
                ));
                summary.dispatched += 1;
            }

            match running.join_next().await {
                Some(Ok(result)) => {
                    summary.finished += 1;
                    sink.on_result(result).await;
                }
                Some(Err(e)) => {
                    summary.finished += 1;
                    error!("Worker task lost: {}", e);
                }
                None => break,
            }
        }

        summary.skipped += pending.len();
        summary.cancelled = cancel.is_cancelled();
        if summary.skipped > 0 {
            info!(
                "Pool stopped by cancellation: {} dispatched, {} never started",
                summary.dispatched, summary.skipped
            );
        }
        summary
    }
}

/// Run one unit on its own task so even a panicking executor yields a result.
async fn execute_isolated(
    executor: Arc<dyn UnitExecutor>,
    request: UnitRequest,
    abort: CancellationToken,
) -> UnitResult {
    let unit_id = request.unit_id.clone();
    let started = Instant::now();
    match tokio::spawn(async move { executor.execute(request, abort).await }).await {
        Ok(result) => result,
        Err(e) => UnitResult::failed(
            unit_id,
            FailureKind::WorkerCrashed,
            format!("executor task failed: {}", e),
            started.elapsed(),
        ),
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn spawn_abort_forwarder(cancel: CancellationToken, abort: CancellationToken) -> AbortOnDrop {
    AbortOnDrop(tokio::spawn(async move {
        cancel.cancelled().await;
        abort.cancel();
    }))
}
