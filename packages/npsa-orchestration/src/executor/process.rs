use super::{
    clear_unit_outputs, collect_artifact, discard_partial_outputs, remove_if_exists, UnitExecutor,
    UnitRequest, UnitResult,
};
use crate::config::{UnitConfig, WorkerCommandConfig};
use crate::error::FailureKind;
use crate::teardown::{identity_of, DescendantTracker, IsolationTeardown, WorkerHandle};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Optional JSON report a worker writes to `NPSA_REPORT_PATH`
pub const REPORT_FILE_NAME: &str = "unit_report.json";
const LOG_FILE_NAME: &str = "worker.log";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerReport {
    pub record_count: Option<usize>,
    pub artifact_path: Option<PathBuf>,
    pub error: Option<String>,
}

enum Exit {
    Finished(ExitStatus),
    WaitFailed(String),
    TimedOut,
    Aborted,
}

/// One OS process per unit, torn down after exactly one invocation
///
/// The worker runs in its own process group with stdout/stderr appended to
/// `worker.log` beside the unit artifact. It receives `NPSA_DOMAIN`, `NPSA_UNIT`,
/// `NPSA_RUN_ID`, `NPSA_ARTIFACT_PATH` and `NPSA_REPORT_PATH`.
pub struct ProcessExecutor {
    command: WorkerCommandConfig,
    unit: UnitConfig,
    teardown: Arc<dyn IsolationTeardown>,
}

impl ProcessExecutor {
    pub fn new(
        command: WorkerCommandConfig,
        unit: UnitConfig,
        teardown: Arc<dyn IsolationTeardown>,
    ) -> Self {
        Self {
            command,
            unit,
            teardown,
        }
    }

    fn build_command(
        &self,
        request: &UnitRequest,
        report_path: &Path,
        log: std::fs::File,
    ) -> std::io::Result<Command> {
        let fill = |template: &str| substitute(template, request, report_path);

        let mut cmd = Command::new(&self.command.program);
        cmd.args(self.command.args.iter().map(|a| fill(a)));
        for (k, v) in &self.command.env {
            cmd.env(k, fill(v));
        }
        if let Some(cwd) = &self.command.working_dir {
            cmd.current_dir(cwd);
        }
        cmd.env("NPSA_DOMAIN", &request.domain)
            .env("NPSA_UNIT", &request.unit_id)
            .env("NPSA_RUN_ID", request.run_id.as_str())
            .env("NPSA_ARTIFACT_PATH", &request.artifact_path)
            .env("NPSA_REPORT_PATH", report_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .process_group(0)
            .kill_on_drop(true);
        Ok(cmd)
    }

    async fn supervise(
        &self,
        child: &mut Child,
        pid: i32,
        abort: &CancellationToken,
        tracker: &mut DescendantTracker,
    ) -> Exit {
        let deadline = tokio::time::sleep(self.unit.timeout());
        tokio::pin!(deadline);
        let mut sampling = tokio::time::interval(self.unit.track_interval());

        loop {
            tokio::select! {
                status = child.wait() => {
                    return match status {
                        Ok(status) => Exit::Finished(status),
                        Err(e) => Exit::WaitFailed(e.to_string()),
                    };
                }
                _ = &mut deadline => return Exit::TimedOut,
                _ = abort.cancelled() => return Exit::Aborted,
                _ = sampling.tick() => tracker.sample(pid),
            }
        }
    }
}

/// Expand `{domain}`, `{unit}`, `{run_id}`, `{artifact}` and `{report}`.
fn substitute(template: &str, request: &UnitRequest, report_path: &Path) -> String {
    template
        .replace("{domain}", &request.domain)
        .replace("{unit}", &request.unit_id)
        .replace("{run_id}", request.run_id.as_str())
        .replace("{artifact}", &request.artifact_path.to_string_lossy())
        .replace("{report}", &report_path.to_string_lossy())
}

async fn read_report(path: &Path) -> Option<WorkerReport> {
    let bytes = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(report) => Some(report),
        Err(e) => {
            warn!("Ignoring malformed worker report {}: {}", path.display(), e);
            None
        }
    }
}

#[async_trait]
impl UnitExecutor for ProcessExecutor {
    async fn execute(&self, request: UnitRequest, abort: CancellationToken) -> UnitResult {
        let started = Instant::now();
        let unit_id = request.unit_id.clone();
        let fail = |kind, msg: String| UnitResult::failed(&unit_id, kind, msg, started.elapsed());

        let unit_dir = request
            .artifact_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let report_path = unit_dir.join(REPORT_FILE_NAME);

        // A re-attempt overwrites, never appends to, an earlier partial output
        let prepared = std::fs::create_dir_all(&unit_dir)
            .and_then(|_| remove_if_exists(&report_path))
            .and_then(|_| clear_unit_outputs(&request.artifact_path))
            .and_then(|_| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(unit_dir.join(LOG_FILE_NAME))
            })
            .and_then(|log| self.build_command(&request, &report_path, log));
        let mut cmd = match prepared {
            Ok(cmd) => cmd,
            Err(e) => {
                return fail(
                    FailureKind::WorkerCrashed,
                    format!("cannot prepare worker: {}", e),
                )
            }
        };

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return fail(
                    FailureKind::WorkerCrashed,
                    format!("failed to start {}: {}", self.command.program, e),
                )
            }
        };
        let Some(pid) = child.id().map(|p| p as i32) else {
            return fail(
                FailureKind::WorkerCrashed,
                "worker exited before it could be tracked".to_string(),
            );
        };
        let start_time = identity_of(pid).map(|identity| identity.start_time);
        debug!("Unit {}: worker pid {}", unit_id, pid);

        let mut tracker = DescendantTracker::new();
        let exit = self.supervise(&mut child, pid, &abort, &mut tracker).await;

        let handle = WorkerHandle {
            pid,
            start_time,
            pgid: pid,
            tracked: tracker.into_tracked(),
            leader_running: !matches!(exit, Exit::Finished(_)),
        };
        self.teardown.teardown(&handle).await;
        // Reap the leader so it does not linger as a zombie
        if handle.leader_running {
            let _ = child.start_kill();
            if tokio::time::timeout(Duration::from_secs(5), child.wait()).await.is_err() {
                warn!("Unit {}: worker {} could not be reaped", unit_id, pid);
            }
        }

        let report = read_report(&report_path).await.unwrap_or_default();

        let result = match exit {
            Exit::Finished(status) if status.success() => {
                match collect_artifact(&request, report.artifact_path).await {
                    Ok(counts) => {
                        if let Some(reported) = report.record_count.filter(|n| *n != counts.total) {
                            info!(
                                "Unit {}: worker reported {} records, artifact has {}",
                                unit_id, reported, counts.total
                            );
                        }
                        UnitResult::succeeded(
                            &unit_id,
                            counts,
                            request.artifact_path.clone(),
                            started.elapsed(),
                        )
                    }
                    Err(e) => fail(FailureKind::Pipeline, format!("unreadable artifact: {}", e)),
                }
            }
            Exit::Finished(status) => match status.code() {
                Some(code) => fail(
                    FailureKind::Pipeline,
                    report
                        .error
                        .unwrap_or_else(|| format!("worker exited with status {}", code)),
                ),
                None => fail(
                    FailureKind::WorkerCrashed,
                    format!("worker terminated by signal ({})", status),
                ),
            },
            Exit::WaitFailed(e) => fail(FailureKind::WorkerCrashed, format!("lost worker: {}", e)),
            Exit::TimedOut => fail(
                FailureKind::Timeout,
                format!("unit exceeded timeout of {}s", self.unit.timeout_secs),
            ),
            Exit::Aborted => fail(FailureKind::Aborted, "unit aborted by cancellation".to_string()),
        };
        discard_partial_outputs(&result, &request.artifact_path);
        result
    }
}
