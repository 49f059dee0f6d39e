//! Worker isolation teardown
//!
//! Contract: terminate every descendant of a worker, deepest first, then the
//! worker itself; anything still alive after the grace period is killed.
//!
//! Descendants are found three ways: the live parent/child tree, membership of the
//! worker's process group, and identities sampled while the worker was running
//! (children that re-parented to init after their parent died). Every signal is
//! checked against the recorded start time so a reused pid is never signalled.
//! Once the worker itself has been reaped its pid is no longer trusted: the tree
//! walk is skipped and the group is only used while the pid is still free.

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getpgrp, Pid};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A process as identified by pid plus kernel start time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessIdentity {
    pub pid: i32,
    pub start_time: u64,
}

/// One row of the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i32,
    pub ppid: i32,
    pub pgrp: i32,
    pub start_time: u64,
    pub zombie: bool,
}

impl ProcessInfo {
    pub fn identity(&self) -> ProcessIdentity {
        ProcessIdentity {
            pid: self.pid,
            start_time: self.start_time,
        }
    }
}

/// Parse `/proc/<pid>/stat`. The command name may contain spaces and parentheses,
/// so fields are counted from the last `)`.
pub fn parse_stat(line: &str) -> Option<ProcessInfo> {
    let pid: i32 = line.split_whitespace().next()?.parse().ok()?;
    let rest = &line[line.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // fields[0] is field 3 (state) of proc(5)
    let state = fields.first()?;
    let ppid = fields.get(1)?.parse().ok()?;
    let pgrp = fields.get(2)?.parse().ok()?;
    let start_time = fields.get(19)?.parse().ok()?;

    Some(ProcessInfo {
        pid,
        ppid,
        pgrp,
        start_time,
        zombie: *state == "Z" || *state == "X",
    })
}

/// Identity of a single live process, if `/proc` can tell.
pub fn identity_of(pid: i32) -> Option<ProcessIdentity> {
    let line = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat(&line).map(|info| info.identity())
}

/// Snapshot of the process table; empty where `/proc` is unavailable.
pub fn scan_processes() -> HashMap<i32, ProcessInfo> {
    let mut table = HashMap::new();
    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return table,
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        // Processes exit between readdir and read; that is expected
        if let Ok(line) = std::fs::read_to_string(entry.path().join("stat")) {
            if let Some(info) = parse_stat(&line) {
                table.insert(pid, info);
            }
        }
    }
    table
}

/// Pids that belong to the worker rooted at `root`, excluding `root` itself,
/// with their depth below the nearest ancestor outside the set (deepest first).
///
/// Without a `root` only group membership and tracked identities count; without
/// a `pgid` only the tree and tracked identities do.
pub fn descendants_deepest_first(
    table: &HashMap<i32, ProcessInfo>,
    root: Option<i32>,
    pgid: Option<i32>,
    tracked: &HashSet<ProcessIdentity>,
) -> Vec<ProcessInfo> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for info in table.values() {
        children.entry(info.ppid).or_default().push(info.pid);
    }

    let mut members: HashSet<i32> = HashSet::new();
    let mut stack: Vec<i32> = root.into_iter().collect();
    while let Some(pid) = stack.pop() {
        for &child in children.get(&pid).into_iter().flatten() {
            if members.insert(child) {
                stack.push(child);
            }
        }
    }
    for info in table.values() {
        if Some(info.pgrp) == pgid || tracked.contains(&info.identity()) {
            members.insert(info.pid);
        }
    }
    if let Some(root) = root {
        members.remove(&root);
    }

    let depth_of = |pid: i32| -> usize {
        let mut depth = 0;
        let mut current = pid;
        while let Some(info) = table.get(&current) {
            if Some(info.ppid) == root || !members.contains(&info.ppid) || depth > table.len() {
                break;
            }
            depth += 1;
            current = info.ppid;
        }
        depth
    };

    let mut found: Vec<(usize, ProcessInfo)> = members
        .iter()
        .filter_map(|pid| table.get(pid))
        .map(|info| (depth_of(info.pid), info.clone()))
        .collect();
    found.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.pid.cmp(&b.1.pid)));
    found.into_iter().map(|(_, info)| info).collect()
}

/// Samples a running worker's descendants so escaped processes are still known at
/// teardown time.
#[derive(Debug, Default)]
pub struct DescendantTracker {
    seen: HashSet<ProcessIdentity>,
}

impl DescendantTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, root: i32) {
        let table = scan_processes();
        for info in descendants_deepest_first(&table, Some(root), Some(root), &self.seen) {
            self.seen.insert(info.identity());
        }
    }

    pub fn tracked(&self) -> &HashSet<ProcessIdentity> {
        &self.seen
    }

    pub fn into_tracked(self) -> HashSet<ProcessIdentity> {
        self.seen
    }
}

/// The worker to tear down
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub pid: i32,
    /// Start time of the worker, read right after spawn
    pub start_time: Option<u64>,
    /// Process group the worker leads
    pub pgid: i32,
    pub tracked: HashSet<ProcessIdentity>,
    /// The worker process itself is still running (timeout or abort)
    pub leader_running: bool,
}

impl WorkerHandle {
    /// The worker's pid now names some other process. A reaped worker is gone
    /// from the table, so any live entry under its pid is a newcomer.
    fn pid_reused(&self, table: &HashMap<i32, ProcessInfo>) -> bool {
        !self.leader_running && table.contains_key(&self.pid)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub terminated: Vec<i32>,
    pub killed: Vec<i32>,
}

impl TeardownReport {
    pub fn is_empty(&self) -> bool {
        self.terminated.is_empty() && self.killed.is_empty()
    }
}

/// Terminates a worker and everything it spawned
#[async_trait]
pub trait IsolationTeardown: Send + Sync {
    async fn teardown(&self, worker: &WorkerHandle) -> TeardownReport;
}

/// SIGTERM deepest-first, grace period, re-scan, SIGKILL survivors
pub struct ProcessTreeTeardown {
    grace: Duration,
}

impl ProcessTreeTeardown {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    async fn wait_exit(&self, pid: i32, start_time: Option<u64>) -> bool {
        let deadline = tokio::time::Instant::now() + self.grace;
        loop {
            if !is_alive(&scan_processes(), pid, start_time) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

fn is_alive(table: &HashMap<i32, ProcessInfo>, pid: i32, start_time: Option<u64>) -> bool {
    match table.get(&pid) {
        Some(info) => !info.zombie && start_time.map_or(true, |t| t == info.start_time),
        None => false,
    }
}

fn send(pid: i32, signal: Signal) -> bool {
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!("Failed to send {:?} to pid {}: {}", signal, pid, e);
            false
        }
    }
}

#[async_trait]
impl IsolationTeardown for ProcessTreeTeardown {
    async fn teardown(&self, worker: &WorkerHandle) -> TeardownReport {
        let mut report = TeardownReport::default();
        let table = scan_processes();
        // An unreaped leader keeps its pid; a reaped one may have handed it on
        let root = worker.leader_running.then_some(worker.pid);
        let pgid = if worker.pid_reused(&table) {
            debug!("Worker pid {} was reused; skipping its group", worker.pid);
            None
        } else {
            Some(worker.pgid)
        };

        // Give the worker itself the first chance to release its resources
        if worker.leader_running
            && is_alive(&table, worker.pid, worker.start_time)
            && send(worker.pid, Signal::SIGTERM)
        {
            report.terminated.push(worker.pid);
            if !self.wait_exit(worker.pid, worker.start_time).await {
                debug!("Worker {} still running after SIGTERM", worker.pid);
            }
        }

        let table = scan_processes();
        let victims = descendants_deepest_first(&table, root, pgid, &worker.tracked);
        for info in &victims {
            if is_alive(&table, info.pid, Some(info.start_time)) && send(info.pid, Signal::SIGTERM)
            {
                report.terminated.push(info.pid);
            }
        }

        if !victims.is_empty() {
            tokio::time::sleep(self.grace).await;
        }

        // Anything left, including new children forked during the grace period
        let table = scan_processes();
        let mut survivors: Vec<ProcessInfo> = descendants_deepest_first(
            &table,
            root,
            pgid,
            &victims.iter().map(ProcessInfo::identity).collect(),
        )
        .into_iter()
        .filter(|info| is_alive(&table, info.pid, Some(info.start_time)))
        .collect();
        if let Some(leader) = root.and_then(|pid| table.get(&pid)) {
            if is_alive(&table, leader.pid, worker.start_time) {
                survivors.push(leader.clone());
            }
        }
        for info in &survivors {
            if send(info.pid, Signal::SIGKILL) {
                report.killed.push(info.pid);
            }
        }

        if let Some(pgid) = pgid.filter(|g| *g != getpgrp().as_raw()) {
            match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => debug!("killpg({}) failed: {}", pgid, e),
            }
        }

        if !report.is_empty() {
            info!(
                "Worker {}: terminated {:?}, killed {:?}",
                worker.pid, report.terminated, report.killed
            );
        }
        report
    }
}

/// Does nothing; for executors without OS processes
pub struct NoopTeardown;

#[async_trait]
impl IsolationTeardown for NoopTeardown {
    async fn teardown(&self, _worker: &WorkerHandle) -> TeardownReport {
        TeardownReport::default()
    }
}
