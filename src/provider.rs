/// Process capability provider: the seam between the core and the OS.
///
/// The core only needs four things from the platform: CPU time and resident
/// memory for a process tree, the live members of a process group, and a way
/// to signal a group. `ProcfsProvider` answers them from `/proc`.
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use procfs::process::{all_processes, Process};
use procfs::ProcError;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Resource usage of one live process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcUsage {
    pub pid: i32,
    /// Cumulative user + system CPU time.
    pub cpu_time: Duration,
    pub resident_bytes: u64,
}

/// Usage of a tracked process and its live descendants.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TreeUsage {
    pub members: Vec<ProcUsage>,
}

impl TreeUsage {
    pub fn resident_bytes(&self) -> u64 {
        self.members.iter().map(|m| m.resident_bytes).sum()
    }
}

/// Errors from probing the platform.
#[derive(Debug)]
pub enum ProbeError {
    /// The process no longer exists (or is a defunct zombie entry).
    Gone,
    /// Transient failure: permissions, a racing exit, malformed /proc data.
    Unavailable(String),
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Gone => write!(f, "process is gone"),
            ProbeError::Unavailable(msg) => write!(f, "process metrics unavailable: {msg}"),
        }
    }
}

impl std::error::Error for ProbeError {}

pub trait ProcessProvider: Send + Sync {
    /// CPU time and RSS for `pid` and every live descendant, including
    /// members of `pgid` that were reparented away from `pid`.
    fn tree_usage(&self, pid: i32, pgid: i32) -> Result<TreeUsage, ProbeError>;

    /// Live (non-zombie) members of a process group.
    fn group_members(&self, pgid: i32) -> Result<Vec<i32>, ProbeError>;

    /// Signal every member of a process group. An empty group is not an error.
    fn signal_group(&self, pgid: i32, signal: Signal) -> Result<(), ProbeError>;
}

/// One row of /proc/<pid>/stat, reduced to what the core needs.
#[derive(Debug, Clone, Copy)]
struct StatRow {
    pid: i32,
    ppid: i32,
    pgrp: i32,
    ticks: u64,
    rss_pages: u64,
}

/// Linux provider reading `/proc` through the `procfs` crate.
pub struct ProcfsProvider {
    ticks_per_second: u64,
    page_size: u64,
}

impl ProcfsProvider {
    pub fn new() -> Self {
        Self {
            ticks_per_second: procfs::ticks_per_second().max(1),
            page_size: procfs::page_size(),
        }
    }

    /// All live processes. Entries that vanish mid-scan are skipped.
    fn scan(&self) -> Result<Vec<StatRow>, ProbeError> {
        let processes = all_processes().map_err(|e| ProbeError::Unavailable(e.to_string()))?;
        let mut rows = Vec::new();
        for process in processes.flatten() {
            if let Ok(Some(row)) = read_row(&process) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn usage(&self, row: &StatRow) -> ProcUsage {
        let millis = row.ticks.saturating_mul(1000) / self.ticks_per_second;
        ProcUsage {
            pid: row.pid,
            cpu_time: Duration::from_millis(millis),
            resident_bytes: row.rss_pages.saturating_mul(self.page_size),
        }
    }
}

impl Default for ProcfsProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// `Ok(None)` for zombies, which hold no resources and cannot be signalled away.
fn read_row(process: &Process) -> Result<Option<StatRow>, ProcError> {
    let stat = process.stat()?;
    if stat.state == 'Z' || stat.state == 'X' {
        return Ok(None);
    }
    Ok(Some(StatRow {
        pid: stat.pid,
        ppid: stat.ppid,
        pgrp: stat.pgrp,
        ticks: stat.utime.saturating_add(stat.stime),
        rss_pages: stat.rss,
    }))
}

/// `pid` plus everything reachable through parent links or group membership.
fn tree_members(rows: &[StatRow], pid: i32, pgid: i32) -> Vec<StatRow> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for row in rows {
        children.entry(row.ppid).or_default().push(row.pid);
    }

    let mut wanted: HashSet<i32> = HashSet::new();
    let mut stack = vec![pid];
    while let Some(next) = stack.pop() {
        if wanted.insert(next) {
            if let Some(kids) = children.get(&next) {
                stack.extend(kids.iter().copied());
            }
        }
    }
    for row in rows {
        if row.pgrp == pgid {
            wanted.insert(row.pid);
        }
    }

    rows.iter().filter(|r| wanted.contains(&r.pid)).copied().collect()
}

impl ProcessProvider for ProcfsProvider {
    fn tree_usage(&self, pid: i32, pgid: i32) -> Result<TreeUsage, ProbeError> {
        match Process::new(pid).and_then(|p| read_row(&p)) {
            Ok(Some(_)) => {}
            Ok(None) => return Err(ProbeError::Gone),
            Err(ProcError::NotFound(_)) => return Err(ProbeError::Gone),
            Err(e) => return Err(ProbeError::Unavailable(e.to_string())),
        }

        let rows = self.scan()?;
        let members = tree_members(&rows, pid, pgid)
            .iter()
            .map(|row| self.usage(row))
            .collect();
        Ok(TreeUsage { members })
    }

    fn group_members(&self, pgid: i32) -> Result<Vec<i32>, ProbeError> {
        let rows = self.scan()?;
        Ok(rows
            .iter()
            .filter(|r| r.pgrp == pgid)
            .map(|r| r.pid)
            .collect())
    }

    fn signal_group(&self, pgid: i32, signal: Signal) -> Result<(), ProbeError> {
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProbeError::Unavailable(format!(
                "failed to send {signal:?} to process group {pgid}: {e}"
            ))),
        }
    }
}
