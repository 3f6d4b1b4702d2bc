//! The persistent pid -> process map and its per-cycle counters.

use std::collections::HashMap;

use procmon_core::schema::PROCESS_TABLE_V1;
use serde::Serialize;

use crate::host::HostSummary;
use crate::process::Process;

/// Live process table, keyed by pid.
///
/// Rows persist across cycles. A scan cycle only marks rows fresh; removing
/// rows whose process has exited is a separate step ([`ProcessTable::sweep`]).
#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: HashMap<u32, Process>,
    cycle: u64,
    pub total_tasks: u32,
    pub running_tasks: u32,
    pub total_threads: u32,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cycle number; zero before the first cycle.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Start a new cycle: bump the cycle number, zero the counters and mark
    /// every row stale.
    pub fn begin_cycle(&mut self) {
        self.cycle += 1;
        self.total_tasks = 0;
        self.running_tasks = 0;
        self.total_threads = 0;
        for process in self.processes.values_mut() {
            process.updated = false;
        }
    }

    pub fn get(&self, pid: u32) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn get_mut(&mut self, pid: u32) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.processes.contains_key(&pid)
    }

    /// Take the row for `pid` out of the table, or build a fresh one.
    ///
    /// The flag is `true` when the row already existed.
    pub(crate) fn take_or_create(&mut self, pid: u32) -> (Process, bool) {
        match self.processes.remove(&pid) {
            Some(process) => (process, true),
            None => (Process::new(pid, self.cycle), false),
        }
    }

    /// Insert or put back a row.
    pub fn insert(&mut self, process: Process) {
        self.processes.insert(process.pid, process);
    }

    pub fn remove(&mut self, pid: u32) -> Option<Process> {
        self.processes.remove(&pid)
    }

    /// Rows not refreshed in the current cycle.
    pub fn stale_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .processes
            .values()
            .filter(|p| !p.updated)
            .map(|p| p.pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Drop stale rows, returning their pids.
    pub fn sweep(&mut self) -> Vec<u32> {
        let stale = self.stale_pids();
        for pid in &stale {
            self.processes.remove(pid);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }

    /// Rows ordered by pid.
    pub fn sorted_by_pid(&self) -> Vec<&Process> {
        let mut rows: Vec<&Process> = self.processes.values().collect();
        rows.sort_by_key(|p| p.pid);
        rows
    }

    /// Serializable snapshot of the table.
    pub fn report<'a>(&'a self, host: HostSummary, rows: Vec<&'a Process>) -> TableReport<'a> {
        TableReport {
            schema_id: PROCESS_TABLE_V1,
            timestamp: current_timestamp(),
            platform: procmon_core::get_platform(),
            cycle: self.cycle,
            host,
            total_tasks: self.total_tasks,
            running_tasks: self.running_tasks,
            total_threads: self.total_threads,
            processes: rows,
        }
    }
}

/// JSON envelope for `procmon scan --json`.
#[derive(Debug, Serialize)]
pub struct TableReport<'a> {
    pub schema_id: &'static str,
    pub timestamp: String,
    pub platform: &'static str,
    pub cycle: u64,
    pub host: HostSummary,
    pub total_tasks: u32,
    pub running_tasks: u32,
    pub total_threads: u32,
    pub processes: Vec<&'a Process>,
}

/// Current time as RFC 3339.
pub fn current_timestamp() -> String {
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
