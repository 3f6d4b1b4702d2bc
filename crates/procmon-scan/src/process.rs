//! The live process entity a scan cycle keeps up to date.

use std::sync::Arc;

use serde::Serialize;

/// Scheduler state as shown in the state column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    Sleeping,
    /// Uninterruptible wait.
    DiskSleep,
    Stopped,
    Traced,
    Zombie,
    Dead,
    Idle,
    #[default]
    Unknown,
}

impl ProcessState {
    /// Single-letter code in `ps` style.
    pub fn code(self) -> char {
        match self {
            ProcessState::Running => 'R',
            ProcessState::Sleeping => 'S',
            ProcessState::DiskSleep => 'D',
            ProcessState::Stopped => 'T',
            ProcessState::Traced => 't',
            ProcessState::Zombie => 'Z',
            ProcessState::Dead => 'X',
            ProcessState::Idle => 'I',
            ProcessState::Unknown => '?',
        }
    }
}

/// Outcome of the best-effort enrichment step this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    #[default]
    Pending,
    Applied,
    /// The kernel query failed; secondary fields keep their previous values.
    NotApplied,
}

/// Outcome of the thread scan this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadScanStatus {
    #[default]
    Pending,
    Applied,
    NotApplied,
    /// Gated off host-wide.
    Skipped,
}

/// One row of the process table.
#[derive(Debug, Clone, Serialize)]
pub struct Process {
    pub pid: u32,
    pub ppid: u32,
    pub pgrp: u32,
    pub tpgid: i32,
    pub uid: u32,
    /// Shared with every other row owned by the same uid.
    pub user: Option<Arc<str>>,
    pub name: String,
    pub command: Option<String>,
    pub state: ProcessState,
    /// Start time as seconds since the Unix epoch.
    pub start_time_unix_secs: u64,

    /// Cumulative user+system CPU time.
    pub cpu_time_ns: u64,
    /// Share of one CPU used during the last interval.
    pub cpu_percent: f64,
    pub rss_bytes: u64,
    pub vsize_bytes: u64,
    pub thread_count: u32,
    pub running_threads: Option<u32>,

    /// Seen in the current cycle.
    pub updated: bool,
    pub first_seen_cycle: u64,
    pub last_seen_cycle: u64,
    pub enrichment: EnrichmentStatus,
    pub thread_scan: ThreadScanStatus,

    #[serde(skip)]
    prev_cpu_time_ns: u64,
    #[serde(skip)]
    cpu_time_sampled: bool,
}

impl Process {
    pub fn new(pid: u32, cycle: u64) -> Self {
        Process {
            pid,
            ppid: 0,
            pgrp: 0,
            tpgid: -1,
            uid: 0,
            user: None,
            name: String::new(),
            command: None,
            state: ProcessState::Unknown,
            start_time_unix_secs: 0,
            cpu_time_ns: 0,
            cpu_percent: 0.0,
            rss_bytes: 0,
            vsize_bytes: 0,
            thread_count: 0,
            running_threads: None,
            updated: false,
            first_seen_cycle: cycle,
            last_seen_cycle: cycle,
            enrichment: EnrichmentStatus::Pending,
            thread_scan: ThreadScanStatus::Pending,
            prev_cpu_time_ns: 0,
            cpu_time_sampled: false,
        }
    }

    /// Record a fresh cumulative CPU time reading.
    pub fn set_cpu_time_ns(&mut self, ns: u64) {
        self.cpu_time_ns = ns;
        self.cpu_time_sampled = true;
    }

    /// Turn this cycle's CPU time reading into a percentage.
    ///
    /// A row with no reading this cycle keeps its previous percentage. The
    /// first reading of a row only establishes the baseline.
    pub(crate) fn settle_cpu(&mut self, time_interval_ns: f64, pre_existing: bool) {
        if !self.cpu_time_sampled {
            return;
        }
        self.cpu_time_sampled = false;

        self.cpu_percent = if pre_existing && time_interval_ns > 0.0 {
            let delta = self.cpu_time_ns.saturating_sub(self.prev_cpu_time_ns);
            delta as f64 / time_interval_ns * 100.0
        } else {
            0.0
        };
        self.prev_cpu_time_ns = self.cpu_time_ns;
    }

    /// Command line if known, else the short name.
    pub fn display_command(&self) -> &str {
        self.command.as_deref().unwrap_or(&self.name)
    }
}
