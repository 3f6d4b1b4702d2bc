//! Merge a captured frame into the persistent process table.

use procmon_core::ProcmonResult;
use serde::Serialize;
use tracing::{debug, trace};

use crate::host::{CpuTickSource, Host};
use crate::process::{EnrichmentStatus, Process, ProcessState, ThreadScanStatus};
use crate::snapshot::{acquire, ProcTableSource};
use crate::table::ProcessTable;
use crate::version::{default_thread_scan_blocklist, KernelVersion, KernelVersionRange, ThreadScanGate};

/// One kernel record, as far as the reconciler cares.
pub trait ProcRecord {
    fn pid(&self) -> u32;

    fn uid(&self) -> u32;

    /// Copy the fields carried by the record itself onto `process`.
    ///
    /// Must not touch `uid`/`user`; the reconciler owns those.
    fn apply_primary(&self, process: &mut Process, pre_existing: bool);
}

/// Best-effort per-process kernel queries made after the primary fields
/// are applied.
///
/// Implementations must leave `process` untouched when they return an
/// error.
pub trait Enricher {
    /// Memory, CPU time and similar secondary fields.
    fn enrich(&mut self, process: &mut Process, time_interval_ns: f64) -> ProcmonResult<()>;

    /// Per-thread details (thread and running-thread counts).
    fn scan_threads(&mut self, process: &mut Process) -> ProcmonResult<()>;
}

/// Tunables for a scan.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Run the thread scan at all.
    pub scan_threads: bool,
    /// Kernel versions on which the thread scan is known to misbehave.
    pub thread_scan_blocklist: Option<KernelVersionRange>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            scan_threads: true,
            thread_scan_blocklist: default_thread_scan_blocklist(),
        }
    }
}

/// What one pass over a frame did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CycleStats {
    pub records: usize,
    pub created: usize,
    pub reused: usize,
    pub enrichment_failures: usize,
    pub thread_scans: usize,
    pub snapshot_attempts: u32,
    pub time_interval_ns: f64,
    /// Rows dropped by the sweep that followed, if any.
    pub removed: usize,
}

/// Drives one scan cycle: capture, then walk every record.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    thread_gate: ThreadScanGate,
}

impl Reconciler {
    /// The thread-scan gate is decided here, once, from the host's kernel
    /// version.
    pub fn new(config: &ScanConfig, kernel_version: Option<KernelVersion>) -> Self {
        let thread_gate = ThreadScanGate::evaluate(
            config.scan_threads,
            config.thread_scan_blocklist,
            kernel_version,
        );
        if thread_gate == ThreadScanGate::Blocked {
            debug!(?kernel_version, "thread scan disabled for this kernel");
        }
        Reconciler { thread_gate }
    }

    pub fn thread_gate(&self) -> ThreadScanGate {
        self.thread_gate
    }

    /// Capture the kernel table and merge it into `table`.
    ///
    /// Only marks rows fresh; exited processes stay until the table is
    /// swept. A capture failure is fatal and leaves `table` untouched.
    pub fn go_through_entries<K>(
        &self,
        table: &mut ProcessTable,
        host: &mut Host,
        kernel: &mut K,
    ) -> ProcmonResult<CycleStats>
    where
        K: ProcTableSource + Enricher + CpuTickSource,
        K::Record: ProcRecord,
    {
        // Every delta metric in this cycle uses the same interval.
        let time_interval_ns = host.time_interval_ns(&*kernel);
        let frame = acquire(kernel)?;

        let mut stats = CycleStats {
            records: frame.count(),
            snapshot_attempts: frame.attempts(),
            time_interval_ns,
            ..CycleStats::default()
        };
        let scan_threads = self.thread_gate.allows_scan();

        for record in frame.records() {
            let pid = record.pid();
            let (mut process, pre_existing) = table.take_or_create(pid);

            record.apply_primary(&mut process, pre_existing);

            match kernel.enrich(&mut process, time_interval_ns) {
                Ok(()) => process.enrichment = EnrichmentStatus::Applied,
                Err(err) => {
                    trace!(pid, %err, "enrichment not applied");
                    process.enrichment = EnrichmentStatus::NotApplied;
                    stats.enrichment_failures += 1;
                }
            }
            process.settle_cpu(time_interval_ns, pre_existing);

            let uid = record.uid();
            if !pre_existing || process.user.is_none() || process.uid != uid {
                process.uid = uid;
                process.user = Some(host.users().get_ref(uid));
            }

            if scan_threads {
                stats.thread_scans += 1;
                process.thread_scan = match kernel.scan_threads(&mut process) {
                    Ok(()) => ThreadScanStatus::Applied,
                    Err(err) => {
                        trace!(pid, %err, "thread scan not applied");
                        ThreadScanStatus::NotApplied
                    }
                };
            } else {
                process.thread_scan = ThreadScanStatus::Skipped;
            }

            table.total_tasks += 1;
            if process.state == ProcessState::Running {
                table.running_tasks += 1;
            }
            table.total_threads += process.thread_count.max(1);

            process.updated = true;
            process.last_seen_cycle = table.cycle();
            if pre_existing {
                stats.reused += 1;
            } else {
                stats.created += 1;
            }
            table.insert(process);
        }

        debug!(
            records = stats.records,
            created = stats.created,
            enrichment_failures = stats.enrichment_failures,
            "reconciled process table"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{CpuTicks, CPU_STATES};
    use crate::snapshot::FetchError;
    use crate::users::UsersTable;
    use procmon_core::ProcmonError;
    use std::io;

    #[derive(Debug, Clone, Copy, Default)]
    struct Row {
        pid: u32,
        uid: u32,
        ppid: u32,
    }

    impl ProcRecord for Row {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn uid(&self) -> u32 {
            self.uid
        }

        fn apply_primary(&self, process: &mut Process, _pre_existing: bool) {
            process.ppid = self.ppid;
            process.state = ProcessState::Running;
        }
    }

    struct Kernel {
        rows: Vec<Row>,
        failing_enrich: Vec<u32>,
        thread_scans: Vec<u32>,
    }

    impl ProcTableSource for Kernel {
        type Record = Row;

        fn query_size(&mut self) -> io::Result<usize> {
            Ok(self.rows.len() * std::mem::size_of::<Row>())
        }

        fn fetch(&mut self, buf: &mut [Row]) -> Result<usize, FetchError> {
            if buf.len() < self.rows.len() {
                return Err(FetchError::BufferTooSmall);
            }
            buf[..self.rows.len()].copy_from_slice(&self.rows);
            Ok(self.rows.len() * std::mem::size_of::<Row>())
        }
    }

    impl Enricher for Kernel {
        fn enrich(&mut self, process: &mut Process, _interval: f64) -> ProcmonResult<()> {
            if self.failing_enrich.contains(&process.pid) {
                return Err(ProcmonError::not_found(process.pid));
            }
            process.rss_bytes = 4096;
            Ok(())
        }

        fn scan_threads(&mut self, process: &mut Process) -> ProcmonResult<()> {
            self.thread_scans.push(process.pid);
            process.thread_count = 2;
            Ok(())
        }
    }

    impl CpuTickSource for Kernel {
        fn read_cpu_ticks(&mut self, existing_cpus: u32) -> ProcmonResult<Vec<CpuTicks>> {
            Ok(vec![[0; CPU_STATES]; existing_cpus as usize])
        }

        fn ticks_to_ns(&self, ticks: u64) -> f64 {
            ticks as f64 * 1e7
        }
    }

    fn host(version: Option<KernelVersion>) -> Host {
        Host::new(
            1,
            1,
            vec![[0; CPU_STATES]],
            UsersTable::with_resolver(|uid| (uid == 0).then(|| "root".to_string())),
            version,
        )
    }

    fn kernel(rows: &[(u32, u32)]) -> Kernel {
        Kernel {
            rows: rows
                .iter()
                .map(|&(pid, uid)| Row { pid, uid, ppid: 1 })
                .collect(),
            failing_enrich: Vec::new(),
            thread_scans: Vec::new(),
        }
    }

    #[test]
    fn test_new_row_gets_user_resolved() {
        let mut table = ProcessTable::new();
        let mut host = host(None);
        let mut kernel = kernel(&[(1, 0)]);
        let reconciler = Reconciler::new(&ScanConfig::default(), None);

        table.begin_cycle();
        reconciler
            .go_through_entries(&mut table, &mut host, &mut kernel)
            .unwrap();
        assert_eq!(table.get(1).unwrap().user.as_deref(), Some("root"));
    }

    #[test]
    fn test_uid_change_re_resolves_user() {
        let mut table = ProcessTable::new();
        let mut host = host(None);
        let mut kernel = kernel(&[(5, 0)]);
        let reconciler = Reconciler::new(&ScanConfig::default(), None);

        table.begin_cycle();
        reconciler
            .go_through_entries(&mut table, &mut host, &mut kernel)
            .unwrap();
        kernel.rows[0].uid = 1234;
        table.begin_cycle();
        reconciler
            .go_through_entries(&mut table, &mut host, &mut kernel)
            .unwrap();

        let p = table.get(5).unwrap();
        assert_eq!(p.uid, 1234);
        assert_eq!(p.user.as_deref(), Some("1234"));
    }

    #[test]
    fn test_running_and_thread_counters() {
        let mut table = ProcessTable::new();
        let mut host = host(None);
        let mut kernel = kernel(&[(1, 0), (2, 0)]);
        let config = ScanConfig {
            scan_threads: true,
            thread_scan_blocklist: None,
        };
        let reconciler = Reconciler::new(&config, None);

        table.begin_cycle();
        reconciler
            .go_through_entries(&mut table, &mut host, &mut kernel)
            .unwrap();
        assert_eq!(table.running_tasks, 2);
        assert_eq!(table.total_threads, 4);
    }

    #[test]
    fn test_capture_failure_leaves_table_untouched() {
        struct Broken;

        impl ProcTableSource for Broken {
            type Record = Row;

            fn query_size(&mut self) -> io::Result<usize> {
                Ok(0)
            }

            fn fetch(&mut self, _buf: &mut [Row]) -> Result<usize, FetchError> {
                unreachable!("zero size must abort before fetching")
            }
        }

        impl Enricher for Broken {
            fn enrich(&mut self, _p: &mut Process, _i: f64) -> ProcmonResult<()> {
                Ok(())
            }

            fn scan_threads(&mut self, _p: &mut Process) -> ProcmonResult<()> {
                Ok(())
            }
        }

        impl CpuTickSource for Broken {
            fn read_cpu_ticks(&mut self, n: u32) -> ProcmonResult<Vec<CpuTicks>> {
                Ok(vec![[0; CPU_STATES]; n as usize])
            }

            fn ticks_to_ns(&self, ticks: u64) -> f64 {
                ticks as f64
            }
        }

        let mut table = ProcessTable::new();
        table.insert(Process::new(9, 0));
        let mut host = host(None);
        let err = Reconciler::new(&ScanConfig::default(), None)
            .go_through_entries(&mut table, &mut host, &mut Broken)
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(table.len(), 1);
        assert_eq!(table.total_tasks, 0);
    }
}
