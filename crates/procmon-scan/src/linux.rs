//! Linux implementation using the /proc filesystem
//!
//! Reads process information from:
//! - `/proc/[pid]/stat` - primary record (state, parentage, CPU time)
//! - `/proc/[pid]/status` - owning UID
//! - `/proc/[pid]/statm` - memory statistics (enrichment)
//! - `/proc/[pid]/cmdline` - command line (enrichment)
//! - `/proc/[pid]/task/*/stat` - per-thread state (thread scan)
//! - `/proc/stat` - per-CPU ticks and boot time

use std::borrow::Cow;
use std::fs;
use std::io;
use std::mem;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use procmon_core::{ProcmonError, ProcmonResult};

use crate::host::{clock_ticks_per_second, CpuTickSource, CpuTicks, CPU_STATES};
use crate::process::{Process, ProcessState};
use crate::reconcile::{Enricher, ProcRecord};
use crate::snapshot::{FetchError, ProcTableSource};

/// Bytes of `comm` kept, including the terminating NUL (`TASK_COMM_LEN`).
const COMM_LEN: usize = 16;

// ============================================================================
// Primary Record
// ============================================================================

/// Fixed-size copy of one `/proc/[pid]/stat` line plus its owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcStatRecord {
    pub pid: u32,
    pub ppid: u32,
    pub pgrp: u32,
    pub tpgid: i32,
    pub uid: u32,
    pub state: u8,
    pub comm: [u8; COMM_LEN],
    pub num_threads: u32,
    pub cpu_time_ns: u64,
    pub start_time_unix_secs: u64,
}

impl ProcStatRecord {
    /// The kernel cuts `comm` on a byte boundary, so it may not be UTF-8.
    pub fn comm(&self) -> Cow<'_, str> {
        let end = self.comm.iter().position(|&b| b == 0).unwrap_or(COMM_LEN);
        String::from_utf8_lossy(&self.comm[..end])
    }
}

impl ProcRecord for ProcStatRecord {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn uid(&self) -> u32 {
        self.uid
    }

    fn apply_primary(&self, process: &mut Process, pre_existing: bool) {
        process.ppid = self.ppid;
        process.pgrp = self.pgrp;
        process.tpgid = self.tpgid;
        process.state = state_from_code(self.state as char);
        process.thread_count = self.num_threads;
        process.set_cpu_time_ns(self.cpu_time_ns);
        let comm = self.comm();
        if !pre_existing || process.name != *comm {
            process.name = comm.into_owned();
            process.start_time_unix_secs = self.start_time_unix_secs;
        }
    }
}

fn state_from_code(code: char) -> ProcessState {
    match code {
        'R' => ProcessState::Running,
        'S' => ProcessState::Sleeping,
        'D' => ProcessState::DiskSleep,
        'T' => ProcessState::Stopped,
        't' => ProcessState::Traced,
        'Z' => ProcessState::Zombie,
        'X' | 'x' => ProcessState::Dead,
        'I' => ProcessState::Idle,
        _ => ProcessState::Unknown,
    }
}

// ============================================================================
// Kernel Interface
// ============================================================================

/// The /proc tree of the running kernel (or a copy of one).
#[derive(Debug, Clone)]
pub struct LinuxKernel {
    root: PathBuf,
    clock_ticks: u64,
    boot_time: u64,
    page_size: u64,
}

impl LinuxKernel {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from a /proc-shaped tree rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let boot_time = fs::read_to_string(root.join("stat"))
            .map(|content| parse_boot_time(&content))
            .unwrap_or(0);
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        LinuxKernel {
            root,
            clock_ticks: clock_ticks_per_second(),
            boot_time,
            page_size: if page_size > 0 { page_size as u64 } else { 4096 },
        }
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// Numeric entries of the /proc root, pid 0 excluded.
    fn pids(&self) -> io::Result<Vec<u32>> {
        let mut pids = Vec::new();
        for entry in fs::read_dir(&self.root)?.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            match name.parse::<u32>() {
                Ok(0) | Err(_) => continue,
                Ok(pid) => pids.push(pid),
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }

    /// `None` when the process exited mid-scan.
    fn read_record(&self, pid: u32) -> Option<ProcStatRecord> {
        let dir = self.pid_dir(pid);
        let content = fs::read(dir.join("stat")).ok()?;
        let stat = parse_stat(&content).ok()?;

        let uid = fs::read_to_string(dir.join("status"))
            .ok()
            .and_then(|status| parse_uid(&status))
            .or_else(|| fs::metadata(&dir).ok().map(|m| m.uid()))?;

        let mut comm = [0u8; COMM_LEN];
        let n = stat.comm.len().min(COMM_LEN - 1);
        comm[..n].copy_from_slice(&stat.comm[..n]);

        Some(ProcStatRecord {
            pid,
            ppid: stat.ppid,
            pgrp: stat.pgrp,
            tpgid: stat.tpgid,
            uid,
            state: stat.state as u8,
            comm,
            num_threads: stat.num_threads,
            cpu_time_ns: self.ticks_to_whole_ns(stat.utime + stat.stime),
            start_time_unix_secs: stat.starttime / self.clock_ticks + self.boot_time,
        })
    }

    fn ticks_to_whole_ns(&self, ticks: u64) -> u64 {
        ticks.saturating_mul(1_000_000_000) / self.clock_ticks
    }
}

impl Default for LinuxKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcTableSource for LinuxKernel {
    type Record = ProcStatRecord;

    fn query_size(&mut self) -> io::Result<usize> {
        Ok(self.pids()?.len() * mem::size_of::<ProcStatRecord>())
    }

    fn fetch(&mut self, buf: &mut [ProcStatRecord]) -> Result<usize, FetchError> {
        let mut filled = 0;
        for pid in self.pids()? {
            let Some(record) = self.read_record(pid) else {
                continue;
            };
            let slot = buf.get_mut(filled).ok_or(FetchError::BufferTooSmall)?;
            *slot = record;
            filled += 1;
        }
        Ok(filled * mem::size_of::<ProcStatRecord>())
    }
}

impl Enricher for LinuxKernel {
    fn enrich(&mut self, process: &mut Process, _time_interval_ns: f64) -> ProcmonResult<()> {
        let dir = self.pid_dir(process.pid);
        let statm = fs::read_to_string(dir.join("statm"))
            .map_err(|e| map_io_error(e, process.pid))?;
        let (size_pages, resident_pages) = parse_statm(&statm)
            .ok_or_else(|| ProcmonError::internal("Invalid statm format"))?;
        let cmdline = read_cmdline(&dir.join("cmdline"));

        process.vsize_bytes = size_pages * self.page_size;
        process.rss_bytes = resident_pages * self.page_size;
        if !cmdline.is_empty() {
            process.command = Some(cmdline.join(" "));
        }
        Ok(())
    }

    fn scan_threads(&mut self, process: &mut Process) -> ProcmonResult<()> {
        let task_dir = self.pid_dir(process.pid).join("task");
        let entries = fs::read_dir(&task_dir).map_err(|e| map_io_error(e, process.pid))?;

        let mut threads = 0u32;
        let mut running = 0u32;
        for entry in entries.flatten() {
            let Ok(content) = fs::read(entry.path().join("stat")) else {
                continue;
            };
            let Ok(stat) = parse_stat(&content) else {
                continue;
            };
            threads += 1;
            if stat.state == 'R' {
                running += 1;
            }
        }

        process.thread_count = threads;
        process.running_threads = Some(running);
        Ok(())
    }
}

impl CpuTickSource for LinuxKernel {
    fn read_cpu_ticks(&mut self, existing_cpus: u32) -> ProcmonResult<Vec<CpuTicks>> {
        let content = fs::read_to_string(self.root.join("stat"))
            .map_err(|e| ProcmonError::internal(format!("Failed to read /proc/stat: {}", e)))?;
        Ok(parse_cpu_ticks(&content, existing_cpus))
    }

    fn ticks_to_ns(&self, ticks: u64) -> f64 {
        ticks as f64 * 1e9 / self.clock_ticks as f64
    }
}

// ============================================================================
// Parsers
// ============================================================================

/// Parsed /proc/[pid]/stat fields.
#[derive(Debug)]
struct StatInfo {
    comm: Vec<u8>,
    state: char,
    ppid: u32,
    pgrp: u32,
    tpgid: i32,
    utime: u64,
    stime: u64,
    num_threads: u32,
    starttime: u64,
}

/// Parse /proc/[pid]/stat content.
///
/// Format: pid (comm) state ppid pgrp session tty_nr tpgid flags minflt cminflt
///         majflt cmajflt utime stime cutime cstime priority nice num_threads
///         itrealvalue starttime vsize rss ...
///
/// Works on raw bytes: `comm` is whatever the process named itself and is
/// not guaranteed to be UTF-8. Everything after it is ASCII.
fn parse_stat(content: &[u8]) -> ProcmonResult<StatInfo> {
    // comm can contain spaces and parens; it ends at the last ')'.
    let start_paren = content
        .iter()
        .position(|&b| b == b'(')
        .ok_or_else(|| ProcmonError::internal("Invalid stat format: no '('"))?;
    let end_paren = content
        .iter()
        .rposition(|&b| b == b')')
        .ok_or_else(|| ProcmonError::internal("Invalid stat format: no ')'"))?;

    let comm = content
        .get(start_paren + 1..end_paren)
        .ok_or_else(|| ProcmonError::internal("Invalid stat format: ')' before '('"))?
        .to_vec();
    let rest = content.get(end_paren + 1..).unwrap_or_default();
    let rest = std::str::from_utf8(rest)
        .map_err(|_| ProcmonError::internal("Invalid stat format: non-ASCII fields"))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();

    if fields.len() < 20 {
        return Err(ProcmonError::internal(
            "Invalid stat format: too few fields",
        ));
    }

    Ok(StatInfo {
        comm,
        state: fields[0].chars().next().unwrap_or('?'),
        ppid: fields[1].parse().unwrap_or(0),
        pgrp: fields[2].parse().unwrap_or(0),
        tpgid: fields[5].parse().unwrap_or(-1),
        utime: fields[11].parse().unwrap_or(0),
        stime: fields[12].parse().unwrap_or(0),
        num_threads: fields[17].parse().unwrap_or(1),
        starttime: fields[19].parse().unwrap_or(0),
    })
}

/// Real UID from /proc/[pid]/status.
fn parse_uid(content: &str) -> Option<u32> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

/// `(size, resident)` in pages from /proc/[pid]/statm.
fn parse_statm(content: &str) -> Option<(u64, u64)> {
    let mut fields = content.split_whitespace();
    let size = fields.next()?.parse().ok()?;
    let resident = fields.next()?.parse().ok()?;
    Some((size, resident))
}

/// NUL-separated arguments, lossily decoded.
fn read_cmdline(path: &Path) -> Vec<String> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(_) => return Vec::new(),
    };

    bytes
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

fn parse_boot_time(content: &str) -> u64 {
    content
        .lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|rest| rest.trim().parse().ok())
        .unwrap_or(0)
}

/// Per-CPU tick rows (`cpuN ...`) from /proc/stat.
///
/// CPUs missing from the file (offline) read as zero.
fn parse_cpu_ticks(content: &str, existing_cpus: u32) -> Vec<CpuTicks> {
    let mut out = vec![[0u64; CPU_STATES]; existing_cpus as usize];
    for line in content.lines() {
        let Some(rest) = line.strip_prefix("cpu") else {
            continue;
        };
        let mut fields = rest.split_whitespace();
        let Some(Ok(id)) = fields.next().map(str::parse::<usize>) else {
            // The aggregate "cpu " line.
            continue;
        };
        let Some(slot) = out.get_mut(id) else {
            continue;
        };
        for (state, value) in slot.iter_mut().zip(fields) {
            *state = value.parse().unwrap_or(0);
        }
    }
    out
}

fn map_io_error(e: io::Error, pid: u32) -> ProcmonError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => ProcmonError::permission_denied(pid, "read process info"),
        _ => ProcmonError::not_found(pid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_LINE: &str = "4242 (tmux: server) S 1 4242 4242 0 -1 4194560 1204 0 0 0 \
        150 50 0 0 20 0 3 0 8000 23195648 1123 18446744073709551615";

    #[test]
    fn test_parse_stat_handles_spaces_in_comm() {
        let stat = parse_stat(STAT_LINE.as_bytes()).unwrap();
        assert_eq!(stat.comm, b"tmux: server");
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.ppid, 1);
        assert_eq!(stat.pgrp, 4242);
        assert_eq!(stat.tpgid, -1);
        assert_eq!(stat.utime, 150);
        assert_eq!(stat.stime, 50);
        assert_eq!(stat.num_threads, 3);
        assert_eq!(stat.starttime, 8000);
    }

    #[test]
    fn test_parse_stat_rejects_truncated_line() {
        assert!(parse_stat(b"1 (init) S 0").is_err());
        assert!(parse_stat(b"garbage").is_err());
    }

    #[test]
    fn test_parse_stat_rejects_close_paren_before_open() {
        let err = parse_stat(b"1 )x( S 0 1 1 0 -1 0 0 0 0 0 1 1 0 0 20 0 1 0 5").unwrap_err();
        assert!(err.to_string().contains("Invalid stat format"));
    }

    #[test]
    fn test_parse_stat_keeps_non_utf8_comm() {
        let mut line = b"20 (".to_vec();
        line.extend_from_slice(&[0xe4, 0xb8]);
        line.extend_from_slice(b") S 1 20 20 0 -1 0 0 0 0 0 7 3 0 0 20 0 2 0 900 0 0");
        let stat = parse_stat(&line).unwrap();
        assert_eq!(stat.comm, vec![0xe4, 0xb8]);
        assert_eq!(stat.utime, 7);
        assert_eq!(stat.num_threads, 2);
    }

    /// Minimal /proc tree under a fresh temp directory.
    fn fake_proc(tag: &str, entries: &[(u32, &[u8])]) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "procmon-linux-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("stat"), "cpu0 1 0 1 10 0 0 0 0\nbtime 1700000000\n").unwrap();
        for &(pid, comm) in entries {
            let dir = root.join(pid.to_string());
            let mut stat = format!("{pid} (").into_bytes();
            stat.extend_from_slice(comm);
            stat.extend_from_slice(b") R 1 1 1 0 -1 0 0 0 0 0 1 1 0 0 20 0 1 0 100 0 0\n");
            fs::create_dir_all(dir.join("task").join(pid.to_string())).unwrap();
            fs::write(dir.join("stat"), &stat).unwrap();
            fs::write(dir.join("task").join(pid.to_string()).join("stat"), &stat).unwrap();
            fs::write(dir.join("status"), "Name:\tx\nUid:\t1000\t1000\t1000\t1000\n").unwrap();
        }
        root
    }

    #[test]
    fn test_non_utf8_comm_stays_in_snapshot() {
        let root = fake_proc("comm", &[(10, b"ok"), (20, &[0xe4, 0xb8])]);
        let mut kernel = LinuxKernel::with_root(&root);

        let frame = crate::snapshot::acquire(&mut kernel).unwrap();
        let pids: Vec<u32> = frame.records().iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![10, 20]);

        let odd = &frame.records()[1];
        assert_eq!(odd.uid, 1000);
        assert_eq!(odd.comm(), "\u{fffd}");

        let mut process = Process::new(20, 1);
        odd.apply_primary(&mut process, false);
        assert_eq!(process.name, "\u{fffd}");

        kernel.scan_threads(&mut process).unwrap();
        assert_eq!(process.thread_count, 1);
        assert_eq!(process.running_threads, Some(1));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_multibyte_comm_cut_mid_character() {
        // 5 x 3-byte chars; the kernel keeps 15 bytes, we keep at most 15 too.
        let name = "日本語日本".as_bytes();
        let root = fake_proc("cut", &[(30, &name[..14])]);
        let mut kernel = LinuxKernel::with_root(&root);

        let frame = crate::snapshot::acquire(&mut kernel).unwrap();
        assert_eq!(frame.count(), 1);
        assert!(frame.records()[0].comm().starts_with("日本語日"));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_parse_uid_and_statm() {
        let status = "Name:\tbash\nUid:\t1000\t1000\t1000\t1000\nGid:\t1000\n";
        assert_eq!(parse_uid(status), Some(1000));
        assert_eq!(parse_uid("Name:\tbash\n"), None);
        assert_eq!(parse_statm("5663 1123 800 200 0 900 0\n"), Some((5663, 1123)));
        assert_eq!(parse_statm(""), None);
    }

    #[test]
    fn test_parse_cpu_ticks_skips_aggregate_and_fills_gaps() {
        let stat = "cpu  10 0 10 100 0 0 0 0 0 0\n\
                    cpu0 5 0 5 50 1 2 3 4 0 0\n\
                    cpu2 5 0 5 50 0 0 0 0 0 0\n\
                    intr 12345\n\
                    btime 1700000000\n";
        let ticks = parse_cpu_ticks(stat, 3);
        assert_eq!(ticks.len(), 3);
        assert_eq!(ticks[0], [5, 0, 5, 50, 1, 2, 3, 4]);
        assert_eq!(ticks[1], [0; CPU_STATES]);
        assert_eq!(ticks[2][3], 50);
        assert_eq!(parse_boot_time(stat), 1_700_000_000);
    }

    #[test]
    fn test_record_applies_primary_fields() {
        let mut comm = [0u8; COMM_LEN];
        comm[..4].copy_from_slice(b"bash");
        let record = ProcStatRecord {
            pid: 10,
            ppid: 1,
            pgrp: 10,
            tpgid: 10,
            uid: 1000,
            state: b'R',
            comm,
            num_threads: 1,
            cpu_time_ns: 2_000_000_000,
            start_time_unix_secs: 1_700_000_080,
        };
        let mut process = Process::new(10, 1);
        record.apply_primary(&mut process, false);
        assert_eq!(process.name, "bash");
        assert_eq!(process.state, ProcessState::Running);
        assert_eq!(process.cpu_time_ns, 2_000_000_000);
        assert_eq!(process.start_time_unix_secs, 1_700_000_080);
        // uid belongs to the reconciler.
        assert_eq!(process.uid, 0);
    }

    #[test]
    fn test_live_self_record() {
        let kernel = LinuxKernel::new();
        let record = kernel.read_record(std::process::id()).unwrap();
        assert_eq!(record.pid, std::process::id());
        assert!(record.num_threads >= 1);
        assert!(!record.comm().is_empty());
    }

    #[test]
    fn test_live_enrich_and_thread_scan_self() {
        let mut kernel = LinuxKernel::new();
        let mut process = Process::new(std::process::id(), 1);
        kernel.enrich(&mut process, 0.0).unwrap();
        assert!(process.rss_bytes > 0);
        assert!(process.vsize_bytes >= process.rss_bytes);

        kernel.scan_threads(&mut process).unwrap();
        assert!(process.thread_count >= 1);
        assert!(process.running_threads.unwrap() >= 1);
    }

    #[test]
    fn test_enrich_missing_process_fails_without_touching_row() {
        let mut kernel = LinuxKernel::new();
        let mut process = Process::new(999_999_999, 1);
        process.rss_bytes = 77;
        assert!(kernel.enrich(&mut process, 0.0).is_err());
        assert_eq!(process.rss_bytes, 77);
    }

    #[test]
    fn test_fetch_into_short_buffer_reports_too_small() {
        let mut kernel = LinuxKernel::new();
        let mut buf: [ProcStatRecord; 0] = [];
        // At least this test process is readable.
        assert!(matches!(
            kernel.fetch(&mut buf),
            Err(FetchError::BufferTooSmall)
        ));
    }

    #[test]
    fn test_live_cpu_ticks() {
        let mut kernel = LinuxKernel::new();
        let ticks = kernel.read_cpu_ticks(1).unwrap();
        assert_eq!(ticks.len(), 1);
        assert!(ticks[0].iter().sum::<u64>() > 0);
        assert!(kernel.ticks_to_ns(kernel.clock_ticks) == 1e9);
    }
}
