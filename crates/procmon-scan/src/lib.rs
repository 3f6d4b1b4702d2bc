//! procmon-scan: live process table sampling
//!
//! Each cycle captures the kernel's process table in one consistent frame,
//! then walks it and updates a persistent pid-keyed table of [`Process`]
//! rows. Rows are reused across cycles so delta metrics (CPU percent) can
//! be computed.
//!
//! ## Cycle
//!
//! 1. Rotate per-CPU tick counters and derive the cycle's time interval.
//! 2. Capture the table ([`snapshot::acquire`]), retrying with a growing
//!    margin if it outgrows the buffer.
//! 3. For every record: reuse or create the row, apply primary fields, run
//!    best-effort enrichment, refresh the owning user, optionally scan
//!    threads, bump counters.
//! 4. Sweep rows that were not seen ([`ProcessTable::sweep`]).
//!
//! ## Platform Support
//!
//! | Concern | Linux | macOS |
//! |---------|-------|-------|
//! | Table capture | /proc/[pid]/stat | sysctl KERN_PROC_ALL |
//! | Enrichment | /proc/[pid]/statm, cmdline | proc_pidinfo PROC_PIDTASKINFO |
//! | Thread scan | /proc/[pid]/task | PROC_PIDLISTTHREADS |
//! | CPU ticks | /proc/stat | host_processor_info |
//!
//! Thread scans are switched off host-wide on Darwin 17.0.0 through 17.5.0.
//!
//! ## Example
//!
//! ```rust,no_run
//! use procmon_scan::{Monitor, ScanConfig};
//!
//! let mut monitor = Monitor::open(&ScanConfig::default()).unwrap();
//! monitor.cycle().unwrap();
//! let stats = monitor.cycle().unwrap();
//! println!("{} tasks, {} new", monitor.table().total_tasks, stats.created);
//! ```

pub mod host;
pub mod monitor;
pub mod process;
pub mod reconcile;
pub mod snapshot;
pub mod table;
pub mod users;
pub mod version;

// Platform-specific implementations
#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "linux")]
use linux as platform;
#[cfg(target_os = "macos")]
use macos as platform;

/// Kernel interface for the platform this crate was built for.
#[cfg(target_os = "linux")]
pub type PlatformKernel = platform::LinuxKernel;
/// Kernel interface for the platform this crate was built for.
#[cfg(target_os = "macos")]
pub type PlatformKernel = platform::DarwinKernel;

pub use host::{CpuTickSource, CpuTicks, Host, HostSummary, CPU_STATES};
pub use monitor::Monitor;
pub use process::{EnrichmentStatus, Process, ProcessState, ThreadScanStatus};
pub use reconcile::{CycleStats, Enricher, ProcRecord, Reconciler, ScanConfig};
pub use snapshot::{acquire, FetchError, ProcTableSource, SnapshotError, SnapshotFrame};
pub use table::{ProcessTable, TableReport};
pub use users::UsersTable;
pub use version::{KernelVersion, KernelVersionRange, ThreadScanGate};

/// Whether this build can sample the live process table.
pub const SUPPORTED: bool = cfg!(any(target_os = "linux", target_os = "macos"));
