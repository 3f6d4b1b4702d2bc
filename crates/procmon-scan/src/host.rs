//! Machine-wide context for a scan cycle: CPU counts, per-CPU tick
//! counters, the users table and the kernel version.

use procmon_core::ProcmonResult;
use serde::Serialize;

use crate::users::UsersTable;
use crate::version::KernelVersion;

/// Tick states tracked per CPU.
///
/// Linux reports eight (user, nice, system, idle, iowait, irq, softirq,
/// steal); Darwin fills the first four and leaves the rest zero.
pub const CPU_STATES: usize = 8;

/// Cumulative scheduler ticks for one CPU, indexed by state.
pub type CpuTicks = [u64; CPU_STATES];

/// Source of per-CPU tick counters.
pub trait CpuTickSource {
    /// One entry per existing CPU, in CPU-id order.
    fn read_cpu_ticks(&mut self, existing_cpus: u32) -> ProcmonResult<Vec<CpuTicks>>;

    /// Convert scheduler ticks to nanoseconds.
    fn ticks_to_ns(&self, ticks: u64) -> f64;
}

/// Host-wide state the reconciler reads.
#[derive(Debug)]
pub struct Host {
    existing_cpus: u32,
    active_cpus: u32,
    prev_load: Vec<CpuTicks>,
    curr_load: Vec<CpuTicks>,
    users: UsersTable,
    kernel_version: Option<KernelVersion>,
}

impl Host {
    /// Host with both tick snapshots set to `initial`.
    ///
    /// The first cycle therefore sees a zero global diff.
    pub fn new(
        existing_cpus: u32,
        active_cpus: u32,
        initial: Vec<CpuTicks>,
        users: UsersTable,
        kernel_version: Option<KernelVersion>,
    ) -> Self {
        Host {
            existing_cpus,
            active_cpus,
            prev_load: initial.clone(),
            curr_load: initial,
            users,
            kernel_version,
        }
    }

    /// Probe the running machine.
    pub fn detect<T: CpuTickSource>(ticks: &mut T) -> ProcmonResult<Self> {
        let (existing, active) = cpu_counts();
        let initial = ticks.read_cpu_ticks(existing)?;
        Ok(Host::new(
            existing,
            active,
            initial,
            UsersTable::new(),
            KernelVersion::current(),
        ))
    }

    pub fn existing_cpus(&self) -> u32 {
        self.existing_cpus
    }

    pub fn active_cpus(&self) -> u32 {
        self.active_cpus
    }

    pub fn kernel_version(&self) -> Option<KernelVersion> {
        self.kernel_version
    }

    pub fn users(&mut self) -> &mut UsersTable {
        &mut self.users
    }

    pub fn prev_load(&self) -> &[CpuTicks] {
        &self.prev_load
    }

    pub fn curr_load(&self) -> &[CpuTicks] {
        &self.curr_load
    }

    /// Current snapshot becomes previous; `next` becomes current.
    pub fn refresh_ticks(&mut self, next: Vec<CpuTicks>) {
        self.prev_load = std::mem::replace(&mut self.curr_load, next);
    }

    /// Read fresh counters from `source` and rotate them in.
    pub fn sample<T: CpuTickSource>(&mut self, source: &mut T) -> ProcmonResult<()> {
        let next = source.read_cpu_ticks(self.existing_cpus)?;
        self.refresh_ticks(next);
        Ok(())
    }

    /// Ticks elapsed across every existing CPU and every state since the
    /// previous sample.
    pub fn global_diff(&self) -> u64 {
        let cpus = self.existing_cpus as usize;
        self.curr_load
            .iter()
            .zip(self.prev_load.iter())
            .take(cpus)
            .flat_map(|(curr, prev)| curr.iter().zip(prev.iter()))
            .map(|(c, p)| c.saturating_sub(*p))
            .sum()
    }

    /// Wall time of one sampling interval seen from a single CPU, in ns.
    ///
    /// Zero when no CPU is active.
    pub fn time_interval_ns<T: CpuTickSource + ?Sized>(&self, source: &T) -> f64 {
        if self.active_cpus == 0 {
            return 0.0;
        }
        source.ticks_to_ns(self.global_diff()) / f64::from(self.active_cpus)
    }

    pub fn summary(&self) -> HostSummary {
        HostSummary {
            existing_cpus: self.existing_cpus,
            active_cpus: self.active_cpus,
            kernel_version: self.kernel_version,
        }
    }
}

/// Serializable view of the host context.
#[derive(Debug, Clone, Serialize)]
pub struct HostSummary {
    pub existing_cpus: u32,
    pub active_cpus: u32,
    pub kernel_version: Option<KernelVersion>,
}

/// `(configured, online)` CPU counts; never below one.
#[cfg(unix)]
pub fn cpu_counts() -> (u32, u32) {
    let configured = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    let existing = if configured > 0 { configured as u32 } else { 1 };
    let active = if online > 0 { online as u32 } else { existing };
    (existing, active.min(existing))
}

#[cfg(not(unix))]
pub fn cpu_counts() -> (u32, u32) {
    let n = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    (n, n)
}

/// Scheduler clock rate in Hz.
#[cfg(unix)]
pub fn clock_ticks_per_second() -> u64 {
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 {
        hz as u64
    } else {
        100
    }
}
