//! Repeated sampling: ticks, capture, reconcile, sweep.

use procmon_core::ProcmonResult;
use tracing::debug;

use crate::host::{CpuTickSource, Host};
use crate::reconcile::{CycleStats, Enricher, ProcRecord, Reconciler, ScanConfig};
use crate::snapshot::ProcTableSource;
use crate::table::ProcessTable;

/// Owns everything a sampling loop needs across cycles.
#[derive(Debug)]
pub struct Monitor<K> {
    kernel: K,
    host: Host,
    table: ProcessTable,
    reconciler: Reconciler,
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
impl Monitor<crate::PlatformKernel> {
    /// Monitor over the running kernel.
    pub fn open(config: &ScanConfig) -> ProcmonResult<Self> {
        let mut kernel = crate::PlatformKernel::new();
        let host = Host::detect(&mut kernel)?;
        Ok(Monitor::with_parts(kernel, host, config))
    }
}

impl<K> Monitor<K>
where
    K: ProcTableSource + Enricher + CpuTickSource,
    K::Record: ProcRecord,
{
    pub fn with_parts(kernel: K, host: Host, config: &ScanConfig) -> Self {
        let reconciler = Reconciler::new(config, host.kernel_version());
        Monitor {
            kernel,
            host,
            table: ProcessTable::new(),
            reconciler,
        }
    }

    /// Run one full cycle and drop rows for processes that have exited.
    pub fn cycle(&mut self) -> ProcmonResult<CycleStats> {
        self.host.sample(&mut self.kernel)?;
        self.table.begin_cycle();
        let mut stats =
            self.reconciler
                .go_through_entries(&mut self.table, &mut self.host, &mut self.kernel)?;
        let removed = self.table.sweep();
        if !removed.is_empty() {
            debug!(count = removed.len(), "removed exited processes");
        }
        stats.removed = removed.len();
        Ok(stats)
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }
}
