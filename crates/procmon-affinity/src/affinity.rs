//! Affinity descriptors: "this process may run on these CPUs".

use procmon_core::{ProcmonError, ProcmonResult};
use tracing::debug;

use crate::backend::{AffinityBackend, BackendKind, BindScope, PlatformBackend};
use crate::bitmap::CpuBitmap;
use crate::cpuset::CpuIdSet;

/// Host context an affinity query runs against.
///
/// Owns the backend (and whatever handle it needs, e.g. an hwloc topology)
/// plus the number of CPUs that exist on the machine.
#[derive(Debug)]
pub struct BindingHost<B: AffinityBackend> {
    backend: B,
    existing_cpus: u32,
}

impl<B: AffinityBackend> BindingHost<B> {
    pub fn new(backend: B, existing_cpus: u32) -> Self {
        BindingHost {
            backend,
            existing_cpus,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn existing_cpus(&self) -> u32 {
        self.existing_cpus
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn scope(&self) -> BindScope {
        self.backend.scope()
    }
}

/// Open the backend compiled into this build.
#[cfg(feature = "hwloc")]
pub fn detect(existing_cpus: u32) -> ProcmonResult<BindingHost<PlatformBackend>> {
    let backend = crate::hwloc::HwlocBackend::load()?;
    Ok(BindingHost::new(backend, existing_cpus))
}

/// Open the backend compiled into this build.
#[cfg(all(not(feature = "hwloc"), target_os = "linux"))]
pub fn detect(existing_cpus: u32) -> ProcmonResult<BindingHost<PlatformBackend>> {
    Ok(BindingHost::new(crate::linux::SchedBackend, existing_cpus))
}

/// Open the backend compiled into this build.
///
/// This build has no affinity capability: [`PlatformBackend`] is uninhabited
/// and no host can be constructed.
#[cfg(not(any(feature = "hwloc", target_os = "linux")))]
pub fn detect(_existing_cpus: u32) -> ProcmonResult<BindingHost<PlatformBackend>> {
    Err(ProcmonError::not_supported(
        "cpu affinity",
        procmon_core::get_platform(),
    ))
}

/// The CPU ids a process is (or should be) bound to, tied to the host that
/// produced it.
///
/// Descriptors are short-lived: build one per query or per set request and
/// drop it afterwards.
#[derive(Debug, Clone)]
pub struct Affinity<'h, B: AffinityBackend> {
    host: &'h BindingHost<B>,
    cpus: CpuIdSet,
}

impl<'h, B: AffinityBackend> Affinity<'h, B> {
    /// Empty descriptor for `host`.
    pub fn new(host: &'h BindingHost<B>) -> Self {
        Affinity {
            host,
            cpus: CpuIdSet::new(),
        }
    }

    /// Descriptor holding the given ids.
    pub fn with_cpus(host: &'h BindingHost<B>, cpus: CpuIdSet) -> Self {
        Affinity { host, cpus }
    }

    pub fn add(&mut self, id: u32) {
        self.cpus.add(id);
    }

    pub fn cpus(&self) -> &CpuIdSet {
        &self.cpus
    }

    pub fn host(&self) -> &'h BindingHost<B> {
        self.host
    }

    pub fn into_cpus(self) -> CpuIdSet {
        self.cpus
    }

    /// Query the kernel for the current binding of `pid`.
    ///
    /// Returns `None` when the kernel call fails (no such process, no
    /// permission). Ids come back in ascending order.
    pub fn get(pid: u32, host: &'h BindingHost<B>) -> Option<Self> {
        let bitmap = match host.backend.query(pid) {
            Ok(bitmap) => bitmap,
            Err(err) => {
                debug!(pid, backend = host.backend.name(), %err, "affinity query failed");
                return None;
            }
        };

        let mut affinity = Affinity::new(host);
        match host.backend.kind() {
            BackendKind::Topology => {
                if bitmap.last().is_none() {
                    // No restriction recorded: bound to everything.
                    affinity.cpus.extend(0..host.existing_cpus);
                } else {
                    affinity.cpus.extend(bitmap.ones());
                }
            }
            BackendKind::NativeMask => {
                affinity
                    .cpus
                    .extend((0..host.existing_cpus).filter(|&id| bitmap.is_set(id)));
            }
        }
        Some(affinity)
    }

    /// Apply this descriptor's ids as the binding of `pid`.
    ///
    /// Order and duplicates in the descriptor are irrelevant. The descriptor
    /// itself is not modified. Ids the backend's mask cannot hold fail the
    /// request before any mask is built.
    pub fn set(&self, pid: u32) -> bool {
        let width = self.host.backend.max_cpus();
        if let Some(id) = self.cpus.iter().copied().find(|&id| id >= width) {
            debug!(pid, id, width, backend = self.host.backend.name(), "CPU id beyond mask width");
            return false;
        }
        let mask: CpuBitmap = self.cpus.iter().copied().collect();
        match self.host.backend.apply(pid, &mask) {
            Ok(()) => true,
            Err(err) => {
                debug!(pid, backend = self.host.backend.name(), %err, "affinity apply failed");
                false
            }
        }
    }
}

/// Convenience wrapper around [`Affinity::get`] returning a plain id list.
pub fn get_affinity<B: AffinityBackend>(pid: u32, host: &BindingHost<B>) -> Option<CpuIdSet> {
    Affinity::get(pid, host).map(Affinity::into_cpus)
}

/// Convenience wrapper around [`Affinity::set`].
pub fn set_affinity<B: AffinityBackend>(pid: u32, host: &BindingHost<B>, cpus: CpuIdSet) -> bool {
    Affinity::with_cpus(host, cpus).set(pid)
}

/// Reject pid values that would be reinterpreted by `pid_t` casts.
pub fn validate_pid(pid: u32) -> ProcmonResult<()> {
    const MAX_SAFE_PID: u32 = i32::MAX as u32;
    if pid > MAX_SAFE_PID {
        return Err(ProcmonError::invalid_argument(format!(
            "PID {} exceeds maximum safe value {}",
            pid, MAX_SAFE_PID
        )));
    }
    Ok(())
}
