//! Binding backends.
//!
//! A backend is the kernel-facing half of an affinity query: it reads or
//! writes a process binding as a [`CpuBitmap`]. Which backend a build uses
//! is decided at compile time (see [`PlatformBackend`]); there is exactly one
//! per build.

use std::io;

use serde::Serialize;

use crate::bitmap::CpuBitmap;

/// The two structurally different kernel facilities.
///
/// They disagree on one rule: a topology bitmap with no bit set means
/// "unrestricted" and is reported as every existing CPU, while an empty
/// native mask is reported as an empty binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Hardware-topology library bitmaps.
    Topology,
    /// Fixed-width kernel bitmask syscall pair.
    NativeMask,
}

/// What a binding request actually affects.
///
/// On hosts that bind threads rather than processes, querying or setting
/// "process" `pid` only touches the thread whose id equals `pid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindScope {
    Process,
    Thread,
}

/// Kernel access for CPU bindings.
pub trait AffinityBackend {
    fn kind(&self) -> BackendKind;

    fn scope(&self) -> BindScope;

    /// Short identifier used in logs and CLI output.
    fn name(&self) -> &'static str;

    /// Number of CPU ids the kernel-side mask can hold; ids at or above it
    /// cannot be applied.
    fn max_cpus(&self) -> u32 {
        crate::bitmap::MAX_CPUS
    }

    /// Read the current binding of `pid`.
    fn query(&self, pid: u32) -> io::Result<CpuBitmap>;

    /// Replace the binding of `pid` with `mask`.
    fn apply(&self, pid: u32, mask: &CpuBitmap) -> io::Result<()>;
}

impl<B: AffinityBackend + ?Sized> AffinityBackend for &B {
    fn kind(&self) -> BackendKind {
        (**self).kind()
    }

    fn scope(&self) -> BindScope {
        (**self).scope()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn max_cpus(&self) -> u32 {
        (**self).max_cpus()
    }

    fn query(&self, pid: u32) -> io::Result<CpuBitmap> {
        (**self).query(pid)
    }

    fn apply(&self, pid: u32, mask: &CpuBitmap) -> io::Result<()> {
        (**self).apply(pid, mask)
    }
}

/// Backend type for builds with no affinity capability.
///
/// The enum has no variants, so no value of it (and therefore no
/// [`crate::BindingHost`] over it) can ever exist.
#[derive(Debug)]
pub enum Unsupported {}

impl AffinityBackend for Unsupported {
    fn kind(&self) -> BackendKind {
        match *self {}
    }

    fn scope(&self) -> BindScope {
        match *self {}
    }

    fn name(&self) -> &'static str {
        match *self {}
    }

    fn query(&self, _pid: u32) -> io::Result<CpuBitmap> {
        match *self {}
    }

    fn apply(&self, _pid: u32, _mask: &CpuBitmap) -> io::Result<()> {
        match *self {}
    }
}

// Build-time backend selection: hwloc wins when the feature is enabled,
// otherwise Linux falls back to sched_{get,set}affinity.

/// Backend compiled into this build.
#[cfg(feature = "hwloc")]
pub type PlatformBackend = crate::hwloc::HwlocBackend;

/// Backend compiled into this build.
#[cfg(all(not(feature = "hwloc"), target_os = "linux"))]
pub type PlatformBackend = crate::linux::SchedBackend;

/// Backend compiled into this build.
#[cfg(not(any(feature = "hwloc", target_os = "linux")))]
pub type PlatformBackend = Unsupported;

/// True when this build carries an affinity backend.
pub const SUPPORTED: bool = cfg!(any(feature = "hwloc", target_os = "linux"));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_scope_serialize_snake_case() {
        assert_eq!(
            serde_json::to_value(BackendKind::NativeMask).unwrap(),
            "native_mask"
        );
        assert_eq!(serde_json::to_value(BackendKind::Topology).unwrap(), "topology");
        assert_eq!(serde_json::to_value(BindScope::Thread).unwrap(), "thread");
    }

    #[cfg(all(not(feature = "hwloc"), target_os = "linux"))]
    #[test]
    fn test_linux_build_carries_native_backend() {
        assert!(SUPPORTED);
        let backend = PlatformBackend::default();
        assert_eq!(backend.kind(), BackendKind::NativeMask);
    }
}
