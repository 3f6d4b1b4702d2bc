//! Topology-aware backend using the hwloc C library.
//!
//! Uses the following APIs:
//! - `hwloc_topology_init()` / `hwloc_topology_load()` - discover the machine
//! - `hwloc_get_proc_cpubind()` - read a binding into a bitmap
//! - `hwloc_set_proc_cpubind()` - apply a bitmap as the binding
//! - `hwloc_bitmap_*()` - bitmap allocation and iteration
//!
//! On Linux hwloc is asked for thread bindings (`HWLOC_CPUBIND_THREAD`),
//! since the kernel binds tasks individually; elsewhere whole processes are
//! bound.

use std::io;
use std::ptr;

use libc::{c_int, c_uint, c_void, pid_t};
use procmon_core::{ProcmonError, ProcmonResult};

use crate::backend::{AffinityBackend, BackendKind, BindScope};
use crate::bitmap::CpuBitmap;

// ============================================================================
// hwloc FFI Bindings
// ============================================================================

type HwlocTopologyT = *mut c_void;
type HwlocBitmapT = *mut c_void;

// Flags from <hwloc.h>
#[cfg_attr(target_os = "linux", allow(dead_code))]
const HWLOC_CPUBIND_PROCESS: c_int = 1 << 0;
const HWLOC_CPUBIND_THREAD: c_int = 1 << 1;

#[cfg(target_os = "linux")]
const CPUBIND_FLAG: c_int = HWLOC_CPUBIND_THREAD;
#[cfg(not(target_os = "linux"))]
const CPUBIND_FLAG: c_int = HWLOC_CPUBIND_PROCESS;

#[link(name = "hwloc")]
extern "C" {
    fn hwloc_topology_init(topology: *mut HwlocTopologyT) -> c_int;
    fn hwloc_topology_load(topology: HwlocTopologyT) -> c_int;
    fn hwloc_topology_destroy(topology: HwlocTopologyT);

    fn hwloc_bitmap_alloc() -> HwlocBitmapT;
    fn hwloc_bitmap_free(bitmap: HwlocBitmapT);
    fn hwloc_bitmap_set(bitmap: HwlocBitmapT, id: c_uint) -> c_int;
    fn hwloc_bitmap_next(bitmap: HwlocBitmapT, prev: c_int) -> c_int;
    fn hwloc_bitmap_last(bitmap: HwlocBitmapT) -> c_int;

    fn hwloc_get_proc_cpubind(
        topology: HwlocTopologyT,
        pid: pid_t,
        set: HwlocBitmapT,
        flags: c_int,
    ) -> c_int;
    fn hwloc_set_proc_cpubind(
        topology: HwlocTopologyT,
        pid: pid_t,
        set: HwlocBitmapT,
        flags: c_int,
    ) -> c_int;
}

/// Owned hwloc bitmap, freed on drop.
struct Bitmap(HwlocBitmapT);

impl Bitmap {
    fn alloc() -> io::Result<Self> {
        let raw = unsafe { hwloc_bitmap_alloc() };
        if raw.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "hwloc_bitmap_alloc failed",
            ));
        }
        Ok(Bitmap(raw))
    }

    /// Set bit `id`; hwloc returns -1 when it cannot grow the bitmap.
    fn set(&mut self, id: u32) -> io::Result<()> {
        if unsafe { hwloc_bitmap_set(self.0, id as c_uint) } != 0 {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("hwloc_bitmap_set({id}) failed"),
            ));
        }
        Ok(())
    }

    fn to_cpu_bitmap(&self) -> CpuBitmap {
        let mut out = CpuBitmap::new();
        // last == -1 covers both "no bit set" and "infinitely set"; either
        // way hwloc recorded no finite restriction.
        if unsafe { hwloc_bitmap_last(self.0) } == -1 {
            return out;
        }
        let mut id = unsafe { hwloc_bitmap_next(self.0, -1) };
        while id >= 0 {
            out.set(id as u32);
            id = unsafe { hwloc_bitmap_next(self.0, id) };
        }
        out
    }
}

impl Drop for Bitmap {
    fn drop(&mut self) {
        unsafe { hwloc_bitmap_free(self.0) };
    }
}

/// Loaded hwloc topology acting as the binding backend.
#[derive(Debug)]
pub struct HwlocBackend {
    topology: HwlocTopologyT,
}

impl HwlocBackend {
    /// Initialize and load the machine topology.
    pub fn load() -> ProcmonResult<Self> {
        let mut topology: HwlocTopologyT = ptr::null_mut();
        if unsafe { hwloc_topology_init(&mut topology) } != 0 {
            return Err(ProcmonError::last_os_error("hwloc_topology_init failed"));
        }
        if unsafe { hwloc_topology_load(topology) } != 0 {
            unsafe { hwloc_topology_destroy(topology) };
            return Err(ProcmonError::last_os_error("hwloc_topology_load failed"));
        }
        Ok(HwlocBackend { topology })
    }
}

impl Drop for HwlocBackend {
    fn drop(&mut self) {
        unsafe { hwloc_topology_destroy(self.topology) };
    }
}

impl AffinityBackend for HwlocBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Topology
    }

    fn scope(&self) -> BindScope {
        if CPUBIND_FLAG == HWLOC_CPUBIND_THREAD {
            BindScope::Thread
        } else {
            BindScope::Process
        }
    }

    fn name(&self) -> &'static str {
        "hwloc"
    }

    fn query(&self, pid: u32) -> io::Result<CpuBitmap> {
        let set = Bitmap::alloc()?;
        let rc =
            unsafe { hwloc_get_proc_cpubind(self.topology, pid as pid_t, set.0, CPUBIND_FLAG) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(set.to_cpu_bitmap())
    }

    fn apply(&self, pid: u32, mask: &CpuBitmap) -> io::Result<()> {
        let mut set = Bitmap::alloc()?;
        for id in mask.ones() {
            set.set(id)?;
        }
        let rc =
            unsafe { hwloc_set_proc_cpubind(self.topology, pid as pid_t, set.0, CPUBIND_FLAG) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
