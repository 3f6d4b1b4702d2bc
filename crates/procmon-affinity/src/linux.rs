//! Native-mask backend using `sched_getaffinity` / `sched_setaffinity`.
//!
//! Linux binds threads, not processes: the syscalls act on the task whose id
//! equals `pid`, which for a process id is its main thread.

use std::io;
use std::mem;

use crate::backend::{AffinityBackend, BackendKind, BindScope};
use crate::bitmap::CpuBitmap;

/// Bits in a `cpu_set_t`.
const CPU_SETSIZE: u32 = libc::CPU_SETSIZE as u32;

/// Binding backend over the fixed-width `cpu_set_t` syscalls.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedBackend;

impl AffinityBackend for SchedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::NativeMask
    }

    fn scope(&self) -> BindScope {
        BindScope::Thread
    }

    fn name(&self) -> &'static str {
        "sched_affinity"
    }

    fn max_cpus(&self) -> u32 {
        CPU_SETSIZE
    }

    fn query(&self, pid: u32) -> io::Result<CpuBitmap> {
        // SAFETY: cpu_set_t is plain data; zeroed is a valid empty set.
        let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
        let rc = unsafe {
            libc::sched_getaffinity(
                pid as libc::pid_t,
                mem::size_of::<libc::cpu_set_t>(),
                &mut set,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut bitmap = CpuBitmap::new();
        for id in 0..CPU_SETSIZE {
            if unsafe { libc::CPU_ISSET(id as usize, &set) } {
                bitmap.set(id);
            }
        }
        Ok(bitmap)
    }

    fn apply(&self, pid: u32, mask: &CpuBitmap) -> io::Result<()> {
        let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
        unsafe { libc::CPU_ZERO(&mut set) };
        for id in mask.ones() {
            if id >= CPU_SETSIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("CPU {id} exceeds cpu_set_t width {CPU_SETSIZE}"),
                ));
            }
            unsafe { libc::CPU_SET(id as usize, &mut set) };
        }

        let rc = unsafe {
            libc::sched_setaffinity(
                pid as libc::pid_t,
                mem::size_of::<libc::cpu_set_t>(),
                &set,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
