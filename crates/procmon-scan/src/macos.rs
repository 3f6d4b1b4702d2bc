//! macOS implementation using sysctl, libproc and the Mach host interface
//!
//! Uses the following APIs:
//! - `sysctl(CTL_KERN, KERN_PROC, KERN_PROC_ALL)` - whole process table as `kinfo_proc`
//! - `proc_pidinfo()` with `PROC_PIDTASKINFO` - memory and CPU time (enrichment)
//! - `proc_pidinfo()` with `PROC_PIDLISTTHREADS` / `PROC_PIDTHREADINFO` - thread scan
//! - `proc_pidpath()` - executable path
//! - `host_processor_info()` with `PROCESSOR_CPU_LOAD_INFO` - per-CPU ticks
//! - `mach_timebase_info()` - convert Mach time units to nanoseconds

use std::ffi::CStr;
use std::io;
use std::mem;
use std::ptr;
use std::sync::OnceLock;

use libc::{c_int, c_void};
use procmon_core::{ProcmonError, ProcmonResult};

use crate::host::{clock_ticks_per_second, CpuTickSource, CpuTicks, CPU_STATES};
use crate::process::{Process, ProcessState};
use crate::reconcile::{Enricher, ProcRecord};
use crate::snapshot::{FetchError, ProcTableSource};

// ============================================================================
// kinfo_proc Layout
// ============================================================================

/// `sizeof(struct kinfo_proc)` on 64-bit Darwin.
const KINFO_PROC_SIZE: usize = 648;

// Byte offsets into `struct kinfo_proc` (kp_proc is `struct extern_proc`,
// kp_eproc starts at 296).
const OFF_P_STARTTIME: usize = 0;
const OFF_P_STAT: usize = 36;
const OFF_P_PID: usize = 40;
const OFF_P_COMM: usize = 243;
const OFF_CR_UID: usize = 296 + 124;
const OFF_E_PPID: usize = 296 + 264;
const OFF_E_PGID: usize = 296 + 268;
const OFF_E_TPGID: usize = 296 + 280;

const MAXCOMLEN: usize = 16;

// Process status values from <sys/proc.h>
const SIDL: u8 = 1;
const SRUN: u8 = 2;
const SSLEEP: u8 = 3;
const SSTOP: u8 = 4;
const SZOMB: u8 = 5;

/// One `struct kinfo_proc`, kept as raw bytes.
#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct KinfoProc {
    raw: [u8; KINFO_PROC_SIZE],
}

impl Default for KinfoProc {
    fn default() -> Self {
        KinfoProc {
            raw: [0; KINFO_PROC_SIZE],
        }
    }
}

impl std::fmt::Debug for KinfoProc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KinfoProc")
            .field("pid", &self.pid())
            .field("comm", &self.comm())
            .finish()
    }
}

impl KinfoProc {
    fn i32_at(&self, off: usize) -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.raw[off..off + 4]);
        i32::from_ne_bytes(bytes)
    }

    fn i64_at(&self, off: usize) -> i64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.raw[off..off + 8]);
        i64::from_ne_bytes(bytes)
    }

    pub fn comm(&self) -> String {
        let field = &self.raw[OFF_P_COMM..OFF_P_COMM + MAXCOMLEN + 1];
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        String::from_utf8_lossy(&field[..end]).into_owned()
    }

    fn stat(&self) -> u8 {
        self.raw[OFF_P_STAT]
    }

    fn start_time_secs(&self) -> u64 {
        self.i64_at(OFF_P_STARTTIME).max(0) as u64
    }
}

impl ProcRecord for KinfoProc {
    fn pid(&self) -> u32 {
        self.i32_at(OFF_P_PID) as u32
    }

    fn uid(&self) -> u32 {
        self.i32_at(OFF_CR_UID) as u32
    }

    fn apply_primary(&self, process: &mut Process, pre_existing: bool) {
        process.ppid = self.i32_at(OFF_E_PPID) as u32;
        process.pgrp = self.i32_at(OFF_E_PGID) as u32;
        process.tpgid = self.i32_at(OFF_E_TPGID);
        process.state = match self.stat() {
            SIDL => ProcessState::Idle,
            SRUN => ProcessState::Running,
            SSLEEP => ProcessState::Sleeping,
            SSTOP => ProcessState::Stopped,
            SZOMB => ProcessState::Zombie,
            _ => ProcessState::Unknown,
        };
        if !pre_existing {
            process.name = self.comm();
            process.start_time_unix_secs = self.start_time_secs();
        }
    }
}

// ============================================================================
// libproc / Mach FFI Bindings
// ============================================================================

const PROC_PIDLISTTHREADS: c_int = 6;
const PROC_PIDTASKINFO: c_int = 4;
const PROC_PIDTHREADINFO: c_int = 5;
const MAXPATHLEN: usize = 1024;

const TH_STATE_RUNNING: i32 = 1;

const PROCESSOR_CPU_LOAD_INFO: c_int = 2;
const CPU_STATE_MAX: usize = 4;
const KERN_SUCCESS: c_int = 0;

/// Task info structure returned by proc_pidinfo with PROC_PIDTASKINFO
#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default)]
struct ProcTaskInfo {
    pti_virtual_size: u64,
    pti_resident_size: u64,
    pti_total_user: u64,
    pti_total_system: u64,
    pti_threads_user: u64,
    pti_threads_system: u64,
    pti_policy: i32,
    pti_faults: i32,
    pti_pageins: i32,
    pti_cow_faults: i32,
    pti_messages_sent: i32,
    pti_messages_received: i32,
    pti_syscalls_mach: i32,
    pti_syscalls_unix: i32,
    pti_csw: i32,
    pti_threadnum: i32,
    pti_numrunning: i32,
    pti_priority: i32,
}

/// Thread info structure returned by proc_pidinfo with PROC_PIDTHREADINFO
#[repr(C)]
#[allow(dead_code)]
struct ProcThreadInfo {
    pth_user_time: u64,
    pth_system_time: u64,
    pth_cpu_usage: i32,
    pth_policy: i32,
    pth_run_state: i32,
    pth_flags: i32,
    pth_sleep_time: i32,
    pth_curpri: i32,
    pth_priority: i32,
    pth_maxpriority: i32,
    pth_name: [libc::c_char; 64],
}

type MachPort = u32;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct MachTimebaseInfo {
    numer: u32,
    denom: u32,
}

extern "C" {
    fn proc_pidinfo(
        pid: c_int,
        flavor: c_int,
        arg: u64,
        buffer: *mut c_void,
        buffersize: c_int,
    ) -> c_int;

    fn proc_pidpath(pid: c_int, buffer: *mut c_void, buffersize: u32) -> c_int;

    fn mach_timebase_info(info: *mut MachTimebaseInfo) -> c_int;

    fn mach_host_self() -> MachPort;

    fn host_processor_info(
        host: MachPort,
        flavor: c_int,
        out_processor_count: *mut u32,
        out_processor_info: *mut *mut i32,
        out_processor_info_count: *mut u32,
    ) -> c_int;

    fn vm_deallocate(target_task: MachPort, address: usize, size: usize) -> c_int;

    static mach_task_self_: MachPort;
}

static MACH_TIMEBASE_FACTOR: OnceLock<f64> = OnceLock::new();

/// Mach absolute time units to nanoseconds.
fn mach_to_ns_factor() -> f64 {
    *MACH_TIMEBASE_FACTOR.get_or_init(|| {
        let mut info = MachTimebaseInfo { numer: 0, denom: 0 };
        let ret = unsafe { mach_timebase_info(&mut info) };
        if ret != 0 || info.denom == 0 {
            1.0
        } else {
            info.numer as f64 / info.denom as f64
        }
    })
}

fn task_info(pid: u32) -> ProcmonResult<ProcTaskInfo> {
    let mut info = ProcTaskInfo::default();
    let size = mem::size_of::<ProcTaskInfo>() as c_int;
    let ret = unsafe {
        proc_pidinfo(
            pid as c_int,
            PROC_PIDTASKINFO,
            0,
            &mut info as *mut _ as *mut c_void,
            size,
        )
    };
    if ret != size {
        return Err(pidinfo_error(pid, "read task info"));
    }
    Ok(info)
}

fn pidinfo_error(pid: u32, operation: &str) -> ProcmonError {
    match io::Error::last_os_error().raw_os_error() {
        Some(libc::EPERM) | Some(libc::EACCES) => ProcmonError::permission_denied(pid, operation),
        _ => ProcmonError::not_found(pid),
    }
}

fn executable_path(pid: u32) -> Option<String> {
    let mut buf = vec![0u8; MAXPATHLEN * 4];
    let ret = unsafe { proc_pidpath(pid as c_int, buf.as_mut_ptr() as *mut c_void, buf.len() as u32) };
    if ret <= 0 {
        return None;
    }
    let path = CStr::from_bytes_until_nul(&buf).ok()?;
    Some(path.to_string_lossy().into_owned())
}

// ============================================================================
// Kernel Interface
// ============================================================================

/// The running Darwin kernel.
#[derive(Debug, Clone, Copy)]
pub struct DarwinKernel {
    clock_ticks: u64,
}

impl DarwinKernel {
    pub fn new() -> Self {
        DarwinKernel {
            clock_ticks: clock_ticks_per_second(),
        }
    }

    fn mib() -> [c_int; 4] {
        [libc::CTL_KERN, libc::KERN_PROC, libc::KERN_PROC_ALL, 0]
    }
}

impl Default for DarwinKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcTableSource for DarwinKernel {
    type Record = KinfoProc;

    fn query_size(&mut self) -> io::Result<usize> {
        let mut mib = Self::mib();
        let mut size: libc::size_t = 0;
        let rc = unsafe {
            libc::sysctl(
                mib.as_mut_ptr(),
                mib.len() as u32,
                ptr::null_mut(),
                &mut size,
                ptr::null_mut(),
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(size)
    }

    fn fetch(&mut self, buf: &mut [KinfoProc]) -> Result<usize, FetchError> {
        let mut mib = Self::mib();
        let mut size: libc::size_t = mem::size_of_val(buf);
        let rc = unsafe {
            libc::sysctl(
                mib.as_mut_ptr(),
                mib.len() as u32,
                buf.as_mut_ptr() as *mut c_void,
                &mut size,
                ptr::null_mut(),
                0,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOMEM) {
                return Err(FetchError::BufferTooSmall);
            }
            return Err(FetchError::Os(err));
        }
        Ok(size)
    }
}

impl Enricher for DarwinKernel {
    fn enrich(&mut self, process: &mut Process, _time_interval_ns: f64) -> ProcmonResult<()> {
        let info = task_info(process.pid)?;
        let total_mach = info.pti_total_user.saturating_add(info.pti_total_system);

        process.set_cpu_time_ns((total_mach as f64 * mach_to_ns_factor()) as u64);
        process.vsize_bytes = info.pti_virtual_size;
        process.rss_bytes = info.pti_resident_size;
        process.thread_count = info.pti_threadnum.max(0) as u32;
        if process.command.is_none() {
            process.command = executable_path(process.pid);
        }
        Ok(())
    }

    fn scan_threads(&mut self, process: &mut Process) -> ProcmonResult<()> {
        let pid = process.pid;
        // Room for the reported count plus threads started since.
        let capacity = process.thread_count as usize + 16;
        let mut ids = vec![0u64; capacity];
        let bytes = unsafe {
            proc_pidinfo(
                pid as c_int,
                PROC_PIDLISTTHREADS,
                0,
                ids.as_mut_ptr() as *mut c_void,
                (capacity * mem::size_of::<u64>()) as c_int,
            )
        };
        if bytes <= 0 {
            return Err(pidinfo_error(pid, "list threads"));
        }
        ids.truncate(bytes as usize / mem::size_of::<u64>());

        let mut running = 0u32;
        for id in &ids {
            let mut info: ProcThreadInfo = unsafe { mem::zeroed() };
            let size = mem::size_of::<ProcThreadInfo>() as c_int;
            let ret = unsafe {
                proc_pidinfo(
                    pid as c_int,
                    PROC_PIDTHREADINFO,
                    *id,
                    &mut info as *mut _ as *mut c_void,
                    size,
                )
            };
            if ret == size && info.pth_run_state == TH_STATE_RUNNING {
                running += 1;
            }
        }

        process.thread_count = ids.len() as u32;
        process.running_threads = Some(running);
        Ok(())
    }
}

impl CpuTickSource for DarwinKernel {
    fn read_cpu_ticks(&mut self, existing_cpus: u32) -> ProcmonResult<Vec<CpuTicks>> {
        let mut cpu_count: u32 = 0;
        let mut info: *mut i32 = ptr::null_mut();
        let mut info_count: u32 = 0;
        let rc = unsafe {
            host_processor_info(
                mach_host_self(),
                PROCESSOR_CPU_LOAD_INFO,
                &mut cpu_count,
                &mut info,
                &mut info_count,
            )
        };
        if rc != KERN_SUCCESS || info.is_null() {
            return Err(ProcmonError::internal(format!(
                "host_processor_info failed: {rc}"
            )));
        }

        // SAFETY: the kernel returned info_count contiguous integers.
        let raw = unsafe { std::slice::from_raw_parts(info, info_count as usize) };
        let mut out = vec![[0u64; CPU_STATES]; existing_cpus as usize];
        for (slot, load) in out.iter_mut().zip(raw.chunks_exact(CPU_STATE_MAX)) {
            for (state, value) in slot.iter_mut().zip(load) {
                *state = *value as u32 as u64;
            }
        }

        unsafe {
            vm_deallocate(
                mach_task_self_,
                info as usize,
                info_count as usize * mem::size_of::<i32>(),
            )
        };
        Ok(out)
    }

    fn ticks_to_ns(&self, ticks: u64) -> f64 {
        ticks as f64 * 1e9 / self.clock_ticks as f64
    }
}
