//! Host kernel version and the thread-scan capability gate.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use procmon_core::{ProcmonError, ProcmonResult};
use serde::Serialize;

/// `major.minor.patch` as reported by `uname -r`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct KernelVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl KernelVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        KernelVersion {
            major,
            minor,
            patch,
        }
    }

    /// Version of the running kernel, if `uname` cooperates.
    #[cfg(unix)]
    pub fn current() -> Option<Self> {
        // SAFETY: utsname is plain data and uname only writes into it.
        let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
        if unsafe { libc::uname(&mut uts) } != 0 {
            return None;
        }
        let release = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) };
        release.to_str().ok()?.parse().ok()
    }

    #[cfg(not(unix))]
    pub fn current() -> Option<Self> {
        None
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Parses the leading numeric components of a release string.
///
/// Missing components default to zero and any vendor suffix is ignored, so
/// `"6.8.0-45-generic"` is 6.8.0 and `"17.4"` is 17.4.0.
impl FromStr for KernelVersion {
    type Err = ProcmonError;

    fn from_str(s: &str) -> ProcmonResult<Self> {
        let mut parts = [0u16; 3];
        let mut seen = 0;
        for (slot, piece) in parts.iter_mut().zip(s.trim().split('.')) {
            let digits: String = piece.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                break;
            }
            *slot = digits.parse().map_err(|_| {
                ProcmonError::invalid_argument(format!("kernel version component '{piece}' out of range"))
            })?;
            seen += 1;
            if digits.len() != piece.len() {
                break;
            }
        }
        if seen == 0 {
            return Err(ProcmonError::invalid_argument(format!(
                "unrecognised kernel release '{s}'"
            )));
        }
        Ok(KernelVersion::new(parts[0], parts[1], parts[2]))
    }
}

/// Closed interval of kernel versions, both ends included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KernelVersionRange {
    pub lower: KernelVersion,
    pub upper: KernelVersion,
}

impl KernelVersionRange {
    pub const fn new(lower: KernelVersion, upper: KernelVersion) -> Self {
        KernelVersionRange { lower, upper }
    }

    pub fn contains(&self, version: KernelVersion) -> bool {
        version.cmp(&self.lower) != Ordering::Less && version.cmp(&self.upper) != Ordering::Greater
    }
}

/// Darwin 17.0 through 17.5 (macOS High Sierra) return corrupt data from
/// per-thread queries.
pub const DARWIN_THREAD_SCAN_BUGGY: KernelVersionRange =
    KernelVersionRange::new(KernelVersion::new(17, 0, 0), KernelVersion::new(17, 5, 0));

/// Known-bad range for thread scans on the platform this crate was built for.
pub fn default_thread_scan_blocklist() -> Option<KernelVersionRange> {
    if cfg!(target_os = "macos") {
        Some(DARWIN_THREAD_SCAN_BUGGY)
    } else {
        None
    }
}

/// Host-wide decision on whether thread enrichment runs.
///
/// Evaluated once from the host's version data; it is a feature switch, not
/// an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadScanGate {
    Enabled,
    /// Host kernel falls in a known-buggy range.
    Blocked,
    /// Thread scanning switched off by configuration.
    Disabled,
}

impl ThreadScanGate {
    pub fn evaluate(
        enabled: bool,
        blocklist: Option<KernelVersionRange>,
        version: Option<KernelVersion>,
    ) -> Self {
        if !enabled {
            return ThreadScanGate::Disabled;
        }
        match (blocklist, version) {
            (Some(range), Some(version)) if range.contains(version) => ThreadScanGate::Blocked,
            _ => ThreadScanGate::Enabled,
        }
    }

    pub fn allows_scan(self) -> bool {
        self == ThreadScanGate::Enabled
    }
}
