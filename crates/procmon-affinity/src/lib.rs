//! procmon-affinity: Inspect and change which CPUs a process may run on
//!
//! The crate presents one contract over two structurally different kernel
//! facilities:
//!
//! | Backend | Selected when | Kernel API | Empty binding reported as |
//! |---------|---------------|------------|---------------------------|
//! | Topology | `hwloc` feature | `hwloc_{get,set}_proc_cpubind` | every existing CPU |
//! | Native mask | Linux, no `hwloc` | `sched_{get,set}affinity` | empty list |
//! | Unsupported | anything else | - | capability absent |
//!
//! The choice is made at build time. On unsupported builds
//! [`PlatformBackend`] is an uninhabited type and [`detect`] returns
//! `NotSupported`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use procmon_affinity::{detect, Affinity};
//!
//! let host = detect(8).unwrap();
//! if let Some(current) = Affinity::get(std::process::id(), &host) {
//!     println!("bound to {:?}", current.cpus());
//!     assert!(current.set(std::process::id()));
//! }
//! ```

pub mod affinity;
pub mod backend;
pub mod bitmap;
pub mod cpuset;

#[cfg(feature = "hwloc")]
pub mod hwloc;
#[cfg(all(not(feature = "hwloc"), target_os = "linux"))]
pub mod linux;

pub use affinity::{detect, get_affinity, set_affinity, validate_pid, Affinity, BindingHost};
pub use backend::{AffinityBackend, BackendKind, BindScope, PlatformBackend, Unsupported, SUPPORTED};
pub use bitmap::{CpuBitmap, MAX_CPUS};
pub use cpuset::{CpuIdSet, INITIAL_CAPACITY, MAX_CPU_ID};
