use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::io;

use procmon_affinity::{
    get_affinity, set_affinity, Affinity, AffinityBackend, BackendKind, BindScope, BindingHost,
    CpuBitmap, CpuIdSet, MAX_CPUS,
};

/// In-memory stand-in for the kernel side of a binding backend.
struct FakeKernel {
    kind: BackendKind,
    binding: RefCell<CpuBitmap>,
    applies: Cell<usize>,
}

impl FakeKernel {
    fn new(kind: BackendKind, bits: &[u32]) -> Self {
        FakeKernel {
            kind,
            binding: RefCell::new(bits.iter().copied().collect()),
            applies: Cell::new(0),
        }
    }
}

impl AffinityBackend for FakeKernel {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn scope(&self) -> BindScope {
        BindScope::Process
    }

    fn name(&self) -> &'static str {
        "fake"
    }

    fn query(&self, pid: u32) -> io::Result<CpuBitmap> {
        if pid == 0 {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such process"));
        }
        Ok(self.binding.borrow().clone())
    }

    fn apply(&self, pid: u32, mask: &CpuBitmap) -> io::Result<()> {
        if pid == 0 {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such process"));
        }
        self.applies.set(self.applies.get() + 1);
        *self.binding.borrow_mut() = mask.clone();
        Ok(())
    }
}

#[test]
fn topology_unbound_reports_every_existing_cpu_in_order() {
    let host = BindingHost::new(FakeKernel::new(BackendKind::Topology, &[]), 6);
    let cpus = get_affinity(100, &host).expect("query should succeed");
    assert_eq!(cpus.as_slice(), &[0, 1, 2, 3, 4, 5]);
}

#[test]
fn topology_reports_exactly_the_set_bits() {
    let host = BindingHost::new(FakeKernel::new(BackendKind::Topology, &[7, 2, 5]), 8);
    let cpus = get_affinity(100, &host).expect("query should succeed");
    assert_eq!(cpus.as_slice(), &[2, 5, 7]);
}

#[test]
fn native_mask_reports_set_bits_without_wildcard_rule() {
    let host = BindingHost::new(FakeKernel::new(BackendKind::NativeMask, &[0, 3]), 8);
    let cpus = get_affinity(100, &host).expect("query should succeed");
    assert_eq!(cpus.as_slice(), &[0, 3]);

    let host = BindingHost::new(FakeKernel::new(BackendKind::NativeMask, &[]), 8);
    let cpus = get_affinity(100, &host).expect("empty mask is still a result");
    assert!(cpus.is_empty());
}

#[test]
fn failed_query_is_none_and_failed_set_is_false() {
    let host = BindingHost::new(FakeKernel::new(BackendKind::Topology, &[1]), 4);
    assert!(Affinity::get(0, &host).is_none());
    assert!(!set_affinity(0, &host, [1u32].into_iter().collect()));
    assert_eq!(host.backend().applies.get(), 0);
}

#[test]
fn set_with_id_beyond_mask_width_never_reaches_kernel() {
    let host = BindingHost::new(FakeKernel::new(BackendKind::NativeMask, &[2]), 8);
    let cpus: CpuIdSet = [0u32, MAX_CPUS].into_iter().collect();
    assert!(!set_affinity(100, &host, cpus));
    assert_eq!(host.backend().applies.get(), 0);
    assert_eq!(get_affinity(100, &host).unwrap().as_slice(), &[2]);
}

#[test]
fn set_then_get_round_trips_as_a_set() {
    for kind in [BackendKind::Topology, BackendKind::NativeMask] {
        let host = BindingHost::new(FakeKernel::new(kind, &[0]), 8);
        let wanted: CpuIdSet = [6u32, 1, 4, 1].into_iter().collect();

        let mut descriptor = Affinity::new(&host);
        for id in wanted.iter() {
            descriptor.add(*id);
        }
        assert!(descriptor.set(100), "{kind:?}: set should succeed");

        let back = get_affinity(100, &host).expect("query should succeed");
        let wanted: BTreeSet<u32> = wanted.iter().copied().collect();
        let got: BTreeSet<u32> = back.iter().copied().collect();
        assert_eq!(got, wanted, "{kind:?}: round trip changed the binding");
    }
}

#[cfg(all(target_os = "linux", not(feature = "hwloc")))]
#[test]
fn live_native_backend_round_trips_own_binding() {
    let configured = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    let existing = if configured > 0 { configured as u32 } else { 1 };
    let host = procmon_affinity::detect(existing).expect("linux always has sched_affinity");
    assert_eq!(host.kind(), BackendKind::NativeMask);

    let pid = std::process::id();
    let current = Affinity::get(pid, &host).expect("own binding should be readable");
    assert!(!current.cpus().is_empty());

    // Re-applying the current binding must succeed and leave it unchanged.
    assert!(current.set(pid));
    let again = get_affinity(pid, &host).expect("own binding should be readable");
    assert_eq!(again.as_slice(), current.cpus().as_slice());
}
