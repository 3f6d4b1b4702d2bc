//! Growable, append-only list of CPU identifiers.

use std::fmt;
use std::str::FromStr;

use procmon_core::{ProcmonError, ProcmonResult};

/// Capacity of a freshly created [`CpuIdSet`].
pub const INITIAL_CAPACITY: usize = 8;

/// Largest CPU id accepted from text. Matches the widest mask any backend
/// builds ([`crate::bitmap::MAX_CPUS`]).
pub const MAX_CPU_ID: u32 = crate::bitmap::MAX_CPUS - 1;

/// Ordered, append-only sequence of CPU indices.
///
/// Despite the name this is not a mathematical set: `add` never deduplicates
/// and there is no lookup or removal. Callers that need set semantics must
/// enforce them themselves.
///
/// Capacity is tracked separately from the number of used slots. It starts
/// at [`INITIAL_CAPACITY`] and doubles whenever an append finds it full, so
/// it is always `8 * 2^k` and never shrinks. Running out of memory while
/// growing aborts the process; a partially grown set is never observable.
#[derive(Clone, PartialEq, Eq)]
pub struct CpuIdSet {
    cpus: Vec<u32>,
    size: usize,
}

impl CpuIdSet {
    /// Create an empty set with room for [`INITIAL_CAPACITY`] ids.
    pub fn new() -> Self {
        CpuIdSet {
            cpus: Vec::with_capacity(INITIAL_CAPACITY),
            size: INITIAL_CAPACITY,
        }
    }

    /// Append `id`, doubling the capacity first when every slot is used.
    pub fn add(&mut self, id: u32) {
        if self.cpus.len() == self.size {
            self.size *= 2;
            self.cpus.reserve_exact(self.size - self.cpus.len());
        }
        self.cpus.push(id);
    }

    /// Number of ids appended so far.
    pub fn used(&self) -> usize {
        self.cpus.len()
    }

    /// Number of slots currently allocated.
    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// Ids in insertion order.
    pub fn as_slice(&self) -> &[u32] {
        &self.cpus
    }

    pub fn iter(&self) -> std::slice::Iter<'_, u32> {
        self.cpus.iter()
    }
}

impl Default for CpuIdSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CpuIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.cpus.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a CpuIdSet {
    type Item = &'a u32;
    type IntoIter = std::slice::Iter<'a, u32>;

    fn into_iter(self) -> Self::IntoIter {
        self.cpus.iter()
    }
}

impl FromIterator<u32> for CpuIdSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = CpuIdSet::new();
        for id in iter {
            set.add(id);
        }
        set
    }
}

impl Extend<u32> for CpuIdSet {
    fn extend<I: IntoIterator<Item = u32>>(&mut self, iter: I) {
        for id in iter {
            self.add(id);
        }
    }
}

/// Parse a kernel-style CPU list such as `0,2-4,7`.
///
/// Ranges are inclusive. Ids are appended in the order written, so
/// `"3,1"` yields `[3, 1]` and duplicates are kept. Ids above
/// [`MAX_CPU_ID`] are rejected before anything is appended for them.
impl FromStr for CpuIdSet {
    type Err = ProcmonError;

    fn from_str(s: &str) -> ProcmonResult<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ProcmonError::invalid_argument("CPU list cannot be empty"));
        }

        let mut set = CpuIdSet::new();
        for part in trimmed.split(',') {
            let part = part.trim();
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo = parse_cpu_id(lo)?;
                    let hi = parse_cpu_id(hi)?;
                    if lo > hi {
                        return Err(ProcmonError::invalid_argument(format!(
                            "CPU range '{part}' is reversed"
                        )));
                    }
                    set.extend(lo..=hi);
                }
                None => set.add(parse_cpu_id(part)?),
            }
        }
        Ok(set)
    }
}

fn parse_cpu_id(s: &str) -> ProcmonResult<u32> {
    let s = s.trim();
    let id = s
        .parse::<u32>()
        .map_err(|_| ProcmonError::invalid_argument(format!("invalid CPU id '{s}'")))?;
    if id > MAX_CPU_ID {
        return Err(ProcmonError::invalid_argument(format!(
            "CPU id {id} exceeds maximum {MAX_CPU_ID}"
        )));
    }
    Ok(id)
}
