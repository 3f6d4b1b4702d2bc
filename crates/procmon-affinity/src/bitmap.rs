//! Kernel-side view of a CPU binding.
//!
//! Backends translate their native representation (an hwloc bitmap or a
//! `cpu_set_t`) to and from [`CpuBitmap`] so the population rules in
//! [`crate::affinity`] can be written once.

const WORD_BITS: u32 = u64::BITS;

/// Upper bound on the mask width of every backend.
pub const MAX_CPUS: u32 = 65_536;

/// Dense bitmap of CPU indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuBitmap {
    words: Vec<u64>,
}

impl CpuBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set bit `id`, growing the bitmap as needed.
    ///
    /// Storage grows with `id`; callers holding untrusted ids check them
    /// against the backend width first (see [`crate::AffinityBackend::max_cpus`]).
    pub fn set(&mut self, id: u32) {
        let word = (id / WORD_BITS) as usize;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (id % WORD_BITS);
    }

    pub fn is_set(&self, id: u32) -> bool {
        let word = (id / WORD_BITS) as usize;
        self.words
            .get(word)
            .is_some_and(|w| w & (1u64 << (id % WORD_BITS)) != 0)
    }

    /// Highest set bit, or `None` when no bit is set.
    pub fn last(&self) -> Option<u32> {
        self.words
            .iter()
            .enumerate()
            .rev()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i as u32 * WORD_BITS + (WORD_BITS - 1 - w.leading_zeros()))
    }

    pub fn is_empty(&self) -> bool {
        self.last().is_none()
    }

    /// Number of set bits.
    pub fn weight(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Set bits in ascending order.
    pub fn ones(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            (0..WORD_BITS)
                .filter(move |bit| w & (1u64 << bit) != 0)
                .map(move |bit| i as u32 * WORD_BITS + bit)
        })
    }
}

impl FromIterator<u32> for CpuBitmap {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut bitmap = CpuBitmap::new();
        for id in iter {
            bitmap.set(id);
        }
        bitmap
    }
}
