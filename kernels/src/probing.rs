//! Probe sequences: the pure mapping from a key to the slots it may occupy.
//!
//! A probe walks the table window by window. A window is `CG_SIZE *
//! vector_width` consecutive slots aligned to its own width; every lane of a
//! cooperative group owns `vector_width` consecutive slots inside it. With
//! `CG_SIZE == 1` and `vector_width == 1` this degenerates to classic
//! single-slot probing.

use core::marker::PhantomData;

use cust_core::DeviceCopy;

use crate::hash::{Hash, HashOutput};

/// Iterator over the slot indices of one probe sequence.
///
/// Pure and cheap to copy. Advancing wraps modulo the capacity; the probe
/// loops themselves terminate only on an empty slot (or a match), per the
/// load-factor-below-one caller contract.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ProbeIterator {
    current: usize,
    step: usize,
    capacity: usize,
}

impl ProbeIterator {
    pub const fn new(start: usize, step: usize, capacity: usize) -> Self {
        Self {
            current: start,
            step,
            capacity,
        }
    }

    /// The slot index this lane inspects at the current probing step.
    pub const fn current(&self) -> usize {
        self.current
    }

    /// Advances to this lane's slot in the next window.
    pub fn advance(&mut self) {
        self.current = (self.current + self.step) % self.capacity;
    }
}

// Safety: three usize fields, no pointers.
unsafe impl DeviceCopy for ProbeIterator {}

/// A collision-resolution strategy: hash function(s) plus the window walk.
pub trait ProbingScheme<Key>: Copy + DeviceCopy {
    /// Number of cooperating lanes per probing group.
    fn cg_size(&self) -> usize;

    /// Whether the step size is key-dependent (requires a prime window count
    /// so every step stays coprime with the table).
    fn is_double_hashing(&self) -> bool;

    /// Probe iterator for `key`, with this worker's lane rank inferred: the
    /// thread index modulo the group size on device, rank 0 on host.
    fn make_iterator(&self, key: &Key, vector_width: usize, capacity: usize) -> ProbeIterator {
        #[cfg(target_arch = "nvptx64")]
        let rank = (cuda_std::thread::thread_idx_x() as usize) % self.cg_size();
        #[cfg(not(target_arch = "nvptx64"))]
        let rank = 0;

        self.make_iterator_with_rank(key, vector_width, capacity, rank)
    }

    /// Probe iterator for `key` with an explicit lane rank.
    fn make_iterator_with_rank(
        &self,
        key: &Key,
        vector_width: usize,
        capacity: usize,
        rank: usize,
    ) -> ProbeIterator;
}

/// Linear probing: windows are visited in consecutive order.
///
/// The initial window comes from `hash(key) mod num_windows`; each step moves
/// one whole window (`CG_SIZE * vector_width` slots) forward.
#[repr(C)]
#[derive(Debug)]
pub struct LinearProbing<Key, Hasher, const CG_SIZE: usize = 1> {
    hasher: Hasher,
    _phantom: PhantomData<Key>,
}

impl<Key, Hasher: Clone, const CG_SIZE: usize> Clone for LinearProbing<Key, Hasher, CG_SIZE> {
    fn clone(&self) -> Self {
        Self {
            hasher: self.hasher.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<Key, Hasher: Copy, const CG_SIZE: usize> Copy for LinearProbing<Key, Hasher, CG_SIZE> {}

impl<Key, Hasher, const CG_SIZE: usize> LinearProbing<Key, Hasher, CG_SIZE>
where
    Hasher: Hash<Key>,
{
    const VALID_CG: () = assert!(
        CG_SIZE.is_power_of_two() && CG_SIZE <= 32,
        "cooperative group size must be a power of two no larger than a warp"
    );

    pub const fn new(hasher: Hasher) -> Self {
        #[allow(clippy::let_unit_value)]
        let _ = Self::VALID_CG;
        Self {
            hasher,
            _phantom: PhantomData,
        }
    }
}

impl<Key, Hasher, const CG_SIZE: usize> ProbingScheme<Key> for LinearProbing<Key, Hasher, CG_SIZE>
where
    Hasher: Hash<Key>,
{
    fn cg_size(&self) -> usize {
        CG_SIZE
    }

    fn is_double_hashing(&self) -> bool {
        false
    }

    fn make_iterator_with_rank(
        &self,
        key: &Key,
        vector_width: usize,
        capacity: usize,
        rank: usize,
    ) -> ProbeIterator {
        let stride = CG_SIZE * vector_width;
        let num_windows = capacity / stride;
        let start = (self.hasher.hash(key).to_usize() % num_windows) * stride;
        ProbeIterator::new(start + rank * vector_width, stride, capacity)
    }
}

// Safety: hasher is DeviceCopy, PhantomData is zero-sized.
unsafe impl<Key, Hasher, const CG_SIZE: usize> DeviceCopy for LinearProbing<Key, Hasher, CG_SIZE> where
    Hasher: Copy + DeviceCopy
{
}

/// Double hashing: a second hash picks a key-dependent window step.
///
/// The step is in `[1, num_windows - 1]` scaled by the window width. Extent
/// validation rounds `num_windows` to a prime for this scheme, so every
/// possible step is coprime with the window count and a full pass visits
/// every window exactly once.
#[repr(C)]
#[derive(Debug)]
pub struct DoubleHashProbing<Key, Hasher1, Hasher2, const CG_SIZE: usize = 1> {
    hasher1: Hasher1,
    hasher2: Hasher2,
    _phantom: PhantomData<Key>,
}

impl<Key, Hasher1: Clone, Hasher2: Clone, const CG_SIZE: usize> Clone
    for DoubleHashProbing<Key, Hasher1, Hasher2, CG_SIZE>
{
    fn clone(&self) -> Self {
        Self {
            hasher1: self.hasher1.clone(),
            hasher2: self.hasher2.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<Key, Hasher1: Copy, Hasher2: Copy, const CG_SIZE: usize> Copy
    for DoubleHashProbing<Key, Hasher1, Hasher2, CG_SIZE>
{
}

impl<Key, Hasher1, Hasher2, const CG_SIZE: usize> DoubleHashProbing<Key, Hasher1, Hasher2, CG_SIZE>
where
    Hasher1: Hash<Key>,
    Hasher2: Hash<Key>,
{
    const VALID_CG: () = assert!(
        CG_SIZE.is_power_of_two() && CG_SIZE <= 32,
        "cooperative group size must be a power of two no larger than a warp"
    );

    pub const fn new(hasher1: Hasher1, hasher2: Hasher2) -> Self {
        #[allow(clippy::let_unit_value)]
        let _ = Self::VALID_CG;
        Self {
            hasher1,
            hasher2,
            _phantom: PhantomData,
        }
    }
}

impl<Key, Hasher1, Hasher2, const CG_SIZE: usize> ProbingScheme<Key>
    for DoubleHashProbing<Key, Hasher1, Hasher2, CG_SIZE>
where
    Hasher1: Hash<Key>,
    Hasher2: Hash<Key>,
{
    fn cg_size(&self) -> usize {
        CG_SIZE
    }

    fn is_double_hashing(&self) -> bool {
        true
    }

    fn make_iterator_with_rank(
        &self,
        key: &Key,
        vector_width: usize,
        capacity: usize,
        rank: usize,
    ) -> ProbeIterator {
        let stride = CG_SIZE * vector_width;
        let num_windows = capacity / stride;
        let start = (self.hasher1.hash(key).to_usize() % num_windows) * stride;

        let step_windows = if num_windows > 1 {
            (self.hasher2.hash(key).to_usize() % (num_windows - 1)) + 1
        } else {
            1
        };

        ProbeIterator::new(start + rank * vector_width, step_windows * stride, capacity)
    }
}

// Safety: two DeviceCopy hashers plus PhantomData.
unsafe impl<Key, Hasher1, Hasher2, const CG_SIZE: usize> DeviceCopy
    for DoubleHashProbing<Key, Hasher1, Hasher2, CG_SIZE>
where
    Hasher1: Copy + DeviceCopy,
    Hasher2: Copy + DeviceCopy,
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{IdentityHash, XXHash64};

    #[test]
    fn linear_probe_visits_every_window_once() {
        let scheme = LinearProbing::<u64, IdentityHash<u64>, 4>::new(IdentityHash::new());
        let capacity = 4 * 8; // 8 windows of 4 slots
        let mut iter = scheme.make_iterator_with_rank(&5, 1, capacity, 0);
        let start = iter.current();

        let mut seen = std::collections::HashSet::new();
        loop {
            assert!(seen.insert(iter.current()), "window revisited early");
            iter.advance();
            if iter.current() == start {
                break;
            }
        }
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn lane_rank_offsets_partition_the_window() {
        let scheme = LinearProbing::<u64, IdentityHash<u64>, 4>::new(IdentityHash::new());
        let capacity = 4 * 8;
        let base = scheme.make_iterator_with_rank(&3, 1, capacity, 0).current();
        for rank in 0..4 {
            let iter = scheme.make_iterator_with_rank(&3, 1, capacity, rank);
            assert_eq!(iter.current(), base + rank);
        }
    }

    #[test]
    fn vector_width_scales_lane_offsets() {
        let scheme = LinearProbing::<u64, IdentityHash<u64>, 2>::new(IdentityHash::new());
        let capacity = 2 * 2 * 16;
        let lane0 = scheme.make_iterator_with_rank(&0, 2, capacity, 0);
        let lane1 = scheme.make_iterator_with_rank(&0, 2, capacity, 1);
        assert_eq!(lane1.current() - lane0.current(), 2);
    }

    #[test]
    fn double_hash_covers_prime_window_count() {
        let scheme = DoubleHashProbing::<u64, XXHash64<u64>, XXHash64<u64>, 1>::new(
            XXHash64::new(0),
            XXHash64::new(42),
        );
        // 13 windows (prime), single-slot windows.
        let capacity = 13;
        for key in 0u64..50 {
            let mut iter = scheme.make_iterator_with_rank(&key, 1, capacity, 0);
            let start = iter.current();
            let mut visited = 1;
            iter.advance();
            while iter.current() != start {
                visited += 1;
                iter.advance();
                assert!(visited <= capacity, "probe cycled without full coverage");
            }
            assert_eq!(visited, capacity);
        }
    }

    #[test]
    fn double_hash_step_is_never_zero() {
        let scheme = DoubleHashProbing::<u64, XXHash64<u64>, XXHash64<u64>, 1>::new(
            XXHash64::new(0),
            XXHash64::new(42),
        );
        for key in 0u64..100 {
            let mut iter = scheme.make_iterator_with_rank(&key, 1, 13, 0);
            let start = iter.current();
            iter.advance();
            assert_ne!(iter.current(), start);
        }
    }
}
