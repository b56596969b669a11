//! Device-side views of the static multimap.
//!
//! The mutable view supports cooperative insertion; the const view supports
//! contains plus the counting and retrieving families. Retrieval stages
//! matches in a per-warp shared-memory buffer and reserves contiguous ranges
//! of the global output with a single device-scope counter add per flush,
//! instead of one global atomic per match.

use crate::open_addressing::{EqualWrapper, KeyEqual, OpenAddressingRefImpl, ThreadScope};
use crate::pair::{alignment, AlignedTo, Pair};
use crate::probing::ProbingScheme;
use crate::storage::{Extent, SlotStorageRef};
use cust_core::DeviceCopy;

#[cfg(target_arch = "nvptx64")]
use crate::open_addressing::{EqualResult, PairEqual};
#[cfg(target_arch = "nvptx64")]
use crate::storage::{AtomicRef, CounterStorageRef};
#[cfg(target_arch = "nvptx64")]
use cuda_std::warp;

/// Full-warp mask: retrieval always flushes at warp width.
#[cfg(target_arch = "nvptx64")]
pub const WARP_MASK: u32 = u32::MAX;

/// Lanes per warp.
pub const WARP_SIZE: usize = 32;

macro_rules! multimap_view_common {
    () => {
        #[inline]
        pub const fn capacity(&self) -> usize {
            self.storage_ref.capacity()
        }

        #[inline]
        pub const fn extent(&self) -> Extent {
            self.storage_ref.extent()
        }

        #[inline]
        pub const fn empty_key_sentinel(&self) -> Key {
            self.empty_slot_sentinel.first
        }

        #[inline]
        pub const fn empty_value_sentinel(&self) -> Value {
            self.empty_slot_sentinel.second
        }

        #[inline]
        pub const fn storage_ref(&self) -> SlotStorageRef<Pair<Key, Value>, VECTOR_WIDTH> {
            self.storage_ref
        }

        #[inline]
        pub const fn probing_scheme(&self) -> &Scheme {
            &self.probing_scheme
        }

        #[inline]
        fn as_ref_impl(
            &self,
        ) -> OpenAddressingRefImpl<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE, true> {
            OpenAddressingRefImpl::new(
                self.storage_ref,
                self.empty_slot_sentinel,
                self.predicate,
                self.probing_scheme,
            )
        }
    };
}

/// Mutable device view: supports insertion (duplicates permitted).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StaticMultimapMutableRef<
    Key,
    Value,
    Scheme,
    const VECTOR_WIDTH: usize,
    KeyEq,
    const SCOPE: ThreadScope,
> where
    Key: Copy,
    Value: Copy,
    Scheme: Copy,
    KeyEq: Copy,
    (): AlignedTo<{ alignment::<Key, Value>() }>,
{
    storage_ref: SlotStorageRef<Pair<Key, Value>, VECTOR_WIDTH>,
    empty_slot_sentinel: Pair<Key, Value>,
    predicate: EqualWrapper<Key, KeyEq>,
    probing_scheme: Scheme,
}

// Safety: Copy value fields; the pointer is only dereferenced where the slot
// memory is accessible.
unsafe impl<Key, Value, Scheme, const VECTOR_WIDTH: usize, KeyEq, const SCOPE: ThreadScope>
    DeviceCopy for StaticMultimapMutableRef<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE>
where
    Key: DeviceCopy + Copy,
    Value: DeviceCopy + Copy,
    Scheme: DeviceCopy + Copy,
    KeyEq: DeviceCopy + Copy,
    Pair<Key, Value>: DeviceCopy,
    (): AlignedTo<{ alignment::<Key, Value>() }>,
{
}

impl<Key, Value, Scheme, const VECTOR_WIDTH: usize, KeyEq, const SCOPE: ThreadScope>
    StaticMultimapMutableRef<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE>
where
    Key: Copy + PartialEq,
    Value: Copy,
    Scheme: ProbingScheme<Key>,
    KeyEq: KeyEqual<Key>,
    (): AlignedTo<{ alignment::<Key, Value>() }>,
{
    pub const fn new(
        empty_slot_sentinel: Pair<Key, Value>,
        predicate: EqualWrapper<Key, KeyEq>,
        probing_scheme: Scheme,
        storage_ref: SlotStorageRef<Pair<Key, Value>, VECTOR_WIDTH>,
    ) -> Self {
        Self {
            storage_ref,
            empty_slot_sentinel,
            predicate,
            probing_scheme,
        }
    }

    multimap_view_common!();

    /// Single-worker insert. Claims the first free slot along the probe
    /// sequence; with no free slot the probe never returns, so sufficient
    /// capacity is the caller's contract.
    #[inline]
    pub fn insert(&self, pair: Pair<Key, Value>) -> bool {
        self.as_ref_impl().insert(pair)
    }
}

#[cfg(target_arch = "nvptx64")]
impl<Key, Value, Scheme, const VECTOR_WIDTH: usize, KeyEq, const SCOPE: ThreadScope>
    StaticMultimapMutableRef<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE>
where
    Key: DeviceCopy + Copy + PartialEq,
    Value: DeviceCopy + Copy,
    Scheme: ProbingScheme<Key>,
    KeyEq: KeyEqual<Key>,
    Pair<Key, Value>: DeviceCopy,
    (): AlignedTo<{ alignment::<Key, Value>() }>,
{
    /// Cooperative insert.
    ///
    /// # Safety
    /// `tile_mask` must name a converged warp partition executing this call
    /// together.
    #[inline]
    pub unsafe fn insert_cooperative(&self, tile_mask: u32, pair: Pair<Key, Value>) -> bool {
        // Safety: forwarded.
        unsafe { self.as_ref_impl().insert_cooperative(tile_mask, pair) }
    }
}

/// Const device view: contains, count, and retrieve families.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StaticMultimapRef<
    Key,
    Value,
    Scheme,
    const VECTOR_WIDTH: usize,
    KeyEq,
    const SCOPE: ThreadScope,
> where
    Key: Copy,
    Value: Copy,
    Scheme: Copy,
    KeyEq: Copy,
    (): AlignedTo<{ alignment::<Key, Value>() }>,
{
    storage_ref: SlotStorageRef<Pair<Key, Value>, VECTOR_WIDTH>,
    empty_slot_sentinel: Pair<Key, Value>,
    predicate: EqualWrapper<Key, KeyEq>,
    probing_scheme: Scheme,
}

// Safety: as for the mutable view.
unsafe impl<Key, Value, Scheme, const VECTOR_WIDTH: usize, KeyEq, const SCOPE: ThreadScope>
    DeviceCopy for StaticMultimapRef<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE>
where
    Key: DeviceCopy + Copy,
    Value: DeviceCopy + Copy,
    Scheme: DeviceCopy + Copy,
    KeyEq: DeviceCopy + Copy,
    Pair<Key, Value>: DeviceCopy,
    (): AlignedTo<{ alignment::<Key, Value>() }>,
{
}

impl<Key, Value, Scheme, const VECTOR_WIDTH: usize, KeyEq, const SCOPE: ThreadScope>
    StaticMultimapRef<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE>
where
    Key: Copy + PartialEq,
    Value: Copy,
    Scheme: ProbingScheme<Key>,
    KeyEq: KeyEqual<Key>,
    (): AlignedTo<{ alignment::<Key, Value>() }>,
{
    pub const fn new(
        empty_slot_sentinel: Pair<Key, Value>,
        predicate: EqualWrapper<Key, KeyEq>,
        probing_scheme: Scheme,
        storage_ref: SlotStorageRef<Pair<Key, Value>, VECTOR_WIDTH>,
    ) -> Self {
        Self {
            storage_ref,
            empty_slot_sentinel,
            predicate,
            probing_scheme,
        }
    }

    multimap_view_common!();

    /// Single-worker membership test.
    #[inline]
    pub fn contains(&self, key: &Key) -> bool {
        self.as_ref_impl().contains(key)
    }
}

#[cfg(target_arch = "nvptx64")]
impl<Key, Value, Scheme, const VECTOR_WIDTH: usize, KeyEq, const SCOPE: ThreadScope>
    StaticMultimapRef<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE>
where
    Key: DeviceCopy + Copy + PartialEq,
    Value: DeviceCopy + Copy + PartialEq,
    Scheme: ProbingScheme<Key>,
    KeyEq: KeyEqual<Key>,
    Pair<Key, Value>: DeviceCopy,
    (): AlignedTo<{ alignment::<Key, Value>() }>,
{
    /// Cooperative membership test.
    ///
    /// # Safety
    /// `tile_mask` must name a converged warp partition executing this call
    /// together.
    #[inline]
    pub unsafe fn contains_cooperative(&self, tile_mask: u32, key: &Key) -> bool {
        // Safety: forwarded.
        unsafe { self.as_ref_impl().contains_cooperative(tile_mask, key) }
    }

    /// Sums `value` across the tile; every lane receives the total.
    ///
    /// # Safety
    /// `tile_mask` must name a converged warp partition.
    #[inline]
    unsafe fn tile_sum(&self, tile_mask: u32, mut value: u32) -> u32 {
        let cg = self.probing_scheme.cg_size() as u32;
        let mut offset = cg / 2;
        while offset > 0 {
            // Safety: converged tile; xor partner stays inside the tile
            // because the tile is a power-of-two aligned partition.
            let (other, _) = unsafe { warp::warp_shuffle_xor(tile_mask, value, offset, 32) };
            value += other;
            offset /= 2;
        }
        value
    }

    /// Cooperative match count for one key. Every lane receives the total.
    ///
    /// With `IS_OUTER`, a probe with zero matches counts as one (left-join
    /// emission of the unmatched probe).
    ///
    /// # Safety
    /// `tile_mask` must name a converged warp partition executing this call
    /// together.
    #[inline]
    pub unsafe fn count_cooperative<const IS_OUTER: bool>(
        &self,
        tile_mask: u32,
        key: &Key,
    ) -> usize {
        let capacity = self.capacity();
        let mut iter = self.probing_scheme.make_iterator(key, VECTOR_WIDTH, capacity);

        let mut lane_matches = 0u32;
        loop {
            let base = iter.current();

            let mut saw_empty = false;
            for i in 0..VECTOR_WIDTH {
                // Safety: window slots stay inside the array.
                let slot_ptr = unsafe { self.storage_ref.slot(base + i) };
                // Safety: initialized slot.
                let slot_key = unsafe { (*slot_ptr).first };
                match self.predicate.equal_for_find(key, &slot_key) {
                    EqualResult::Equal => lane_matches += 1,
                    EqualResult::Empty => saw_empty = true,
                    _ => {}
                }
            }

            // Safety: converged tile.
            unsafe { warp::sync_warp(tile_mask) };
            // Safety: converged tile.
            if unsafe { warp::warp_vote_any(tile_mask, saw_empty) } {
                break;
            }

            iter.advance();
        }

        // Safety: converged tile.
        let total = unsafe { self.tile_sum(tile_mask, lane_matches) } as usize;
        if IS_OUTER && total == 0 {
            1
        } else {
            total
        }
    }

    /// Cooperative pair-match count for one probe pair. Every lane receives
    /// the total.
    ///
    /// # Safety
    /// As for [`Self::count_cooperative`].
    #[inline]
    pub unsafe fn pair_count_cooperative<const IS_OUTER: bool, PairEq>(
        &self,
        tile_mask: u32,
        probe: &Pair<Key, Value>,
        pair_equal: &PairEq,
    ) -> usize
    where
        PairEq: PairEqual<Key, Value>,
    {
        let capacity = self.capacity();
        let mut iter = self
            .probing_scheme
            .make_iterator(&probe.first, VECTOR_WIDTH, capacity);

        let mut lane_matches = 0u32;
        loop {
            let base = iter.current();

            let mut saw_empty = false;
            for i in 0..VECTOR_WIDTH {
                // Safety: window slots stay inside the array.
                let slot_ptr = unsafe { self.storage_ref.slot(base + i) };
                // Safety: initialized slot.
                let slot = unsafe { *slot_ptr };
                if self.predicate.is_empty_sentinel(&slot.first) {
                    saw_empty = true;
                } else if pair_equal.equal(probe, &slot) {
                    lane_matches += 1;
                }
            }

            // Safety: converged tile.
            unsafe { warp::sync_warp(tile_mask) };
            // Safety: converged tile.
            if unsafe { warp::warp_vote_any(tile_mask, saw_empty) } {
                break;
            }

            iter.advance();
        }

        // Safety: converged tile.
        let total = unsafe { self.tile_sum(tile_mask, lane_matches) } as usize;
        if IS_OUTER && total == 0 {
            1
        } else {
            total
        }
    }

    /// Warp-collective flush of the staging buffer: the warp leader reserves
    /// `fill` contiguous output records from the device-wide counter, the
    /// warp copies the buffer over warp-strided, and the fill counter
    /// resets.
    ///
    /// # Safety
    /// Whole-warp call: every lane of the warp must be converged here.
    /// `buffer` and `warp_fill` must be this warp's shared-memory staging
    /// area; `output` must have room for every record ever reserved.
    #[inline]
    unsafe fn flush_output_buffer(
        &self,
        warp_fill: &AtomicRef<'_, u32, { ThreadScope::Block }>,
        buffer: *const Pair<Key, Value>,
        num_matches: &CounterStorageRef<{ ThreadScope::Device }>,
        output: *mut Pair<Key, Value>,
    ) {
        use core::sync::atomic::Ordering;

        let lane = warp::lane_id();
        let fill = warp_fill.load(Ordering::Relaxed);
        if fill == 0 {
            return;
        }

        let base = if lane == 0 {
            num_matches.data().fetch_add(fill as u64, Ordering::Relaxed)
        } else {
            0
        };
        // Safety: whole-warp call per the contract.
        let (base, _) = unsafe { warp::warp_shuffle_idx(WARP_MASK, base, 0, 32) };

        let mut i = lane as usize;
        while i < fill as usize {
            // Safety: `i < fill <= buffer capacity`; the reserved output
            // range `[base, base + fill)` is exclusively this warp's.
            unsafe { *output.add(base as usize + i) = *buffer.add(i) };
            i += WARP_SIZE;
        }

        // Safety: whole-warp call.
        unsafe { warp::sync_warp(WARP_MASK) };
        if lane == 0 {
            warp_fill.store(0, Ordering::Relaxed);
        }
        // Safety: whole-warp call.
        unsafe { warp::sync_warp(WARP_MASK) };
    }

    /// Dual-buffer variant of [`Self::flush_output_buffer`] for pair
    /// retrieval: probe and contained records flush to two output streams at
    /// identical offsets.
    ///
    /// # Safety
    /// As for [`Self::flush_output_buffer`].
    #[inline]
    #[allow(clippy::too_many_arguments)]
    unsafe fn flush_pair_output_buffers(
        &self,
        warp_fill: &AtomicRef<'_, u32, { ThreadScope::Block }>,
        probe_buffer: *const Pair<Key, Value>,
        contained_buffer: *const Pair<Key, Value>,
        num_matches: &CounterStorageRef<{ ThreadScope::Device }>,
        probe_output: *mut Pair<Key, Value>,
        contained_output: *mut Pair<Key, Value>,
    ) {
        use core::sync::atomic::Ordering;

        let lane = warp::lane_id();
        let fill = warp_fill.load(Ordering::Relaxed);
        if fill == 0 {
            return;
        }

        let base = if lane == 0 {
            num_matches.data().fetch_add(fill as u64, Ordering::Relaxed)
        } else {
            0
        };
        // Safety: whole-warp call per the contract.
        let (base, _) = unsafe { warp::warp_shuffle_idx(WARP_MASK, base, 0, 32) };

        let mut i = lane as usize;
        while i < fill as usize {
            // Safety: as in flush_output_buffer, for both streams.
            unsafe {
                *probe_output.add(base as usize + i) = *probe_buffer.add(i);
                *contained_output.add(base as usize + i) = *contained_buffer.add(i);
            }
            i += WARP_SIZE;
        }

        // Safety: whole-warp call.
        unsafe { warp::sync_warp(WARP_MASK) };
        if lane == 0 {
            warp_fill.store(0, Ordering::Relaxed);
        }
        // Safety: whole-warp call.
        unsafe { warp::sync_warp(WARP_MASK) };
    }

    /// Cooperative retrieve of every `(key, value)` match for one probe key,
    /// staged through the warp's shared-memory buffer.
    ///
    /// The whole warp stays converged: probing groups whose probe already
    /// ended (or that received `active == false` from the tail of the input)
    /// keep participating in flushes until every group in the warp is done,
    /// then the buffer drains.
    ///
    /// With `IS_OUTER`, a probe with zero matches emits one
    /// `(probe_key, empty_value)` record.
    ///
    /// # Safety
    /// Whole-warp call with a converged warp; `tile_mask` must name this
    /// lane's probing partition; `buffer`/`warp_fill` must be this warp's
    /// staging area of `buffer_size` records; `output` must have room for
    /// every match this bulk operation can produce.
    #[inline]
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn retrieve_cooperative<const IS_OUTER: bool>(
        &self,
        tile_mask: u32,
        active: bool,
        key: &Key,
        warp_fill: &AtomicRef<'_, u32, { ThreadScope::Block }>,
        buffer: *mut Pair<Key, Value>,
        buffer_size: usize,
        num_matches: &CounterStorageRef<{ ThreadScope::Device }>,
        output: *mut Pair<Key, Value>,
    ) {
        use core::sync::atomic::Ordering;

        let capacity = self.capacity();
        let rank = (warp::lane_id() % self.probing_scheme.cg_size() as u32) as usize;
        let mut iter = self.probing_scheme.make_iterator(key, VECTOR_WIDTH, capacity);

        let mut running = active;
        let mut found_any = false;

        // One window per iteration; worst case the warp stages a full
        // window per lane plus one outer record per probing group.
        let max_step =
            WARP_SIZE * VECTOR_WIDTH + WARP_SIZE / self.probing_scheme.cg_size();

        loop {
            // Safety: whole-warp call.
            if !unsafe { warp::warp_vote_any(WARP_MASK, running) } {
                break;
            }

            // Flush ahead of staging whenever this step could overflow.
            if warp_fill.load(Ordering::Relaxed) as usize + max_step > buffer_size {
                // Safety: whole warp is here every iteration.
                unsafe { self.flush_output_buffer(warp_fill, buffer, num_matches, output) };
            }

            if running {
                let base = iter.current();

                let mut matched = false;
                let mut saw_empty = false;
                for i in 0..VECTOR_WIDTH {
                    // Safety: window slots stay inside the array.
                    let slot_ptr = unsafe { self.storage_ref.slot(base + i) };
                    // Safety: initialized slot.
                    let slot = unsafe { *slot_ptr };
                    match self.predicate.equal_for_find(key, &slot.first) {
                        EqualResult::Equal => {
                            matched = true;
                            let at = warp_fill.fetch_add(1, Ordering::Relaxed);
                            // Safety: the pre-staging flush guaranteed room
                            // for this step's worst case.
                            unsafe { *buffer.add(at as usize) = slot };
                        }
                        EqualResult::Empty => saw_empty = true,
                        _ => {}
                    }
                }

                // Safety: converged tile (a subset of the converged warp).
                unsafe { warp::sync_warp(tile_mask) };
                // Safety: converged tile.
                if unsafe { warp::warp_vote_any(tile_mask, matched) } {
                    found_any = true;
                }

                // Safety: converged tile.
                let probe_done = unsafe { warp::warp_vote_any(tile_mask, saw_empty) };
                if !probe_done {
                    iter.advance();
                }

                if probe_done {
                    if IS_OUTER && !found_any && rank == 0 {
                        let at = warp_fill.fetch_add(1, Ordering::Relaxed);
                        // Safety: headroom reserved by the pre-staging flush.
                        unsafe {
                            *buffer.add(at as usize) =
                                Pair::new(*key, self.empty_slot_sentinel.second)
                        };
                    }
                    running = false;
                }
            }

            // Safety: whole-warp call.
            unsafe { warp::sync_warp(WARP_MASK) };
        }

        // Safety: the loop exits warp-collectively.
        unsafe { self.flush_output_buffer(warp_fill, buffer, num_matches, output) };
    }

    /// Cooperative pair retrieve: for one probe pair, emits
    /// `(probe_pair, slot_pair)` for every slot matching under `pair_equal`,
    /// into two parallel output streams at identical offsets.
    ///
    /// With `IS_OUTER`, a probe with zero matches emits the probe pair
    /// alongside the empty slot pair.
    ///
    /// # Safety
    /// As for [`Self::retrieve_cooperative`], with both buffers sized
    /// `buffer_size`.
    #[inline]
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn pair_retrieve_cooperative<const IS_OUTER: bool, PairEq>(
        &self,
        tile_mask: u32,
        active: bool,
        probe: &Pair<Key, Value>,
        pair_equal: &PairEq,
        warp_fill: &AtomicRef<'_, u32, { ThreadScope::Block }>,
        probe_buffer: *mut Pair<Key, Value>,
        contained_buffer: *mut Pair<Key, Value>,
        buffer_size: usize,
        num_matches: &CounterStorageRef<{ ThreadScope::Device }>,
        probe_output: *mut Pair<Key, Value>,
        contained_output: *mut Pair<Key, Value>,
    ) where
        PairEq: PairEqual<Key, Value>,
    {
        use core::sync::atomic::Ordering;

        let capacity = self.capacity();
        let rank = (warp::lane_id() % self.probing_scheme.cg_size() as u32) as usize;
        let mut iter = self
            .probing_scheme
            .make_iterator(&probe.first, VECTOR_WIDTH, capacity);

        let mut running = active;
        let mut found_any = false;

        let max_step =
            WARP_SIZE * VECTOR_WIDTH + WARP_SIZE / self.probing_scheme.cg_size();

        loop {
            // Safety: whole-warp call.
            if !unsafe { warp::warp_vote_any(WARP_MASK, running) } {
                break;
            }

            if warp_fill.load(Ordering::Relaxed) as usize + max_step > buffer_size {
                // Safety: whole warp is here every iteration.
                unsafe {
                    self.flush_pair_output_buffers(
                        warp_fill,
                        probe_buffer,
                        contained_buffer,
                        num_matches,
                        probe_output,
                        contained_output,
                    )
                };
            }

            if running {
                let base = iter.current();

                let mut matched = false;
                let mut saw_empty = false;
                for i in 0..VECTOR_WIDTH {
                    // Safety: window slots stay inside the array.
                    let slot_ptr = unsafe { self.storage_ref.slot(base + i) };
                    // Safety: initialized slot.
                    let slot = unsafe { *slot_ptr };
                    if self.predicate.is_empty_sentinel(&slot.first) {
                        saw_empty = true;
                    } else if pair_equal.equal(probe, &slot) {
                        matched = true;
                        let at = warp_fill.fetch_add(1, Ordering::Relaxed);
                        // Safety: headroom reserved by the pre-staging flush.
                        unsafe {
                            *probe_buffer.add(at as usize) = *probe;
                            *contained_buffer.add(at as usize) = slot;
                        }
                    }
                }

                // Safety: converged tile.
                unsafe { warp::sync_warp(tile_mask) };
                // Safety: converged tile.
                if unsafe { warp::warp_vote_any(tile_mask, matched) } {
                    found_any = true;
                }

                // Safety: converged tile.
                let probe_done = unsafe { warp::warp_vote_any(tile_mask, saw_empty) };
                if !probe_done {
                    iter.advance();
                }

                if probe_done {
                    if IS_OUTER && !found_any && rank == 0 {
                        let at = warp_fill.fetch_add(1, Ordering::Relaxed);
                        // Safety: headroom reserved by the pre-staging flush.
                        unsafe {
                            *probe_buffer.add(at as usize) = *probe;
                            *contained_buffer.add(at as usize) = self.empty_slot_sentinel;
                        }
                    }
                    running = false;
                }
            }

            // Safety: whole-warp call.
            unsafe { warp::sync_warp(WARP_MASK) };
        }

        // Safety: the loop exits warp-collectively.
        unsafe {
            self.flush_pair_output_buffers(
                warp_fill,
                probe_buffer,
                contained_buffer,
                num_matches,
                probe_output,
                contained_output,
            )
        };
    }
}
