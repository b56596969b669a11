//! The static map: a fixed-capacity, unique-key associative container whose
//! slots live in device memory.
//!
//! The host type owns storage, the success counter, and the incrementally
//! maintained size. Bulk operations launch device kernels; the kernels are
//! monomorphized for the canonical `u32`/`u32` and `u64`/`u64` slot types
//! with identity-hash linear probing, one instantiation per cooperative
//! group size in [`BULK_SUPPORTED_CG_SIZES`].

use crate::open_addressing::ThreadScope;
use crate::pair::{alignment, AlignedTo, Pair};

#[cfg(not(target_arch = "nvptx64"))]
use crate::open_addressing::{EqualWrapper, KeyEqual, OpenAddressingImpl};
#[cfg(not(target_arch = "nvptx64"))]
use crate::probing::ProbingScheme;
#[cfg(not(target_arch = "nvptx64"))]
use crate::static_map_ref::{StaticMapMutableRef, StaticMapRef};
#[cfg(not(target_arch = "nvptx64"))]
use crate::storage::CounterStorage;
#[cfg(not(target_arch = "nvptx64"))]
use cust::error::CudaResult;
#[cfg(not(target_arch = "nvptx64"))]
use cust::launch;
#[cfg(not(target_arch = "nvptx64"))]
use cust::memory::{AsyncCopyDestination, DeviceBuffer};
#[cfg(not(target_arch = "nvptx64"))]
use cust::module::Module;
#[cfg(not(target_arch = "nvptx64"))]
use cust::stream::Stream;
use cust_core::DeviceCopy;

/// Cooperative group sizes the bulk kernels are generated for.
pub const BULK_SUPPORTED_CG_SIZES: &[usize] = &[1, 2, 4, 8];

/// Launch geometry: work items times group width, one item per group.
#[cfg(not(target_arch = "nvptx64"))]
pub(crate) fn grid_size_for_bulk(num_items: usize, cg_size: usize, block_size: u32) -> u32 {
    let block = block_size as usize;
    let threads = num_items.saturating_mul(cg_size);
    let grid = (threads.saturating_add(block - 1)) / block;
    (grid.min(u32::MAX as usize) as u32).max(1)
}

/// A GPU-resident, fixed-capacity map with unique keys.
///
/// Insert-and-lookup only: no deletion, no resizing. The requested capacity
/// is validated against the probing scheme. Callers keep the load factor
/// below one: an insert into a table with no free slot probes forever.
/// This contract is documented, not enforced.
///
/// # Type Parameters
/// * `Key` / `Value` - slot cell types
/// * `Scheme` - probing scheme
/// * `VECTOR_WIDTH` - consecutive slots loaded per lane (default 1)
/// * `KeyEq` - key equality predicate
/// * `SCOPE` - thread scope for slot atomics
pub struct StaticMap<
    Key,
    Value,
    Scheme,
    const VECTOR_WIDTH: usize = 1,
    KeyEq = crate::open_addressing::DefaultKeyEqual,
    const SCOPE: ThreadScope = { ThreadScope::Device },
> where
    Key: DeviceCopy + Copy + PartialEq,
    Value: DeviceCopy + Copy,
    Pair<Key, Value>: DeviceCopy,
    (): AlignedTo<{ alignment::<Key, Value>() }>,
{
    #[cfg(not(target_arch = "nvptx64"))]
    impl_: OpenAddressingImpl<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE>,
    #[cfg(not(target_arch = "nvptx64"))]
    counter: CounterStorage<{ ThreadScope::Device }>,
    #[cfg(not(target_arch = "nvptx64"))]
    size_: usize,
    #[cfg(target_arch = "nvptx64")]
    _phantom: core::marker::PhantomData<(Key, Value, Scheme, KeyEq)>,
}

#[cfg(not(target_arch = "nvptx64"))]
impl<Key, Value, Scheme, const VECTOR_WIDTH: usize, KeyEq, const SCOPE: ThreadScope>
    StaticMap<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE>
where
    Key: DeviceCopy + Copy + PartialEq,
    Value: DeviceCopy + Copy,
    Scheme: ProbingScheme<Key>,
    KeyEq: KeyEqual<Key> + Copy,
    Pair<Key, Value>: DeviceCopy,
    (): AlignedTo<{ alignment::<Key, Value>() }>,
{
    /// Constructs a map with at least the requested capacity.
    ///
    /// The capacity is clamped to at least one slot and rounded up per the
    /// probing scheme. Slot initialization is enqueued on `stream`; with a
    /// module the constructor returns without synchronizing, so the caller
    /// must order any use of the map after this stream work.
    pub fn new(
        capacity: usize,
        empty_key_sentinel: Key,
        empty_value_sentinel: Value,
        pred: KeyEq,
        probing_scheme: Scheme,
        stream: &Stream,
        module: Option<&Module>,
    ) -> CudaResult<Self> {
        let empty_slot_sentinel = Pair::new(empty_key_sentinel, empty_value_sentinel);
        let impl_ = OpenAddressingImpl::new(
            capacity,
            empty_slot_sentinel,
            pred,
            probing_scheme,
            stream,
            module,
        )?;
        // Safety: reset before every read, in each count-producing call.
        let counter = unsafe { CounterStorage::new(stream)? };
        Ok(Self {
            impl_,
            counter,
            size_: 0,
        })
    }

    /// Constructs a map sized for `n` elements at the given load factor.
    ///
    /// # Panics
    /// Panics unless `desired_load_factor` lies in `(0.0, 1.0)`.
    pub fn with_load_factor(
        n: usize,
        desired_load_factor: f64,
        empty_key_sentinel: Key,
        empty_value_sentinel: Value,
        pred: KeyEq,
        probing_scheme: Scheme,
        stream: &Stream,
        module: Option<&Module>,
    ) -> CudaResult<Self> {
        let empty_slot_sentinel = Pair::new(empty_key_sentinel, empty_value_sentinel);
        let impl_ = OpenAddressingImpl::with_load_factor(
            n,
            desired_load_factor,
            empty_slot_sentinel,
            pred,
            probing_scheme,
            stream,
            module,
        )?;
        // Safety: reset before every read, in each count-producing call.
        let counter = unsafe { CounterStorage::new(stream)? };
        Ok(Self {
            impl_,
            counter,
            size_: 0,
        })
    }

    /// Resets every slot to empty, synchronously.
    pub fn clear(&mut self, stream: &Stream, module: Option<&Module>) -> CudaResult<()> {
        self.size_ = 0;
        self.impl_.clear(stream, module)
    }

    /// Resets every slot to empty without synchronizing.
    ///
    /// # Safety
    /// The map must not be used until the stream reaches this work.
    pub unsafe fn clear_async(&mut self, stream: &Stream, module: Option<&Module>) -> CudaResult<()> {
        self.size_ = 0;
        // Safety: forwarded.
        unsafe { self.impl_.clear_async(stream, module) }
    }

    pub fn capacity(&self) -> usize {
        self.impl_.capacity()
    }

    pub fn empty_key_sentinel(&self) -> Key {
        self.impl_.empty_key_sentinel()
    }

    pub fn empty_value_sentinel(&self) -> Value {
        self.impl_.empty_value_sentinel()
    }

    /// Number of successfully inserted elements, summed over bulk inserts.
    pub fn size(&self) -> usize {
        self.size_
    }

    /// `size / capacity`.
    pub fn load_factor(&self) -> f64 {
        self.size_ as f64 / self.impl_.capacity() as f64
    }

    /// Const device view for custom kernels: `find`, `contains`.
    pub fn device_ref(&self) -> StaticMapRef<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE> {
        StaticMapRef::new(
            Pair::new(self.impl_.empty_key_sentinel(), self.impl_.empty_value_sentinel()),
            EqualWrapper::new(self.impl_.empty_key_sentinel(), self.impl_.key_eq()),
            *self.impl_.probing_scheme(),
            self.impl_.storage_ref(),
        )
    }

    /// Mutable device view for custom kernels: `insert`.
    pub fn device_mutable_ref(
        &self,
    ) -> StaticMapMutableRef<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE> {
        StaticMapMutableRef::new(
            Pair::new(self.impl_.empty_key_sentinel(), self.impl_.empty_value_sentinel()),
            EqualWrapper::new(self.impl_.empty_key_sentinel(), self.impl_.key_eq()),
            *self.impl_.probing_scheme(),
            self.impl_.storage_ref(),
        )
    }
}

/// Host bulk operations for the canonical slot types, one impl per
/// cooperative group size. Kernels are monomorphized per key type and CG
/// size and resolved by symbol name from the loaded module.
#[cfg(not(target_arch = "nvptx64"))]
macro_rules! impl_map_bulk_ops {
    ($($t:ident => [$($cg:literal),+]);+ $(;)?) => {
        $($(
            impl StaticMap<
                $t,
                $t,
                crate::probing::LinearProbing<$t, crate::hash::IdentityHash<$t>, $cg>,
                1,
                crate::open_addressing::DefaultKeyEqual,
                { ThreadScope::Device },
            > {
                /// Bulk insert. Returns the number of freshly inserted pairs
                /// and folds it into `size()`. Synchronizes `stream` to read
                /// back the success counter.
                pub fn insert(
                    &mut self,
                    pairs: &[Pair<$t, $t>],
                    stream: &Stream,
                    module: &Module,
                ) -> Result<usize, Box<dyn std::error::Error>> {
                    if pairs.is_empty() {
                        return Ok(0);
                    }
                    let n = pairs.len();
                    let pairs_buf = DeviceBuffer::from_slice(pairs)?;
                    // Safety: reset and read on the same stream as the launch.
                    unsafe { self.counter.reset(stream)? };

                    let container_ref = self.device_mutable_ref();
                    let counter_ref = self.counter.storage_ref();
                    const BLOCK_SIZE: u32 = 128;
                    let grid_size = grid_size_for_bulk(n, $cg, BLOCK_SIZE);
                    let kernel = module
                        .get_function(concat!("map_insert_", stringify!($t), "_cg", stringify!($cg)))?;
                    // Safety: `pairs_buf` and the container outlive the
                    // stream sync in `load_to_host` below; refs are valid
                    // per-value copies.
                    unsafe {
                        launch!(kernel<<<grid_size, BLOCK_SIZE, 0, stream>>>(
                            pairs_buf.as_device_ptr().as_raw(),
                            n,
                            counter_ref,
                            container_ref
                        ))?;
                    }
                    let count = self.counter.load_to_host(stream)? as usize;
                    self.size_ += count;
                    Ok(count)
                }

                /// Bulk conditional insert: pair `i` is inserted only when
                /// `stencil[i]` is nonzero. Returns the number of freshly
                /// inserted pairs and folds it into `size()`.
                pub fn insert_if(
                    &mut self,
                    pairs: &[Pair<$t, $t>],
                    stencil: &[u64],
                    stream: &Stream,
                    module: &Module,
                ) -> Result<usize, Box<dyn std::error::Error>> {
                    if pairs.len() != stencil.len() {
                        return Err("pairs and stencil length mismatch".into());
                    }
                    if pairs.is_empty() {
                        return Ok(0);
                    }
                    let n = pairs.len();
                    let pairs_buf = DeviceBuffer::from_slice(pairs)?;
                    let stencil_buf = DeviceBuffer::from_slice(stencil)?;
                    // Safety: reset and read on the same stream as the launch.
                    unsafe { self.counter.reset(stream)? };

                    let container_ref = self.device_mutable_ref();
                    let counter_ref = self.counter.storage_ref();
                    const BLOCK_SIZE: u32 = 128;
                    let grid_size = grid_size_for_bulk(n, $cg, BLOCK_SIZE);
                    let kernel = module
                        .get_function(concat!("map_insert_if_", stringify!($t), "_cg", stringify!($cg)))?;
                    // Safety: all buffers outlive the stream sync below.
                    unsafe {
                        launch!(kernel<<<grid_size, BLOCK_SIZE, 0, stream>>>(
                            pairs_buf.as_device_ptr().as_raw(),
                            stencil_buf.as_device_ptr().as_raw(),
                            n,
                            counter_ref,
                            container_ref
                        ))?;
                    }
                    let count = self.counter.load_to_host(stream)? as usize;
                    self.size_ += count;
                    Ok(count)
                }

                /// Bulk lookup: `output[i]` receives the value mapped to
                /// `keys[i]`, or the empty value sentinel. Synchronizes
                /// `stream` before returning.
                ///
                /// # Safety
                /// `output` must be page-locked (pinned) host memory; it is
                /// the destination of an asynchronous device-to-host copy.
                pub unsafe fn find(
                    &self,
                    keys: &[$t],
                    output: &mut [$t],
                    stream: &Stream,
                    module: &Module,
                ) -> Result<(), Box<dyn std::error::Error>> {
                    if keys.len() != output.len() {
                        return Err("keys and output length mismatch".into());
                    }
                    if keys.is_empty() {
                        return Ok(());
                    }
                    let n = keys.len();
                    let keys_buf = DeviceBuffer::from_slice(keys)?;
                    // Safety: fully written by the kernel before the copy.
                    let out_buf = unsafe { DeviceBuffer::<$t>::uninitialized(n)? };

                    let container_ref = self.device_ref();
                    let empty_value = self.empty_value_sentinel();
                    const BLOCK_SIZE: u32 = 128;
                    let grid_size = grid_size_for_bulk(n, $cg, BLOCK_SIZE);
                    let kernel = module
                        .get_function(concat!("map_find_", stringify!($t), "_cg", stringify!($cg)))?;
                    // Safety: buffers live past the sync below.
                    unsafe {
                        launch!(kernel<<<grid_size, BLOCK_SIZE, 0, stream>>>(
                            keys_buf.as_device_ptr().as_raw(),
                            n,
                            out_buf.as_device_ptr().as_raw(),
                            empty_value,
                            container_ref
                        ))?;
                    }
                    // Safety: `output` is pinned per the function contract;
                    // nothing touches either side until the sync below.
                    unsafe { out_buf.async_copy_to(&mut output[..n], stream)? };
                    stream.synchronize()?;
                    Ok(())
                }

                /// Bulk membership test: `output[i]` receives whether
                /// `keys[i]` is present. Synchronizes `stream` before
                /// returning.
                ///
                /// # Safety
                /// `output` must be page-locked (pinned) host memory; it is
                /// the destination of an asynchronous device-to-host copy.
                pub unsafe fn contains(
                    &self,
                    keys: &[$t],
                    output: &mut [bool],
                    stream: &Stream,
                    module: &Module,
                ) -> Result<(), Box<dyn std::error::Error>> {
                    if keys.len() != output.len() {
                        return Err("keys and output length mismatch".into());
                    }
                    if keys.is_empty() {
                        return Ok(());
                    }
                    let n = keys.len();
                    let keys_buf = DeviceBuffer::from_slice(keys)?;
                    // Safety: fully written by the kernel before the copy.
                    let out_buf = unsafe { DeviceBuffer::<bool>::uninitialized(n)? };

                    let container_ref = self.device_ref();
                    const BLOCK_SIZE: u32 = 128;
                    let grid_size = grid_size_for_bulk(n, $cg, BLOCK_SIZE);
                    let kernel = module
                        .get_function(concat!("map_contains_", stringify!($t), "_cg", stringify!($cg)))?;
                    // Safety: buffers live past the sync below.
                    unsafe {
                        launch!(kernel<<<grid_size, BLOCK_SIZE, 0, stream>>>(
                            keys_buf.as_device_ptr().as_raw(),
                            n,
                            out_buf.as_device_ptr().as_raw(),
                            container_ref
                        ))?;
                    }
                    // Safety: `output` is pinned per the function contract.
                    unsafe { out_buf.async_copy_to(&mut output[..n], stream)? };
                    stream.synchronize()?;
                    Ok(())
                }
            }
        )+)+
    };
}

#[cfg(not(target_arch = "nvptx64"))]
impl_map_bulk_ops! {
    u32 => [1, 2, 4, 8];
    u64 => [1, 2, 4, 8];
}

// Device bulk kernels for the canonical slot types. One module per key type
// and CG size; symbols follow `map_<op>_<type>_cg<N>`.
#[cfg(target_arch = "nvptx64")]
macro_rules! map_bulk_kernels {
    (@mod $t:ident, $cg:literal) => {
        paste::paste! {
            mod [<map_kernels_ $t _cg $cg>] {
                use core::sync::atomic::Ordering;
                use cuda_std::prelude::*;
                use cuda_std::warp;

                use crate::hash::IdentityHash;
                use crate::open_addressing::{DefaultKeyEqual, NonZeroStencil, StencilPredicate, ThreadScope};
                use crate::pair::Pair;
                use crate::probing::LinearProbing;
                use crate::static_map_ref::{StaticMapMutableRef, StaticMapRef};
                use crate::storage::CounterStorageRef;

                type K = $t;
                type V = $t;
                type S = LinearProbing<K, IdentityHash<K>, $cg>;
                type MutRef = StaticMapMutableRef<K, V, S, 1, DefaultKeyEqual, { ThreadScope::Device }>;
                type ConstRef = StaticMapRef<K, V, S, 1, DefaultKeyEqual, { ThreadScope::Device }>;

                const CG: usize = $cg;

                #[inline]
                fn tile_mask_of(lane: u32) -> u32 {
                    let base = (lane / CG as u32) * CG as u32;
                    ((1u32 << CG) - 1) << base
                }

                /// One probing group per pair; the group leader publishes the
                /// success into the counter.
                ///
                /// # Safety
                /// `pairs` must be valid for `num_pairs` reads for the kernel
                /// duration; the refs must come from a live container.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<map_insert_ $t _cg $cg>](
                    pairs: *const Pair<K, V>,
                    num_pairs: usize,
                    counter_ref: CounterStorageRef<{ ThreadScope::Device }>,
                    container_ref: MutRef,
                ) {
                    let grid_stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize / CG;
                    let mut idx = (thread::index_1d() as usize) / CG;

                    while idx < num_pairs {
                        // Safety: `idx < num_pairs` and the caller guarantees
                        // the input extent.
                        let pair = unsafe { *pairs.add(idx) };

                        if CG == 1 {
                            if container_ref.insert(pair) {
                                // Relaxed: the host reads after a stream sync.
                                counter_ref.data().fetch_add(1, Ordering::Relaxed);
                            }
                        } else {
                            let lane = warp::lane_id();
                            let mask = tile_mask_of(lane);
                            // Safety: `mask` partitions the warp into
                            // converged CG-wide tiles.
                            if unsafe { container_ref.insert_cooperative(mask, pair) }
                                && lane % CG as u32 == 0
                            {
                                counter_ref.data().fetch_add(1, Ordering::Relaxed);
                            }
                        }

                        idx += grid_stride;
                    }
                }

                /// Insert gated per item by a stencil predicate.
                ///
                /// # Safety
                /// `pairs` and `stencil` must be valid for `num_pairs` reads
                /// for the kernel duration.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<map_insert_if_ $t _cg $cg>](
                    pairs: *const Pair<K, V>,
                    stencil: *const u64,
                    num_pairs: usize,
                    counter_ref: CounterStorageRef<{ ThreadScope::Device }>,
                    container_ref: MutRef,
                ) {
                    let pred = NonZeroStencil;
                    let grid_stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize / CG;
                    let mut idx = (thread::index_1d() as usize) / CG;

                    while idx < num_pairs {
                        // Safety: in-bounds per the caller contract. The
                        // stencil value is uniform across the tile, so the
                        // branch below keeps the tile converged.
                        let admit = pred.test(unsafe { &*stencil.add(idx) });
                        if admit {
                            // Safety: in-bounds per the caller contract.
                            let pair = unsafe { *pairs.add(idx) };

                            if CG == 1 {
                                if container_ref.insert(pair) {
                                    counter_ref.data().fetch_add(1, Ordering::Relaxed);
                                }
                            } else {
                                let lane = warp::lane_id();
                                let mask = tile_mask_of(lane);
                                // Safety: converged CG-wide tile.
                                if unsafe { container_ref.insert_cooperative(mask, pair) }
                                    && lane % CG as u32 == 0
                                {
                                    counter_ref.data().fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }

                        idx += grid_stride;
                    }
                }

                /// One probing group per key; the group leader writes the
                /// found value or the empty value sentinel.
                ///
                /// # Safety
                /// `keys` and `output` must be valid for `num_keys` elements
                /// for the kernel duration.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<map_find_ $t _cg $cg>](
                    keys: *const K,
                    num_keys: usize,
                    output: *mut V,
                    empty_value: V,
                    container_ref: ConstRef,
                ) {
                    let grid_stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize / CG;
                    let mut idx = (thread::index_1d() as usize) / CG;

                    while idx < num_keys {
                        // Safety: in-bounds per the caller contract.
                        let key = unsafe { *keys.add(idx) };

                        let found = if CG == 1 {
                            container_ref.find(&key)
                        } else {
                            let mask = tile_mask_of(warp::lane_id());
                            // Safety: converged CG-wide tile.
                            unsafe { container_ref.find_cooperative(mask, &key) }
                        };

                        if CG == 1 || warp::lane_id() % CG as u32 == 0 {
                            // Safety: `idx` is this group's own output slot.
                            unsafe { *output.add(idx) = found.unwrap_or(empty_value) };
                        }

                        idx += grid_stride;
                    }
                }

                /// One probing group per key; the group leader writes the
                /// membership flag.
                ///
                /// # Safety
                /// `keys` and `output` must be valid for `num_keys` elements
                /// for the kernel duration.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<map_contains_ $t _cg $cg>](
                    keys: *const K,
                    num_keys: usize,
                    output: *mut bool,
                    container_ref: ConstRef,
                ) {
                    let grid_stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize / CG;
                    let mut idx = (thread::index_1d() as usize) / CG;

                    while idx < num_keys {
                        // Safety: in-bounds per the caller contract.
                        let key = unsafe { *keys.add(idx) };

                        let present = if CG == 1 {
                            container_ref.contains(&key)
                        } else {
                            let mask = tile_mask_of(warp::lane_id());
                            // Safety: converged CG-wide tile.
                            unsafe { container_ref.contains_cooperative(mask, &key) }
                        };

                        if CG == 1 || warp::lane_id() % CG as u32 == 0 {
                            // Safety: `idx` is this group's own output slot.
                            unsafe { *output.add(idx) = present };
                        }

                        idx += grid_stride;
                    }
                }
            }
        }
    };
    ($($t:ident => [$($cg:literal),+]);+ $(;)?) => {
        $($( map_bulk_kernels!(@mod $t, $cg); )+)+
    };
}

#[cfg(target_arch = "nvptx64")]
map_bulk_kernels! {
    u32 => [1, 2, 4, 8];
    u64 => [1, 2, 4, 8];
}
