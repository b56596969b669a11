//! The static multimap: a fixed-capacity associative container permitting
//! duplicate keys, with counting and retrieving bulk operations.
//!
//! The host type owns storage and the device-resident match counter. Bulk
//! kernels are monomorphized for the canonical `u64`/`u64` slot type probed
//! with seeded-XXHash double hashing at vector width 2, one instantiation
//! per cooperative group size in
//! [`BULK_SUPPORTED_CG_SIZES`](crate::static_map::BULK_SUPPORTED_CG_SIZES).

use crate::open_addressing::ThreadScope;
use crate::pair::{alignment, AlignedTo, Pair};

#[cfg(not(target_arch = "nvptx64"))]
use crate::open_addressing::{EqualWrapper, KeyEqual, OpenAddressingImpl};
#[cfg(not(target_arch = "nvptx64"))]
use crate::probing::ProbingScheme;
#[cfg(not(target_arch = "nvptx64"))]
use crate::static_map::grid_size_for_bulk;
#[cfg(not(target_arch = "nvptx64"))]
use crate::static_multimap_ref::{StaticMultimapMutableRef, StaticMultimapRef};
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

/// A GPU-resident, fixed-capacity multimap.
///
/// Keys may repeat; inserts never fail on duplicates and publish no success
/// count. Sizing the table to fit every inserted pair is the caller's
/// responsibility. The requested capacity is rounded up to whole probing
/// windows (`cg_size * VECTOR_WIDTH` slots).
pub struct StaticMultimap<
    Key,
    Value,
    Scheme,
    const VECTOR_WIDTH: usize = 2,
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
    #[cfg(target_arch = "nvptx64")]
    _phantom: core::marker::PhantomData<(Key, Value, Scheme, KeyEq)>,
}

#[cfg(not(target_arch = "nvptx64"))]
impl<Key, Value, Scheme, const VECTOR_WIDTH: usize, KeyEq, const SCOPE: ThreadScope>
    StaticMultimap<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE>
where
    Key: DeviceCopy + Copy + PartialEq,
    Value: DeviceCopy + Copy,
    Scheme: ProbingScheme<Key>,
    KeyEq: KeyEqual<Key> + Copy,
    Pair<Key, Value>: DeviceCopy,
    (): AlignedTo<{ alignment::<Key, Value>() }>,
{
    /// Constructs a multimap with at least the requested capacity.
    ///
    /// Slot initialization is enqueued on `stream`; with a module the
    /// constructor returns without synchronizing, so the caller must order
    /// any use of the container after this stream work.
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
        Ok(Self { impl_, counter })
    }

    /// Constructs a multimap sized for `n` pairs at the given load factor.
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
        Ok(Self { impl_, counter })
    }

    /// Resets every slot to empty, synchronously.
    pub fn clear(&mut self, stream: &Stream, module: Option<&Module>) -> CudaResult<()> {
        self.impl_.clear(stream, module)
    }

    /// Resets every slot to empty without synchronizing.
    ///
    /// # Safety
    /// The container must not be used until the stream reaches this work.
    pub unsafe fn clear_async(&mut self, stream: &Stream, module: Option<&Module>) -> CudaResult<()> {
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

    /// Const device view for custom kernels: contains/count/retrieve.
    pub fn device_ref(&self) -> StaticMultimapRef<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE> {
        StaticMultimapRef::new(
            Pair::new(self.impl_.empty_key_sentinel(), self.impl_.empty_value_sentinel()),
            EqualWrapper::new(self.impl_.empty_key_sentinel(), self.impl_.key_eq()),
            *self.impl_.probing_scheme(),
            self.impl_.storage_ref(),
        )
    }

    /// Mutable device view for custom kernels: insert.
    pub fn device_mutable_ref(
        &self,
    ) -> StaticMultimapMutableRef<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE> {
        StaticMultimapMutableRef::new(
            Pair::new(self.impl_.empty_key_sentinel(), self.impl_.empty_value_sentinel()),
            EqualWrapper::new(self.impl_.empty_key_sentinel(), self.impl_.key_eq()),
            *self.impl_.probing_scheme(),
            self.impl_.storage_ref(),
        )
    }
}

/// Host bulk operations for the canonical multimap, one impl per
/// cooperative group size.
#[cfg(not(target_arch = "nvptx64"))]
macro_rules! impl_multimap_bulk_ops {
    ($($cg:literal),+ $(,)?) => {
        $(
            impl StaticMultimap<
                u64,
                u64,
                crate::probing::DoubleHashProbing<
                    u64,
                    crate::hash::XXHash64<u64>,
                    crate::hash::XXHash64<u64>,
                    $cg,
                >,
                2,
                crate::open_addressing::DefaultKeyEqual,
                { ThreadScope::Device },
            > {
                /// Bulk insert. Synchronizes `stream` before returning.
                pub fn insert(
                    &mut self,
                    pairs: &[Pair<u64, u64>],
                    stream: &Stream,
                    module: &Module,
                ) -> Result<(), Box<dyn std::error::Error>> {
                    if pairs.is_empty() {
                        return Ok(());
                    }
                    let n = pairs.len();
                    let pairs_buf = DeviceBuffer::from_slice(pairs)?;

                    let container_ref = self.device_mutable_ref();
                    const BLOCK_SIZE: u32 = 128;
                    let grid_size = grid_size_for_bulk(n, $cg, BLOCK_SIZE);
                    let kernel = module
                        .get_function(concat!("mm_insert_cg", stringify!($cg)))?;
                    // Safety: `pairs_buf` and the container outlive the sync
                    // below.
                    unsafe {
                        launch!(kernel<<<grid_size, BLOCK_SIZE, 0, stream>>>(
                            pairs_buf.as_device_ptr().as_raw(),
                            n,
                            container_ref
                        ))?;
                    }
                    stream.synchronize()?;
                    Ok(())
                }

                /// Bulk conditional insert: pair `i` is inserted only when
                /// `stencil[i]` is nonzero. Synchronizes `stream`.
                pub fn insert_if(
                    &mut self,
                    pairs: &[Pair<u64, u64>],
                    stencil: &[u64],
                    stream: &Stream,
                    module: &Module,
                ) -> Result<(), Box<dyn std::error::Error>> {
                    if pairs.len() != stencil.len() {
                        return Err("pairs and stencil length mismatch".into());
                    }
                    if pairs.is_empty() {
                        return Ok(());
                    }
                    let n = pairs.len();
                    let pairs_buf = DeviceBuffer::from_slice(pairs)?;
                    let stencil_buf = DeviceBuffer::from_slice(stencil)?;

                    let container_ref = self.device_mutable_ref();
                    const BLOCK_SIZE: u32 = 128;
                    let grid_size = grid_size_for_bulk(n, $cg, BLOCK_SIZE);
                    let kernel = module
                        .get_function(concat!("mm_insert_if_cg", stringify!($cg)))?;
                    // Safety: buffers outlive the sync below.
                    unsafe {
                        launch!(kernel<<<grid_size, BLOCK_SIZE, 0, stream>>>(
                            pairs_buf.as_device_ptr().as_raw(),
                            stencil_buf.as_device_ptr().as_raw(),
                            n,
                            container_ref
                        ))?;
                    }
                    stream.synchronize()?;
                    Ok(())
                }

                /// Bulk membership test. Synchronizes `stream`.
                ///
                /// # Safety
                /// `output` must be page-locked (pinned) host memory; it is
                /// the destination of an asynchronous device-to-host copy.
                pub unsafe fn contains(
                    &self,
                    keys: &[u64],
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
                        .get_function(concat!("mm_contains_cg", stringify!($cg)))?;
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

                /// Total number of matches for all probe keys.
                pub fn count(
                    &self,
                    keys: &[u64],
                    stream: &Stream,
                    module: &Module,
                ) -> Result<usize, Box<dyn std::error::Error>> {
                    self.count_impl(keys, stream, module, concat!("mm_count_cg", stringify!($cg)))
                }

                /// Like [`Self::count`], plus one per probe key with zero
                /// matches (left-join semantics).
                pub fn count_outer(
                    &self,
                    keys: &[u64],
                    stream: &Stream,
                    module: &Module,
                ) -> Result<usize, Box<dyn std::error::Error>> {
                    self.count_impl(
                        keys,
                        stream,
                        module,
                        concat!("mm_count_outer_cg", stringify!($cg)),
                    )
                }

                fn count_impl(
                    &self,
                    keys: &[u64],
                    stream: &Stream,
                    module: &Module,
                    kernel_name: &str,
                ) -> Result<usize, Box<dyn std::error::Error>> {
                    if keys.is_empty() {
                        return Ok(0);
                    }
                    let n = keys.len();
                    let keys_buf = DeviceBuffer::from_slice(keys)?;
                    // Safety: reset and read on the same stream as the launch.
                    unsafe { self.counter.reset(stream)? };

                    let container_ref = self.device_ref();
                    let counter_ref = self.counter.storage_ref();
                    const BLOCK_SIZE: u32 = 128;
                    let grid_size = grid_size_for_bulk(n, $cg, BLOCK_SIZE);
                    let kernel = module.get_function(kernel_name)?;
                    // Safety: buffers live past the counter readback sync.
                    unsafe {
                        launch!(kernel<<<grid_size, BLOCK_SIZE, 0, stream>>>(
                            keys_buf.as_device_ptr().as_raw(),
                            n,
                            counter_ref,
                            container_ref
                        ))?;
                    }
                    Ok(self.counter.load_to_host(stream)? as usize)
                }

                /// Total number of pair matches (key and value both equal)
                /// for all probe pairs.
                pub fn pair_count(
                    &self,
                    pairs: &[Pair<u64, u64>],
                    stream: &Stream,
                    module: &Module,
                ) -> Result<usize, Box<dyn std::error::Error>> {
                    self.pair_count_impl(
                        pairs,
                        stream,
                        module,
                        concat!("mm_pair_count_cg", stringify!($cg)),
                    )
                }

                /// Like [`Self::pair_count`], plus one per probe pair with
                /// zero matches.
                pub fn pair_count_outer(
                    &self,
                    pairs: &[Pair<u64, u64>],
                    stream: &Stream,
                    module: &Module,
                ) -> Result<usize, Box<dyn std::error::Error>> {
                    self.pair_count_impl(
                        pairs,
                        stream,
                        module,
                        concat!("mm_pair_count_outer_cg", stringify!($cg)),
                    )
                }

                fn pair_count_impl(
                    &self,
                    pairs: &[Pair<u64, u64>],
                    stream: &Stream,
                    module: &Module,
                    kernel_name: &str,
                ) -> Result<usize, Box<dyn std::error::Error>> {
                    if pairs.is_empty() {
                        return Ok(0);
                    }
                    let n = pairs.len();
                    let pairs_buf = DeviceBuffer::from_slice(pairs)?;
                    // Safety: reset and read on the same stream as the launch.
                    unsafe { self.counter.reset(stream)? };

                    let container_ref = self.device_ref();
                    let counter_ref = self.counter.storage_ref();
                    const BLOCK_SIZE: u32 = 128;
                    let grid_size = grid_size_for_bulk(n, $cg, BLOCK_SIZE);
                    let kernel = module.get_function(kernel_name)?;
                    // Safety: buffers live past the counter readback sync.
                    unsafe {
                        launch!(kernel<<<grid_size, BLOCK_SIZE, 0, stream>>>(
                            pairs_buf.as_device_ptr().as_raw(),
                            n,
                            counter_ref,
                            container_ref
                        ))?;
                    }
                    Ok(self.counter.load_to_host(stream)? as usize)
                }

                /// Retrieves every `(key, value)` pair matching the probe
                /// keys into `output`, in no particular order. Returns the
                /// number of records written; only that prefix of `output`
                /// is meaningful. The caller sizes `output` for the maximum
                /// possible result (`count` of the same probe set).
                ///
                /// # Safety
                /// `output` must be page-locked (pinned) host memory; it is
                /// the destination of an asynchronous device-to-host copy.
                pub unsafe fn retrieve(
                    &self,
                    keys: &[u64],
                    output: &mut [Pair<u64, u64>],
                    stream: &Stream,
                    module: &Module,
                ) -> Result<usize, Box<dyn std::error::Error>> {
                    // Safety: forwarded.
                    unsafe {
                        self.retrieve_impl(
                            keys,
                            output,
                            stream,
                            module,
                            concat!("mm_retrieve_cg", stringify!($cg)),
                        )
                    }
                }

                /// Like [`Self::retrieve`], plus one `(key, empty_value)`
                /// record per probe key with zero matches.
                ///
                /// # Safety
                /// As for [`Self::retrieve`].
                pub unsafe fn retrieve_outer(
                    &self,
                    keys: &[u64],
                    output: &mut [Pair<u64, u64>],
                    stream: &Stream,
                    module: &Module,
                ) -> Result<usize, Box<dyn std::error::Error>> {
                    // Safety: forwarded.
                    unsafe {
                        self.retrieve_impl(
                            keys,
                            output,
                            stream,
                            module,
                            concat!("mm_retrieve_outer_cg", stringify!($cg)),
                        )
                    }
                }

                unsafe fn retrieve_impl(
                    &self,
                    keys: &[u64],
                    output: &mut [Pair<u64, u64>],
                    stream: &Stream,
                    module: &Module,
                    kernel_name: &str,
                ) -> Result<usize, Box<dyn std::error::Error>> {
                    if keys.is_empty() {
                        return Ok(0);
                    }
                    let n = keys.len();
                    let keys_buf = DeviceBuffer::from_slice(keys)?;
                    // Safety: the kernel writes the match prefix; the copy
                    // below returns the whole buffer and callers read only
                    // the reported prefix.
                    let out_buf =
                        unsafe { DeviceBuffer::<Pair<u64, u64>>::uninitialized(output.len())? };
                    // Safety: reset and read on the same stream as the launch.
                    unsafe { self.counter.reset(stream)? };

                    let container_ref = self.device_ref();
                    let counter_ref = self.counter.storage_ref();
                    const BLOCK_SIZE: u32 = 128;
                    let grid_size = grid_size_for_bulk(n, $cg, BLOCK_SIZE);
                    let kernel = module.get_function(kernel_name)?;
                    // Safety: buffers live past the counter readback sync.
                    unsafe {
                        launch!(kernel<<<grid_size, BLOCK_SIZE, 0, stream>>>(
                            keys_buf.as_device_ptr().as_raw(),
                            n,
                            out_buf.as_device_ptr().as_raw(),
                            counter_ref,
                            container_ref
                        ))?;
                    }
                    let count = self.counter.load_to_host(stream)? as usize;
                    if count > output.len() {
                        return Err("retrieve output buffer too small for match count".into());
                    }
                    // Safety: `output` is pinned per the function contract.
                    unsafe { out_buf.async_copy_to(&mut output[..], stream)? };
                    stream.synchronize()?;
                    Ok(count)
                }

                /// Retrieves, for every probe pair, the probe alongside each
                /// slot pair matching it (key and value both equal), into
                /// two parallel outputs at identical offsets. Returns the
                /// number of records written to each output.
                ///
                /// # Safety
                /// Both outputs must be page-locked (pinned) host memory.
                pub unsafe fn pair_retrieve(
                    &self,
                    pairs: &[Pair<u64, u64>],
                    probe_output: &mut [Pair<u64, u64>],
                    contained_output: &mut [Pair<u64, u64>],
                    stream: &Stream,
                    module: &Module,
                ) -> Result<usize, Box<dyn std::error::Error>> {
                    // Safety: forwarded.
                    unsafe {
                        self.pair_retrieve_impl(
                            pairs,
                            probe_output,
                            contained_output,
                            stream,
                            module,
                            concat!("mm_pair_retrieve_cg", stringify!($cg)),
                        )
                    }
                }

                /// Like [`Self::pair_retrieve`], plus one
                /// `(probe_pair, empty_pair)` record per probe pair with
                /// zero matches.
                ///
                /// # Safety
                /// As for [`Self::pair_retrieve`].
                pub unsafe fn pair_retrieve_outer(
                    &self,
                    pairs: &[Pair<u64, u64>],
                    probe_output: &mut [Pair<u64, u64>],
                    contained_output: &mut [Pair<u64, u64>],
                    stream: &Stream,
                    module: &Module,
                ) -> Result<usize, Box<dyn std::error::Error>> {
                    // Safety: forwarded.
                    unsafe {
                        self.pair_retrieve_impl(
                            pairs,
                            probe_output,
                            contained_output,
                            stream,
                            module,
                            concat!("mm_pair_retrieve_outer_cg", stringify!($cg)),
                        )
                    }
                }

                #[allow(clippy::too_many_arguments)]
                unsafe fn pair_retrieve_impl(
                    &self,
                    pairs: &[Pair<u64, u64>],
                    probe_output: &mut [Pair<u64, u64>],
                    contained_output: &mut [Pair<u64, u64>],
                    stream: &Stream,
                    module: &Module,
                    kernel_name: &str,
                ) -> Result<usize, Box<dyn std::error::Error>> {
                    if probe_output.len() != contained_output.len() {
                        return Err("pair_retrieve outputs must have equal length".into());
                    }
                    if pairs.is_empty() {
                        return Ok(0);
                    }
                    let n = pairs.len();
                    let pairs_buf = DeviceBuffer::from_slice(pairs)?;
                    // Safety: match prefixes written by the kernel; callers
                    // read only the reported prefix.
                    let probe_buf = unsafe {
                        DeviceBuffer::<Pair<u64, u64>>::uninitialized(probe_output.len())?
                    };
                    let contained_buf = unsafe {
                        DeviceBuffer::<Pair<u64, u64>>::uninitialized(contained_output.len())?
                    };
                    // Safety: reset and read on the same stream as the launch.
                    unsafe { self.counter.reset(stream)? };

                    let container_ref = self.device_ref();
                    let counter_ref = self.counter.storage_ref();
                    const BLOCK_SIZE: u32 = 128;
                    let grid_size = grid_size_for_bulk(n, $cg, BLOCK_SIZE);
                    let kernel = module.get_function(kernel_name)?;
                    // Safety: buffers live past the counter readback sync.
                    unsafe {
                        launch!(kernel<<<grid_size, BLOCK_SIZE, 0, stream>>>(
                            pairs_buf.as_device_ptr().as_raw(),
                            n,
                            probe_buf.as_device_ptr().as_raw(),
                            contained_buf.as_device_ptr().as_raw(),
                            counter_ref,
                            container_ref
                        ))?;
                    }
                    let count = self.counter.load_to_host(stream)? as usize;
                    if count > probe_output.len() {
                        return Err("pair_retrieve output buffers too small for match count".into());
                    }
                    // Safety: both outputs are pinned per the contract.
                    unsafe {
                        probe_buf.async_copy_to(&mut probe_output[..], stream)?;
                        contained_buf.async_copy_to(&mut contained_output[..], stream)?;
                    }
                    stream.synchronize()?;
                    Ok(count)
                }

                /// Number of occupied slots, by full scan of the slot array.
                pub fn get_size(
                    &self,
                    stream: &Stream,
                    module: &Module,
                ) -> Result<usize, Box<dyn std::error::Error>> {
                    // Safety: reset and read on the same stream as the launch.
                    unsafe { self.counter.reset(stream)? };

                    let container_ref = self.device_ref();
                    let counter_ref = self.counter.storage_ref();
                    const BLOCK_SIZE: u32 = 128;
                    let capacity = self.capacity();
                    let grid_size = grid_size_for_bulk(capacity, 1, BLOCK_SIZE);
                    let kernel = module
                        .get_function(concat!("mm_get_size_cg", stringify!($cg)))?;
                    // Safety: the container outlives the readback sync.
                    unsafe {
                        launch!(kernel<<<grid_size, BLOCK_SIZE, 0, stream>>>(
                            counter_ref,
                            container_ref
                        ))?;
                    }
                    Ok(self.counter.load_to_host(stream)? as usize)
                }

                /// `get_size / capacity`.
                pub fn get_load_factor(
                    &self,
                    stream: &Stream,
                    module: &Module,
                ) -> Result<f32, Box<dyn std::error::Error>> {
                    let size = self.get_size(stream, module)?;
                    Ok(size as f32 / self.capacity() as f32)
                }
            }
        )+
    };
}

#[cfg(not(target_arch = "nvptx64"))]
impl_multimap_bulk_ops!(1, 2, 4, 8);

// Device bulk kernels for the canonical multimap. One module per CG size;
// symbols follow `mm_<op>_cg<N>`. The outer/inner kernel pairs share
// const-generic body helpers.
#[cfg(target_arch = "nvptx64")]
macro_rules! multimap_bulk_kernels {
    (@mod $cg:literal) => {
        paste::paste! {
            mod [<mm_kernels_cg $cg>] {
                use core::sync::atomic::Ordering;
                use cuda_std::prelude::*;
                use cuda_std::warp;

                use crate::hash::XXHash64;
                use crate::open_addressing::{
                    DefaultKeyEqual, DefaultPairEqual, NonZeroStencil, StencilPredicate,
                    ThreadScope,
                };
                use crate::pair::Pair;
                use crate::probing::DoubleHashProbing;
                use crate::static_multimap_ref::{
                    StaticMultimapMutableRef, StaticMultimapRef, WARP_MASK, WARP_SIZE,
                };
                use crate::storage::{AtomicRef, CounterStorageRef};

                type K = u64;
                type V = u64;
                type S = DoubleHashProbing<K, XXHash64<K>, XXHash64<K>, $cg>;
                type MutRef =
                    StaticMultimapMutableRef<K, V, S, 2, DefaultKeyEqual, { ThreadScope::Device }>;
                type ConstRef =
                    StaticMultimapRef<K, V, S, 2, DefaultKeyEqual, { ThreadScope::Device }>;

                const CG: usize = $cg;
                const VECTOR_WIDTH: usize = 2;
                const BLOCK_SIZE: usize = 128;
                const WARPS_PER_BLOCK: usize = BLOCK_SIZE / WARP_SIZE;
                // Per-warp staging capacity, in records.
                const BUFFER_SIZE: usize = WARP_SIZE * (VECTOR_WIDTH + 1);

                #[inline]
                fn tile_mask_of(lane: u32) -> u32 {
                    let base = (lane / CG as u32) * CG as u32;
                    ((1u32 << CG) - 1) << base
                }

                /// One probing group per pair.
                ///
                /// # Safety
                /// `pairs` must be valid for `num_pairs` reads for the
                /// kernel duration.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<mm_insert_cg $cg>](
                    pairs: *const Pair<K, V>,
                    num_pairs: usize,
                    container_ref: MutRef,
                ) {
                    let grid_stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize / CG;
                    let mut idx = (thread::index_1d() as usize) / CG;

                    while idx < num_pairs {
                        // Safety: in-bounds per the caller contract.
                        let pair = unsafe { *pairs.add(idx) };

                        if CG == 1 {
                            container_ref.insert(pair);
                        } else {
                            let mask = tile_mask_of(warp::lane_id());
                            // Safety: converged CG-wide tile.
                            unsafe { container_ref.insert_cooperative(mask, pair) };
                        }

                        idx += grid_stride;
                    }
                }

                /// Insert gated per item by a stencil predicate.
                ///
                /// # Safety
                /// `pairs` and `stencil` must be valid for `num_pairs`
                /// reads for the kernel duration.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<mm_insert_if_cg $cg>](
                    pairs: *const Pair<K, V>,
                    stencil: *const u64,
                    num_pairs: usize,
                    container_ref: MutRef,
                ) {
                    let pred = NonZeroStencil;
                    let grid_stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize / CG;
                    let mut idx = (thread::index_1d() as usize) / CG;

                    while idx < num_pairs {
                        // Safety: in-bounds; the stencil value is tile-uniform
                        // so the branch keeps the tile converged.
                        if pred.test(unsafe { &*stencil.add(idx) }) {
                            // Safety: in-bounds per the caller contract.
                            let pair = unsafe { *pairs.add(idx) };

                            if CG == 1 {
                                container_ref.insert(pair);
                            } else {
                                let mask = tile_mask_of(warp::lane_id());
                                // Safety: converged CG-wide tile.
                                unsafe { container_ref.insert_cooperative(mask, pair) };
                            }
                        }

                        idx += grid_stride;
                    }
                }

                /// One probing group per key; the leader writes the flag.
                ///
                /// # Safety
                /// `keys` and `output` must be valid for `num_keys` elements
                /// for the kernel duration.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<mm_contains_cg $cg>](
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
                            // Safety: this group's own output slot.
                            unsafe { *output.add(idx) = present };
                        }

                        idx += grid_stride;
                    }
                }

                /// Shared body of the count kernels: per-thread local
                /// tallies, one device-scope add per thread at exit.
                ///
                /// # Safety
                /// `keys` must be valid for `num_keys` reads.
                #[inline]
                unsafe fn count_body<const IS_OUTER: bool>(
                    keys: *const K,
                    num_keys: usize,
                    counter_ref: CounterStorageRef<{ ThreadScope::Device }>,
                    container_ref: ConstRef,
                ) {
                    let grid_stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize / CG;
                    let mut idx = (thread::index_1d() as usize) / CG;
                    let lane = warp::lane_id();
                    let mut local = 0u64;

                    while idx < num_keys {
                        // Safety: in-bounds per the caller contract.
                        let key = unsafe { *keys.add(idx) };
                        let mask = tile_mask_of(lane);
                        // Safety: converged CG-wide tile.
                        let total =
                            unsafe { container_ref.count_cooperative::<IS_OUTER>(mask, &key) };
                        if lane % CG as u32 == 0 {
                            local += total as u64;
                        }
                        idx += grid_stride;
                    }

                    if local > 0 {
                        // Relaxed: the host reads after a stream sync.
                        counter_ref.data().fetch_add(local, Ordering::Relaxed);
                    }
                }

                /// # Safety
                /// `keys` must be valid for `num_keys` reads.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<mm_count_cg $cg>](
                    keys: *const K,
                    num_keys: usize,
                    counter_ref: CounterStorageRef<{ ThreadScope::Device }>,
                    container_ref: ConstRef,
                ) {
                    // Safety: forwarded.
                    unsafe { count_body::<false>(keys, num_keys, counter_ref, container_ref) }
                }

                /// # Safety
                /// `keys` must be valid for `num_keys` reads.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<mm_count_outer_cg $cg>](
                    keys: *const K,
                    num_keys: usize,
                    counter_ref: CounterStorageRef<{ ThreadScope::Device }>,
                    container_ref: ConstRef,
                ) {
                    // Safety: forwarded.
                    unsafe { count_body::<true>(keys, num_keys, counter_ref, container_ref) }
                }

                /// Shared body of the pair-count kernels.
                ///
                /// # Safety
                /// `pairs` must be valid for `num_pairs` reads.
                #[inline]
                unsafe fn pair_count_body<const IS_OUTER: bool>(
                    pairs: *const Pair<K, V>,
                    num_pairs: usize,
                    counter_ref: CounterStorageRef<{ ThreadScope::Device }>,
                    container_ref: ConstRef,
                ) {
                    let pair_equal = DefaultPairEqual;
                    let grid_stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize / CG;
                    let mut idx = (thread::index_1d() as usize) / CG;
                    let lane = warp::lane_id();
                    let mut local = 0u64;

                    while idx < num_pairs {
                        // Safety: in-bounds per the caller contract.
                        let probe = unsafe { *pairs.add(idx) };
                        let mask = tile_mask_of(lane);
                        // Safety: converged CG-wide tile.
                        let total = unsafe {
                            container_ref
                                .pair_count_cooperative::<IS_OUTER, _>(mask, &probe, &pair_equal)
                        };
                        if lane % CG as u32 == 0 {
                            local += total as u64;
                        }
                        idx += grid_stride;
                    }

                    if local > 0 {
                        counter_ref.data().fetch_add(local, Ordering::Relaxed);
                    }
                }

                /// # Safety
                /// `pairs` must be valid for `num_pairs` reads.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<mm_pair_count_cg $cg>](
                    pairs: *const Pair<K, V>,
                    num_pairs: usize,
                    counter_ref: CounterStorageRef<{ ThreadScope::Device }>,
                    container_ref: ConstRef,
                ) {
                    // Safety: forwarded.
                    unsafe { pair_count_body::<false>(pairs, num_pairs, counter_ref, container_ref) }
                }

                /// # Safety
                /// `pairs` must be valid for `num_pairs` reads.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<mm_pair_count_outer_cg $cg>](
                    pairs: *const Pair<K, V>,
                    num_pairs: usize,
                    counter_ref: CounterStorageRef<{ ThreadScope::Device }>,
                    container_ref: ConstRef,
                ) {
                    // Safety: forwarded.
                    unsafe { pair_count_body::<true>(pairs, num_pairs, counter_ref, container_ref) }
                }

                /// Shared body of the retrieve kernels: whole warps stay
                /// converged so probing groups can share the per-warp
                /// staging buffer and its flushes.
                ///
                /// # Safety
                /// `keys` must be valid for `num_keys` reads; `output` must
                /// have room for every match; `buffer` and `fill_ptr` must
                /// be this warp's shared staging area.
                #[inline]
                #[allow(clippy::too_many_arguments)]
                unsafe fn retrieve_body<const IS_OUTER: bool>(
                    keys: *const K,
                    num_keys: usize,
                    output: *mut Pair<K, V>,
                    counter_ref: CounterStorageRef<{ ThreadScope::Device }>,
                    container_ref: ConstRef,
                    buffer: *mut Pair<K, V>,
                    fill_ptr: *mut u32,
                ) {
                    let lane = warp::lane_id();
                    if lane == 0 {
                        // Safety: this warp's own fill counter.
                        unsafe { *fill_ptr = 0 };
                    }
                    // Safety: whole warp participates.
                    unsafe { warp::sync_warp(WARP_MASK) };
                    // Safety: valid, initialized shared cell.
                    let warp_fill =
                        unsafe { AtomicRef::<u32, { ThreadScope::Block }>::new(fill_ptr) };

                    let groups_per_warp = WARP_SIZE / CG;
                    let num_warps =
                        (thread::grid_dim_x() * thread::block_dim_x()) as usize / WARP_SIZE;
                    let warp_id = (thread::index_1d() as usize) / WARP_SIZE;
                    let group_in_warp = lane as usize / CG;
                    let stride = num_warps * groups_per_warp;
                    let mut idx = warp_id * groups_per_warp + group_in_warp;

                    loop {
                        let active = idx < num_keys;
                        // Safety: whole warp participates.
                        if !unsafe { warp::warp_vote_any(WARP_MASK, active) } {
                            break;
                        }
                        let key = if active {
                            // Safety: in-bounds per the caller contract.
                            unsafe { *keys.add(idx) }
                        } else {
                            container_ref.empty_key_sentinel()
                        };
                        let mask = tile_mask_of(lane);
                        // Safety: whole warp converged; the tile mask
                        // partitions it; the staging area is this warp's own.
                        unsafe {
                            container_ref.retrieve_cooperative::<IS_OUTER>(
                                mask,
                                active,
                                &key,
                                &warp_fill,
                                buffer,
                                BUFFER_SIZE,
                                &counter_ref,
                                output,
                            )
                        };
                        idx += stride;
                    }
                }

                /// # Safety
                /// `keys` valid for `num_keys` reads; `output` sized for
                /// every match.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<mm_retrieve_cg $cg>](
                    keys: *const K,
                    num_keys: usize,
                    output: *mut Pair<K, V>,
                    counter_ref: CounterStorageRef<{ ThreadScope::Device }>,
                    container_ref: ConstRef,
                ) {
                    let buffer =
                        cuda_std::shared_array![Pair<K, V>; WARPS_PER_BLOCK * BUFFER_SIZE];
                    let fills = cuda_std::shared_array![u32; WARPS_PER_BLOCK];
                    let warp_in_block = (thread::thread_idx_x() as usize) / WARP_SIZE;
                    // Safety: disjoint per-warp shared segments; body
                    // contract forwarded.
                    unsafe {
                        retrieve_body::<false>(
                            keys,
                            num_keys,
                            output,
                            counter_ref,
                            container_ref,
                            buffer.add(warp_in_block * BUFFER_SIZE),
                            fills.add(warp_in_block),
                        )
                    }
                }

                /// # Safety
                /// `keys` valid for `num_keys` reads; `output` sized for
                /// every match plus one record per unmatched probe.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<mm_retrieve_outer_cg $cg>](
                    keys: *const K,
                    num_keys: usize,
                    output: *mut Pair<K, V>,
                    counter_ref: CounterStorageRef<{ ThreadScope::Device }>,
                    container_ref: ConstRef,
                ) {
                    let buffer =
                        cuda_std::shared_array![Pair<K, V>; WARPS_PER_BLOCK * BUFFER_SIZE];
                    let fills = cuda_std::shared_array![u32; WARPS_PER_BLOCK];
                    let warp_in_block = (thread::thread_idx_x() as usize) / WARP_SIZE;
                    // Safety: disjoint per-warp shared segments; body
                    // contract forwarded.
                    unsafe {
                        retrieve_body::<true>(
                            keys,
                            num_keys,
                            output,
                            counter_ref,
                            container_ref,
                            buffer.add(warp_in_block * BUFFER_SIZE),
                            fills.add(warp_in_block),
                        )
                    }
                }

                /// Shared body of the pair-retrieve kernels.
                ///
                /// # Safety
                /// `pairs` must be valid for `num_pairs` reads; both outputs
                /// must have room for every match; the buffers and
                /// `fill_ptr` must be this warp's shared staging area.
                #[inline]
                #[allow(clippy::too_many_arguments)]
                unsafe fn pair_retrieve_body<const IS_OUTER: bool>(
                    pairs: *const Pair<K, V>,
                    num_pairs: usize,
                    probe_output: *mut Pair<K, V>,
                    contained_output: *mut Pair<K, V>,
                    counter_ref: CounterStorageRef<{ ThreadScope::Device }>,
                    container_ref: ConstRef,
                    probe_buffer: *mut Pair<K, V>,
                    contained_buffer: *mut Pair<K, V>,
                    fill_ptr: *mut u32,
                ) {
                    let pair_equal = DefaultPairEqual;
                    let lane = warp::lane_id();
                    if lane == 0 {
                        // Safety: this warp's own fill counter.
                        unsafe { *fill_ptr = 0 };
                    }
                    // Safety: whole warp participates.
                    unsafe { warp::sync_warp(WARP_MASK) };
                    // Safety: valid, initialized shared cell.
                    let warp_fill =
                        unsafe { AtomicRef::<u32, { ThreadScope::Block }>::new(fill_ptr) };

                    let groups_per_warp = WARP_SIZE / CG;
                    let num_warps =
                        (thread::grid_dim_x() * thread::block_dim_x()) as usize / WARP_SIZE;
                    let warp_id = (thread::index_1d() as usize) / WARP_SIZE;
                    let group_in_warp = lane as usize / CG;
                    let stride = num_warps * groups_per_warp;
                    let mut idx = warp_id * groups_per_warp + group_in_warp;

                    loop {
                        let active = idx < num_pairs;
                        // Safety: whole warp participates.
                        if !unsafe { warp::warp_vote_any(WARP_MASK, active) } {
                            break;
                        }
                        let probe = if active {
                            // Safety: in-bounds per the caller contract.
                            unsafe { *pairs.add(idx) }
                        } else {
                            Pair::new(
                                container_ref.empty_key_sentinel(),
                                container_ref.empty_value_sentinel(),
                            )
                        };
                        let mask = tile_mask_of(lane);
                        // Safety: whole warp converged; the tile mask
                        // partitions it; the staging areas are this warp's
                        // own.
                        unsafe {
                            container_ref.pair_retrieve_cooperative::<IS_OUTER, _>(
                                mask,
                                active,
                                &probe,
                                &pair_equal,
                                &warp_fill,
                                probe_buffer,
                                contained_buffer,
                                BUFFER_SIZE,
                                &counter_ref,
                                probe_output,
                                contained_output,
                            )
                        };
                        idx += stride;
                    }
                }

                /// # Safety
                /// `pairs` valid for `num_pairs` reads; outputs sized for
                /// every match.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<mm_pair_retrieve_cg $cg>](
                    pairs: *const Pair<K, V>,
                    num_pairs: usize,
                    probe_output: *mut Pair<K, V>,
                    contained_output: *mut Pair<K, V>,
                    counter_ref: CounterStorageRef<{ ThreadScope::Device }>,
                    container_ref: ConstRef,
                ) {
                    let probe_buffer =
                        cuda_std::shared_array![Pair<K, V>; WARPS_PER_BLOCK * BUFFER_SIZE];
                    let contained_buffer =
                        cuda_std::shared_array![Pair<K, V>; WARPS_PER_BLOCK * BUFFER_SIZE];
                    let fills = cuda_std::shared_array![u32; WARPS_PER_BLOCK];
                    let warp_in_block = (thread::thread_idx_x() as usize) / WARP_SIZE;
                    // Safety: disjoint per-warp shared segments; body
                    // contract forwarded.
                    unsafe {
                        pair_retrieve_body::<false>(
                            pairs,
                            num_pairs,
                            probe_output,
                            contained_output,
                            counter_ref,
                            container_ref,
                            probe_buffer.add(warp_in_block * BUFFER_SIZE),
                            contained_buffer.add(warp_in_block * BUFFER_SIZE),
                            fills.add(warp_in_block),
                        )
                    }
                }

                /// # Safety
                /// `pairs` valid for `num_pairs` reads; outputs sized for
                /// every match plus one record per unmatched probe.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<mm_pair_retrieve_outer_cg $cg>](
                    pairs: *const Pair<K, V>,
                    num_pairs: usize,
                    probe_output: *mut Pair<K, V>,
                    contained_output: *mut Pair<K, V>,
                    counter_ref: CounterStorageRef<{ ThreadScope::Device }>,
                    container_ref: ConstRef,
                ) {
                    let probe_buffer =
                        cuda_std::shared_array![Pair<K, V>; WARPS_PER_BLOCK * BUFFER_SIZE];
                    let contained_buffer =
                        cuda_std::shared_array![Pair<K, V>; WARPS_PER_BLOCK * BUFFER_SIZE];
                    let fills = cuda_std::shared_array![u32; WARPS_PER_BLOCK];
                    let warp_in_block = (thread::thread_idx_x() as usize) / WARP_SIZE;
                    // Safety: disjoint per-warp shared segments; body
                    // contract forwarded.
                    unsafe {
                        pair_retrieve_body::<true>(
                            pairs,
                            num_pairs,
                            probe_output,
                            contained_output,
                            counter_ref,
                            container_ref,
                            probe_buffer.add(warp_in_block * BUFFER_SIZE),
                            contained_buffer.add(warp_in_block * BUFFER_SIZE),
                            fills.add(warp_in_block),
                        )
                    }
                }

                /// Full scan counting occupied slots; one device-scope add
                /// per thread.
                ///
                /// # Safety
                /// `container_ref` must come from a live container.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<mm_get_size_cg $cg>](
                    counter_ref: CounterStorageRef<{ ThreadScope::Device }>,
                    container_ref: ConstRef,
                ) {
                    let storage = container_ref.storage_ref();
                    let empty_key = container_ref.empty_key_sentinel();
                    let capacity = storage.capacity();

                    let stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize;
                    let mut idx = thread::index_1d() as usize;
                    let mut local = 0u64;

                    while idx < capacity {
                        // Safety: `idx < capacity`.
                        let slot_key = unsafe { (*storage.slot(idx)).first };
                        if slot_key != empty_key {
                            local += 1;
                        }
                        idx += stride;
                    }

                    if local > 0 {
                        // Relaxed: the host reads after a stream sync.
                        counter_ref.data().fetch_add(local, Ordering::Relaxed);
                    }
                }
            }
        }
    };
    ($($cg:literal),+ $(,)?) => {
        $( multimap_bulk_kernels!(@mod $cg); )+
    };
}

#[cfg(target_arch = "nvptx64")]
multimap_bulk_kernels!(1, 2, 4, 8);
