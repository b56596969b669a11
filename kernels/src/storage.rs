//! Device-memory storage for the containers.
//!
//! The slot array is a flat device allocation of `Pair` cells addressed in
//! windows of `cg_size * vector_width` slots. This module owns:
//!
//! - `Extent` and the capacity-validation logic (window alignment, prime
//!   window counts for double hashing),
//! - `SlotStorage` / `SlotStorageRef`: owning host handle and non-owning
//!   device handle over the slot array,
//! - `CounterStorage` / `CounterStorageRef`: the single device-resident
//!   success/match counter,
//! - `AtomicRef` and `atomic_ops`: scope-dispatched atomics, backed by
//!   `cuda_std` intrinsics on device and `core::sync::atomic` on host.

use crate::open_addressing::ThreadScope;
use crate::probing::ProbingScheme;

#[cfg(not(target_arch = "nvptx64"))]
use cust::error::{CudaError, CudaResult};
#[cfg(not(target_arch = "nvptx64"))]
use cust::launch;
#[cfg(not(target_arch = "nvptx64"))]
use cust::memory::{AsyncCopyDestination, DeviceBuffer, DevicePointer};
#[cfg(not(target_arch = "nvptx64"))]
use cust::module::Module;
#[cfg(not(target_arch = "nvptx64"))]
use cust::stream::Stream;
#[cfg(not(target_arch = "nvptx64"))]
use cust_raw::driver_sys;

use core::marker::PhantomData;

use cust_core::DeviceCopy;

// Compile-time generated prime table (see build.rs).
include!(concat!(env!("OUT_DIR"), "/primes.rs"));

/// Validated container capacity.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Extent {
    value: usize,
}

impl Extent {
    pub const fn new(value: usize) -> Self {
        Self { value }
    }

    pub const fn value(&self) -> usize {
        self.value
    }
}

// Safety: a plain usize wrapper.
unsafe impl DeviceCopy for Extent {}

/// Smallest tabulated prime `>= n`: exact below the table's dense range,
/// within one percent above it (the tail is geometrically spaced).
fn next_prime_at_least(n: usize) -> usize {
    match PRIMES.binary_search(&n) {
        Ok(i) => PRIMES[i],
        Err(i) if i < PRIMES.len() => PRIMES[i],
        Err(_) => PRIMES.last().copied().unwrap_or(n),
    }
}

/// Rounds a requested capacity up to a usable extent.
///
/// The capacity becomes a multiple of the window stride `cg_size *
/// vector_width`, so every probing window lies fully inside the array and is
/// aligned to its own width. Double hashing additionally rounds the window
/// count to a tabulated prime, keeping every key-derived step coprime with
/// the table. A request of zero yields the smallest valid extent.
pub fn make_valid_extent(
    requested: usize,
    cg_size: usize,
    vector_width: usize,
    is_double_hashing: bool,
) -> Extent {
    let stride = cg_size * vector_width;
    assert!(stride > 0, "window stride must be nonzero");

    let requested = requested.max(1);
    let num_windows = (requested + stride - 1) / stride;

    if is_double_hashing {
        Extent::new(next_prime_at_least(num_windows) * stride)
    } else {
        Extent::new(num_windows * stride)
    }
}

/// [`make_valid_extent`] with the stride and hashing kind taken from a scheme.
pub fn make_valid_extent_for_scheme<Key>(
    requested: usize,
    scheme: &impl ProbingScheme<Key>,
    vector_width: usize,
) -> Extent {
    make_valid_extent(
        requested,
        scheme.cg_size(),
        vector_width,
        scheme.is_double_hashing(),
    )
}

/// Non-owning device-side handle to the slot array.
///
/// Trivially copyable; passed by value into kernels. The creator guarantees
/// the pointed-to memory stays valid while any copy of the ref is live.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SlotStorageRef<T, const VECTOR_WIDTH: usize> {
    extent: Extent,
    slots: *const T,
    _phantom: PhantomData<T>,
}

// Safety: an Extent plus a raw pointer; the pointer is a plain value that is
// only dereferenced where the memory it names is accessible.
unsafe impl<T: Copy, const VECTOR_WIDTH: usize> DeviceCopy for SlotStorageRef<T, VECTOR_WIDTH> {}

impl<T, const VECTOR_WIDTH: usize> SlotStorageRef<T, VECTOR_WIDTH> {
    /// Creates a storage ref over `extent.value()` slots at `slots`.
    ///
    /// # Safety
    /// `slots` must point to at least `extent.value()` elements, aligned for
    /// `T`, valid for the lifetime of every copy of the returned ref.
    pub const unsafe fn new(extent: Extent, slots: *const T) -> Self {
        Self {
            extent,
            slots,
            _phantom: PhantomData,
        }
    }

    /// Pointer to the slot at `slot_idx`.
    ///
    /// # Safety
    /// `slot_idx` must be below `capacity()`.
    #[inline]
    pub unsafe fn slot(&self, slot_idx: usize) -> *const T {
        // Safety: in-bounds by the caller contract; the allocation holds
        // `capacity()` elements.
        unsafe { self.slots.add(slot_idx) }
    }

    pub const fn data(&self) -> *const T {
        self.slots
    }

    pub const fn capacity(&self) -> usize {
        self.extent.value()
    }

    pub const fn extent(&self) -> Extent {
        self.extent
    }

    /// Number of `VECTOR_WIDTH`-slot groups a single lane loads at once.
    pub const fn num_vectors(&self) -> usize {
        self.extent.value() / VECTOR_WIDTH
    }
}

/// Host-side slot storage owning the device allocation.
#[cfg(not(target_arch = "nvptx64"))]
#[derive(Debug)]
pub struct SlotStorage<T, const VECTOR_WIDTH: usize>
where
    T: DeviceCopy,
{
    extent: Extent,
    buffer: DeviceBuffer<T>,
}

#[cfg(not(target_arch = "nvptx64"))]
impl<T, const VECTOR_WIDTH: usize> SlotStorage<T, VECTOR_WIDTH>
where
    T: DeviceCopy,
{
    /// Allocates (but does not initialize) storage for `extent` slots.
    ///
    /// # Safety
    /// The slots must be filled via `initialize`/`initialize_async` before
    /// any other operation reads them.
    pub unsafe fn new(extent: Extent, stream: &Stream) -> CudaResult<Self> {
        // Safety: per the function contract, initialization happens before
        // any read, on the same stream.
        let buffer = unsafe { DeviceBuffer::uninitialized_async(extent.value(), stream)? };
        Ok(Self { extent, buffer })
    }

    pub fn data(&self) -> DevicePointer<T> {
        self.buffer.as_slice().as_device_ptr()
    }

    pub fn storage_ref(&self) -> SlotStorageRef<T, VECTOR_WIDTH> {
        // Safety: the buffer holds `extent.value()` elements of device memory
        // that live as long as `self`; CUDA allocations are at least 256-byte
        // aligned, which covers any slot alignment we use (<= 16).
        unsafe { SlotStorageRef::new(self.extent, self.data().as_raw() as *const T) }
    }

    /// Writes `value` into every slot and synchronizes the stream.
    pub fn initialize(&mut self, value: T, stream: &Stream, module: Option<&Module>) -> CudaResult<()> {
        // Safety: synchronized below before returning.
        unsafe { self.initialize_async(value, stream, module)? };
        stream.synchronize()
    }

    /// Enqueues writing `value` into every slot.
    ///
    /// With a module and a slot type of at most 16 bytes, launches the fill
    /// kernel (the sentinel travels by value, so nothing host-side must
    /// outlive the enqueue). Otherwise falls back to staging a prefilled
    /// host buffer, which synchronizes before returning because the staging
    /// buffer cannot outlive this call.
    ///
    /// # Safety
    /// The storage must not be read until the stream operation completes.
    pub unsafe fn initialize_async(
        &mut self,
        value: T,
        stream: &Stream,
        module: Option<&Module>,
    ) -> CudaResult<()> {
        let capacity = self.extent.value();
        if capacity == 0 {
            return Ok(());
        }

        let slot_size = core::mem::size_of::<T>();
        if let (Some(module), true) = (module, slot_size <= 16) {
            let mut words = [0u64; 2];
            // Safety: `value` is a fully initialized `T` of `slot_size <= 16`
            // bytes; the copy stays inside both objects.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    &value as *const T as *const u8,
                    words.as_mut_ptr() as *mut u8,
                    slot_size,
                );
            }

            const BLOCK_SIZE: u32 = 128;
            const STRIDE: u32 = 4;
            let grid_size =
                ((capacity as u32 + STRIDE * BLOCK_SIZE - 1) / (STRIDE * BLOCK_SIZE)).max(1);

            let kernel = module.get_function("initialize_storage_slots")?;
            // Safety: the destination buffer is owned by `self` and stays
            // live; all other kernel arguments are passed by value. The
            // caller synchronizes before reading the slots.
            unsafe {
                launch!(kernel<<<grid_size, BLOCK_SIZE, 0, stream>>>(
                    self.buffer.as_device_ptr().as_raw() as *mut u8,
                    words[0],
                    words[1],
                    slot_size,
                    capacity
                ))?;
            }
            return Ok(());
        }

        let host_data: Vec<T> = vec![value; capacity];
        // Safety: the copy is synchronized below, before `host_data` drops.
        unsafe { self.buffer.async_copy_from(&host_data, stream)? };
        stream.synchronize()?;
        Ok(())
    }

    pub const fn capacity(&self) -> usize {
        self.extent.value()
    }

    pub const fn extent(&self) -> Extent {
        self.extent
    }
}

/// Scope-dispatched atomic access to a single `u32` or `u64` cell.
pub struct AtomicRef<'a, T, const SCOPE: ThreadScope> {
    ptr: *mut T,
    _phantom: PhantomData<&'a T>,
}

impl<'a, T, const SCOPE: ThreadScope> AtomicRef<'a, T, SCOPE> {
    /// # Safety
    /// `ptr` must be valid, initialized, and aligned for atomic access to `T`
    /// for the lifetime `'a`.
    pub const unsafe fn new(ptr: *mut T) -> Self {
        Self {
            ptr,
            _phantom: PhantomData,
        }
    }
}

#[cfg(target_arch = "nvptx64")]
macro_rules! atomic_ref_device_impl {
    ($t:ty, $fetch_add:ident, $load:ident, $store:ident) => {
        impl<'a, const SCOPE: ThreadScope> AtomicRef<'a, $t, SCOPE> {
            #[inline(always)]
            pub fn fetch_add(&self, val: $t, order: core::sync::atomic::Ordering) -> $t {
                use cuda_std::atomic::mid;
                // Safety: the constructor contract guarantees a valid,
                // aligned, initialized cell; scope/ordering forwarded as-is.
                // Thread scope is volatile-only and demands exclusive access,
                // which its callers must provide.
                unsafe {
                    match SCOPE {
                        ThreadScope::System => paste::paste! { mid::[<$fetch_add _system>](self.ptr, order, val) },
                        ThreadScope::Device => paste::paste! { mid::[<$fetch_add _device>](self.ptr, order, val) },
                        ThreadScope::Block => paste::paste! { mid::[<$fetch_add _block>](self.ptr, order, val) },
                        ThreadScope::Thread => {
                            let old = core::ptr::read_volatile(self.ptr);
                            core::ptr::write_volatile(self.ptr, old.wrapping_add(val));
                            old
                        }
                    }
                }
            }

            #[inline(always)]
            pub fn load(&self, order: core::sync::atomic::Ordering) -> $t {
                use cuda_std::atomic::mid;
                // Safety: as for fetch_add.
                unsafe {
                    match SCOPE {
                        ThreadScope::System => paste::paste! { mid::[<$load _system>](self.ptr, order) },
                        ThreadScope::Device => paste::paste! { mid::[<$load _device>](self.ptr, order) },
                        ThreadScope::Block => paste::paste! { mid::[<$load _block>](self.ptr, order) },
                        ThreadScope::Thread => core::ptr::read_volatile(self.ptr),
                    }
                }
            }

            #[inline(always)]
            pub fn store(&self, val: $t, order: core::sync::atomic::Ordering) {
                use cuda_std::atomic::mid;
                // Safety: as for fetch_add.
                unsafe {
                    match SCOPE {
                        ThreadScope::System => paste::paste! { mid::[<$store _system>](self.ptr, order, val) },
                        ThreadScope::Device => paste::paste! { mid::[<$store _device>](self.ptr, order, val) },
                        ThreadScope::Block => paste::paste! { mid::[<$store _block>](self.ptr, order, val) },
                        ThreadScope::Thread => core::ptr::write_volatile(self.ptr, val),
                    }
                }
            }
        }
    };
}

#[cfg(target_arch = "nvptx64")]
atomic_ref_device_impl!(u32, atomic_fetch_add_u32, atomic_load_32, atomic_store_32);
#[cfg(target_arch = "nvptx64")]
atomic_ref_device_impl!(u64, atomic_fetch_add_u64, atomic_load_64, atomic_store_64);

#[cfg(not(target_arch = "nvptx64"))]
macro_rules! atomic_ref_host_impl {
    ($t:ty, $atomic:ty) => {
        impl<'a, const SCOPE: ThreadScope> AtomicRef<'a, $t, SCOPE> {
            #[inline(always)]
            pub fn fetch_add(&self, val: $t, order: core::sync::atomic::Ordering) -> $t {
                // Safety: the constructor contract guarantees a valid,
                // aligned, initialized cell; the atomic type shares layout
                // with its integer.
                unsafe { (&*(self.ptr as *const $atomic)).fetch_add(val, order) }
            }

            #[inline(always)]
            pub fn load(&self, order: core::sync::atomic::Ordering) -> $t {
                // Safety: as for fetch_add.
                unsafe { (&*(self.ptr as *const $atomic)).load(order) }
            }

            #[inline(always)]
            pub fn store(&self, val: $t, order: core::sync::atomic::Ordering) {
                // Safety: as for fetch_add.
                unsafe { (&*(self.ptr as *const $atomic)).store(val, order) }
            }
        }
    };
}

#[cfg(not(target_arch = "nvptx64"))]
atomic_ref_host_impl!(u32, core::sync::atomic::AtomicU32);
#[cfg(not(target_arch = "nvptx64"))]
atomic_ref_host_impl!(u64, core::sync::atomic::AtomicU64);

/// Non-owning device-side handle to the container counter.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CounterStorageRef<const SCOPE: ThreadScope> {
    ptr: *mut u64,
}

// Safety: a raw pointer value; dereferenced only on device.
unsafe impl<const SCOPE: ThreadScope> DeviceCopy for CounterStorageRef<SCOPE> {}

impl<const SCOPE: ThreadScope> CounterStorageRef<SCOPE> {
    /// # Safety
    /// `ptr` must point to an initialized `u64` in device memory.
    pub const unsafe fn new(ptr: *mut u64) -> Self {
        Self { ptr }
    }

    pub fn data<'a>(&self) -> AtomicRef<'a, u64, SCOPE> {
        // Safety: constructed from CounterStorage, whose single-element
        // device buffer is valid and 8-byte aligned.
        unsafe { AtomicRef::new(self.ptr) }
    }
}

/// Host-side owner of the single device-resident `u64` counter.
///
/// Reset at the start of every count-producing bulk call; read back behind a
/// stream sync.
#[cfg(not(target_arch = "nvptx64"))]
pub struct CounterStorage<const SCOPE: ThreadScope = { ThreadScope::Device }> {
    buffer: DeviceBuffer<u64>,
}

#[cfg(not(target_arch = "nvptx64"))]
fn translate_driver_error(err: driver_sys::cudaError_enum) -> CudaError {
    use driver_sys::cudaError_enum;
    match err {
        cudaError_enum::CUDA_SUCCESS => unreachable!(),
        cudaError_enum::CUDA_ERROR_INVALID_VALUE => CudaError::InvalidValue,
        cudaError_enum::CUDA_ERROR_OUT_OF_MEMORY => CudaError::OutOfMemory,
        cudaError_enum::CUDA_ERROR_NOT_INITIALIZED => CudaError::NotInitialized,
        cudaError_enum::CUDA_ERROR_DEINITIALIZED => CudaError::Deinitialized,
        cudaError_enum::CUDA_ERROR_INVALID_CONTEXT => CudaError::InvalidContext,
        cudaError_enum::CUDA_ERROR_INVALID_DEVICE => CudaError::InvalidDevice,
        _ => CudaError::UnknownError,
    }
}

#[cfg(not(target_arch = "nvptx64"))]
impl<const SCOPE: ThreadScope> CounterStorage<SCOPE> {
    /// Allocates the counter.
    ///
    /// # Safety
    /// The counter must be `reset` before its first read.
    pub unsafe fn new(stream: &Stream) -> CudaResult<Self> {
        // Safety: reset is required before any read, per the contract above.
        let buffer = unsafe { DeviceBuffer::uninitialized_async(1, stream)? };
        Ok(Self { buffer })
    }

    /// Enqueues zeroing the counter on `stream`.
    ///
    /// # Safety
    /// The counter must not be read (host or device) until the stream
    /// reaches this operation, and count-producing calls sharing this
    /// counter must be serialized per stream.
    pub unsafe fn reset(&self, stream: &Stream) -> CudaResult<()> {
        // Safety: the buffer owns exactly 8 valid device bytes; mutation is
        // device-side and stream-ordered.
        unsafe {
            let result = driver_sys::cuMemsetD8Async(
                self.buffer.as_device_ptr().as_raw(),
                0,
                core::mem::size_of::<u64>(),
                stream.as_inner(),
            );
            match result {
                driver_sys::cudaError_enum::CUDA_SUCCESS => Ok(()),
                e => Err(translate_driver_error(e)),
            }
        }
    }

    /// Copies the counter to the host, synchronizing the stream first.
    pub fn load_to_host(&self, stream: &Stream) -> CudaResult<u64> {
        let mut host_val = vec![0u64];
        // Safety: one-element copy between live buffers; synchronized below
        // before `host_val` is read.
        unsafe { self.buffer.async_copy_to(&mut host_val, stream)? };
        stream.synchronize()?;
        Ok(host_val[0])
    }

    pub fn storage_ref(&self) -> CounterStorageRef<SCOPE> {
        // Safety: the single-element buffer is valid device memory for the
        // lifetime of `self`.
        unsafe { CounterStorageRef::new(self.buffer.as_device_ptr().as_raw() as *mut u64) }
    }
}

/// Raw word-level atomics on slot cells.
///
/// All operations are relaxed unless stated otherwise. CAS returns the
/// observed old word so callers can resolve duplicate-vs-continue without a
/// second load. Only 4- and 8-byte widths are supported; other widths are
/// reported as a failed CAS / zero load by construction, and the container
/// protocols statically never request them.
#[cfg(target_arch = "nvptx64")]
pub mod atomic_ops {
    use super::ThreadScope;
    use core::sync::atomic::Ordering;
    use cuda_std::atomic::mid;

    /// Relaxed CAS of a 4- or 8-byte word; returns the observed old word.
    ///
    /// # Safety
    /// `address` must be valid device memory, aligned to `size`, holding an
    /// initialized word. Under `ThreadScope::Thread` the cell must not be
    /// accessed concurrently.
    #[inline(always)]
    pub unsafe fn cas_word<const SCOPE: ThreadScope>(
        address: *mut u8,
        expected: u64,
        desired: u64,
        size: usize,
    ) -> u64 {
        match size {
            4 => {
                let ptr = address as *mut u32;
                // Safety: forwarded from the function contract.
                let old = unsafe {
                    match SCOPE {
                        ThreadScope::System => mid::atomic_compare_and_swap_u32_system(
                            ptr,
                            expected as u32,
                            desired as u32,
                            Ordering::Relaxed,
                        ),
                        ThreadScope::Device => mid::atomic_compare_and_swap_u32_device(
                            ptr,
                            expected as u32,
                            desired as u32,
                            Ordering::Relaxed,
                        ),
                        ThreadScope::Block => mid::atomic_compare_and_swap_u32_block(
                            ptr,
                            expected as u32,
                            desired as u32,
                            Ordering::Relaxed,
                        ),
                        ThreadScope::Thread => {
                            let current = core::ptr::read_volatile(ptr);
                            if current == expected as u32 {
                                core::ptr::write_volatile(ptr, desired as u32);
                            }
                            current
                        }
                    }
                };
                old as u64
            }
            8 => {
                let ptr = address as *mut u64;
                // Safety: forwarded from the function contract.
                unsafe {
                    match SCOPE {
                        ThreadScope::System => mid::atomic_compare_and_swap_u64_system(
                            ptr,
                            expected,
                            desired,
                            Ordering::Relaxed,
                        ),
                        ThreadScope::Device => mid::atomic_compare_and_swap_u64_device(
                            ptr,
                            expected,
                            desired,
                            Ordering::Relaxed,
                        ),
                        ThreadScope::Block => mid::atomic_compare_and_swap_u64_block(
                            ptr,
                            expected,
                            desired,
                            Ordering::Relaxed,
                        ),
                        ThreadScope::Thread => {
                            let current = core::ptr::read_volatile(ptr);
                            if current == expected {
                                core::ptr::write_volatile(ptr, desired);
                            }
                            current
                        }
                    }
                }
            }
            // Unsupported width: report as a CAS that observed a different
            // word.
            _ => !expected,
        }
    }

    /// Relaxed store of a 4- or 8-byte word.
    ///
    /// # Safety
    /// As for [`cas_word`].
    #[inline(always)]
    pub unsafe fn store_word<const SCOPE: ThreadScope>(address: *mut u8, value: u64, size: usize) {
        match size {
            4 => {
                let ptr = address as *mut u32;
                // Safety: forwarded from the function contract.
                unsafe {
                    match SCOPE {
                        ThreadScope::System => {
                            mid::atomic_store_32_system(ptr, Ordering::Relaxed, value as u32)
                        }
                        ThreadScope::Device => {
                            mid::atomic_store_32_device(ptr, Ordering::Relaxed, value as u32)
                        }
                        ThreadScope::Block => {
                            mid::atomic_store_32_block(ptr, Ordering::Relaxed, value as u32)
                        }
                        ThreadScope::Thread => core::ptr::write_volatile(ptr, value as u32),
                    }
                }
            }
            8 => {
                let ptr = address as *mut u64;
                // Safety: forwarded from the function contract.
                unsafe {
                    match SCOPE {
                        ThreadScope::System => {
                            mid::atomic_store_64_system(ptr, Ordering::Relaxed, value)
                        }
                        ThreadScope::Device => {
                            mid::atomic_store_64_device(ptr, Ordering::Relaxed, value)
                        }
                        ThreadScope::Block => {
                            mid::atomic_store_64_block(ptr, Ordering::Relaxed, value)
                        }
                        ThreadScope::Thread => core::ptr::write_volatile(ptr, value),
                    }
                }
            }
            _ => {}
        }
    }

    /// Acquire load of a 4- or 8-byte word.
    ///
    /// # Safety
    /// As for [`cas_word`].
    #[inline(always)]
    pub unsafe fn load_word<const SCOPE: ThreadScope>(address: *const u8, size: usize) -> u64 {
        match size {
            4 => {
                let ptr = address as *mut u32;
                // Safety: forwarded from the function contract.
                let v = unsafe {
                    match SCOPE {
                        ThreadScope::System => mid::atomic_load_32_system(ptr, Ordering::Acquire),
                        ThreadScope::Device => mid::atomic_load_32_device(ptr, Ordering::Acquire),
                        ThreadScope::Block => mid::atomic_load_32_block(ptr, Ordering::Acquire),
                        ThreadScope::Thread => core::ptr::read_volatile(ptr),
                    }
                };
                v as u64
            }
            8 => {
                let ptr = address as *mut u64;
                // Safety: forwarded from the function contract.
                unsafe {
                    match SCOPE {
                        ThreadScope::System => mid::atomic_load_64_system(ptr, Ordering::Acquire),
                        ThreadScope::Device => mid::atomic_load_64_device(ptr, Ordering::Acquire),
                        ThreadScope::Block => mid::atomic_load_64_block(ptr, Ordering::Acquire),
                        ThreadScope::Thread => core::ptr::read_volatile(ptr),
                    }
                }
            }
            _ => 0,
        }
    }

    /// Spins until the word at `address` differs from `sentinel`.
    ///
    /// Read-side guard for the CAS-then-store protocol: a committed key may
    /// briefly coexist with the sentinel value.
    ///
    /// # Safety
    /// As for [`cas_word`]; additionally some thread must eventually publish
    /// a non-sentinel word, or this never returns.
    #[inline]
    pub unsafe fn wait_for_payload<const SCOPE: ThreadScope>(
        address: *const u8,
        sentinel: u64,
        size: usize,
    ) {
        if size != 4 && size != 8 {
            return;
        }
        // Safety: forwarded from the function contract.
        while unsafe { load_word::<SCOPE>(address, size) } == sentinel {
            core::hint::spin_loop();
        }
    }
}

/// Host builds of the same word-level atomics, backed by `core::sync::atomic`.
///
/// These carry the container protocols in host unit tests; `SCOPE` is
/// accepted for signature parity but standard atomics have no scope notion.
#[cfg(not(target_arch = "nvptx64"))]
pub mod atomic_ops {
    use super::ThreadScope;
    use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    /// Relaxed CAS of a 4- or 8-byte word; returns the observed old word.
    ///
    /// # Safety
    /// `address` must be valid, aligned to `size`, and initialized.
    #[inline]
    pub unsafe fn cas_word<const SCOPE: ThreadScope>(
        address: *mut u8,
        expected: u64,
        desired: u64,
        size: usize,
    ) -> u64 {
        match size {
            4 => {
                // Safety: valid aligned cell per the contract.
                let atomic = unsafe { &*(address as *const AtomicU32) };
                match atomic.compare_exchange(
                    expected as u32,
                    desired as u32,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(old) => old as u64,
                    Err(old) => old as u64,
                }
            }
            8 => {
                // Safety: valid aligned cell per the contract.
                let atomic = unsafe { &*(address as *const AtomicU64) };
                match atomic.compare_exchange(expected, desired, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(old) => old,
                    Err(old) => old,
                }
            }
            _ => !expected,
        }
    }

    /// Relaxed store of a 4- or 8-byte word.
    ///
    /// # Safety
    /// As for [`cas_word`].
    #[inline]
    pub unsafe fn store_word<const SCOPE: ThreadScope>(address: *mut u8, value: u64, size: usize) {
        match size {
            4 => {
                // Safety: valid aligned cell per the contract.
                unsafe { &*(address as *const AtomicU32) }.store(value as u32, Ordering::Relaxed)
            }
            8 => {
                // Safety: valid aligned cell per the contract.
                unsafe { &*(address as *const AtomicU64) }.store(value, Ordering::Relaxed)
            }
            _ => {}
        }
    }

    /// Acquire load of a 4- or 8-byte word.
    ///
    /// # Safety
    /// As for [`cas_word`].
    #[inline]
    pub unsafe fn load_word<const SCOPE: ThreadScope>(address: *const u8, size: usize) -> u64 {
        match size {
            4 => {
                // Safety: valid aligned cell per the contract.
                unsafe { &*(address as *const AtomicU32) }.load(Ordering::Acquire) as u64
            }
            8 => {
                // Safety: valid aligned cell per the contract.
                unsafe { &*(address as *const AtomicU64) }.load(Ordering::Acquire)
            }
            _ => 0,
        }
    }

    /// Spins until the word at `address` differs from `sentinel`.
    ///
    /// # Safety
    /// As for [`cas_word`]; some thread must eventually publish a
    /// non-sentinel word.
    #[inline]
    pub unsafe fn wait_for_payload<const SCOPE: ThreadScope>(
        address: *const u8,
        sentinel: u64,
        size: usize,
    ) {
        if size != 4 && size != 8 {
            return;
        }
        // Safety: forwarded from the function contract.
        while unsafe { load_word::<SCOPE>(address, size) } == sentinel {
            core::hint::spin_loop();
        }
    }
}

// Slot-array fill kernel, loaded from the compiled PTX module.
#[cfg(target_arch = "nvptx64")]
mod device_kernels {
    use cuda_std::prelude::*;

    /// Writes the sentinel byte pattern into every slot.
    ///
    /// The sentinel arrives by value as two 64-bit words covering up to 16
    /// bytes of slot payload; grid-stride so the launch geometry can
    /// undershoot the capacity.
    ///
    /// # Safety
    /// * `slots` must cover `capacity * slot_size` bytes of device memory.
    /// * `slot_size` must be at most 16.
    /// * No other access to `slots` may overlap the kernel.
    #[kernel]
    #[allow(improper_ctypes_definitions)]
    pub unsafe fn initialize_storage_slots(
        slots: *mut u8,
        sentinel_lo: u64,
        sentinel_hi: u64,
        slot_size: usize,
        capacity: usize,
    ) {
        let sentinel = [sentinel_lo, sentinel_hi];
        let src = sentinel.as_ptr() as *const u8;

        let stride = (thread::grid_dim_x() * thread::block_dim_x()) as usize;
        let mut idx = thread::index_1d() as usize;

        while idx < capacity {
            // Safety: `idx < capacity`, so the destination lies inside the
            // slot array; `slot_size <= 16` keeps the source read inside the
            // local sentinel words.
            unsafe {
                core::ptr::copy_nonoverlapping(src, slots.add(idx * slot_size), slot_size);
            }
            idx += stride;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::XXHash64;
    use crate::probing::DoubleHashProbing;

    #[test]
    fn extent_aligns_to_window_stride() {
        // cg 4, vector width 2: stride 8.
        assert_eq!(make_valid_extent(10, 4, 2, false).value(), 16);
        assert_eq!(make_valid_extent(16, 4, 2, false).value(), 16);
        assert_eq!(make_valid_extent(17, 4, 2, false).value(), 24);
    }

    #[test]
    fn zero_request_yields_smallest_valid_extent() {
        assert_eq!(make_valid_extent(0, 1, 1, false).value(), 1);
        assert_eq!(make_valid_extent(0, 8, 2, false).value(), 16);
    }

    #[test]
    fn double_hashing_extent_has_prime_window_count() {
        let extent = make_valid_extent(200, 8, 2, true);
        let windows = extent.value() / 16;
        assert!(extent.value() >= 200);
        assert!(PRIMES.binary_search(&windows).is_ok());
    }

    #[test]
    fn scheme_extent_matches_direct_form() {
        let scheme = DoubleHashProbing::<u64, XXHash64<u64>, XXHash64<u64>, 8>::new(
            XXHash64::new(0),
            XXHash64::new(42),
        );
        assert_eq!(
            make_valid_extent_for_scheme(200, &scheme, 2),
            make_valid_extent(200, 8, 2, true)
        );
    }

    #[test]
    fn host_cas_word_reports_observed_value() {
        let mut cell = 7u64;
        let ptr = &mut cell as *mut u64 as *mut u8;

        // Safety: `cell` is a valid aligned u64 on the stack.
        let old = unsafe { atomic_ops::cas_word::<{ ThreadScope::Device }>(ptr, 7, 9, 8) };
        assert_eq!(old, 7);
        assert_eq!(cell, 9);

        let old = unsafe { atomic_ops::cas_word::<{ ThreadScope::Device }>(ptr, 7, 11, 8) };
        assert_eq!(old, 9);
        assert_eq!(cell, 9);
    }

    #[test]
    fn unsupported_width_never_matches() {
        let mut cell = 0u64;
        let ptr = &mut cell as *mut u64 as *mut u8;
        // Safety: valid stack cell; width 3 is rejected before any access.
        let old = unsafe { atomic_ops::cas_word::<{ ThreadScope::Device }>(ptr, 0, 1, 3) };
        assert_ne!(old, 0);
        assert_eq!(cell, 0);
    }
}
