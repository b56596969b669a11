//! Device-side views of the static map.
//!
//! Two non-owning, trivially copyable value types: the mutable view supports
//! `insert` from device code, the const view supports `find` and `contains`.
//! Both are built host-side and passed to kernels by value; neither may
//! outlive the container that produced it.

use crate::open_addressing::{EqualWrapper, KeyEqual, OpenAddressingRefImpl, ThreadScope};
use crate::pair::{alignment, AlignedTo, Pair};
use crate::probing::ProbingScheme;
use crate::storage::{Extent, SlotStorageRef};
use cust_core::DeviceCopy;

macro_rules! map_view_common {
    () => {
        /// Maximum number of elements the container can hold.
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
        ) -> OpenAddressingRefImpl<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE, false> {
            OpenAddressingRefImpl::new(
                self.storage_ref,
                self.empty_slot_sentinel,
                self.predicate,
                self.probing_scheme,
            )
        }
    };
}

/// Mutable device view: supports insertion.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StaticMapMutableRef<
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

// Safety: Copy value fields only; the embedded pointer is dereferenced only
// where the slot memory is accessible.
unsafe impl<Key, Value, Scheme, const VECTOR_WIDTH: usize, KeyEq, const SCOPE: ThreadScope>
    DeviceCopy for StaticMapMutableRef<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE>
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
    StaticMapMutableRef<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE>
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

    map_view_common!();

    /// Single-worker insert. Returns `true` only for a fresh insert.
    #[inline]
    pub fn insert(&self, pair: Pair<Key, Value>) -> bool {
        self.as_ref_impl().insert(pair)
    }
}

#[cfg(target_arch = "nvptx64")]
impl<Key, Value, Scheme, const VECTOR_WIDTH: usize, KeyEq, const SCOPE: ThreadScope>
    StaticMapMutableRef<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE>
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

/// Const device view: lookups only.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StaticMapRef<
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
    DeviceCopy for StaticMapRef<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE>
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
    StaticMapRef<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE>
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

    map_view_common!();

    /// Single-worker lookup: the mapped value, if present.
    #[inline]
    pub fn find(&self, key: &Key) -> Option<Value> {
        self.as_ref_impl().find(key)
    }

    /// Single-worker membership test.
    #[inline]
    pub fn contains(&self, key: &Key) -> bool {
        self.as_ref_impl().contains(key)
    }
}

#[cfg(target_arch = "nvptx64")]
impl<Key, Value, Scheme, const VECTOR_WIDTH: usize, KeyEq, const SCOPE: ThreadScope>
    StaticMapRef<Key, Value, Scheme, VECTOR_WIDTH, KeyEq, SCOPE>
where
    Key: DeviceCopy + Copy + PartialEq,
    Value: DeviceCopy + Copy,
    Scheme: ProbingScheme<Key>,
    KeyEq: KeyEqual<Key>,
    Pair<Key, Value>: DeviceCopy,
    (): AlignedTo<{ alignment::<Key, Value>() }>,
{
    /// Cooperative lookup.
    ///
    /// # Safety
    /// `tile_mask` must name a converged warp partition executing this call
    /// together.
    #[inline]
    pub unsafe fn find_cooperative(&self, tile_mask: u32, key: &Key) -> Option<Value> {
        // Safety: forwarded.
        unsafe { self.as_ref_impl().find_cooperative(tile_mask, key) }
    }

    /// Cooperative membership test.
    ///
    /// # Safety
    /// As for [`Self::find_cooperative`].
    #[inline]
    pub unsafe fn contains_cooperative(&self, tile_mask: u32, key: &Key) -> bool {
        // Safety: forwarded.
        unsafe { self.as_ref_impl().contains_cooperative(tile_mask, key) }
    }
}
