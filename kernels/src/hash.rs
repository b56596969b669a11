//! Hash functions usable from both host and device code.
//!
//! The containers treat hashers as user-supplied pure functors; the
//! implementations here are the stock choices (identity for pre-hashed or
//! densely numbered keys, XXHash for everything else).

use cust_core::DeviceCopy;

/// Marker trait for valid hash return types (`u32` or `u64`).
pub trait HashOutput: Copy + DeviceCopy {
    /// Widens the hash value to `usize` for modulo arithmetic.
    fn to_usize(self) -> usize;
}

impl HashOutput for u32 {
    fn to_usize(self) -> usize {
        self as usize
    }
}

impl HashOutput for u64 {
    fn to_usize(self) -> usize {
        self as usize
    }
}

/// A hash function over a fixed-size key, callable on host and device.
pub trait Hash<Key>: Copy + DeviceCopy {
    /// The hash result type, either `u32` or `u64`.
    type HashType: HashOutput;

    fn hash(&self, key: &Key) -> Self::HashType;
}

pub mod identity;
pub mod xxhash;

pub use identity::IdentityHash;
pub use xxhash::{XXHash32, XXHash64};
