//! Shared host/device core of the static containers.
//!
//! Compiles two ways: as a regular Rust library for the host (bulk APIs,
//! storage management, unit-testable probing core) and to PTX for
//! `nvptx64-nvidia-cuda` (bulk kernels, cooperative protocols). Device-only
//! and host-only paths are switched on `target_arch`.

#![feature(generic_const_exprs)]
#![feature(adt_const_params)]
#![allow(incomplete_features)]

pub mod hash;
pub mod open_addressing;
pub mod pair;
pub mod probing;
pub mod static_map;
pub mod static_map_ref;
pub mod static_multimap;
pub mod static_multimap_ref;
pub mod storage;

pub use hash::{Hash, IdentityHash, XXHash32, XXHash64};
pub use open_addressing::{DefaultKeyEqual, DefaultPairEqual, KeyEqual, PairEqual, ThreadScope};
pub use pair::Pair;
pub use probing::{DoubleHashProbing, LinearProbing, ProbingScheme};
pub use static_map::StaticMap;
pub use static_map_ref::{StaticMapMutableRef, StaticMapRef};
pub use static_multimap::StaticMultimap;
pub use static_multimap_ref::{StaticMultimapMutableRef, StaticMultimapRef};
pub use storage::{make_valid_extent, make_valid_extent_for_scheme, Extent, SlotStorageRef};
#[cfg(not(target_arch = "nvptx64"))]
pub use storage::{CounterStorage, SlotStorage};
