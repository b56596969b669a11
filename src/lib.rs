//! GPU-resident concurrent associative containers: a fixed-capacity hash map
//! with unique keys and a fixed-capacity hash multimap, both open-addressing
//! tables whose slot arrays live in device memory.
//!
//! The container logic lives in the shared `cuda-static-containers-kernels`
//! crate; this crate embeds the compiled PTX and re-exports the public API.
//! Load the PTX into a [`cust::module::Module`] and hand it to the bulk
//! operations:
//!
//! ```no_run
//! use cuda_static_containers::{get_ptx, StaticMap};
//! use cust::module::Module;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let _ctx = cust::quick_init()?;
//! let module = Module::from_ptx(get_ptx(), &[])?;
//! # Ok(())
//! # }
//! ```

static PTX: &str = include_str!(concat!(env!("OUT_DIR"), "/kernels.ptx"));

/// The compiled device kernels, for loading as a module.
pub fn get_ptx() -> &'static str {
    PTX
}

pub use cuda_static_containers_kernels::{
    hash, open_addressing, pair, probing, static_map, static_map_ref, static_multimap,
    static_multimap_ref, storage,
};

pub use cuda_static_containers_kernels::{
    DefaultKeyEqual, DefaultPairEqual, DoubleHashProbing, Hash, IdentityHash, KeyEqual,
    LinearProbing, Pair, PairEqual, ProbingScheme, StaticMap, StaticMapMutableRef, StaticMapRef,
    StaticMultimap, StaticMultimapMutableRef, StaticMultimapRef, ThreadScope, XXHash32, XXHash64,
};
