#![feature(generic_const_exprs)]
#![feature(adt_const_params)]
#![allow(incomplete_features)]

use cuda_static_containers::hash::IdentityHash;
use cuda_static_containers::open_addressing::{DefaultKeyEqual, ThreadScope};
use cuda_static_containers::probing::LinearProbing;
use cuda_static_containers::{get_ptx, Pair, StaticMap};
use cust::memory::LockedBuffer;
use cust::prelude::*;
use std::error::Error;

fn setup_cuda() -> Result<(Context, Stream, Module), Box<dyn Error>> {
    cust::init(CudaFlags::empty())?;
    let device = Device::get_device(0)?;
    let ctx = Context::new(device)?;
    let stream = Stream::new(StreamFlags::NON_BLOCKING, None)?;
    let module = Module::from_ptx(get_ptx(), &[])?;
    Ok((ctx, stream, module))
}

mod test_helpers {
    use super::*;

    pub type Map32 = StaticMap<
        u32,
        u32,
        LinearProbing<u32, IdentityHash<u32>, 4>,
        1,
        DefaultKeyEqual,
        { ThreadScope::Device },
    >;

    pub type Map64 = StaticMap<
        u64,
        u64,
        LinearProbing<u64, IdentityHash<u64>, 4>,
        1,
        DefaultKeyEqual,
        { ThreadScope::Device },
    >;

    pub type Map64Scalar = StaticMap<
        u64,
        u64,
        LinearProbing<u64, IdentityHash<u64>, 1>,
        1,
        DefaultKeyEqual,
        { ThreadScope::Device },
    >;

    pub fn create_map32(
        capacity: usize,
        stream: &Stream,
        module: &Module,
    ) -> Result<Map32, Box<dyn Error>> {
        Ok(Map32::new(
            capacity,
            u32::MAX,
            u32::MAX,
            DefaultKeyEqual,
            LinearProbing::new(IdentityHash::new()),
            stream,
            Some(module),
        )?)
    }

    pub fn create_map64(
        capacity: usize,
        stream: &Stream,
        module: &Module,
    ) -> Result<Map64, Box<dyn Error>> {
        Ok(Map64::new(
            capacity,
            u64::MAX,
            u64::MAX,
            DefaultKeyEqual,
            LinearProbing::new(IdentityHash::new()),
            stream,
            Some(module),
        )?)
    }
}

mod basic_operations {
    use super::test_helpers::*;
    use super::*;

    #[test]
    fn single_insert_then_find() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_map32(1024, &stream, &module)?;

        let inserted = map.insert(&[Pair::new(42u32, 100u32)], &stream, &module)?;
        assert_eq!(inserted, 1);

        let mut output = unsafe { LockedBuffer::uninitialized(1)? };
        unsafe { map.find(&[42u32], output.as_mut_slice(), &stream, &module)? };
        assert_eq!(output[0], 100);

        Ok(())
    }

    /// Packed-slot path: 8-byte `(u32, u32)` slots, capacity 100.
    #[test]
    fn packed_bulk_roundtrip() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_map32(100, &stream, &module)?;

        let pairs: Vec<Pair<u32, u32>> = (0..50).map(|i| Pair::new(i, 2 * i)).collect();
        let inserted = map.insert(&pairs, &stream, &module)?;
        assert_eq!(inserted, 50);
        assert_eq!(map.size(), 50);

        let keys: Vec<u32> = (0..100).collect();
        let mut values = unsafe { LockedBuffer::uninitialized(100)? };
        unsafe { map.find(&keys, values.as_mut_slice(), &stream, &module)? };
        for i in 0..50usize {
            assert_eq!(values[i], 2 * i as u32);
        }
        for i in 50..100usize {
            assert_eq!(values[i], u32::MAX, "missing key {i} must yield the empty value");
        }

        let mut present = unsafe { LockedBuffer::uninitialized(100)? };
        unsafe { map.contains(&keys, present.as_mut_slice(), &stream, &module)? };
        for i in 0..100usize {
            assert_eq!(present[i], i < 50);
        }

        Ok(())
    }

    /// Wide-slot path: 16-byte `(u64, u64)` slots take the per-cell CAS
    /// protocols; results must match the packed path exactly.
    #[test]
    fn wide_bulk_roundtrip() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_map64(100, &stream, &module)?;

        let pairs: Vec<Pair<u64, u64>> = (0..50).map(|i| Pair::new(i, 2 * i)).collect();
        assert_eq!(map.insert(&pairs, &stream, &module)?, 50);
        assert_eq!(map.size(), 50);

        let keys: Vec<u64> = (0..100).collect();
        let mut values = unsafe { LockedBuffer::uninitialized(100)? };
        unsafe { map.find(&keys, values.as_mut_slice(), &stream, &module)? };
        for i in 0..50usize {
            assert_eq!(values[i], 2 * i as u64);
        }
        for i in 50..100usize {
            assert_eq!(values[i], u64::MAX);
        }

        Ok(())
    }

    #[test]
    fn scalar_groups_match_cooperative_groups() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = Map64Scalar::new(
            512,
            u64::MAX,
            u64::MAX,
            DefaultKeyEqual,
            LinearProbing::new(IdentityHash::new()),
            &stream,
            Some(&module),
        )?;

        let pairs: Vec<Pair<u64, u64>> = (0..200).map(|i| Pair::new(i, i + 7)).collect();
        assert_eq!(map.insert(&pairs, &stream, &module)?, 200);

        let keys: Vec<u64> = (0..200).collect();
        let mut values = unsafe { LockedBuffer::uninitialized(200)? };
        unsafe { map.find(&keys, values.as_mut_slice(), &stream, &module)? };
        for i in 0..200usize {
            assert_eq!(values[i], i as u64 + 7);
        }

        Ok(())
    }
}

mod duplicates {
    use super::test_helpers::*;
    use super::*;

    /// Duplicate keys in one batch: exactly one insert wins and the stored
    /// value is one of the contenders.
    #[test]
    fn duplicate_keys_single_success() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_map32(100, &stream, &module)?;

        let pairs = vec![Pair::new(0u32, 0u32), Pair::new(0, 1), Pair::new(0, 2)];
        let inserted = map.insert(&pairs, &stream, &module)?;
        assert_eq!(inserted, 1);
        assert_eq!(map.size(), 1);

        let mut output = unsafe { LockedBuffer::uninitialized(1)? };
        unsafe { map.find(&[0u32], output.as_mut_slice(), &stream, &module)? };
        assert!(
            [0, 1, 2].contains(&output[0]),
            "stored value must come from one contender, got {}",
            output[0]
        );

        Ok(())
    }

    /// A later insert of an existing key never overwrites the stored value.
    #[test]
    fn losing_insert_never_overwrites() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_map32(100, &stream, &module)?;

        assert_eq!(map.insert(&[Pair::new(7u32, 70u32)], &stream, &module)?, 1);
        assert_eq!(map.insert(&[Pair::new(7u32, 99u32)], &stream, &module)?, 0);
        assert_eq!(map.size(), 1);

        let mut output = unsafe { LockedBuffer::uninitialized(1)? };
        unsafe { map.find(&[7u32], output.as_mut_slice(), &stream, &module)? };
        assert_eq!(output[0], 70);

        Ok(())
    }
}

mod conditional_insert {
    use super::test_helpers::*;
    use super::*;

    #[test]
    fn stencil_gates_insertion() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_map32(256, &stream, &module)?;

        let pairs: Vec<Pair<u32, u32>> = (0..100).map(|i| Pair::new(i, i * 10)).collect();
        let stencil: Vec<u64> = (0..100).map(|i| (i % 2) as u64).collect();

        let inserted = map.insert_if(&pairs, &stencil, &stream, &module)?;
        assert_eq!(inserted, 50);
        assert_eq!(map.size(), 50);

        let keys: Vec<u32> = (0..100).collect();
        let mut present = unsafe { LockedBuffer::uninitialized(100)? };
        unsafe { map.contains(&keys, present.as_mut_slice(), &stream, &module)? };
        for i in 0..100usize {
            assert_eq!(present[i], i % 2 == 1, "stencil admits odd indices only");
        }

        Ok(())
    }
}

mod boundaries {
    use super::test_helpers::*;
    use super::*;

    #[test]
    fn empty_input_ranges_are_noops() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_map32(64, &stream, &module)?;

        assert_eq!(map.insert(&[], &stream, &module)?, 0);
        assert_eq!(map.insert_if(&[], &[], &stream, &module)?, 0);
        unsafe {
            map.find(&[], &mut [], &stream, &module)?;
            map.contains(&[], &mut [], &stream, &module)?;
        }
        assert_eq!(map.size(), 0);

        Ok(())
    }

    #[test]
    fn zero_capacity_is_clamped() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let map = create_map32(0, &stream, &module)?;
        assert!(map.capacity() >= 1);
        Ok(())
    }

    #[test]
    fn clear_resets_slots_and_size() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_map32(128, &stream, &module)?;

        let pairs: Vec<Pair<u32, u32>> = (0..64).map(|i| Pair::new(i, i)).collect();
        assert_eq!(map.insert(&pairs, &stream, &module)?, 64);

        map.clear(&stream, Some(&module))?;
        assert_eq!(map.size(), 0);

        let keys: Vec<u32> = (0..64).collect();
        let mut present = unsafe { LockedBuffer::uninitialized(64)? };
        unsafe { map.contains(&keys, present.as_mut_slice(), &stream, &module)? };
        assert!(present.iter().all(|p| !p));

        // The cleared table accepts the keys again.
        assert_eq!(map.insert(&pairs, &stream, &module)?, 64);
        assert_eq!(map.size(), 64);

        Ok(())
    }

    #[test]
    fn load_factor_constructor_oversizes() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let map = test_helpers::Map32::with_load_factor(
            100,
            0.5,
            u32::MAX,
            u32::MAX,
            DefaultKeyEqual,
            LinearProbing::new(IdentityHash::new()),
            &stream,
            Some(&module),
        )?;
        assert!(map.capacity() >= 200);
        Ok(())
    }
}

mod randomized {
    use super::test_helpers::*;
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    /// Random keyed batches alternating between two streams: size matches
    /// the number of distinct keys, and every lookup returns a value some
    /// batch inserted for that key.
    #[test]
    fn random_batches_preserve_invariants() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream_a, module) = setup_cuda()?;
        let stream_b = Stream::new(StreamFlags::NON_BLOCKING, None)?;

        const TOTAL: usize = 100_000;
        const BATCHES: usize = 4;
        let mut map = create_map64(2 * TOTAL, &stream_a, &module)?;
        stream_a.synchronize()?;

        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        let mut expected: HashMap<u64, Vec<u64>> = HashMap::new();

        for batch in 0..BATCHES {
            let pairs: Vec<Pair<u64, u64>> = (0..TOTAL / BATCHES)
                .map(|_| {
                    let key = rng.gen_range(0..u64::MAX / 2);
                    let value = rng.gen_range(0..u64::MAX / 2);
                    Pair::new(key, value)
                })
                .collect();
            for pair in &pairs {
                expected.entry(pair.first).or_default().push(pair.second);
            }
            let stream = if batch % 2 == 0 { &stream_a } else { &stream_b };
            map.insert(&pairs, stream, &module)?;
        }

        assert_eq!(map.size(), expected.len());

        let keys: Vec<u64> = expected.keys().copied().collect();
        let mut values = unsafe { LockedBuffer::uninitialized(keys.len())? };
        unsafe { map.find(&keys, values.as_mut_slice(), &stream_a, &module)? };
        for (key, found) in keys.iter().zip(values.iter()) {
            assert!(
                expected[key].contains(found),
                "key {key} mapped to {found}, which no batch inserted"
            );
        }

        Ok(())
    }
}
