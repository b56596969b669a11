#![feature(generic_const_exprs)]
#![feature(adt_const_params)]
#![allow(incomplete_features)]

use cuda_static_containers::hash::XXHash64;
use cuda_static_containers::open_addressing::{DefaultKeyEqual, ThreadScope};
use cuda_static_containers::probing::DoubleHashProbing;
use cuda_static_containers::{get_ptx, Pair, StaticMultimap};
use cust::memory::LockedBuffer;
use cust::prelude::*;
use std::collections::HashSet;
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

    pub const EMPTY: u64 = u64::MAX;

    pub type Multimap = StaticMultimap<
        u64,
        u64,
        DoubleHashProbing<u64, XXHash64<u64>, XXHash64<u64>, 8>,
        2,
        DefaultKeyEqual,
        { ThreadScope::Device },
    >;

    pub fn create_multimap(
        capacity: usize,
        stream: &Stream,
        module: &Module,
    ) -> Result<Multimap, Box<dyn Error>> {
        Ok(Multimap::new(
            capacity,
            EMPTY,
            EMPTY,
            DefaultKeyEqual,
            DoubleHashProbing::new(XXHash64::new(0), XXHash64::new(42)),
            stream,
            Some(module),
        )?)
    }

    /// The scenario shared by most tests: `(i mod 10, i)` for `i in 0..100`,
    /// ten values per key.
    pub fn insert_mod10(
        map: &mut Multimap,
        stream: &Stream,
        module: &Module,
    ) -> Result<(), Box<dyn Error>> {
        let pairs: Vec<Pair<u64, u64>> = (0..100).map(|i| Pair::new(i % 10, i)).collect();
        map.insert(&pairs, stream, module)?;
        Ok(())
    }
}

mod construction {
    use super::test_helpers::*;
    use super::*;

    /// Capacity rounds up to whole probing windows (cg 8, vector width 2).
    #[test]
    fn capacity_rounds_to_windows() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let map = create_multimap(200, &stream, &module)?;
        assert!(map.capacity() >= 200);
        assert_eq!(map.capacity() % 16, 0);
        Ok(())
    }
}

mod counting {
    use super::test_helpers::*;
    use super::*;

    #[test]
    fn counts_match_multiplicities() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_multimap(200, &stream, &module)?;
        insert_mod10(&mut map, &stream, &module)?;

        let all_keys: Vec<u64> = (0..10).collect();
        assert_eq!(map.count(&all_keys, &stream, &module)?, 100);

        for k in 0..10u64 {
            assert_eq!(map.count(&[k], &stream, &module)?, 10);
        }

        assert_eq!(map.count(&[11u64], &stream, &module)?, 0);

        Ok(())
    }

    /// `count_outer(Q) = count(Q) + |{q : count({q}) = 0}|`.
    #[test]
    fn outer_count_law() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_multimap(200, &stream, &module)?;
        insert_mod10(&mut map, &stream, &module)?;

        let query = [0u64, 1, 11];
        assert_eq!(map.count(&query, &stream, &module)?, 20);
        assert_eq!(map.count_outer(&query, &stream, &module)?, 21);

        // All-miss probe set: one record per probe.
        let misses = [100u64, 101, 102];
        assert_eq!(map.count(&misses, &stream, &module)?, 0);
        assert_eq!(map.count_outer(&misses, &stream, &module)?, 3);

        Ok(())
    }

    #[test]
    fn pair_counts_match_exact_pairs() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_multimap(200, &stream, &module)?;
        insert_mod10(&mut map, &stream, &module)?;

        // (0, 0) was inserted (i = 0); (0, 5) was not (i = 5 lands on key 5).
        assert_eq!(map.pair_count(&[Pair::new(0u64, 0u64)], &stream, &module)?, 1);
        assert_eq!(map.pair_count(&[Pair::new(0u64, 5u64)], &stream, &module)?, 0);

        let probes = [Pair::new(0u64, 0u64), Pair::new(0u64, 5u64)];
        assert_eq!(map.pair_count(&probes, &stream, &module)?, 1);
        assert_eq!(map.pair_count_outer(&probes, &stream, &module)?, 2);

        Ok(())
    }
}

mod retrieval {
    use super::test_helpers::*;
    use super::*;

    #[test]
    fn retrieve_returns_every_match_grouped_by_key() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_multimap(200, &stream, &module)?;
        insert_mod10(&mut map, &stream, &module)?;

        let keys: Vec<u64> = (0..10).collect();
        let mut output = unsafe { LockedBuffer::uninitialized(128)? };
        let count = unsafe { map.retrieve(&keys, output.as_mut_slice(), &stream, &module)? };
        assert_eq!(count, 100);

        // Per key, the values form exactly {k, k + 10, ..., k + 90}.
        for k in 0..10u64 {
            let got: HashSet<u64> = output[..count]
                .iter()
                .filter(|pair| pair.first == k)
                .map(|pair| pair.second)
                .collect();
            let want: HashSet<u64> = (0..10).map(|j| k + 10 * j).collect();
            assert_eq!(got, want, "values for key {k}");
        }

        Ok(())
    }

    /// `retrieve(Q)` returns exactly `count(Q)` pairs, matched or not.
    #[test]
    fn retrieve_and_count_agree() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_multimap(200, &stream, &module)?;
        insert_mod10(&mut map, &stream, &module)?;

        let query = [0u64, 3, 7, 11, 42];
        let expected = map.count(&query, &stream, &module)?;
        let mut output = unsafe { LockedBuffer::uninitialized(128)? };
        let count = unsafe { map.retrieve(&query, output.as_mut_slice(), &stream, &module)? };
        assert_eq!(count, expected);

        let expected_outer = map.count_outer(&query, &stream, &module)?;
        let outer_count =
            unsafe { map.retrieve_outer(&query, output.as_mut_slice(), &stream, &module)? };
        assert_eq!(outer_count, expected_outer);

        Ok(())
    }

    #[test]
    fn outer_retrieve_emits_sentinel_for_misses() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_multimap(200, &stream, &module)?;
        insert_mod10(&mut map, &stream, &module)?;

        let mut output = unsafe { LockedBuffer::uninitialized(16)? };
        let count = unsafe { map.retrieve_outer(&[11u64], output.as_mut_slice(), &stream, &module)? };
        assert_eq!(count, 1);
        assert_eq!(output[0], Pair::new(11u64, EMPTY));

        Ok(())
    }

    #[test]
    fn pair_retrieve_fills_parallel_outputs() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_multimap(200, &stream, &module)?;
        insert_mod10(&mut map, &stream, &module)?;

        let probes = [Pair::new(3u64, 3u64)];
        let mut probe_out = unsafe { LockedBuffer::uninitialized(16)? };
        let mut contained_out = unsafe { LockedBuffer::uninitialized(16)? };
        let count = unsafe {
            map.pair_retrieve(
                &probes,
                probe_out.as_mut_slice(),
                contained_out.as_mut_slice(),
                &stream,
                &module,
            )?
        };
        assert_eq!(count, 1);
        assert_eq!(probe_out[0], Pair::new(3u64, 3u64));
        assert_eq!(contained_out[0], Pair::new(3u64, 3u64));

        // Outer form: a missing probe pair emits the empty slot pair.
        let probes = [Pair::new(0u64, 123u64)];
        let count = unsafe {
            map.pair_retrieve_outer(
                &probes,
                probe_out.as_mut_slice(),
                contained_out.as_mut_slice(),
                &stream,
                &module,
            )?
        };
        assert_eq!(count, 1);
        assert_eq!(probe_out[0], Pair::new(0u64, 123u64));
        assert_eq!(contained_out[0], Pair::new(EMPTY, EMPTY));

        Ok(())
    }

    /// Heavy duplication: one key with more matches than one staging buffer
    /// holds, forcing mid-probe flushes.
    #[test]
    fn retrieve_survives_buffer_overflow() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_multimap(2048, &stream, &module)?;

        let pairs: Vec<Pair<u64, u64>> = (0..500).map(|i| Pair::new(9, i)).collect();
        map.insert(&pairs, &stream, &module)?;

        assert_eq!(map.count(&[9u64], &stream, &module)?, 500);

        let mut output = unsafe { LockedBuffer::uninitialized(512)? };
        let count = unsafe { map.retrieve(&[9u64], output.as_mut_slice(), &stream, &module)? };
        assert_eq!(count, 500);

        let got: HashSet<u64> = output[..count].iter().map(|pair| pair.second).collect();
        assert_eq!(got.len(), 500);
        assert!(output[..count].iter().all(|pair| pair.first == 9));

        Ok(())
    }
}

mod membership_and_size {
    use super::test_helpers::*;
    use super::*;

    #[test]
    fn contains_reports_present_keys() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_multimap(200, &stream, &module)?;
        insert_mod10(&mut map, &stream, &module)?;

        let keys: Vec<u64> = (0..20).collect();
        let mut present = unsafe { LockedBuffer::uninitialized(20)? };
        unsafe { map.contains(&keys, present.as_mut_slice(), &stream, &module)? };
        for i in 0..20usize {
            assert_eq!(present[i], i < 10);
        }

        Ok(())
    }

    #[test]
    fn get_size_scans_occupied_slots() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_multimap(200, &stream, &module)?;

        assert_eq!(map.get_size(&stream, &module)?, 0);

        insert_mod10(&mut map, &stream, &module)?;
        assert_eq!(map.get_size(&stream, &module)?, 100);

        let lf = map.get_load_factor(&stream, &module)?;
        assert!((lf - 100.0 / map.capacity() as f32).abs() < f32::EPSILON);

        Ok(())
    }

    #[test]
    fn insert_if_gates_by_stencil() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_multimap(200, &stream, &module)?;

        let pairs: Vec<Pair<u64, u64>> = (0..100).map(|i| Pair::new(i % 10, i)).collect();
        let stencil: Vec<u64> = (0..100).map(|i| (i < 40) as u64).collect();
        map.insert_if(&pairs, &stencil, &stream, &module)?;

        assert_eq!(map.get_size(&stream, &module)?, 40);
        for k in 0..10u64 {
            assert_eq!(map.count(&[k], &stream, &module)?, 4);
        }

        Ok(())
    }

    #[test]
    fn clear_empties_the_table() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_multimap(200, &stream, &module)?;
        insert_mod10(&mut map, &stream, &module)?;

        map.clear(&stream, Some(&module))?;
        assert_eq!(map.get_size(&stream, &module)?, 0);
        assert_eq!(map.count(&[0u64], &stream, &module)?, 0);

        Ok(())
    }
}

mod boundaries {
    use super::test_helpers::*;
    use super::*;

    #[test]
    fn empty_input_ranges_are_noops() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let mut map = create_multimap(64, &stream, &module)?;

        map.insert(&[], &stream, &module)?;
        map.insert_if(&[], &[], &stream, &module)?;
        assert_eq!(map.count(&[], &stream, &module)?, 0);
        assert_eq!(map.count_outer(&[], &stream, &module)?, 0);
        assert_eq!(map.pair_count(&[], &stream, &module)?, 0);

        let mut output = unsafe { LockedBuffer::uninitialized(4)? };
        let count = unsafe { map.retrieve(&[], output.as_mut_slice(), &stream, &module)? };
        assert_eq!(count, 0);

        Ok(())
    }

    #[test]
    fn zero_capacity_is_clamped() -> Result<(), Box<dyn Error>> {
        let (_ctx, stream, module) = setup_cuda()?;
        let map = create_multimap(0, &stream, &module)?;
        assert!(map.capacity() >= 1);
        Ok(())
    }
}
