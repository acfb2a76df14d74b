extern crate std;

use quickcheck_macros::quickcheck;
use std::{collections::BTreeMap, mem::MaybeUninit, ops::Range, prelude::v1::*};

use super::*;

/// Tracks the ground truth of every byte in a pool as the allocator under
/// test is driven through a random sequence of operations, so its claims
/// about freed/used ranges can be checked against the allocator's.
struct ShadowAllocator {
    regions: BTreeMap<usize, SaRegion>,
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
enum SaRegion {
    Free,
    Used,
    Invalid,
}

impl ShadowAllocator {
    fn new() -> Self {
        Self {
            regions: Some((0, SaRegion::Invalid)).into_iter().collect(),
        }
    }

    fn convert_range(&mut self, range: Range<usize>, old_region: SaRegion, new_region: SaRegion) {
        if range.is_empty() {
            return;
        }
        assert_ne!(old_region, new_region);

        let (&addr, &region) = self.regions.range(0..range.end).next_back().unwrap();
        assert!(addr <= range.start, "discontinuity in range {:?}", range);
        assert_eq!(
            region, old_region,
            "range {:?} is {:?} (expected {:?})",
            range, region, old_region
        );

        if addr == range.start {
            *self.regions.get_mut(&addr).unwrap() = new_region;
        } else {
            self.regions.insert(range.start, new_region);
        }

        if let Some((_, &region)) = self.regions.range(0..range.start).next_back() {
            if region == new_region {
                self.regions.remove(&range.start);
            }
        }

        if let Some(&end_region) = self.regions.get(&range.end) {
            if end_region == new_region {
                self.regions.remove(&range.end);
            }
        } else {
            self.regions.insert(range.end, old_region);
        }
    }

    fn add_pool(&mut self, pool: &[MaybeUninit<u8>]) {
        let start = pool.as_ptr() as usize;
        self.convert_range(start..start + pool.len(), SaRegion::Invalid, SaRegion::Free);
    }

    fn allocate(&mut self, start: NonNull<u8>, size: usize, align: usize) {
        let start = start.as_ptr() as usize;
        assert_eq!(start % align, 0, "0x{:x} is not {}-byte aligned", start, align);
        self.convert_range(start..start + size, SaRegion::Free, SaRegion::Used);
    }

    fn deallocate(&mut self, start: NonNull<u8>, size: usize) {
        let start = start.as_ptr() as usize;
        self.convert_range(start..start + size, SaRegion::Used, SaRegion::Free);
    }
}

#[repr(align(64))]
struct AlignedPool<T>(T);

macro_rules! gen_test {
    ($mod:ident, $($tt:tt)*) => {
        mod $mod {
            use super::*;
            type TheTlsf<'a> = Tlsf<'a, $($tt)*>;

            #[test]
            fn empty_pool_rejects_any_allocation() {
                let _ = env_logger::builder().is_test(true).try_init();

                let mut tlsf: TheTlsf = Tlsf::INIT;
                let mut pool = AlignedPool([MaybeUninit::uninit(); 4096]);
                assert!(tlsf.add_pool(&mut pool.0));
                assert!(tlsf.malloc(usize::MAX / 2).is_none());
            }

            #[test]
            fn single_allocation_round_trips() {
                let _ = env_logger::builder().is_test(true).try_init();

                let mut tlsf: TheTlsf = Tlsf::INIT;
                let mut pool = AlignedPool([MaybeUninit::uninit(); 4096]);
                assert!(tlsf.add_pool(&mut pool.0));

                let p = tlsf.malloc(64).expect("allocation should succeed");
                log::trace!("p = {:?}", p);
                assert_eq!(p.as_ptr() as usize % GRANULARITY, 0);
                unsafe {
                    assert!(tlsf.block_size(p) >= 64);
                    tlsf.free(Some(p));
                }
            }

            #[test]
            fn zero_size_request_fails() {
                let _ = env_logger::builder().is_test(true).try_init();

                let mut tlsf: TheTlsf = Tlsf::INIT;
                let mut pool = AlignedPool([MaybeUninit::uninit(); 4096]);
                assert!(tlsf.add_pool(&mut pool.0));
                assert!(tlsf.malloc(0).is_none());
            }

            #[quickcheck]
            fn random(pool_start: usize, pool_size: usize, bytecode: Vec<u8>) {
                random_inner(pool_start, pool_size, bytecode);
            }

            fn random_inner(pool_start: usize, pool_size: usize, bytecode: Vec<u8>) -> Option<()> {
                let _ = env_logger::builder().is_test(true).try_init();

                let mut sa = ShadowAllocator::new();
                let mut tlsf: TheTlsf = Tlsf::INIT;

                let mut pool = AlignedPool([MaybeUninit::uninit(); 65536]);
                let pool_start = pool_start % 64;
                let pool_size = pool_size % (pool.0.len() - 63);
                let pool = &mut pool.0[pool_start..pool_start + pool_size];
                log::trace!("pool = {:p}: [u8; {}]", pool, pool.len());

                sa.add_pool(pool);
                if !tlsf.add_pool(pool) {
                    return None;
                }

                #[derive(Debug)]
                struct Alloc {
                    ptr: NonNull<u8>,
                    size: usize,
                    align: usize,
                }
                let mut allocs: Vec<Alloc> = Vec::new();

                let mut it = bytecode.iter().cloned();
                loop {
                    match it.next()? % 2 {
                        0 => {
                            let len = u32::from_le_bytes([it.next()?, it.next()?, it.next()?, 0]);
                            let len = ((len as u64 * pool_size as u64) >> 24) as usize;
                            let align = 1usize << (it.next()? % 6);

                            let ptr = if align <= GRANULARITY {
                                tlsf.malloc(len)
                            } else {
                                tlsf.memalign(align, len)
                            };
                            log::trace!("alloc(len={}, align={}) -> {:?}", len, align, ptr);

                            if let Some(ptr) = ptr {
                                sa.allocate(ptr, len.max(1), align);
                                allocs.push(Alloc { ptr, size: len.max(1), align });
                            }
                        }
                        1 => {
                            let alloc_i = it.next()?;
                            if !allocs.is_empty() {
                                let alloc = allocs.swap_remove(alloc_i as usize % allocs.len());
                                log::trace!("dealloc {:?}", alloc);
                                sa.deallocate(alloc.ptr, alloc.size);
                                unsafe { tlsf.free(Some(alloc.ptr)) };
                            }
                        }
                        _ => unreachable!(),
                    }
                }
            }
        }
    };
}

gen_test!(tlsf_u8_u8_4_4, u8, u8, 4, 4);
gen_test!(tlsf_u8_u8_8_8, u8, u8, 8, 8);
gen_test!(tlsf_u16_u8_11_4, u16, u8, 11, 4);
gen_test!(tlsf_u16_u16_11_16, u16, u16, 11, 16);
gen_test!(tlsf_u32_u32_20_32, u32, u32, 20, 32);

/// Focused, deterministic scenarios beyond what random fuzzing reliably
/// stumbles into: coalescing, in-place growth, and alignment-gap release.
mod scenarios {
    use super::*;

    type TheTlsf<'a> = Tlsf<'a, u16, u16, 16, 16>;

    fn new_pool() -> TheTlsf<'static> {
        new_pool_with_base().0
    }

    /// Like `new_pool`, but also returns the pool's base address, as needed
    /// by [`Tlsf::walk_pool`] (which takes the same address [`Tlsf::add_pool`]
    /// was given, not an arbitrary pointer into the pool).
    fn new_pool_with_base() -> (TheTlsf<'static>, NonNull<u8>) {
        let boxed: &'static mut [MaybeUninit<u8>; 1 << 16] =
            Box::leak(Box::new([MaybeUninit::uninit(); 1 << 16]));
        let base = NonNull::new(boxed.as_mut_ptr() as *mut u8).unwrap();
        let mut tlsf = TheTlsf::INIT;
        assert!(tlsf.add_pool(&mut boxed[..]));
        (tlsf, base)
    }

    #[test]
    fn freeing_adjacent_blocks_coalesces() {
        let mut tlsf = new_pool();
        let a = tlsf.malloc(256).unwrap();
        let b = tlsf.malloc(256).unwrap();
        let c = tlsf.malloc(256).unwrap();

        unsafe {
            tlsf.free(Some(b));
            tlsf.free(Some(a));
        }

        // `a` and `b` should have merged into one free block large enough
        // for a request that neither could have satisfied alone.
        let big = tlsf.malloc(480).expect("coalesced free space should satisfy a larger request");
        unsafe {
            tlsf.free(Some(big));
            tlsf.free(Some(c));
        }
    }

    #[test]
    fn realloc_grows_in_place_into_following_free_space() {
        let mut tlsf = new_pool();
        let a = tlsf.malloc(128).unwrap();
        let b = tlsf.malloc(128).unwrap();
        unsafe {
            tlsf.free(Some(b));
            let grown = tlsf.realloc(Some(a), 192).expect("growth should succeed in place");
            assert_eq!(grown, a, "growing into trailing free space must not move the block");
            tlsf.free(Some(grown));
        }
    }

    #[test]
    fn realloc_to_zero_frees_and_returns_none() {
        let mut tlsf = new_pool();
        let a = tlsf.malloc(64).unwrap();
        unsafe {
            assert!(tlsf.realloc(Some(a), 0).is_none());
        }
        // The space must have been returned to the pool.
        let _b = tlsf.malloc(64).expect("freed space should be reusable");
    }

    #[test]
    fn memalign_releases_leading_gap() {
        let mut tlsf = new_pool();
        // Force a large alignment, guaranteeing a gap will usually need
        // trimming ahead of the aligned pointer.
        let p = tlsf.memalign(4096, 37).expect("large-alignment allocation should succeed");
        assert_eq!(p.as_ptr() as usize % 4096, 0);

        // The gap should be usable by a subsequent small allocation.
        let q = tlsf.malloc(64);
        assert!(q.is_some(), "leading alignment gap should have been returned to the pool");

        unsafe {
            tlsf.free(Some(p));
            if let Some(q) = q {
                tlsf.free(Some(q));
            }
        }
    }

    #[test]
    fn walk_pool_visits_every_block_regardless_of_used_predecessors() {
        let (mut tlsf, base) = new_pool_with_base();

        // Chain is [a: used][b: used][c: free after d's allocation][...].
        // A backward walk that stops at the first used predecessor would,
        // anchored anywhere past `a`, never reach `a` at all.
        let a = tlsf.malloc(128).unwrap();
        let b = tlsf.malloc(128).unwrap();
        let c = tlsf.malloc(128).unwrap();
        unsafe {
            tlsf.free(Some(c));
        }

        let mut visited = Vec::new();
        unsafe {
            TheTlsf::walk_pool(base, |ptr, _size, used| {
                visited.push((ptr, used));
            });
        }

        assert!(
            visited.iter().any(|&(p, used)| p == a && used),
            "block `a` was not visited as used"
        );
        assert!(
            visited.iter().any(|&(p, used)| p == b && used),
            "block `b` was not visited as used"
        );
        assert!(
            visited.iter().any(|&(p, used)| p == c && !used),
            "freed block `c` was not visited as free"
        );
    }

    #[test]
    fn out_of_memory_leaves_existing_allocations_intact() {
        let mut tlsf = new_pool();
        let a = tlsf.malloc(1024).unwrap();
        assert!(tlsf.malloc(usize::MAX / 2).is_none());
        // `a`'s contents and bookkeeping must be untouched by the failed request.
        unsafe {
            assert!(tlsf.block_size(a) >= 1024);
            tlsf.free(Some(a));
        }
    }
}
