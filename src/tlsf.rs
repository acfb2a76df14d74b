//! The TLSF allocator core.
//!
//! This module implements the Two-Level Segregated Fit algorithm: a
//! constant-time segregated free-list allocator backed by memory pools
//! supplied by the caller. The vocabulary and block-splitting rules
//! follow the reference TLSF implementation (Matthew Conte, after Masmano
//! et al.); the representation (bitmap-indexed `Option<NonNull<_>>` free
//! lists, generic bitmap width, no raw pointer casts for list heads) is
//! this crate's own.
use core::{
    debug_assert, debug_assert_eq,
    hint::unreachable_unchecked,
    marker::PhantomData,
    mem::{self, MaybeUninit},
    ptr::NonNull,
};

use crate::{
    int::BinInteger,
    utils::{align_down, align_up, nonnull_slice_len},
};

#[cfg_attr(doc, svgbobdoc::transform)]
/// A TLSF control structure and the free lists it indexes.
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///   First level
///                                                                       FLLEN = 8
///                               ,-----+-----+-----+-----+-----+-----+-----+-----,
///         fl_bitmap: FLBitmap = |  0  |  0  |  0  |  1  |  0  |  0  |  0  |  0  |
///                               +-----+-----+-----+-----+-----+-----+-----+-----+
///                      min size | 2¹¹ | 2¹⁰ |  2⁹ |  2⁸ |  2⁷ |  2⁶ |  2⁵ |  2⁴ |
///                               '-----+-----+--+--+-----+-----+-----+-----+-----'
///                                                |
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Second Level                                |
///                                                v                      SLLEN = 8
///                                  ,-----+-----+-----+-----+-----+-----+-----+-----,
///        "sl_bitmap[4]: SLBitmap"= |  0  |  0  |  1  |  0  |  0  |  0  |  0  |  0  |
///                                  +-----+-----+-----+-----+-----+-----+-----+-----+
///                         blocks[4]|     |     |  O  |     |     |     |     |     |
///                                  '-----+-----+--|--+-----+-----+-----+-----+-----'
///                                                 |
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Free blocks                                   |
///                                                 |
///             ,-----------------------------------'
///             | ,---+---+-------,    ,---+---+-------,
///             '-+>O | O-+-------+----+>O |   |       |
///               +---+---'       |    +---+---'       |
///               |               |    |               |
///               '---------------'    '---------------'
/// ```
/// </center>
///
/// # Type Parameters
///
/// - `FLBitmap`, `SLBitmap` — unsigned integers wide enough to hold
///   `FLLEN` and `SLLEN` bits respectively.
/// - `FLLEN`, `SLLEN` — the number of first- and second-level buckets.
///   `SLLEN` must be a power of two.
///
/// # Properties
///
/// [`GRANULARITY`] is the allocation granularity, the minimum block size,
/// and the unit every block's recorded size is a multiple of. It is
/// `size_of::<usize>() * 4` bytes: enough for a free block's four
/// list-maintenance fields ([`FreeBlockHdr`]).
///
/// The maximum representable block size is `(GRANULARITY << FLLEN) -
/// GRANULARITY`; pools larger than that are split across several
/// sentinel-terminated chains by [`Tlsf::add_pool`].
#[derive(Debug)]
pub struct Tlsf<'pool, FLBitmap, SLBitmap, const FLLEN: usize, const SLLEN: usize> {
    fl_bitmap: FLBitmap,
    sl_bitmap: [SLBitmap; FLLEN],
    /// `blocks[fl][sl]` is the head of the free list for bucket `(fl, sl)`,
    /// or `None` if that list is empty. There is no dedicated null-sentinel
    /// node; an empty head is the `None` variant, per the data model's
    /// recommendation for memory-safe hosts.
    blocks: [[Option<NonNull<FreeBlockHdr>>; SLLEN]; FLLEN],
    _phantom: PhantomData<&'pool mut ()>,
}

// Safety: Every block header reachable from a `Tlsf` instance is logically
//         owned by that instance and has no interior mutability.
unsafe impl<FLBitmap, SLBitmap, const FLLEN: usize, const SLLEN: usize> Send
    for Tlsf<'_, FLBitmap, SLBitmap, FLLEN, SLLEN>
{
}
unsafe impl<FLBitmap, SLBitmap, const FLLEN: usize, const SLLEN: usize> Sync
    for Tlsf<'_, FLBitmap, SLBitmap, FLLEN, SLLEN>
{
}

/// The allocation granularity, minimum block size, and alignment of every
/// pointer this allocator returns.
pub const GRANULARITY: usize = mem::size_of::<usize>() * 4;

const GRANULARITY_LOG2: u32 = GRANULARITY.trailing_zeros();
const USIZE_BITS: u32 = mem::size_of::<usize>() as u32 * 8;

/// Bit 0 of [`BlockHdr::size`]: the block is free.
const SIZE_FREE: usize = 1 << 0;
/// Bit 1 of [`BlockHdr::size`]: the physically preceding block is free
/// (and therefore its `prev_phys_block` is valid).
const SIZE_PREV_FREE: usize = 1 << 1;
const SIZE_SIZE_MASK: usize = !((1 << GRANULARITY_LOG2) - 1);

/// Physical block header. Common to free and used blocks.
///
/// `size` is the size of the *whole* block, header included, always a
/// multiple of [`GRANULARITY`]. `prev_phys_block` is meaningful only when
/// `SIZE_PREV_FREE` is set; for a used predecessor, the slot simply isn't
/// read.
#[cfg_attr(target_pointer_width = "16", repr(align(4)))]
#[cfg_attr(target_pointer_width = "32", repr(align(8)))]
#[cfg_attr(target_pointer_width = "64", repr(align(16)))]
#[derive(Debug)]
struct BlockHdr {
    size: usize,
    prev_phys_block: Option<NonNull<BlockHdr>>,
}

impl BlockHdr {
    #[inline]
    fn size(&self) -> usize {
        self.size & SIZE_SIZE_MASK
    }

    #[inline]
    fn set_size(&mut self, size: usize) {
        debug_assert_eq!(size & !SIZE_SIZE_MASK, 0);
        self.size = size | (self.size & !SIZE_SIZE_MASK);
    }

    #[inline]
    fn is_free(&self) -> bool {
        (self.size & SIZE_FREE) != 0
    }

    #[inline]
    fn is_prev_free(&self) -> bool {
        (self.size & SIZE_PREV_FREE) != 0
    }

    /// A block is the pool's terminal sentinel iff its size is zero.
    #[inline]
    fn is_sentinel(&self) -> bool {
        self.size() == 0
    }

    /// Get the next physical block, or `None` if `self` is a sentinel.
    ///
    /// # Safety
    ///
    /// `self` must be a live block header belonging to a pool this
    /// structure owns.
    #[inline]
    unsafe fn next_phys_block(&self) -> Option<NonNull<BlockHdr>> {
        if self.is_sentinel() {
            None
        } else {
            Some(NonNull::new_unchecked(
                (self as *const _ as *mut u8).add(self.size()) as *mut BlockHdr,
            ))
        }
    }
}

/// The header of a free memory block. `GRANULARITY` bytes long.
#[repr(C)]
#[cfg_attr(target_pointer_width = "16", repr(align(8)))]
#[cfg_attr(target_pointer_width = "32", repr(align(16)))]
#[cfg_attr(target_pointer_width = "64", repr(align(32)))]
#[derive(Debug)]
struct FreeBlockHdr {
    common: BlockHdr,
    next_free: Option<NonNull<FreeBlockHdr>>,
    prev_free: Option<NonNull<FreeBlockHdr>>,
}

/// The header of a used memory block. `GRANULARITY / 2` bytes long; the
/// payload immediately follows.
#[repr(C)]
#[derive(Debug)]
struct UsedBlockHdr {
    common: BlockHdr,
}

const HEADER_OVERHEAD: usize = mem::size_of::<UsedBlockHdr>();

/// The smallest total block size a pool can contain (a free block's full
/// four-field header).
const BLOCK_SIZE_MIN: usize = GRANULARITY;

impl<FLBitmap: BinInteger, SLBitmap: BinInteger, const FLLEN: usize, const SLLEN: usize> Default
    for Tlsf<'_, FLBitmap, SLBitmap, FLLEN, SLLEN>
{
    fn default() -> Self {
        Self::INIT
    }
}

impl<FLBitmap: BinInteger, SLBitmap: BinInteger, const FLLEN: usize, const SLLEN: usize> crate::Init
    for Tlsf<'_, FLBitmap, SLBitmap, FLLEN, SLLEN>
{
    const INIT: Self = Self::INIT;
}

impl<'pool, FLBitmap: BinInteger, SLBitmap: BinInteger, const FLLEN: usize, const SLLEN: usize>
    Tlsf<'pool, FLBitmap, SLBitmap, FLLEN, SLLEN>
{
    /// An empty control structure: no pools installed, every free list
    /// empty. This is the moral equivalent of `tlsf_create`; in Rust, the
    /// control structure is an ordinary value, so "installing it at a
    /// caller-given address" is simply placing this value wherever the
    /// caller likes (a `static`, a `Box`, a stack slot).
    pub const INIT: Self = Self {
        fl_bitmap: FLBitmap::ZERO,
        sl_bitmap: [SLBitmap::ZERO; FLLEN],
        blocks: [[None; SLLEN]; FLLEN],
        _phantom: {
            let () = Self::VALID;
            PhantomData
        },
    };

    const VALID: () = {
        if FLLEN == 0 {
            panic!("`FLLEN` must not be zero");
        }
        if SLLEN == 0 {
            panic!("`SLLEN` must not be zero");
        }
        if (FLBitmap::BITS as u128) < FLLEN as u128 {
            panic!("`FLBitmap` must contain at least `FLLEN` bits");
        }
        if (SLBitmap::BITS as u128) < SLLEN as u128 {
            panic!("`SLBitmap` must contain at least `SLLEN` bits");
        }
        if !SLLEN.is_power_of_two() {
            panic!("`SLLEN` must be a power of two");
        }
    };

    /// `log2(SLLEN)`.
    const SLI: u32 = SLLEN.trailing_zeros();

    /// The largest whole-block size representable by this instance's
    /// bucket matrix, or `None` if it would overflow `usize`.
    const MAX_BLOCK_SIZE: Option<usize> = {
        let shift = GRANULARITY_LOG2 + FLLEN as u32;
        if shift < USIZE_BITS {
            Some((1 << shift) - GRANULARITY)
        } else if shift == USIZE_BITS {
            Some(0usize.wrapping_sub(GRANULARITY))
        } else {
            None
        }
    };

    /// The smallest total block size a pool can be initialized with.
    pub const BLOCK_SIZE_MIN: usize = BLOCK_SIZE_MIN;

    /// Map a known block size to the `(fl, sl)` bucket it is stored at.
    /// Used when inserting or removing a free block of a size that is
    /// already known to be representable.
    #[inline]
    fn mapping_insert(size: usize) -> Option<(usize, usize)> {
        debug_assert!(size >= GRANULARITY);
        debug_assert_eq!(size % GRANULARITY, 0);
        let fl = USIZE_BITS - GRANULARITY_LOG2 - 1 - size.leading_zeros();

        let sl = if GRANULARITY_LOG2 < Self::SLI && fl < Self::SLI - GRANULARITY_LOG2 {
            size << ((Self::SLI - GRANULARITY_LOG2) - fl)
        } else {
            let sl = size >> (fl + GRANULARITY_LOG2 - Self::SLI);
            debug_assert_eq!(sl >> Self::SLI, 1);
            sl
        };

        if fl as usize >= FLLEN {
            return None;
        }
        Some((fl as usize, sl & (SLLEN - 1)))
    }

    /// Map a requested size to the first bucket guaranteed to contain only
    /// blocks at least as large as the request: round `size` up to the
    /// bucket boundary before mapping (§ search mapping).
    #[inline]
    fn mapping_search(size: usize) -> Option<(usize, usize)> {
        let size = if size >= (1 << Self::SLI) {
            let fls = USIZE_BITS - 1 - size.leading_zeros();
            let round = (1usize << (fls - Self::SLI)).wrapping_sub(1);
            size.checked_add(round)?
        } else {
            size
        };
        Self::mapping_insert(size)
    }

    /// Locate a non-empty free list whose blocks are all `>= min_size`.
    /// Implements § locate-free.
    #[inline]
    fn search_suitable_free_list(&self, min_size: usize) -> Option<(usize, usize)> {
        let (mut fl, mut sl) = Self::mapping_search(min_size)?;

        // Search within the same first-level bucket for a populated
        // second-level list at `>= sl`.
        let sl_scan = self.sl_bitmap[fl].bit_scan_forward(sl as u32);
        if sl_scan < SLBitmap::BITS {
            return Some((fl, sl_scan as usize));
        }

        // Nothing big enough at this first-level index; move up.
        let fl_scan = self.fl_bitmap.bit_scan_forward(fl as u32 + 1);
        if (fl_scan as usize) < FLLEN {
            fl = fl_scan as usize;
            sl = self.sl_bitmap[fl].trailing_zeros() as usize;
            if sl >= SLLEN {
                debug_assert!(false, "fl_bitmap claims a non-empty list with no sl set");
                unsafe { unreachable_unchecked() };
            }
            Some((fl, sl))
        } else {
            None
        }
    }

    /// Insert `block` (of the given whole-block `size`) at the head of its
    /// bucket's free list, updating both bitmaps.
    ///
    /// # Safety
    ///
    /// `block` must be owned by `self`, marked free, and not already
    /// present in any free list.
    #[inline]
    unsafe fn link_free_block(&mut self, mut block: NonNull<FreeBlockHdr>, size: usize) {
        let (fl, sl) = Self::mapping_insert(size).unwrap_or_else(|| unreachable_unchecked());
        let head = &mut self.blocks[fl][sl];
        let old_head = mem::replace(head, Some(block));
        block.as_mut().next_free = old_head;
        block.as_mut().prev_free = None;
        if let Some(mut old_head) = old_head {
            old_head.as_mut().prev_free = Some(block);
        }

        self.fl_bitmap.set_bit(fl as u32);
        self.sl_bitmap[fl].set_bit(sl as u32);
    }

    /// Remove `block` (of the given whole-block `size`) from its bucket's
    /// free list.
    ///
    /// # Safety
    ///
    /// `block` must currently be linked into the free list for `size`'s
    /// bucket.
    #[inline]
    unsafe fn unlink_free_block(&mut self, mut block: NonNull<FreeBlockHdr>, size: usize) {
        let next_free = block.as_mut().next_free;
        let prev_free = block.as_mut().prev_free;

        if let Some(mut next_free) = next_free {
            next_free.as_mut().prev_free = prev_free;
        }

        if let Some(mut prev_free) = prev_free {
            prev_free.as_mut().next_free = next_free;
        } else {
            let (fl, sl) = Self::mapping_insert(size).unwrap_or_else(|| unreachable_unchecked());
            debug_assert_eq!(self.blocks[fl][sl], Some(block));
            self.blocks[fl][sl] = next_free;

            if next_free.is_none() {
                self.sl_bitmap[fl].clear_bit(sl as u32);
                if self.sl_bitmap[fl] == SLBitmap::ZERO {
                    self.fl_bitmap.clear_bit(fl as u32);
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Block operations: split / absorb / merge / trim. These are the
    // only mutators of physical block topology.
    // ---------------------------------------------------------------

    /// Whether `block` (whole size `cur_size`) is big enough to be carved
    /// into a leading piece of `new_size` plus a remainder `>=
    /// BLOCK_SIZE_MIN`.
    #[inline]
    fn can_split(cur_size: usize, new_size: usize) -> bool {
        cur_size >= new_size + BLOCK_SIZE_MIN
    }

    /// Split `block` into a leading sub-block of whole size `new_size` and
    /// a trailing free remainder. Flags of `block` are preserved; the
    /// remainder is marked free and its own successor's `prev_phys_block`
    /// is patched. The remainder is not yet linked into a free list.
    ///
    /// # Safety
    ///
    /// `block`'s current whole size must satisfy
    /// `can_split(current_size, new_size)`.
    #[inline]
    unsafe fn split(
        &mut self,
        mut block: NonNull<BlockHdr>,
        new_size: usize,
    ) -> NonNull<FreeBlockHdr> {
        let old_size = block.as_ref().size();
        let remainder_size = old_size - new_size;
        debug_assert!(remainder_size >= BLOCK_SIZE_MIN);

        // The remainder's predecessor is `block` itself, whose free-ness
        // is unchanged by this split.
        let leading_is_free = block.as_ref().is_free();

        let mut remainder: NonNull<FreeBlockHdr> =
            NonNull::new_unchecked((block.as_ptr() as *mut u8).add(new_size) as *mut FreeBlockHdr);
        remainder.as_mut().common = BlockHdr {
            size: remainder_size | SIZE_FREE | if leading_is_free { SIZE_PREV_FREE } else { 0 },
            prev_phys_block: Some(block),
        };

        block.as_mut().set_size(new_size);

        // `remainder` is always free, so whatever follows it must have
        // its `PREV_FREE` bit set and point back at `remainder`.
        if let Some(mut next) = remainder.as_ref().common.next_phys_block() {
            next.as_mut().prev_phys_block = Some(remainder.cast());
            next.as_mut().size |= SIZE_PREV_FREE;
        }

        remainder
    }

    /// Extend `prev` to absorb the immediately following block `block`,
    /// which must not be the sentinel. `prev`'s flags are preserved; the
    /// block after `block` has its `prev_phys_block` repointed at `prev`.
    #[inline]
    unsafe fn absorb(&mut self, mut prev: NonNull<BlockHdr>, block: NonNull<BlockHdr>) {
        debug_assert!(!prev.as_ref().is_sentinel());
        let combined = prev.as_ref().size() + block.as_ref().size();
        prev.as_mut().set_size(combined);
        if let Some(mut next) = prev.as_ref().next_phys_block() {
            next.as_mut().prev_phys_block = Some(prev);
        }
    }

    /// If the block physically preceding `block` is free, unlink it and
    /// absorb `block` into it. Returns the (possibly new) block.
    #[inline]
    unsafe fn merge_prev(&mut self, block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
        if block.as_ref().is_prev_free() {
            let prev = block.as_ref().prev_phys_block.unwrap_or_else(|| unreachable_unchecked());
            debug_assert!(prev.as_ref().is_free());
            self.unlink_free_block(prev.cast(), prev.as_ref().size());
            self.absorb(prev, block);
            prev
        } else {
            block
        }
    }

    /// If the block physically following `block` is free, unlink it and
    /// absorb it into `block`. Returns `block`.
    #[inline]
    unsafe fn merge_next(&mut self, block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
        let next = block
            .as_ref()
            .next_phys_block()
            .unwrap_or_else(|| unreachable_unchecked());
        if next.as_ref().is_free() {
            self.unlink_free_block(next.cast(), next.as_ref().size());
            self.absorb(block, next);
        }
        block
    }

    /// Trim trailing free space off a free block down to `new_size`,
    /// returning the (now smaller) remainder to the free index.
    #[inline]
    unsafe fn trim_trailing_free(&mut self, block: NonNull<BlockHdr>, new_size: usize) {
        debug_assert!(block.as_ref().is_free());
        if Self::can_split(block.as_ref().size(), new_size) {
            let remainder = self.split(block, new_size);
            self.link_free_block(remainder, remainder.as_ref().common.size());
        }
    }

    /// Trim trailing free space off a used block down to `new_size`,
    /// coalescing the remainder with its successor before returning it to
    /// the free index.
    #[inline]
    unsafe fn trim_trailing_used(&mut self, block: NonNull<BlockHdr>, new_size: usize) {
        debug_assert!(!block.as_ref().is_free());
        if Self::can_split(block.as_ref().size(), new_size) {
            let remainder = self.split(block, new_size);
            let remainder = self.merge_next(remainder.cast());
            self.link_free_block(remainder.cast(), remainder.as_ref().size());
        }
    }

    /// Split a leading `gap`-byte free prefix off `block` and return it to
    /// the free index, returning the tail block that retains `block`'s
    /// original flags.
    #[inline]
    unsafe fn trim_leading_free(
        &mut self,
        block: NonNull<FreeBlockHdr>,
        gap: usize,
    ) -> NonNull<BlockHdr> {
        debug_assert!(gap >= BLOCK_SIZE_MIN);
        debug_assert!(block.as_ref().common.is_free());
        // `block` becomes the leading `gap`-sized piece; `split` returns
        // the trailing remainder, which inherits `block`'s free-ness
        // (free) and is what the caller goes on to use.
        let tail = self.split(block.cast(), gap);
        self.link_free_block(block, gap);
        tail.cast()
    }

    // ---------------------------------------------------------------
    // Pool lifecycle
    // ---------------------------------------------------------------

    /// Attach a new memory pool. Returns `false` if `pool`'s address is
    /// not aligned to [`GRANULARITY`] or its usable size would fall
    /// outside `[BLOCK_SIZE_MIN, MAX_BLOCK_SIZE]`.
    ///
    /// # Safety
    ///
    /// The memory block will be considered owned by `self` from now on.
    /// It must outlive `self`.
    pub unsafe fn add_pool_ptr(&mut self, pool: NonNull<[u8]>) -> bool {
        let len = nonnull_slice_len(pool);
        let start = pool.as_ptr() as *mut u8 as usize;

        if start % GRANULARITY != 0 {
            return false;
        }

        // Unlike the reference C implementation, a block header here never
        // overlaps a neighboring block's storage, so the sentinel is the
        // only overhead this pool needs to reserve: the leading free
        // block's own header is already accounted for by its `size`.
        let usable = if let Some(x) = len.checked_sub(HEADER_OVERHEAD) {
            align_down(x, GRANULARITY)
        } else {
            return false;
        };

        let max = Self::MAX_BLOCK_SIZE.unwrap_or(usize::MAX);
        if usable < BLOCK_SIZE_MIN || usable > max {
            return false;
        }

        let mut block: NonNull<FreeBlockHdr> = NonNull::new_unchecked(start as *mut FreeBlockHdr);
        block.as_mut().common = BlockHdr {
            size: usable | SIZE_FREE,
            prev_phys_block: None,
        };
        self.link_free_block(block, usable);

        // Install the zero-size sentinel immediately after, marked used
        // with PREV_FREE set.
        let mut sentinel: NonNull<BlockHdr> = block
            .as_ref()
            .common
            .next_phys_block()
            .unwrap_or_else(|| unreachable_unchecked());
        sentinel.as_mut().size = SIZE_PREV_FREE;
        sentinel.as_mut().prev_phys_block = Some(block.cast());

        true
    }

    /// Attach a new memory pool given as a slice.
    #[inline]
    pub fn add_pool(&mut self, pool: &'pool mut [MaybeUninit<u8>]) -> bool {
        // Safety: `pool` is a mutable reference, so there's no aliasing,
        // and being `'pool` it outlives `self`.
        unsafe { self.add_pool_ptr(NonNull::new(pool as *mut [_] as _).unwrap()) }
    }

    /// Construct an allocator with `pool` already attached: `Self::INIT`
    /// plus [`Self::add_pool`] in one step.
    ///
    /// This is the moral equivalent of the reference's
    /// `create_with_pool(mem, bytes)`, which carves a control structure out
    /// of the front of a single buffer and adds the remainder as the pool.
    /// In Rust the control structure is an ordinary value rather than
    /// something that has to be co-located with pool storage, so this
    /// constructor hands the *entire* buffer to `add_pool` — none of it is
    /// reserved for `self`.
    #[inline]
    pub fn new_with_pool(pool: &'pool mut [MaybeUninit<u8>]) -> Self {
        let mut this = Self::INIT;
        this.add_pool(pool);
        this
    }

    // ---------------------------------------------------------------
    // Allocation API
    // ---------------------------------------------------------------

    /// Round a requested payload size up to a whole block size in
    /// `[BLOCK_SIZE_MIN, MAX_BLOCK_SIZE)`, or return `None` if the
    /// request is zero or too large to ever succeed.
    #[inline]
    fn adjust_request_size(size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let max = Self::MAX_BLOCK_SIZE?;
        let with_header = size.checked_add(HEADER_OVERHEAD)?;
        let aligned = align_up(with_header, GRANULARITY);
        if aligned > max {
            return None;
        }
        Some(aligned.max(BLOCK_SIZE_MIN))
    }

    /// Locate a free block of at least `size` bytes (whole size) and
    /// remove it from its free list. Implements § locate-free plus
    /// removal.
    #[inline]
    unsafe fn locate_free(&mut self, size: usize) -> Option<NonNull<FreeBlockHdr>> {
        let (fl, sl) = self.search_suitable_free_list(size)?;
        let block = self.blocks[fl][sl].unwrap_or_else(|| unreachable_unchecked());
        debug_assert!(block.as_ref().common.size() >= size);
        self.unlink_free_block(block, block.as_ref().common.size());
        Some(block)
    }

    /// Trim a located free block down to `size` and mark it used,
    /// returning the user pointer.
    #[inline]
    unsafe fn prepare_used(&mut self, block: NonNull<FreeBlockHdr>, size: usize) -> NonNull<u8> {
        self.trim_trailing_free(block.cast(), size);

        let mut block = block.cast::<UsedBlockHdr>();
        block.as_mut().common.size &= !SIZE_FREE;
        if let Some(mut next) = block.as_ref().common.next_phys_block() {
            next.as_mut().size &= !SIZE_PREV_FREE;
        }

        NonNull::new_unchecked((block.as_ptr() as *mut u8).add(HEADER_OVERHEAD))
    }

    /// Allocate `size` bytes, aligned to [`GRANULARITY`].
    ///
    /// Returns `None` if `size` is zero, `size` cannot be satisfied by any
    /// registered pool, or `size` exceeds the representable maximum.
    ///
    /// # Time Complexity
    ///
    /// Constant.
    pub fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let adjust = Self::adjust_request_size(size)?;
        unsafe {
            let block = self.locate_free(adjust)?;
            Some(self.prepare_used(block, adjust))
        }
    }

    /// Allocate `size` bytes aligned to `align`, a power of two.
    ///
    /// When `align <= GRANULARITY` this defers to [`Self::malloc`].
    /// Otherwise, a free block large enough to contain the request plus a
    /// worst-case alignment gap is located, and any unused leading gap is
    /// released back to the pool as its own free block.
    pub fn memalign(&mut self, align: usize, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());

        if align <= GRANULARITY {
            return self.malloc(size);
        }

        let adjust = Self::adjust_request_size(size)?;

        // Room for a worst-case alignment gap, plus one extra minimum
        // block so a too-small gap can still be trimmed and released.
        let gap_minimum = BLOCK_SIZE_MIN;
        let size_with_gap = align_up(
            adjust.checked_add(align)?.checked_add(gap_minimum)?,
            align,
        );

        unsafe {
            let mut block = self.locate_free(size_with_gap)?;

            let ptr = (block.as_ptr() as *mut u8).add(HEADER_OVERHEAD);
            let aligned = align_up(ptr as usize, align) as *mut u8;
            let mut gap = aligned as usize - ptr as usize;

            if gap != 0 && gap < gap_minimum {
                let offset = (gap_minimum - gap).max(align);
                let next_aligned = align_up(aligned as usize + offset, align);
                gap = next_aligned - ptr as usize;
            }

            if gap > 0 {
                debug_assert!(gap >= gap_minimum);
                let tail = self.trim_leading_free(block, gap);
                block = tail.cast();
            }

            Some(self.prepare_used(block, adjust))
        }
    }

    /// Recover the [`UsedBlockHdr`] for a pointer returned by
    /// [`Self::malloc`]/[`Self::memalign`]/[`Self::realloc`].
    #[inline]
    unsafe fn used_block_for_ptr(ptr: NonNull<u8>) -> NonNull<UsedBlockHdr> {
        NonNull::new_unchecked(ptr.as_ptr().sub(HEADER_OVERHEAD)).cast()
    }

    /// Free a previously allocated block. `ptr = None` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr`, if present, must denote a live allocation made by `self`
    /// that has not already been freed.
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
        let ptr = if let Some(ptr) = ptr {
            ptr
        } else {
            return;
        };

        let block = Self::used_block_for_ptr(ptr).cast::<BlockHdr>();
        debug_assert!(!block.as_ref().is_free());

        let mut next = block.as_ref().next_phys_block().unwrap_or_else(|| unreachable_unchecked());
        next.as_mut().size |= SIZE_PREV_FREE;
        let mut block = block;
        block.as_mut().size |= SIZE_FREE;

        let block = self.merge_prev(block);
        let block = self.merge_next(block);
        self.link_free_block(block.cast(), block.as_ref().size());
    }

    /// Get the payload size (excluding header overhead) of the allocation
    /// at `ptr`. Debug-only.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live allocation made by `self`.
    pub unsafe fn block_size(&self, ptr: NonNull<u8>) -> usize {
        let block = Self::used_block_for_ptr(ptr);
        block.as_ref().common.size() - HEADER_OVERHEAD
    }

    /// Walk every block of a pool in address order, invoking
    /// `visitor(user_ptr, payload_size, is_used)` for each. Debug-only.
    ///
    /// `pool` must be the same address previously passed to
    /// [`Self::add_pool`]/[`Self::add_pool_ptr`] (i.e. the pool's first
    /// byte, not an allocation within it), since this structure does not
    /// retain a registry of installed pools (see the "default pool" design
    /// note). Unlike an arbitrary live allocation, the pool's start address
    /// cannot be recovered by walking `prev_phys_block` backward: that link
    /// is only valid when the preceding block is free, so an arbitrary
    /// anchor pointer preceded by one or more *used* blocks would silently
    /// truncate the walk. Requiring the true pool base sidesteps that
    /// entirely.
    ///
    /// # Safety
    ///
    /// `pool` must be the base address of a pool owned by `self`.
    pub unsafe fn walk_pool(pool: NonNull<u8>, mut visitor: impl FnMut(NonNull<u8>, usize, bool)) {
        let mut block: NonNull<BlockHdr> = pool.cast();

        loop {
            let ptr = NonNull::new_unchecked((block.as_ptr() as *mut u8).add(HEADER_OVERHEAD));
            let used = !block.as_ref().is_free();
            visitor(ptr, block.as_ref().size() - HEADER_OVERHEAD, used);
            match block.as_ref().next_phys_block() {
                Some(next) => block = next,
                None => break,
            }
        }
    }

    /// Shrink or grow a previously allocated block.
    ///
    /// `ptr = None` behaves like [`Self::malloc`]; `size = 0` behaves like
    /// [`Self::free`] and returns `None`. Otherwise, returns the new
    /// location of the data (which may equal `ptr`) on success, or `None`
    /// if no larger block could be found — in which case the original
    /// allocation is untouched.
    ///
    /// # Time Complexity
    ///
    /// Constant for in-place growth/shrinkage; the copying path is linear
    /// in the minimum of the old and new sizes.
    ///
    /// # Safety
    ///
    /// `ptr`, if present, must denote a live allocation made by `self`.
    pub unsafe fn realloc(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let ptr = match ptr {
            None => return self.malloc(size),
            Some(ptr) if size == 0 => {
                self.free(Some(ptr));
                return None;
            }
            Some(ptr) => ptr,
        };

        let block = Self::used_block_for_ptr(ptr).cast::<BlockHdr>();
        debug_assert!(!block.as_ref().is_free());

        let cur = block.as_ref().size();
        let next = block.as_ref().next_phys_block().unwrap_or_else(|| unreachable_unchecked());
        let next_size = next.as_ref().size();
        let next_is_free = next.as_ref().is_free();
        let combined = cur + if next_is_free { next_size } else { 0 };

        let adjust = match Self::adjust_request_size(size) {
            Some(x) => x,
            None => return None,
        };

        if adjust > cur && (!next_is_free || adjust > combined) {
            // Cannot grow in place: allocate fresh, copy, free the old
            // block. If the new allocation fails, the caller's pointer
            // remains valid.
            let new_ptr = self.malloc(size)?;
            let old_payload = cur - HEADER_OVERHEAD;
            core::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                new_ptr.as_ptr(),
                old_payload.min(size),
            );
            self.free(Some(ptr));
            Some(new_ptr)
        } else {
            if adjust > cur {
                let block = self.merge_next(block);
                let mut used = block.cast::<UsedBlockHdr>();
                used.as_mut().common.size &= !SIZE_FREE;
                if let Some(mut n) = used.as_ref().common.next_phys_block() {
                    n.as_mut().size &= !SIZE_PREV_FREE;
                }
                self.trim_trailing_used(used.cast(), adjust);
            } else {
                self.trim_trailing_used(block, adjust);
            }
            Some(ptr)
        }
    }
}

#[cfg(test)]
mod tests;
