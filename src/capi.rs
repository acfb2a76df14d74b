//! A thin C-ABI wrapper layer over [`Tlsf`], mirroring the reference
//! `tlsf-malloc.c`/`.h` pair: a name-prefixed `{malloc, calloc, memalign,
//! realloc, free}` surface, each entry serialized by a caller-supplied
//! critical section.
//!
//! This module does not pick an interrupt-masking mechanism for you — there
//! is no portable one. Implement [`CriticalSection`] for whatever your
//! target provides (masking interrupts, a spinlock, a no-op if you are
//! single-threaded) and pass it to [`LockedTlsf`] or the [`tlsf_capi`] macro.
use core::{cell::UnsafeCell, mem::MaybeUninit, ops, ptr::NonNull};

use crate::{tlsf::Tlsf, Init};

/// A lock guarding a critical section, acquired by [`CriticalSection::enter`]
/// and released when dropped.
///
/// Implementations stand in for the reference's `irq_disable()`/
/// `irq_restore()` pair. The core allocator itself never blocks or yields
/// (§5 of the allocator's resource model), so the critical section only
/// needs to exclude other callers of the *wrapper*, not arbitrary waiting.
pub trait CriticalSection: Sized {
    /// Enter the critical section, returning a guard that exits it on drop.
    fn enter() -> Self;
}

/// A [`CriticalSection`] that does nothing, for single-threaded programs and
/// tests where no other caller can possibly be inside the allocator.
#[derive(Debug)]
pub struct NoopCriticalSection;

impl CriticalSection for NoopCriticalSection {
    #[inline]
    fn enter() -> Self {
        Self
    }
}

/// A [`Tlsf`] instance guarded by a [`CriticalSection`], suitable for
/// placement in a `static` and use from C-ABI wrappers generated by
/// [`tlsf_capi`].
///
/// `'static` is required because a `static` value cannot itself borrow a
/// pool from a more limited scope; attach a `'static` pool with
/// [`LockedTlsf::add_pool`] (e.g. a `static mut` array, or memory leaked
/// deliberately for the program's lifetime).
pub struct LockedTlsf<Cs, FLBitmap, SLBitmap, const FLLEN: usize, const SLLEN: usize> {
    inner: UnsafeCell<Tlsf<'static, FLBitmap, SLBitmap, FLLEN, SLLEN>>,
    _cs: core::marker::PhantomData<fn() -> Cs>,
}

// Safety: all access to `inner` goes through `lock`, which requires
// acquiring `Cs` first; `Cs` implementations are responsible for excluding
// concurrent callers on whatever definition of "concurrent" their target
// has (interrupts, threads, ...).
unsafe impl<Cs, FLBitmap: Send, SLBitmap: Send, const FLLEN: usize, const SLLEN: usize> Sync
    for LockedTlsf<Cs, FLBitmap, SLBitmap, FLLEN, SLLEN>
{
}

impl<Cs, FLBitmap, SLBitmap, const FLLEN: usize, const SLLEN: usize> Init
    for LockedTlsf<Cs, FLBitmap, SLBitmap, FLLEN, SLLEN>
where
    Tlsf<'static, FLBitmap, SLBitmap, FLLEN, SLLEN>: Init,
{
    const INIT: Self = Self {
        inner: UnsafeCell::new(Init::INIT),
        _cs: core::marker::PhantomData,
    };
}

impl<Cs: CriticalSection, FLBitmap, SLBitmap, const FLLEN: usize, const SLLEN: usize>
    LockedTlsf<Cs, FLBitmap, SLBitmap, FLLEN, SLLEN>
{
    #[inline]
    fn lock(&self) -> impl ops::DerefMut<Target = Tlsf<'static, FLBitmap, SLBitmap, FLLEN, SLLEN>> + '_ {
        struct Guard<'a, T, Cs> {
            inner: &'a UnsafeCell<T>,
            _cs: Cs,
        }

        impl<T, Cs> ops::Deref for Guard<'_, T, Cs> {
            type Target = T;
            #[inline]
            fn deref(&self) -> &T {
                // Safety: `_cs` is held for the guard's lifetime.
                unsafe { &*self.inner.get() }
            }
        }

        impl<T, Cs> ops::DerefMut for Guard<'_, T, Cs> {
            #[inline]
            fn deref_mut(&mut self) -> &mut T {
                // Safety: `_cs` is held for the guard's lifetime.
                unsafe { &mut *self.inner.get() }
            }
        }

        Guard { inner: &self.inner, _cs: Cs::enter() }
    }

    /// Attach a `'static` pool. See [`Tlsf::add_pool`].
    pub fn add_pool(&self, pool: &'static mut [MaybeUninit<u8>]) -> bool {
        self.lock().add_pool(pool)
    }

    /// See [`Tlsf::malloc`].
    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.lock().malloc(size)
    }

    /// Allocates `count * size` bytes and zeroes them, failing (rather than
    /// wrapping) if `count * size` overflows `usize`.
    ///
    /// The reference `tlsf-malloc.c` does not check this multiplication for
    /// overflow; this is a deliberate, documented deviation (see
    /// `DESIGN.md`).
    pub fn calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let bytes = count.checked_mul(size)?;
        // Zeroing happens after the guard returned by `malloc` is dropped,
        // keeping the critical section as short as possible.
        let ptr = self.malloc(bytes)?;
        unsafe { ptr.as_ptr().write_bytes(0, bytes) };
        Some(ptr)
    }

    /// See [`Tlsf::memalign`].
    pub fn memalign(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        self.lock().memalign(align, size)
    }

    /// See [`Tlsf::realloc`].
    ///
    /// # Safety
    ///
    /// `ptr`, if present, must denote an outstanding allocation from this
    /// allocator.
    pub unsafe fn realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        self.lock().realloc(ptr, size)
    }

    /// See [`Tlsf::free`].
    ///
    /// # Safety
    ///
    /// `ptr`, if present, must denote an outstanding allocation from this
    /// allocator, and must not be used again afterwards.
    pub unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        self.lock().free(ptr)
    }

    /// See [`Tlsf::block_size`].
    ///
    /// # Safety
    ///
    /// `ptr` must denote an outstanding allocation from this allocator.
    pub unsafe fn block_size(&self, ptr: NonNull<u8>) -> usize {
        self.lock().block_size(ptr)
    }
}

/// Declares a `static` [`LockedTlsf`] and a set of `#[no_mangle] extern "C"`
/// functions forwarding to it, one per allocator primitive.
///
/// This plays the role of the reference's `TLSF_MALLOC_NAME` token-pasting
/// macro: rather than splicing a prefix onto fixed identifiers (which stable
/// `macro_rules!` cannot do without pulling in an identifier-pasting
/// dependency), the caller spells out each final function name directly,
/// matching however their build already names the symbols it links against.
///
/// # Example
///
/// ```
/// use tlsf_rt::{capi::{tlsf_capi, NoopCriticalSection}, Init};
/// use std::mem::MaybeUninit;
///
/// tlsf_capi! {
///     static ALLOC: tlsf_rt::capi::LockedTlsf<NoopCriticalSection, u16, u16, 16, 16> = Init::INIT;
///     unsafe extern "C" fn demo_malloc = malloc;
///     unsafe extern "C" fn demo_calloc = calloc;
///     unsafe extern "C" fn demo_memalign = memalign;
///     unsafe extern "C" fn demo_realloc = realloc;
///     unsafe extern "C" fn demo_free = free;
/// }
///
/// static mut POOL: [MaybeUninit<u8>; 65536] = [MaybeUninit::uninit(); 65536];
/// unsafe {
///     ALLOC.add_pool(&mut POOL);
///     let p = demo_malloc(64);
///     assert!(!p.is_null());
///     demo_free(p);
/// }
/// ```
#[macro_export]
macro_rules! tlsf_capi {
    (
        static $alloc:ident: $ty:ty = $init:expr;
        unsafe extern "C" fn $malloc:ident = malloc;
        unsafe extern "C" fn $calloc:ident = calloc;
        unsafe extern "C" fn $memalign:ident = memalign;
        unsafe extern "C" fn $realloc:ident = realloc;
        unsafe extern "C" fn $free:ident = free;
    ) => {
        static $alloc: $ty = $init;

        /// # Safety
        /// See [`$crate::capi::LockedTlsf::malloc`].
        #[no_mangle]
        pub unsafe extern "C" fn $malloc(bytes: usize) -> *mut u8 {
            $alloc
                .malloc(bytes)
                .map(::core::ptr::NonNull::as_ptr)
                .unwrap_or(::core::ptr::null_mut())
        }

        /// # Safety
        /// See [`$crate::capi::LockedTlsf::calloc`].
        #[no_mangle]
        pub unsafe extern "C" fn $calloc(count: usize, bytes: usize) -> *mut u8 {
            $alloc
                .calloc(count, bytes)
                .map(::core::ptr::NonNull::as_ptr)
                .unwrap_or(::core::ptr::null_mut())
        }

        /// # Safety
        /// See [`$crate::capi::LockedTlsf::memalign`].
        #[no_mangle]
        pub unsafe extern "C" fn $memalign(align: usize, bytes: usize) -> *mut u8 {
            $alloc
                .memalign(align, bytes)
                .map(::core::ptr::NonNull::as_ptr)
                .unwrap_or(::core::ptr::null_mut())
        }

        /// # Safety
        /// `ptr` must be null or a pointer previously returned by one of
        /// this allocator's entry points and not yet freed.
        #[no_mangle]
        pub unsafe extern "C" fn $realloc(ptr: *mut u8, size: usize) -> *mut u8 {
            let ptr = ::core::ptr::NonNull::new(ptr);
            $alloc
                .realloc(ptr, size)
                .map(::core::ptr::NonNull::as_ptr)
                .unwrap_or(::core::ptr::null_mut())
        }

        /// # Safety
        /// `ptr` must be null or a pointer previously returned by one of
        /// this allocator's entry points and not yet freed.
        #[no_mangle]
        pub unsafe extern "C" fn $free(ptr: *mut u8) {
            $alloc.free(::core::ptr::NonNull::new(ptr))
        }
    };
}

pub use tlsf_capi;

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::{mem::MaybeUninit, prelude::v1::*};

    type TheLock = LockedTlsf<NoopCriticalSection, u16, u16, 16, 16>;

    #[test]
    fn malloc_calloc_free_round_trip() {
        static ALLOC: TheLock = Init::INIT;
        let pool: &'static mut [MaybeUninit<u8>] =
            Box::leak(Box::new([MaybeUninit::uninit(); 65536]));
        assert!(ALLOC.add_pool(pool));

        let p = ALLOC.malloc(64).expect("malloc should succeed");
        unsafe {
            assert!(ALLOC.block_size(p) >= 64);
            ALLOC.free(Some(p));
        }

        let z = ALLOC.calloc(16, 4).expect("calloc should succeed");
        unsafe {
            let bytes = core::slice::from_raw_parts(z.as_ptr(), 64);
            assert!(bytes.iter().all(|&b| b == 0));
            ALLOC.free(Some(z));
        }
    }

    #[test]
    fn calloc_rejects_overflowing_size() {
        static ALLOC: TheLock = Init::INIT;
        let pool: &'static mut [MaybeUninit<u8>] =
            Box::leak(Box::new([MaybeUninit::uninit(); 65536]));
        assert!(ALLOC.add_pool(pool));

        assert!(ALLOC.calloc(usize::MAX, 2).is_none());
    }

    tlsf_capi! {
        static DOCTEST_ALLOC: TheLock = Init::INIT;
        unsafe extern "C" fn doctest_malloc = malloc;
        unsafe extern "C" fn doctest_calloc = calloc;
        unsafe extern "C" fn doctest_memalign = memalign;
        unsafe extern "C" fn doctest_realloc = realloc;
        unsafe extern "C" fn doctest_free = free;
    }

    #[test]
    fn generated_capi_wrappers_round_trip() {
        let pool: &'static mut [MaybeUninit<u8>] =
            Box::leak(Box::new([MaybeUninit::uninit(); 65536]));
        assert!(DOCTEST_ALLOC.add_pool(pool));

        unsafe {
            let p = doctest_malloc(128);
            assert!(!p.is_null());
            let q = doctest_realloc(p, 256);
            assert!(!q.is_null());
            doctest_free(q);
        }
    }
}
