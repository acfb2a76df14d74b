//! This crate implements the TLSF (Two-Level Segregated Fit) dynamic memory
//! allocation algorithm¹.
//!
//!  - **Allocation and deallocation operations are guaranteed to complete in
//!    constant time.** TLSF is suitable for real-time applications.
//!
//!  - **The memory pool is provided by the caller.** Examples of potential
//!    memory pool sources include a `static` array for global allocation, or
//!    a block carved out by another allocator for arena allocation. This
//!    crate never grows a pool after it is added and never returns memory to
//!    an underlying OS — the caller owns the pool's lifetime start to finish.
//!
//!  - **This crate supports `#![no_std]`.** It can be used in bare-metal and
//!    RTOS-based applications. A [`capi`] module is provided for exposing the
//!    allocator as a name-prefixed set of C-ABI entry points guarded by a
//!    caller-supplied [`CriticalSection`](capi::CriticalSection).
//!
//! <sub>¹ M. Masmano, I. Ripoll, A. Crespo and J. Real, "TLSF: a new dynamic
//! memory allocator for real-time systems," *Proceedings. 16th Euromicro
//! Conference on Real-Time Systems*, 2004. ECRTS 2004., Catania, Italy, 2004,
//! pp. 79-88, doi: 10.1109/EMRTS.2004.1311009.</sub>
//!
//! # Example
//!
//! ```
//! use tlsf_rt::Tlsf;
//! use std::mem::MaybeUninit;
//!
//! let mut pool = [MaybeUninit::uninit(); 65536];
//! // `'_` is the lifetime of `pool`'s borrow.
//! let mut tlsf: Tlsf<'_, u16, u16, 12, 16> = Tlsf::INIT;
//! assert!(tlsf.add_pool(&mut pool));
//!
//! let p = tlsf.malloc(64).unwrap();
//! unsafe {
//!     assert_eq!(tlsf.block_size(p) >= 64, true);
//!     tlsf.free(Some(p));
//! }
//! ```
//!
//! # Differences from the Reference Algorithm
//!
//!  - Each pool is capped by a sentinel block (a permanently occupied,
//!    zero-size block) instead of a normal block carrying a
//!    last-block-in-pool flag. This simplifies coalescing and keeps the
//!    physical-chain walk a single, branchless pointer step per block.
//!  - Block headers do not byte-share storage with the preceding block's
//!    payload; every block owns a complete, non-overlapping header. This
//!    costs one extra word per used block in exchange for headers that are
//!    ordinary, non-aliasing Rust structs.
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

pub mod capi;
mod init;
pub mod int;
mod tlsf;
mod utils;

pub use self::{
    init::Init,
    tlsf::{Tlsf, GRANULARITY},
};

#[cfg(any(test, feature = "std"))]
extern crate std;
