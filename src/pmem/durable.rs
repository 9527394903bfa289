//! Cache-line flush + store-fence primitives (§4.1).
//!
//! The original source calls straight into `libpmem`'s `pmem_persist` and
//! `_mm_sfence`. Per the redesign notes this is abstracted behind a
//! `Durable` trait with two backends: a real one using the x86_64
//! `clflush`/`sfence` intrinsics, and a no-op one for in-memory testing on
//! any target (including non-x86_64 CI runners).

use std::sync::atomic::{fence, Ordering};

pub const CACHE_LINE_SIZE: usize = 64;

/// Durability primitives required by every PM-resident write.
///
/// Durability rule used by all callers: any store that must survive a
/// crash is followed by `flush` of its cache line(s) and a `fence` before
/// the next dependent store. A header field that atomically "validates" a
/// structure is always the *last* field flushed, after the payload it
/// validates.
pub trait Durable: Send + Sync {
    /// Issue cache-line writeback for every 64-byte line overlapping
    /// `[addr, addr+len)`.
    fn flush(&self, addr: *const u8, len: usize);

    /// Store-fence: makes prior flushed writes durable before subsequent
    /// ones.
    fn fence(&self);

    /// `flush` then `fence`.
    fn persist(&self, addr: *const u8, len: usize) {
        self.flush(addr, len);
        self.fence();
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", not(miri)))] {
        /// Real cache-line flush backend, using the `clflush`/`sfence`
        /// intrinsics the original source relies on directly.
        #[derive(Debug, Default, Clone, Copy)]
        pub struct CpuDurable;

        impl Durable for CpuDurable {
            #[inline]
            fn flush(&self, addr: *const u8, len: usize) {
                if len == 0 {
                    return;
                }
                unsafe {
                    let start = (addr as usize) & !(CACHE_LINE_SIZE - 1);
                    let end = (addr as usize) + len;
                    let mut line = start;
                    while line < end {
                        core::arch::x86_64::_mm_clflush(line as *const u8);
                        line += CACHE_LINE_SIZE;
                    }
                }
            }

            #[inline]
            fn fence(&self) {
                unsafe { core::arch::x86_64::_mm_sfence() }
            }
        }
    } else {
        /// Portable fallback: a compiler/CPU fence only. Correct but
        /// conservative on targets without an explicit cache-line flush
        /// instruction (the mapped file still reaches disk on `munmap`/
        /// `msync`, just not with the same crash-window guarantee).
        #[derive(Debug, Default, Clone, Copy)]
        pub struct CpuDurable;

        impl Durable for CpuDurable {
            #[inline]
            fn flush(&self, _addr: *const u8, _len: usize) {
                fence(Ordering::SeqCst);
            }

            #[inline]
            fn fence(&self) {
                fence(Ordering::SeqCst);
            }
        }
    }
}

/// In-memory test backend: no durability at all, just a fast no-op. Used
/// by [`crate::pmem::PmFile::map_anonymous`] so unit tests don't pay for
/// real cache-line flushes and don't require a PM-backed filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDurable;

impl Durable for NoopDurable {
    #[inline]
    fn flush(&self, _addr: *const u8, _len: usize) {}
    #[inline]
    fn fence(&self) {}
}
