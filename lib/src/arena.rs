//! One-way bump allocator with stack-collision detection.
//!
//! RAM on the target devices is a few kilobytes with no MMU, so the runtime
//! allocates everything it will ever own during init from a single bounded
//! region and never frees.  The whole region is filled with a poison byte
//! before the first allocation; every allocation re-checks that its block
//! *plus a guard margin* still holds the poison value.  A non-poison byte
//! there means the stack has grown down into the region — a fatal fault,
//! caught before the corrupted block is handed out.
//!
//! # Concurrency
//!
//! Allocation happens only during init, before the reactor runs, so the
//! interrupt-masking lock around the bump state is never contended; it exists
//! so the arena is a plain `Sync` value like every other service.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use crate::alignment::align_up_usize;
use crate::fault::{FaultCode, fault};
use crate::irqlock::IrqMutex;

/// Value every unallocated byte must hold.
pub const POISON: u8 = 0xAA;

/// Bytes past the high-water mark that must remain poison on every
/// allocation.  Doubles as the reserve between the last block and the stack.
pub const STACK_GUARD: usize = 32;

struct ArenaState {
    /// First byte of the region; null until `init`.
    start: *mut u8,
    /// Next byte to hand out.
    next: *mut u8,
    /// One past the last usable byte (the stack-side boundary).
    end: *mut u8,
}

// SAFETY: the raw region pointers are only dereferenced under the lock.
unsafe impl Send for ArenaState {}

pub struct Arena {
    inner: IrqMutex<ArenaState>,
}

impl Arena {
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new(ArenaState {
                start: core::ptr::null_mut(),
                next: core::ptr::null_mut(),
                end: core::ptr::null_mut(),
            }),
        }
    }

    /// Adopt `[start, start + len)` as the allocation region and poison-fill
    /// it.  Must run before any allocation — on the target, before any other
    /// service init touches the arena.
    ///
    /// The region includes the [`STACK_GUARD`] headroom: the last `alloc`
    /// that fits leaves at least `STACK_GUARD` poison bytes before `end`.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes for the rest of the
    /// program and referenced by nothing else.
    pub unsafe fn init(&self, start: *mut u8, len: usize) {
        let mut state = self.inner.lock();
        core::ptr::write_bytes(start, POISON, len);
        state.start = start;
        state.next = start;
        state.end = start.add(len);
    }

    /// Allocate a zeroed block of `nelem * elem_size` bytes, `usize`-aligned.
    pub fn alloc(&self, nelem: usize, elem_size: usize) -> NonNull<u8> {
        self.alloc_bytes(nelem * elem_size, core::mem::align_of::<usize>())
    }

    /// Allocate a zeroed array of `n` values of `T`, aligned for `T`.
    pub fn alloc_array<T>(&self, n: usize) -> NonNull<T> {
        self.alloc_bytes(n * core::mem::size_of::<T>(), core::mem::align_of::<T>())
            .cast()
    }

    fn alloc_bytes(&self, size: usize, align: usize) -> NonNull<u8> {
        let mut state = self.inner.lock();
        if state.next.is_null() {
            fault(FaultCode::ArenaExhausted);
        }

        let base = align_up_usize(state.next as usize, align) as *mut u8;
        // Alignment padding stays poison; only the block itself is zeroed.
        let needed = size + STACK_GUARD;
        if (state.end as usize).saturating_sub(base as usize) < needed {
            fault(FaultCode::ArenaExhausted);
        }

        // The block and the guard margin past it must be untouched poison;
        // anything else means the stack has already been down here.
        for offset in 0..needed {
            // SAFETY: `base + needed <= end` was checked above.
            let byte = unsafe { *base.add(offset) };
            if byte != POISON {
                fault(FaultCode::StackCollision);
            }
        }

        // SAFETY: in-bounds and exclusively ours from here on.
        unsafe {
            core::ptr::write_bytes(base, 0, size);
            state.next = base.add(size);
            NonNull::new_unchecked(base)
        }
    }

    /// Bytes handed out so far, padding included.  Diagnostic.
    pub fn used(&self) -> usize {
        let state = self.inner.lock();
        if state.next.is_null() {
            return 0;
        }
        (state.next as usize) - (state.start as usize)
    }
}

/// Statically allocatable backing region for an [`Arena`].
///
/// On the target the region usually comes from linker symbols instead; this
/// exists for boards that reserve the arena as a Rust static, and for tests.
#[repr(align(8))]
pub struct ArenaBacking<const N: usize>(UnsafeCell<[u8; N]>);

// SAFETY: all access goes through the owning Arena's lock.
unsafe impl<const N: usize> Sync for ArenaBacking<N> {}

impl<const N: usize> ArenaBacking<N> {
    pub const fn new() -> Self {
        Self(UnsafeCell::new([0; N]))
    }

    pub fn as_region(&self) -> (*mut u8, usize) {
        (self.0.get() as *mut u8, N)
    }
}
