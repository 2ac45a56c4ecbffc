//! Interrupt-masking mutex for single-core targets.
//!
//! The runtime has exactly two execution contexts: interrupt handlers and the
//! main loop.  On a single core, masking interrupts for the duration of an
//! access *is* mutual exclusion, so there is no spinning and no ticket
//! machinery — a lock acquisition saves and disables the interrupt state and
//! the guard's drop restores it.
//!
//! The masking primitive is the `critical-section` crate, which each board
//! crate backs with its target's save/disable/restore sequence (and which the
//! host test harness backs with its `std` implementation, giving tests real
//! serialization).
//!
//! # Nesting
//!
//! Critical sections nest, so holding a guard while locking a *different*
//! mutex is fine.  Re-locking the *same* mutex while its guard is live would
//! alias the protected data and must not be done; nothing in this runtime
//! holds a guard across a callback into foreign code.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use critical_section::RestoreState;

/// Mutex that disables interrupts while held.
/// Essential for state shared between ISRs and the main loop.
pub struct IrqMutex<T> {
    data: UnsafeCell<T>,
}

// SAFETY: IrqMutex provides exclusive access by disabling interrupts for the
// lifetime of the guard; on the single-core targets this runtime serves there
// is no other context that could observe the data meanwhile.
unsafe impl<T: Send> Send for IrqMutex<T> {}
unsafe impl<T: Send> Sync for IrqMutex<T> {}

pub struct IrqMutexGuard<'a, T> {
    mutex: &'a IrqMutex<T>,
    restore: RestoreState,
}

impl<T> IrqMutex<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            data: UnsafeCell::new(data),
        }
    }

    #[inline]
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        // SAFETY: paired with the release in the guard's Drop.
        let restore = unsafe { critical_section::acquire() };
        IrqMutexGuard {
            mutex: self,
            restore,
        }
    }
}

impl<'a, T> Deref for IrqMutexGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: interrupts are masked while the guard lives.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for IrqMutexGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: interrupts are masked while the guard lives.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for IrqMutexGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: restores the state saved by the matching acquire.
        unsafe { critical_section::release(self.restore) };
    }
}
