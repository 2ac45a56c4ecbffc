//! Board-supplied CPU hooks.
//!
//! The reactor needs two operations no portable code can express: idling the
//! CPU until the next interrupt and kicking the watchdog.  A board crate
//! registers both once during init; before registration (and on the test
//! host) inert defaults apply, so the runtime is safe to exercise without a
//! board.

use core::sync::atomic::{AtomicPtr, Ordering};

pub struct PlatformHooks {
    /// Idle the CPU until any interrupt.
    ///
    /// Called with interrupts enabled, outside any critical section.  The
    /// implementation must guarantee that an interrupt raised between the
    /// caller's last idle check and the sleep entry still wakes the CPU
    /// (AVR `sei; sleep` ordering, ARM WFI-with-pending semantics).
    pub cpu_sleep: fn(),

    /// Reset the hardware watchdog.  The reactor calls this once per
    /// dispatched payload; a wedged loop therefore trips the dog.
    pub watchdog_reset: fn(),
}

fn default_cpu_sleep() {
    core::hint::spin_loop();
}

fn default_watchdog_reset() {}

static DEFAULT_HOOKS: PlatformHooks = PlatformHooks {
    cpu_sleep: default_cpu_sleep,
    watchdog_reset: default_watchdog_reset,
};

static HOOKS: AtomicPtr<PlatformHooks> = AtomicPtr::new(core::ptr::null_mut());

/// Install the board's hooks.  Called once during board init.
pub fn register(hooks: &'static PlatformHooks) {
    HOOKS.store(hooks as *const PlatformHooks as *mut PlatformHooks, Ordering::Release);
}

#[inline]
fn hooks() -> &'static PlatformHooks {
    let ptr = HOOKS.load(Ordering::Acquire);
    if ptr.is_null() {
        &DEFAULT_HOOKS
    } else {
        // SAFETY: `register` only stores `&'static PlatformHooks`.
        unsafe { &*ptr }
    }
}

#[inline]
pub fn cpu_sleep() {
    (hooks().cpu_sleep)()
}

#[inline]
pub fn watchdog_reset() {
    (hooks().watchdog_reset)()
}
