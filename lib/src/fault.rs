//! Fatal invariant handling.
//!
//! The runtime's error policy is deliberately blunt: a violated invariant
//! means the firmware state can no longer be trusted, so execution stops.
//! [`fault`] logs the code and diverts to a board-registered hook (typically
//! "latch the fault indicator and halt").  Without a hook it panics, which is
//! also what host tests observe.
//!
//! Recoverable conditions (queue full, cancel-after-fire, malformed sequence
//! characters) are ordinary return values in their own modules and never come
//! through here.

use core::sync::atomic::{AtomicPtr, Ordering};

/// What went wrong.  One variant per fatal invariant the runtime checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultCode {
    /// `Reactor::register` after `run`/`prepare` froze the handler order.
    RegisterAfterRun,
    /// More handlers than the reactor table holds.
    HandlerTableFull,
    /// A notification bit was set for a handler whose queue is empty.
    QueueUnderflow,
    /// No free slot in the timer wheel.
    TimerWheelFull,
    /// Arena region exhausted (or used before init).
    ArenaExhausted,
    /// A byte past the arena high-water mark lost its poison value: the
    /// stack has grown into the arena.
    StackCollision,
    /// More input declarations than the input table holds.
    InputTableFull,
    /// More output declarations than the output table holds.
    OutputTableFull,
    /// A service entry point ran before the service's `init`.
    ServiceUninitialized,
}

impl FaultCode {
    pub fn as_str(self) -> &'static str {
        match self {
            FaultCode::RegisterAfterRun => "register after run",
            FaultCode::HandlerTableFull => "handler table full",
            FaultCode::QueueUnderflow => "queue underflow",
            FaultCode::TimerWheelFull => "timer wheel full",
            FaultCode::ArenaExhausted => "arena exhausted",
            FaultCode::StackCollision => "arena/stack collision",
            FaultCode::InputTableFull => "input table full",
            FaultCode::OutputTableFull => "output table full",
            FaultCode::ServiceUninitialized => "service not initialized",
        }
    }
}

/// Signature of a board fault hook.  Must not return.
pub type FaultHook = fn(FaultCode) -> !;

/// Stored as a raw pointer; `null` means "panic instead".
static HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Register the board's fault hook (latch an indicator, halt the CPU).
pub fn register_fault_hook(hook: FaultHook) {
    HOOK.store(hook as *mut (), Ordering::Release);
}

/// Signal a fatal invariant violation and stop.
pub fn fault(code: FaultCode) -> ! {
    crate::klog_error!("fault: {}", code.as_str());
    let ptr = HOOK.load(Ordering::Acquire);
    if !ptr.is_null() {
        // SAFETY: `register_fault_hook` only stores valid `FaultHook` fn
        // pointers, which are the same size as `*mut ()` on all supported
        // targets.
        let hook: FaultHook = unsafe { core::mem::transmute(ptr) };
        hook(code);
    }
    panic!("fault: {}", code.as_str());
}

/// Stop with `code` when `cond` holds.
#[macro_export]
macro_rules! fault_if {
    ($cond:expr, $code:expr) => {
        if $cond {
            $crate::fault::fault($code);
        }
    };
}
