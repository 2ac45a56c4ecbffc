//! Millisecond timer service over the reactor.
//!
//! A 1 ms hardware timer ISR calls [`TimerService::on_tick_isr`], which does
//! two things only: bump the monotonic counter and notify the internal
//! dispatch handler.  Everything else — expiry checks, re-arming repeats,
//! user notifications — happens in main context when the reactor runs the
//! dispatch handler.
//!
//! # The wheel
//!
//! Pending futures live in a fixed ring kept in ascending-deadline order
//! between the `active` index (next to fire) and the `avail` index (next
//! free slot).  "Earlier" is decided on the *signed* distance from the
//! current tick, so deadlines computed across the 32-bit counter's rollover
//! still sort correctly.  Insert and cancel shift at most the pending
//! entries, which the capacity bounds to a small constant.
//!
//! # Ordering
//!
//! Futures with equal deadlines fire in arm order.  A repeating future's
//! next deadline is `previous deadline + repeat`, not "now + repeat", so the
//! period stays stable across dispatch jitter, and the future keeps both its
//! payload and its instance id across re-arms — cancelling a repeating timer
//! with the id returned by `arm` works at any point in its life.

use core::sync::atomic::{AtomicU32, Ordering};

use pneuma_lib::arena::Arena;
use pneuma_lib::fault::FaultCode;
use pneuma_lib::irqlock::IrqMutex;
use pneuma_lib::{fault_if, klog_trace};
use spin::Once;

use crate::reactor::{Handle, Handler, Payload, Priority, Reactor};

/// Capacity of the future ring.
pub const MAX_FUTURES: usize = 16;

/// Reactor priority of the dispatch handler.
pub const DISPATCH_PRIO: Priority = Priority::VERY_HIGH_PLUS;

/// One unit of the monotonic 1 ms counter.
pub type Tick = u32;

/// Identity of one armed timer, unique across the program's life.
///
/// Returned by [`TimerService::arm`]; pass it to
/// [`TimerService::cancel`] to revoke the future before it fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerInstance(u32);

impl TimerInstance {
    /// Sentinel that never matches an armed timer.
    pub const INVALID: Self = Self(0);

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

#[derive(Clone, Copy)]
struct Future {
    /// Target handler; `None` marks a vacated slot.
    target: Option<Handle>,
    /// Absolute deadline on the monotonic counter.
    deadline: Tick,
    /// Re-arm interval; 0 = one-shot.
    repeat: Tick,
    payload: Payload,
    instance: TimerInstance,
}

impl Future {
    const VACANT: Future = Future {
        target: None,
        deadline: 0,
        repeat: 0,
        payload: Payload::NONE,
        instance: TimerInstance::INVALID,
    };
}

struct Wheel {
    futures: [Future; MAX_FUTURES],
    /// Next slot to fire.
    active: u8,
    /// Next free slot.
    avail: u8,
    /// Occupied slots between `active` and `avail`.
    len: u8,
    last_instance: u32,
}

struct TimerDeps {
    reactor: &'static Reactor,
    dispatch: Handle,
}

pub struct TimerService {
    /// Free-running millisecond counter.  Only the tick ISR writes it;
    /// reads are single atomic loads, so no masking is needed.
    ticks: AtomicU32,
    wheel: IrqMutex<Wheel>,
    deps: Once<TimerDeps>,
}

#[inline]
fn right_of(index: u8) -> u8 {
    if index as usize == MAX_FUTURES - 1 { 0 } else { index + 1 }
}

#[inline]
fn left_of(index: u8) -> u8 {
    if index == 0 { (MAX_FUTURES - 1) as u8 } else { index - 1 }
}

/// Signed tick distance from `from` to `to`, tolerant of counter rollover.
#[inline]
fn distance(from: Tick, to: Tick) -> i32 {
    to.wrapping_sub(from) as i32
}

impl TimerService {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU32::new(0),
            wheel: IrqMutex::new(Wheel {
                futures: [Future::VACANT; MAX_FUTURES],
                active: 0,
                avail: 0,
                len: 0,
                last_instance: 0,
            }),
            deps: Once::new(),
        }
    }

    /// Register the dispatch handler.  Call once during init, before the
    /// board timer starts ticking in earnest.
    pub fn init(&'static self, arena: &Arena, reactor: &'static Reactor) {
        let dispatch = reactor.register(
            arena,
            Handler::with_context(dispatch_trampoline, self as *const Self as *mut ()),
            DISPATCH_PRIO,
            // Tick notifications carry no payload and coalesce by ring
            // overwrite, so one slot is enough.
            1,
        );
        self.deps.call_once(|| TimerDeps { reactor, dispatch });
    }

    /// Current value of the monotonic counter.
    #[inline]
    pub fn now(&self) -> Tick {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Park the counter at an arbitrary value, e.g. just before rollover.
    #[cfg(test)]
    pub(crate) fn set_now(&self, ticks: Tick) {
        self.ticks.store(ticks, Ordering::Relaxed);
    }

    /// Deadline `delay_ms` from now, for use with [`arm`](Self::arm).
    /// The value may roll over; the wheel handles that.
    #[inline]
    pub fn deadline_in(&self, delay_ms: Tick) -> Tick {
        self.now().wrapping_add(delay_ms)
    }

    /// Ticks elapsed since an earlier counter reading.
    #[inline]
    pub fn elapsed_since(&self, earlier: Tick) -> Tick {
        self.now().wrapping_sub(earlier)
    }

    /// The 1 ms tick.  **ISR context.**  The board's periodic timer
    /// interrupt calls this once per fire and nothing else.
    pub fn on_tick_isr(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        if let Some(deps) = self.deps.get() {
            deps.reactor.notify(deps.dispatch, Payload::NONE);
        }
    }

    /// Arm a future for `target` at the absolute `deadline`.
    ///
    /// `repeat > 0` re-arms the future every `repeat` ticks after it fires.
    /// `payload` rides along to every notification.  Returns the instance id
    /// for [`cancel`](Self::cancel).  A full wheel is a fatal fault.
    pub fn arm(&self, target: Handle, deadline: Tick, repeat: Tick, payload: Payload) -> TimerInstance {
        let now = self.now();
        let mut wheel = self.wheel.lock();
        let instance = wheel.next_instance();
        wheel.insert(now, Future {
            target: Some(target),
            deadline,
            repeat,
            payload,
            instance,
        });
        klog_trace!("timer: armed {} for t={}", instance.0, deadline);
        instance
    }

    /// Cancel a pending future.
    ///
    /// Returns `true` iff the future was still in the wheel — in which case
    /// no notification for it has been or will be delivered.  `false` means
    /// it already fired (its payload may be in flight) or never existed;
    /// callers that re-arm often should carry a validity token in the
    /// payload and check it on delivery.
    pub fn cancel(&self, instance: TimerInstance) -> bool {
        if !instance.is_valid() {
            return false;
        }
        let mut wheel = self.wheel.lock();
        let mut pos = wheel.active;
        let mut remaining = wheel.len;
        while remaining > 0 {
            if wheel.futures[pos as usize].instance == instance {
                wheel.futures[pos as usize].target = None;
                wheel.remove_at(pos);
                klog_trace!("timer: cancelled {}", instance.0);
                return true;
            }
            pos = right_of(pos);
            remaining -= 1;
        }
        false
    }

    /// Pending futures in the wheel.  Diagnostic.
    pub fn pending_count(&self) -> usize {
        self.wheel.lock().len as usize
    }

    /// Expire due futures.  Runs as a reactor handler once per tick
    /// notification.
    fn dispatch(&self) {
        let Some(deps) = self.deps.get() else {
            return;
        };
        let now = self.now();

        loop {
            let fired = {
                let mut guard = self.wheel.lock();
                let wheel = &mut *guard;
                if wheel.len == 0 {
                    break;
                }
                let future = wheel.futures[wheel.active as usize];
                if distance(now, future.deadline) > 0 {
                    // Sorted order: everything further out is later still.
                    break;
                }

                wheel.futures[wheel.active as usize].target = None;
                wheel.active = right_of(wheel.active);
                wheel.len -= 1;

                if future.repeat > 0 {
                    // Next deadline counts from the previous one, keeping
                    // the period stable; payload and instance id carry over.
                    let mut next = future;
                    next.deadline = future.deadline.wrapping_add(future.repeat);
                    wheel.insert(now, next);
                }
                future
            };

            if let Some(target) = fired.target {
                deps.reactor.notify(target, fired.payload);
            }
        }
    }
}

fn dispatch_trampoline(context: *mut (), _payload: Payload) {
    // SAFETY: `init` registered this handler with `&'static self`.
    let service = unsafe { &*(context as *const TimerService) };
    service.dispatch();
}

impl Wheel {
    fn next_instance(&mut self) -> TimerInstance {
        self.last_instance = self.last_instance.wrapping_add(1);
        if self.last_instance == 0 {
            self.last_instance = 1;
        }
        TimerInstance(self.last_instance)
    }

    /// Insert keeping ascending deadline order relative to `now`.
    /// Equal deadlines land after existing ones (FIFO among equals).
    fn insert(&mut self, now: Tick, future: Future) {
        fault_if!(self.len as usize == MAX_FUTURES, FaultCode::TimerWheelFull);

        let mut insert_at = self.active;
        let mut remaining = self.len;
        while remaining > 0 {
            let pending = &self.futures[insert_at as usize];
            if distance(now, future.deadline) < distance(now, pending.deadline) {
                break;
            }
            insert_at = right_of(insert_at);
            remaining -= 1;
        }

        // Shift everything at and after the insert point one slot toward
        // `avail`.
        let mut slot = self.avail;
        while slot != insert_at {
            let left = left_of(slot);
            self.futures[slot as usize] = self.futures[left as usize];
            slot = left;
        }

        self.futures[insert_at as usize] = future;
        self.avail = right_of(self.avail);
        self.len += 1;
    }

    /// Reclaim the slot at `pos` by shifting the later entries left.
    fn remove_at(&mut self, pos: u8) {
        let mut slot = pos;
        while right_of(slot) != self.avail {
            self.futures[slot as usize] = self.futures[right_of(slot) as usize];
            slot = right_of(slot);
        }
        self.futures[slot as usize] = Future::VACANT;
        self.avail = slot;
        self.len -= 1;
    }
}
