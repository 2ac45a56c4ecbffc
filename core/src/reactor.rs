//! Priority-ordered cooperative event reactor.
//!
//! Interrupt handlers stay short: they post a notification and a payload for
//! a registered handler, and the main loop runs the handler later in thread
//! context.  When nothing is pending the loop puts the CPU to sleep.
//!
//! # Architecture
//!
//! Each registered handler owns a bounded payload queue and one bit in the
//! notification set.  Before `run` the bit position is simply the
//! registration index; `prepare` freezes registration, sorts the handlers by
//! descending priority, and re-assigns each handler's bit to its rank, so
//! that "lowest set bit" afterwards means "highest-priority pending handler".
//! Pending notifications posted during init are remapped in the same
//! interrupts-masked section.
//!
//! # Scheduling
//!
//! One pass of the loop dispatches exactly one payload from the
//! highest-priority pending handler, then restarts the scan from the top.
//! Higher priorities therefore always win, while handlers at the same
//! priority interleave one payload at a time instead of one handler draining
//! its whole queue.
//!
//! # Concurrency
//!
//! The notification set and all queues are only ever mutated under the
//! interrupt-masking lock, so ISR-side `notify` and loop-side dispatch never
//! observe each other halfway.  Handler callbacks run with interrupts
//! enabled and must return promptly; there is no preemption between them.

use pneuma_lib::arena::Arena;
use pneuma_lib::fault::{FaultCode, fault};
use pneuma_lib::irqlock::IrqMutex;
use pneuma_lib::queue::Queue;
use pneuma_lib::{fault_if, klog_debug, platform};

/// Size of the handler table; one notification bit each.
pub const MAX_HANDLERS: usize = 16;

type NotifyMask = u16;

// ---------------------------------------------------------------------------
// Payloads, priorities, handles
// ---------------------------------------------------------------------------

/// One pointer-sized opaque word delivered to a handler.
///
/// Producers and consumers agree on the packing; the reactor never looks
/// inside.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Payload(usize);

impl Payload {
    pub const NONE: Payload = Payload(0);

    pub const fn from_usize(value: usize) -> Self {
        Self(value)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

/// Dispatch priority; higher values run sooner.  Ties resolve by
/// registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(pub u8);

impl Priority {
    pub const IDLE: Priority = Priority(0);
    pub const LOW_MINUS: Priority = Priority(20);
    pub const LOW: Priority = Priority(30);
    pub const LOW_PLUS: Priority = Priority(40);
    pub const MEDIUM_MINUS: Priority = Priority(70);
    pub const MEDIUM: Priority = Priority(80);
    pub const MEDIUM_PLUS: Priority = Priority(90);
    pub const HIGH_MINUS: Priority = Priority(120);
    pub const HIGH: Priority = Priority(130);
    pub const HIGH_PLUS: Priority = Priority(140);
    pub const VERY_HIGH_MINUS: Priority = Priority(170);
    pub const VERY_HIGH: Priority = Priority(180);
    pub const VERY_HIGH_PLUS: Priority = Priority(190);
    pub const REALTIME: Priority = Priority(230);
    pub const REALTIME_PLUS: Priority = Priority(240);
}

/// Opaque identifier of a registered handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handle(u8);

impl Handle {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Callback plus context pointer, the shape stored in the handler table.
///
/// The context pointer lets a service route dispatch back to its own
/// instance; plain functions go through a trampoline that smuggles the
/// function pointer itself in the context slot.
#[derive(Clone, Copy)]
pub struct Handler {
    func: fn(*mut (), Payload),
    context: *mut (),
}

impl Handler {
    /// Wrap a plain `fn(Payload)`.
    pub fn new(func: fn(Payload)) -> Self {
        Self {
            func: plain_trampoline,
            context: func as *mut (),
        }
    }

    /// Bind `func` to a service instance.  `context` must stay valid for the
    /// rest of the program; every service passes `&'static self`.
    pub fn with_context(func: fn(*mut (), Payload), context: *mut ()) -> Self {
        Self { func, context }
    }
}

fn plain_trampoline(context: *mut (), payload: Payload) {
    // SAFETY: `Handler::new` stores a plain `fn(Payload)` here; fn pointers
    // and data pointers are the same width on all supported targets.
    let func: fn(Payload) = unsafe { core::mem::transmute(context) };
    func(payload)
}

// ---------------------------------------------------------------------------
// Reactor
// ---------------------------------------------------------------------------

struct Slot {
    handler: Handler,
    priority: Priority,
    /// This handler's bit in the notification set.  Registration index until
    /// `prepare` re-assigns ranks.
    mask: NotifyMask,
    queue: Queue<Payload>,
}

struct ReactorState {
    slots: [Option<Slot>; MAX_HANDLERS],
    count: u8,
    /// Bit position -> slot index, the dispatch permutation.
    order: [u8; MAX_HANDLERS],
    /// Bit *i* set ⇔ the handler ranked *i* has at least one payload queued.
    notifications: NotifyMask,
    /// Rank serviced by the previous pass; drives the equal-priority
    /// rotation.  `NO_RANK` until the first dispatch.
    last_rank: u8,
    /// Set by `prepare`; registration is rejected afterwards.
    running: bool,
}

const NO_RANK: u8 = u8::MAX;

// SAFETY: the raw pointers inside (handler contexts, queue buffers) are only
// used under the reactor's interrupt-masking lock or from the single main
// loop.
unsafe impl Send for ReactorState {}

pub struct Reactor {
    inner: IrqMutex<ReactorState>,
}

impl Reactor {
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new(ReactorState {
                slots: [const { None }; MAX_HANDLERS],
                count: 0,
                order: [0; MAX_HANDLERS],
                notifications: 0,
                last_rank: NO_RANK,
                running: false,
            }),
        }
    }

    /// Register a handler.  Only legal before [`run`](Self::run) /
    /// [`prepare`](Self::prepare); the queue slots come from `arena`.
    pub fn register(
        &self,
        arena: &Arena,
        handler: Handler,
        priority: Priority,
        queue_capacity: u8,
    ) -> Handle {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        fault_if!(state.running, FaultCode::RegisterAfterRun);
        fault_if!(
            state.count as usize == MAX_HANDLERS,
            FaultCode::HandlerTableFull
        );

        let index = state.count;
        state.slots[index as usize] = Some(Slot {
            handler,
            priority,
            // Temporary mask so notifications work during init; prepare()
            // remaps it to the handler's rank.
            mask: 1 << index,
            queue: Queue::with_capacity(arena, queue_capacity),
        });
        state.order[index as usize] = index;
        state.count += 1;

        klog_debug!(
            "reactor: handler {} registered, prio {}, queue {}",
            index,
            priority.0,
            queue_capacity
        );
        Handle(index)
    }

    /// Mark `handle` pending and enqueue `payload` for it.
    ///
    /// Callable from any context, including ISRs.  When the handler's queue
    /// is full the oldest payload is dropped silently — for input edges the
    /// newest event is the one that matters.
    pub fn notify(&self, handle: Handle, payload: Payload) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        if let Some(slot) = state.slots[handle.index()].as_mut() {
            state.notifications |= slot.mask;
            slot.queue.push_overwrite(payload);
        }
    }

    /// Freeze registration and establish the dispatch order.
    ///
    /// Sorts handlers by descending priority (stable: ties keep registration
    /// order), assigns each handler's notification bit to its rank, and
    /// remaps any notifications already pending.  Called by [`run`](Self::run);
    /// exposed for callers that drive [`step`](Self::step) themselves.
    pub fn prepare(&self) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let count = state.count as usize;

        // Stable insertion sort of slot indices; the table is small.
        let mut order = [0u8; MAX_HANDLERS];
        for (i, entry) in order.iter_mut().enumerate().take(count) {
            *entry = i as u8;
        }
        let priority_of = |slots: &[Option<Slot>; MAX_HANDLERS], index: u8| {
            slots[index as usize]
                .as_ref()
                .map(|slot| slot.priority)
                .unwrap_or(Priority::IDLE)
        };
        for i in 1..count {
            let mut j = i;
            while j > 0
                && priority_of(&state.slots, order[j - 1]) < priority_of(&state.slots, order[j])
            {
                order.swap(j - 1, j);
                j -= 1;
            }
        }

        // Re-assign masks and shuffle pending notifications to the new bit
        // positions, all inside the same masked section.
        let mut remapped: NotifyMask = 0;
        for (rank, &slot_index) in order.iter().enumerate().take(count) {
            let mask = 1 << rank;
            if let Some(slot) = state.slots[slot_index as usize].as_mut() {
                if state.notifications & slot.mask != 0 {
                    remapped |= mask;
                }
                slot.mask = mask;
            }
        }

        state.order = order;
        state.notifications = remapped;
        state.last_rank = NO_RANK;
        state.running = true;
        klog_debug!("reactor: {} handlers, order frozen", count);
    }

    /// Dispatch at most one payload.
    ///
    /// Pops one payload from the highest-priority pending handler, kicks the
    /// watchdog, and invokes the callback with interrupts enabled.  Returns
    /// `false` when nothing was pending.
    ///
    /// Within one priority tier the pass rotates: the pending handler ranked
    /// just after the previously serviced one goes first, so equal-priority
    /// handlers interleave one payload at a time instead of the lowest rank
    /// draining its whole queue.  A pending handler of a strictly higher
    /// tier always preempts the rotation.
    pub fn step(&self) -> bool {
        let (handler, payload) = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            if state.notifications == 0 {
                return false;
            }

            let rank = Self::pick_rank(state);
            state.last_rank = rank;
            let slot_index = state.order[rank as usize] as usize;
            let Some(slot) = state.slots[slot_index].as_mut() else {
                fault(FaultCode::QueueUnderflow);
            };
            let Some(payload) = slot.queue.try_pop_front() else {
                // A set bit with an empty queue breaks the core invariant.
                fault(FaultCode::QueueUnderflow);
            };
            if slot.queue.is_empty() {
                state.notifications &= !slot.mask;
            }
            (slot.handler, payload)
        };

        // The system is alive for as long as handlers are being dispatched.
        platform::watchdog_reset();
        (handler.func)(handler.context, payload);
        true
    }

    /// Choose the rank to service: the lowest pending bit, unless the
    /// previous pass serviced the same priority tier — then the next pending
    /// rank of that tier (wrapping to its first) takes the turn.
    fn pick_rank(state: &ReactorState) -> u8 {
        let lowest = state.notifications.trailing_zeros() as u8;
        if state.last_rank == NO_RANK {
            return lowest;
        }

        let priority_at = |rank: u8| {
            state.slots[state.order[rank as usize] as usize]
                .as_ref()
                .map(|slot| slot.priority)
                .unwrap_or(Priority::IDLE)
        };
        let tier = priority_at(lowest);
        if state.last_rank as usize >= MAX_HANDLERS || priority_at(state.last_rank) != tier {
            return lowest;
        }

        // Pending ranks strictly after the one serviced last.
        let serviced = ((1u32 << (state.last_rank + 1)) - 1) as NotifyMask;
        let after = state.notifications & !serviced;
        if after != 0 {
            let candidate = after.trailing_zeros() as u8;
            if priority_at(candidate) == tier {
                return candidate;
            }
        }
        lowest
    }

    /// Run the loop forever: dispatch while pending, sleep when idle.
    ///
    /// The sleep hook's contract guarantees that a notification arriving
    /// between the idle check and the sleep entry still wakes the CPU.
    pub fn run(&self) -> ! {
        self.prepare();
        loop {
            if !self.step() {
                platform::cpu_sleep();
            }
        }
    }
}
