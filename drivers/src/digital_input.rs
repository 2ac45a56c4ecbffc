//! Digital input service: edge-triggered and sampled pins over the reactor.
//!
//! Two acquisition paths share one record table:
//!
//! 1. **Direct** — the pin's hardware change sense raises a port interrupt.
//!    The ISR entry point marks the pin "pending acknowledge", disables its
//!    sense so a bouncing contact cannot storm, and defers to a dispatch
//!    handler in main context.  The dispatch handler notifies the owner and
//!    schedules the acknowledge: after the input's filter time (or at once
//!    when the filter is zero) the pending bit is cleared and the sense
//!    re-enabled, atomically.  Every edge therefore costs one interrupt,
//!    and consecutive notifications for one pin are at least `filter` ticks
//!    apart.
//!
//! 2. **Sampled** — a repeating timer walks the sampled records every
//!    [`SAMPLE_PERIOD_MS`] and integrates each pin level: samples that
//!    disagree with the reported level charge the integrator, an agreeing
//!    sample discharges it.  The reported level flips only after a full
//!    threshold's worth of *consecutive* disagreeing samples, so a glitch
//!    shorter than the filter time never surfaces and never shortens a
//!    later transition.
//!
//! Handlers receive a [`PinEvent`] packed into the payload word.

use pneuma_core::reactor::{Handle, Handler, Payload, Priority, Reactor};
use pneuma_core::timer::{Tick, TimerService};
use pneuma_lib::arena::Arena;
use pneuma_lib::fault::{FaultCode, fault};
use pneuma_lib::irqlock::IrqMutex;
use pneuma_lib::pin::{Pin, PortIo, Sense};
use pneuma_lib::{fault_if, klog_debug};
use spin::Once;

/// Size of the input record table.
pub const MAX_INPUTS: usize = 16;

/// Ports with change-interrupt support.
pub const NUM_PORTS: usize = 2;

/// Period of the shared sampling timer.
pub const SAMPLE_PERIOD_MS: Tick = 5;

/// Reactor priority of the sampling handler.
pub const SAMPLE_PRIO: Priority = Priority::MEDIUM_PLUS;

/// Reactor priority of the direct dispatch and acknowledge handlers.
pub const ACK_PRIO: Priority = Priority::VERY_HIGH_MINUS;

/// Identifier of one declared input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputHandle(u8);

/// Pin plus level, packed into one payload word: the low byte carries the
/// pin, bit 8 the level.  The common packing for every input notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PinEvent {
    pub pin: Pin,
    pub level: bool,
}

impl PinEvent {
    pub const fn to_payload(self) -> Payload {
        Payload::from_usize(self.pin.raw() as usize | (self.level as usize) << 8)
    }

    pub const fn from_payload(payload: Payload) -> Self {
        let raw = payload.as_usize();
        Self {
            pin: Pin::from_raw((raw & 0xFF) as u8),
            level: raw & (1 << 8) != 0,
        }
    }
}

#[derive(Clone, Copy)]
enum Kind {
    Direct {
        sense: Sense,
        /// Minimum ticks between two notifications for this pin.
        filter: Tick,
    },
    Sampled {
        /// Consecutive samples disagreeing with `level`.
        integrator: u8,
        threshold: u8,
        /// Last reported logical level.
        level: bool,
    },
}

#[derive(Clone, Copy)]
struct InputRecord {
    pin: Pin,
    /// Owner to notify on change; `None` for declare-only pins.
    handler: Option<Handle>,
    kind: Kind,
}

struct InputTable {
    records: [Option<InputRecord>; MAX_INPUTS],
    count: u8,
    /// Per-port mask of pins whose interrupt fired and whose acknowledge has
    /// not run yet.  Bits here suppress re-delivery and hardware re-arming.
    pending_ack: [u8; NUM_PORTS],
}

struct InputDeps {
    reactor: &'static Reactor,
    timer: &'static TimerService,
    port: &'static dyn PortIo,
    /// Main-context handler for ISR-detected edges.
    dispatch: Handle,
    /// Handler that re-arms a pin after its filter time.
    ack: Handle,
}

pub struct DigitalInputService {
    table: IrqMutex<InputTable>,
    deps: Once<InputDeps>,
}

impl DigitalInputService {
    pub const fn new() -> Self {
        Self {
            table: IrqMutex::new(InputTable {
                records: [const { None }; MAX_INPUTS],
                count: 0,
                pending_ack: [0; NUM_PORTS],
            }),
            deps: Once::new(),
        }
    }

    /// Register the service's reactor handlers and start the sampling timer.
    /// Call once during init, after the timer service's own `init`.
    pub fn init(
        &'static self,
        arena: &Arena,
        reactor: &'static Reactor,
        timer: &'static TimerService,
        port: &'static dyn PortIo,
    ) {
        let context = self as *const Self as *mut ();
        let sample = reactor.register(
            arena,
            Handler::with_context(sample_trampoline, context),
            SAMPLE_PRIO,
            1,
        );
        // Deep enough that a simultaneous edge on every declared pin still
        // reaches dispatch — a dropped dispatch would leave its pin disabled
        // with no acknowledge ever coming.
        let dispatch = reactor.register(
            arena,
            Handler::with_context(dispatch_trampoline, context),
            ACK_PRIO,
            MAX_INPUTS as u8,
        );
        let ack = reactor.register(
            arena,
            Handler::with_context(ack_trampoline, context),
            ACK_PRIO,
            MAX_INPUTS as u8,
        );
        self.deps.call_once(|| InputDeps {
            reactor,
            timer,
            port,
            dispatch,
            ack,
        });

        let _ = timer.arm(sample, timer.deadline_in(SAMPLE_PERIOD_MS), SAMPLE_PERIOD_MS, Payload::NONE);
    }

    fn deps(&self) -> &InputDeps {
        match self.deps.get() {
            Some(deps) => deps,
            None => fault(FaultCode::ServiceUninitialized),
        }
    }

    /// Declare an edge-triggered input.
    ///
    /// `handler` (if any) is notified with a [`PinEvent`] on every accepted
    /// edge.  `filter` is the minimum number of ticks between two accepted
    /// edges; 0 re-arms the pin immediately (beware chattering contacts).
    pub fn declare_direct(
        &self,
        pin: Pin,
        handler: Option<Handle>,
        sense: Sense,
        filter: Tick,
    ) -> InputHandle {
        let deps = self.deps();
        let handle = self.push_record(InputRecord {
            pin,
            handler,
            kind: Kind::Direct { sense, filter },
        });
        if sense != Sense::Disabled {
            deps.port.set_sense(pin, sense);
        }
        klog_debug!(
            "digital_input: direct pin {}:{} filter {}",
            pin.port(),
            pin.bit(),
            filter
        );
        handle
    }

    /// Declare a sampled input.
    ///
    /// The reported level follows the pin only after `filter_ms` of agreeing
    /// samples; `handler` (if any) is notified on each reported transition.
    pub fn declare_sampled(&self, pin: Pin, handler: Option<Handle>, filter_ms: Tick) -> InputHandle {
        let _ = self.deps();
        // A filter shorter than one sample period still integrates once.
        let threshold = (filter_ms / SAMPLE_PERIOD_MS).max(1) as u8;
        let handle = self.push_record(InputRecord {
            pin,
            handler,
            kind: Kind::Sampled {
                integrator: 0,
                threshold,
                level: false,
            },
        });
        klog_debug!(
            "digital_input: sampled pin {}:{} threshold {}",
            pin.port(),
            pin.bit(),
            threshold
        );
        handle
    }

    /// Last reported level of a sampled input.  Direct inputs do not expose
    /// a level; they read as `false`.
    pub fn value(&self, handle: InputHandle) -> bool {
        let table = self.table.lock();
        match table.records[handle.0 as usize] {
            Some(InputRecord {
                kind: Kind::Sampled { level, .. },
                ..
            }) => level,
            _ => false,
        }
    }

    /// Port-change interrupt entry point.  **ISR context.**
    ///
    /// The board ISR reads the port's input register (`port_value`) and its
    /// interrupt-flag register (`int_flags`), calls this, then clears the
    /// hardware flags with its platform's write-1-to-clear idiom.
    ///
    /// Flag bits whose acknowledge is still outstanding are suppressed here —
    /// that absorbs both contact bounce re-fires and spurious interrupts.
    pub fn on_port_change_isr(&self, port: u8, port_value: u8, int_flags: u8) {
        let Some(deps) = self.deps.get() else {
            return;
        };
        let mut table = self.table.lock();

        let pending = table.pending_ack[port as usize];
        let mut fresh = int_flags & !pending;
        table.pending_ack[port as usize] |= fresh;

        let mut bit = 0u8;
        while fresh != 0 {
            if fresh & 1 != 0 {
                let pin = Pin::new(port, bit);
                // No re-interrupt until the acknowledge re-arms the sense.
                deps.port.set_sense(pin, Sense::Disabled);
                let event = PinEvent {
                    pin,
                    level: port_value & pin.mask() != 0,
                };
                deps.reactor.notify(deps.dispatch, event.to_payload());
            }
            fresh >>= 1;
            bit += 1;
        }
    }

    fn push_record(&self, record: InputRecord) -> InputHandle {
        let mut table = self.table.lock();
        fault_if!(table.count as usize == MAX_INPUTS, FaultCode::InputTableFull);
        let index = table.count;
        table.records[index as usize] = Some(record);
        table.count += 1;
        InputHandle(index)
    }

    /// Main-context half of the direct path: notify the owner, then arm (or
    /// perform) the acknowledge.
    fn dispatch_direct(&self, payload: Payload) {
        let deps = self.deps();
        let event = PinEvent::from_payload(payload);

        let found = {
            let table = self.table.lock();
            let mut found = None;
            for index in 0..table.count {
                if let Some(record) = &table.records[index as usize] {
                    if record.pin == event.pin {
                        if let Kind::Direct { filter, .. } = record.kind {
                            found = Some((index, record.handler, filter));
                            break;
                        }
                    }
                }
            }
            found
        };

        // An edge on a pin nobody declared stays parked in the pending mask,
        // which quietly absorbs further spurious interrupts from it.
        let Some((index, handler, filter)) = found else {
            return;
        };

        if let Some(handler) = handler {
            deps.reactor.notify(handler, payload);
        }

        if filter > 0 {
            let _ = deps.timer.arm(
                deps.ack,
                deps.timer.deadline_in(filter),
                0,
                Payload::from_usize(index as usize),
            );
        } else {
            self.acknowledge(index);
        }
    }

    /// Clear the pending bit and re-enable the sense, atomically.
    fn acknowledge(&self, index: u8) {
        let deps = self.deps();
        let mut table = self.table.lock();
        if let Some(InputRecord {
            pin,
            kind: Kind::Direct { sense, .. },
            ..
        }) = table.records[index as usize]
        {
            table.pending_ack[pin.port() as usize] &= !pin.mask();
            deps.port.set_sense(pin, sense);
        }
    }

    /// Walk the sampled records once; runs every [`SAMPLE_PERIOD_MS`].
    fn sample(&self) {
        let deps = self.deps();
        let mut table = self.table.lock();

        for index in 0..table.count as usize {
            let Some(record) = table.records[index].as_mut() else {
                continue;
            };
            let Kind::Sampled {
                ref mut integrator,
                threshold,
                ref mut level,
            } = record.kind
            else {
                continue;
            };

            let previous = *level;
            if deps.port.read(record.pin) != *level {
                *integrator += 1;
                if *integrator >= threshold {
                    *level = !*level;
                    *integrator = 0;
                }
            } else {
                *integrator = 0;
            }

            if *level != previous {
                if let Some(handler) = record.handler {
                    let event = PinEvent {
                        pin: record.pin,
                        level: *level,
                    };
                    deps.reactor.notify(handler, event.to_payload());
                }
            }
        }
    }
}

fn sample_trampoline(context: *mut (), _payload: Payload) {
    // SAFETY: `init` registered this handler with `&'static self`.
    let service = unsafe { &*(context as *const DigitalInputService) };
    service.sample();
}

fn dispatch_trampoline(context: *mut (), payload: Payload) {
    // SAFETY: `init` registered this handler with `&'static self`.
    let service = unsafe { &*(context as *const DigitalInputService) };
    service.dispatch_direct(payload);
}

fn ack_trampoline(context: *mut (), payload: Payload) {
    // SAFETY: `init` registered this handler with `&'static self`.
    let service = unsafe { &*(context as *const DigitalInputService) };
    service.acknowledge(payload.as_usize() as u8);
}
