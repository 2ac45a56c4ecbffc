//! Digital output sequencer.
//!
//! An output either follows direct `set`/`toggle` calls or plays a compact
//! ASCII sequence, one step per timer fire.  The grammar:
//!
//! - whitespace is ignored
//! - `+` drives the pin high, `-` low, `X` toggles
//! - an optional digit `0`–`8` right after a level token sets the duration
//!   exponent: the step lasts `reference_period >> digit` ticks.  With no
//!   digit the previous exponent carries over (it persists across restarts
//!   and across `start` calls).
//! - anything else is skipped silently and the sequence continues
//!
//! Playback runs through one shared reactor handler: apply a token, arm a
//! one-shot timer for the step's duration, repeat.  On end-of-string the
//! cursor wraps when `repeat` was requested, otherwise playback stops.
//!
//! Every state-changing call cancels the running timer **and** bumps a
//! generation counter carried in the step payload, so a step notification
//! already in flight when its sequence was replaced is recognised as stale
//! and dropped (the cancel-race rule: a fired timer's payload may already
//! sit in the queue).

use pneuma_core::reactor::{Handle, Handler, Payload, Priority, Reactor};
use pneuma_core::timer::{Tick, TimerInstance, TimerService};
use pneuma_lib::arena::Arena;
use pneuma_lib::fault::{FaultCode, fault};
use pneuma_lib::irqlock::IrqMutex;
use pneuma_lib::pin::{Pin, PortIo};
use pneuma_lib::{fault_if, klog_debug};
use spin::Once;

/// Size of the output table, and the step handler's queue depth.
pub const MAX_OUTPUTS: usize = 8;

/// Reactor priority of the step handler.
pub const STEP_PRIO: Priority = Priority::MEDIUM;

/// Identifier of one declared output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputHandle(u8);

/// What a parsed token does to the pin.
#[derive(Clone, Copy)]
enum Action {
    Set(bool),
    Toggle,
}

#[derive(Clone, Copy)]
struct OutputState {
    pin: Pin,
    /// Full-length step duration; each step lasts `reference_ms >> shift`.
    reference_ms: Tick,
    /// Current duration exponent.  Persists until a digit changes it.
    shift: u8,
    sequence: Option<&'static str>,
    /// Byte offset of the next unparsed character.
    cursor: usize,
    repeat: bool,
    /// Timer backing the pending step; `INVALID` when idle.
    timer: TimerInstance,
    /// Validity token for in-flight step payloads.
    generation: u8,
}

struct OutputTable {
    outputs: [Option<OutputState>; MAX_OUTPUTS],
    count: u8,
}

struct OutputDeps {
    reactor: &'static Reactor,
    timer: &'static TimerService,
    port: &'static dyn PortIo,
    step: Handle,
}

pub struct DigitalOutputService {
    table: IrqMutex<OutputTable>,
    deps: Once<OutputDeps>,
}

impl DigitalOutputService {
    pub const fn new() -> Self {
        Self {
            table: IrqMutex::new(OutputTable {
                outputs: [const { None }; MAX_OUTPUTS],
                count: 0,
            }),
            deps: Once::new(),
        }
    }

    /// Register the shared step handler.  Call once during init, after the
    /// timer service's own `init`.
    pub fn init(
        &'static self,
        arena: &Arena,
        reactor: &'static Reactor,
        timer: &'static TimerService,
        port: &'static dyn PortIo,
    ) {
        let step = reactor.register(
            arena,
            Handler::with_context(step_trampoline, self as *const Self as *mut ()),
            STEP_PRIO,
            MAX_OUTPUTS as u8,
        );
        self.deps.call_once(|| OutputDeps {
            reactor,
            timer,
            port,
            step,
        });
    }

    fn deps(&self) -> &OutputDeps {
        match self.deps.get() {
            Some(deps) => deps,
            None => fault(FaultCode::ServiceUninitialized),
        }
    }

    /// Declare an output.  Does not touch the pin.
    pub fn declare(&self, pin: Pin) -> OutputHandle {
        let mut table = self.table.lock();
        fault_if!(
            table.count as usize == MAX_OUTPUTS,
            FaultCode::OutputTableFull
        );
        let index = table.count;
        table.outputs[index as usize] = Some(OutputState {
            pin,
            reference_ms: 0,
            shift: 0,
            sequence: None,
            cursor: 0,
            repeat: false,
            timer: TimerInstance::INVALID,
            generation: 0,
        });
        table.count += 1;
        klog_debug!("digital_output: pin {}:{} declared", pin.port(), pin.bit());
        OutputHandle(index)
    }

    /// Stop any running sequence and drive the pin to `level`.
    pub fn set(&self, handle: OutputHandle, level: bool) {
        let deps = self.deps();
        let pin = {
            let mut table = self.table.lock();
            let Some(state) = table.outputs[handle.0 as usize].as_mut() else {
                return;
            };
            Self::stop_sequence(deps, state);
            state.pin
        };
        deps.port.write(pin, level);
    }

    /// Stop any running sequence and invert the pin.
    pub fn toggle(&self, handle: OutputHandle) {
        let deps = self.deps();
        let pin = {
            let mut table = self.table.lock();
            let Some(state) = table.outputs[handle.0 as usize].as_mut() else {
                return;
            };
            Self::stop_sequence(deps, state);
            state.pin
        };
        deps.port.toggle(pin);
    }

    /// Play `sequence` with full-step duration `reference_ms`, replacing any
    /// running sequence.  The first step applies immediately.
    ///
    /// No copy of the string is taken; `'static` keeps it alive for as long
    /// as the playback may run.
    pub fn start(&self, handle: OutputHandle, reference_ms: Tick, sequence: &'static str, repeat: bool) {
        let deps = self.deps();
        let generation = {
            let mut table = self.table.lock();
            let Some(state) = table.outputs[handle.0 as usize].as_mut() else {
                return;
            };
            Self::stop_sequence(deps, state);
            state.sequence = Some(sequence);
            state.cursor = 0;
            state.repeat = repeat;
            state.reference_ms = reference_ms;
            state.generation
        };
        self.step_output(handle.0, generation);
    }

    /// Cancel the pending step timer and invalidate in-flight step payloads.
    fn stop_sequence(deps: &OutputDeps, state: &mut OutputState) {
        if state.timer.is_valid() {
            let _ = deps.timer.cancel(state.timer);
            state.timer = TimerInstance::INVALID;
        }
        state.sequence = None;
        state.generation = state.generation.wrapping_add(1);
    }

    /// Apply the next token of `index`'s sequence and re-arm for the step's
    /// duration.  Runs from `start` and from every step-timer fire.
    fn step_output(&self, index: u8, generation: u8) {
        let deps = self.deps();
        let (pin, action) = {
            let mut table = self.table.lock();
            let Some(state) = table.outputs[index as usize].as_mut() else {
                return;
            };
            // A stale fire from a sequence that was since replaced.
            if state.generation != generation {
                return;
            }
            let Some(sequence) = state.sequence else {
                return;
            };

            let Some(step) = parse_next(sequence, &mut state.cursor, &mut state.shift, state.repeat)
            else {
                // End of a non-repeating sequence (or nothing playable).
                state.sequence = None;
                state.timer = TimerInstance::INVALID;
                return;
            };

            let duration = state.reference_ms >> step.shift;
            state.timer = deps.timer.arm(
                deps.step,
                deps.timer.deadline_in(duration),
                0,
                pack_step(index, generation),
            );
            (state.pin, step.action)
        };

        match action {
            Action::Set(level) => deps.port.write(pin, level),
            Action::Toggle => deps.port.toggle(pin),
        }
    }
}

/// One parsed playback step.
struct Step {
    action: Action,
    shift: u8,
}

/// Scan for the next level token from `cursor`, updating `cursor` and
/// `shift`.  Returns `None` at end-of-string (after wrapping once when
/// `repeat` is set — a second wrap means nothing in the string is playable).
fn parse_next(sequence: &str, cursor: &mut usize, shift: &mut u8, repeat: bool) -> Option<Step> {
    let bytes = sequence.as_bytes();
    let mut wrapped = false;

    loop {
        if *cursor >= bytes.len() {
            if repeat && !wrapped {
                wrapped = true;
                *cursor = 0;
                continue;
            }
            return None;
        }

        let token = bytes[*cursor];
        *cursor += 1;

        let action = match token {
            b'+' => Action::Set(true),
            b'-' => Action::Set(false),
            b'X' => Action::Toggle,
            // A bare digit re-programs the duration exponent for later
            // steps; anything else (whitespace included) is skipped.
            b'0'..=b'8' => {
                *shift = token - b'0';
                continue;
            }
            _ => continue,
        };

        // An immediately following digit scales this and later steps.
        if *cursor < bytes.len() {
            let digit = bytes[*cursor];
            if digit.is_ascii_digit() && digit <= b'8' {
                *shift = digit - b'0';
                *cursor += 1;
            }
        }

        return Some(Step {
            action,
            shift: *shift,
        });
    }
}

const fn pack_step(index: u8, generation: u8) -> Payload {
    Payload::from_usize(index as usize | (generation as usize) << 8)
}

fn step_trampoline(context: *mut (), payload: Payload) {
    // SAFETY: `init` registered this handler with `&'static self`.
    let service = unsafe { &*(context as *const DigitalOutputService) };
    let raw = payload.as_usize();
    service.step_output((raw & 0xFF) as u8, (raw >> 8 & 0xFF) as u8);
}
