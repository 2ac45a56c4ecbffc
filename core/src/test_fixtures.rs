//! Shared fixtures for reactor and timer tests.
//!
//! Each test builds its own private world out of function-local statics, so
//! the parallel test harness never shares runtime state between tests.

use std::sync::Mutex;
use std::vec::Vec;

use crate::reactor::{Handler, Payload, Reactor};
use crate::timer::TimerService;

/// Records every payload delivered to handlers created from it, in delivery
/// order.  Registering several handlers against one log captures the global
/// dispatch order; distinct payload values tell the handlers apart.
pub struct EventLog {
    events: Mutex<Vec<usize>>,
}

impl EventLog {
    pub const fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// A reactor handler that appends each payload to this log.
    pub fn handler(&'static self) -> Handler {
        Handler::with_context(record, self as *const Self as *mut ())
    }

    pub fn snapshot(&self) -> Vec<usize> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

fn record(context: *mut (), payload: Payload) {
    // SAFETY: `EventLog::handler` binds `&'static self` as the context.
    let log = unsafe { &*(context as *const EventLog) };
    log.events.lock().unwrap().push(payload.as_usize());
}

/// Fire `ticks` timer interrupts, draining the reactor after each one —
/// the per-test stand-in for the board's 1 ms ISR plus the main loop.
pub fn advance(reactor: &Reactor, timer: &TimerService, ticks: u32) {
    for _ in 0..ticks {
        timer.on_tick_isr();
        while reactor.step() {}
    }
}

/// Arena + reactor statics private to the enclosing test function.
macro_rules! reactor_world {
    () => {{
        static BACKING: pneuma_lib::arena::ArenaBacking<4096> =
            pneuma_lib::arena::ArenaBacking::new();
        static ARENA: pneuma_lib::arena::Arena = pneuma_lib::arena::Arena::new();
        static REACTOR: $crate::reactor::Reactor = $crate::reactor::Reactor::new();
        let (ptr, len) = BACKING.as_region();
        // SAFETY: the backing is exclusive to this test function.
        unsafe { ARENA.init(ptr, len) };
        (&ARENA, &REACTOR)
    }};
}

/// Arena + reactor + initialized timer service.
macro_rules! timer_world {
    () => {{
        let (arena, reactor) = $crate::test_fixtures::reactor_world!();
        static TIMER: $crate::timer::TimerService = $crate::timer::TimerService::new();
        TIMER.init(arena, reactor);
        (arena, reactor, &TIMER)
    }};
}

pub(crate) use {reactor_world, timer_world};
