//! Shared fixtures for the driver tests: a simulated GPIO port, a payload
//! recorder, and the tick-then-drain loop driver.  Each test builds its
//! world from function-local statics so the parallel harness never shares
//! state between tests.

use std::sync::Mutex;
use std::vec::Vec;

use pneuma_core::reactor::{Handler, Payload, Reactor};
use pneuma_core::timer::TimerService;
use pneuma_lib::pin::{Pin, PortIo, Sense};

pub const TEST_PINS: usize = 16;

/// In-memory GPIO port: levels and sense configs live in arrays, and every
/// `write`/`toggle` is journalled so tests can assert the drive sequence.
pub struct TestPort {
    levels: Mutex<[bool; TEST_PINS]>,
    senses: Mutex<[Sense; TEST_PINS]>,
    writes: Mutex<Vec<(u8, bool)>>,
}

impl TestPort {
    pub const fn new() -> Self {
        Self {
            levels: Mutex::new([false; TEST_PINS]),
            senses: Mutex::new([Sense::Disabled; TEST_PINS]),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Set the level an input pin will read back.
    pub fn drive_input(&self, pin: Pin, level: bool) {
        self.levels.lock().unwrap()[pin.raw() as usize] = level;
    }

    pub fn sense(&self, pin: Pin) -> Sense {
        self.senses.lock().unwrap()[pin.raw() as usize]
    }

    pub fn level(&self, pin: Pin) -> bool {
        self.levels.lock().unwrap()[pin.raw() as usize]
    }

    /// Chronological `(pin, level)` journal of all output writes.
    pub fn writes(&self) -> Vec<(u8, bool)> {
        self.writes.lock().unwrap().clone()
    }
}

impl PortIo for TestPort {
    fn read(&self, pin: Pin) -> bool {
        self.levels.lock().unwrap()[pin.raw() as usize]
    }

    fn write(&self, pin: Pin, level: bool) {
        self.levels.lock().unwrap()[pin.raw() as usize] = level;
        self.writes.lock().unwrap().push((pin.raw(), level));
    }

    fn set_sense(&self, pin: Pin, sense: Sense) {
        self.senses.lock().unwrap()[pin.raw() as usize] = sense;
    }
}

/// Records every payload delivered to handlers created from it.
pub struct EventLog {
    events: Mutex<Vec<usize>>,
}

impl EventLog {
    pub const fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

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

/// Fire `ticks` timer interrupts, draining the reactor after each one.
pub fn advance(reactor: &Reactor, timer: &TimerService, ticks: u32) {
    for _ in 0..ticks {
        timer.on_tick_isr();
        while reactor.step() {}
    }
}

/// Arena + reactor + initialized timer + simulated port, all private to the
/// enclosing test function.
macro_rules! driver_world {
    () => {{
        static BACKING: pneuma_lib::arena::ArenaBacking<8192> =
            pneuma_lib::arena::ArenaBacking::new();
        static ARENA: pneuma_lib::arena::Arena = pneuma_lib::arena::Arena::new();
        static REACTOR: pneuma_core::reactor::Reactor = pneuma_core::reactor::Reactor::new();
        static TIMER: pneuma_core::timer::TimerService = pneuma_core::timer::TimerService::new();
        static PORT: $crate::test_fixtures::TestPort = $crate::test_fixtures::TestPort::new();
        let (ptr, len) = BACKING.as_region();
        // SAFETY: the backing is exclusive to this test function.
        unsafe { ARENA.init(ptr, len) };
        TIMER.init(&ARENA, &REACTOR);
        (&ARENA, &REACTOR, &TIMER, &PORT)
    }};
}

pub(crate) use driver_world;
