//! Tests for the reactor: priority order, equal-priority rotation, FIFO
//! delivery, ring-overflow discipline, and lifecycle faults.

use crate::reactor::{Handler, Payload, Priority, Reactor};
use crate::test_fixtures::{EventLog, reactor_world};

fn payload(value: usize) -> Payload {
    Payload::from_usize(value)
}

#[test]
fn higher_priority_runs_first() {
    let (arena, reactor) = reactor_world!();
    static LOG: EventLog = EventLog::new();

    let h1 = reactor.register(arena, LOG.handler(), Priority(10), 4);
    let h2 = reactor.register(arena, LOG.handler(), Priority(20), 4);

    reactor.notify(h1, payload(0xA1));
    reactor.notify(h2, payload(0xB2));
    reactor.prepare();

    assert!(reactor.step());
    assert_eq!(LOG.snapshot(), [0xB2]);
    assert!(reactor.step());
    assert_eq!(LOG.snapshot(), [0xB2, 0xA1]);
    assert!(!reactor.step());
}

#[test]
fn equal_priority_interleaves_one_for_one() {
    let (arena, reactor) = reactor_world!();
    static LOG: EventLog = EventLog::new();

    let h1 = reactor.register(arena, LOG.handler(), Priority(50), 4);
    let h2 = reactor.register(arena, LOG.handler(), Priority(50), 4);

    for v in [1, 2, 3] {
        reactor.notify(h1, payload(v));
    }
    for v in [9, 8, 7] {
        reactor.notify(h2, payload(v));
    }
    reactor.prepare();

    for _ in 0..6 {
        assert!(reactor.step());
    }
    assert_eq!(LOG.snapshot(), [1, 9, 2, 8, 3, 7]);
}

#[test]
fn rotation_never_overtakes_a_higher_tier() {
    let (arena, reactor) = reactor_world!();
    static LOG: EventLog = EventLog::new();

    let low_a = reactor.register(arena, LOG.handler(), Priority(50), 4);
    let low_b = reactor.register(arena, LOG.handler(), Priority(50), 4);
    let high = reactor.register(arena, LOG.handler(), Priority(90), 4);

    reactor.notify(low_a, payload(1));
    reactor.notify(low_b, payload(2));
    reactor.prepare();

    assert!(reactor.step()); // low_a
    // A high-priority payload arrives mid-rotation and must cut in.
    reactor.notify(high, payload(100));
    assert!(reactor.step());
    assert!(reactor.step());
    assert_eq!(LOG.snapshot(), [1, 100, 2]);
}

#[test]
fn payloads_deliver_in_push_order() {
    let (arena, reactor) = reactor_world!();
    static LOG: EventLog = EventLog::new();

    let h = reactor.register(arena, LOG.handler(), Priority(80), 8);
    for v in 1..=5 {
        reactor.notify(h, payload(v));
    }
    reactor.prepare();
    while reactor.step() {}

    assert_eq!(LOG.snapshot(), [1, 2, 3, 4, 5]);
}

#[test]
fn overflow_drops_the_oldest_payloads() {
    let (arena, reactor) = reactor_world!();
    static LOG: EventLog = EventLog::new();

    let h = reactor.register(arena, LOG.handler(), Priority(80), 4);
    for v in 1..=6 {
        reactor.notify(h, payload(v));
    }
    reactor.prepare();
    while reactor.step() {}

    // Exactly the last `capacity` payloads survive, in push order.
    assert_eq!(LOG.snapshot(), [3, 4, 5, 6]);
}

#[test]
fn notifications_posted_before_prepare_are_remapped() {
    let (arena, reactor) = reactor_world!();
    static LOG: EventLog = EventLog::new();

    // Registered low-priority first: the sort must move it behind h2 and
    // carry its pending notification to the new bit position.
    let h1 = reactor.register(arena, LOG.handler(), Priority(10), 2);
    let h2 = reactor.register(arena, LOG.handler(), Priority(200), 2);
    reactor.notify(h1, payload(11));
    reactor.notify(h2, payload(22));

    reactor.prepare();
    while reactor.step() {}
    assert_eq!(LOG.snapshot(), [22, 11]);
}

#[test]
fn plain_function_handlers_dispatch() {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static HITS: AtomicUsize = AtomicUsize::new(0);
    fn bump(payload: Payload) {
        HITS.fetch_add(payload.as_usize(), Ordering::Relaxed);
    }

    let (arena, reactor) = reactor_world!();
    let h = reactor.register(arena, Handler::new(bump), Priority(80), 2);
    reactor.notify(h, payload(3));
    reactor.notify(h, payload(4));
    reactor.prepare();
    while reactor.step() {}

    assert_eq!(HITS.load(Ordering::Relaxed), 7);
}

#[test]
#[should_panic(expected = "register after run")]
fn registering_after_prepare_faults() {
    let (arena, reactor) = reactor_world!();
    static LOG: EventLog = EventLog::new();

    let _ = reactor.register(arena, LOG.handler(), Priority(80), 2);
    reactor.prepare();
    let _ = reactor.register(arena, LOG.handler(), Priority(80), 2);
}

#[test]
#[should_panic(expected = "handler table full")]
fn exceeding_the_handler_table_faults() {
    let (arena, reactor) = reactor_world!();
    static LOG: EventLog = EventLog::new();

    for _ in 0..=crate::reactor::MAX_HANDLERS {
        let _ = reactor.register(arena, LOG.handler(), Priority(80), 1);
    }
}

#[test]
fn the_watchdog_is_kicked_per_dispatch() {
    use core::sync::atomic::{AtomicUsize, Ordering};
    use pneuma_lib::platform::{self, PlatformHooks};

    static KICKS: AtomicUsize = AtomicUsize::new(0);
    fn idle() {}
    fn kick() {
        KICKS.fetch_add(1, Ordering::Relaxed);
    }
    static HOOKS: PlatformHooks = PlatformHooks {
        cpu_sleep: idle,
        watchdog_reset: kick,
    };
    platform::register(&HOOKS);

    let (arena, reactor) = reactor_world!();
    static LOG: EventLog = EventLog::new();
    let h = reactor.register(arena, LOG.handler(), Priority(80), 2);
    reactor.notify(h, payload(1));
    reactor.prepare();

    // The hooks are global, so other tests may kick concurrently; this
    // dispatch still accounts for at least one of the kicks in between.
    let before = KICKS.load(Ordering::Relaxed);
    assert!(reactor.step());
    assert!(KICKS.load(Ordering::Relaxed) > before);
}

#[test]
fn step_reports_idle() {
    let (_, reactor) = reactor_world!();
    static REACTOR_UNUSED: Reactor = Reactor::new();

    reactor.prepare();
    assert!(!reactor.step());
    assert!(!REACTOR_UNUSED.step());
}
