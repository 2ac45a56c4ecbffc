//! Tests for the timer service: deadline precision, firing order, repeat
//! stability, cancellation races, counter rollover, and wheel capacity.

use crate::reactor::{Payload, Priority};
use crate::test_fixtures::{EventLog, advance, timer_world};
use crate::timer::TimerInstance;

fn payload(value: usize) -> Payload {
    Payload::from_usize(value)
}

#[test]
fn one_shot_fires_exactly_at_its_deadline() {
    let (arena, reactor, timer) = timer_world!();
    static LOG: EventLog = EventLog::new();

    let h = reactor.register(arena, LOG.handler(), Priority(80), 4);
    reactor.prepare();

    let _ = timer.arm(h, timer.deadline_in(5), 0, payload(42));
    advance(reactor, timer, 4);
    assert_eq!(LOG.len(), 0);

    advance(reactor, timer, 1);
    assert_eq!(LOG.snapshot(), [42]);
    assert_eq!(timer.pending_count(), 0);

    // Nothing left to fire.
    advance(reactor, timer, 10);
    assert_eq!(LOG.len(), 1);
}

#[test]
fn earlier_deadlines_fire_first_regardless_of_arm_order() {
    let (arena, reactor, timer) = timer_world!();
    static LOG: EventLog = EventLog::new();

    let h = reactor.register(arena, LOG.handler(), Priority(80), 4);
    reactor.prepare();

    let _ = timer.arm(h, timer.deadline_in(10), 0, payload(10));
    let _ = timer.arm(h, timer.deadline_in(5), 0, payload(5));
    advance(reactor, timer, 12);

    assert_eq!(LOG.snapshot(), [5, 10]);
}

#[test]
fn equal_deadlines_fire_in_arm_order() {
    let (arena, reactor, timer) = timer_world!();
    static LOG: EventLog = EventLog::new();

    let h = reactor.register(arena, LOG.handler(), Priority(80), 4);
    reactor.prepare();

    let deadline = timer.deadline_in(3);
    let _ = timer.arm(h, deadline, 0, payload(1));
    let _ = timer.arm(h, deadline, 0, payload(2));
    let _ = timer.arm(h, deadline, 0, payload(3));
    advance(reactor, timer, 3);

    assert_eq!(LOG.snapshot(), [1, 2, 3]);
}

#[test]
fn repeating_timer_with_mid_stream_cancel() {
    let (arena, reactor, timer) = timer_world!();
    static LOG: EventLog = EventLog::new();

    let h = reactor.register(arena, LOG.handler(), Priority(80), 4);
    reactor.prepare();
    advance(reactor, timer, 1000);

    // Armed at tick 1000 for 1005, repeating every 3: fires 1005, 1008, ...
    let instance = timer.arm(h, timer.deadline_in(5), 3, payload(9));
    advance(reactor, timer, 5);
    assert_eq!(LOG.len(), 1);
    advance(reactor, timer, 3);
    assert_eq!(LOG.len(), 2);

    // Tick 1009: 1011 is still pending, so cancel wins and stops the chain.
    advance(reactor, timer, 1);
    assert!(timer.cancel(instance));
    advance(reactor, timer, 20);
    assert_eq!(LOG.len(), 2);
    assert_eq!(timer.pending_count(), 0);
}

#[test]
fn repeat_schedule_is_computed_from_the_previous_deadline() {
    let (arena, reactor, timer) = timer_world!();
    static LOG: EventLog = EventLog::new();

    let h = reactor.register(arena, LOG.handler(), Priority(80), 4);
    reactor.prepare();

    let _ = timer.arm(h, timer.deadline_in(5), 3, payload(1));

    // The dispatch handler is starved until tick 9; both the tick-5 and the
    // tick-8 deadlines must still be honoured when it finally runs.
    for _ in 0..9 {
        timer.on_tick_isr();
    }
    while reactor.step() {}
    assert_eq!(LOG.len(), 2);

    // And the chain continues on the original grid: 11, not 9 + 3.
    advance(reactor, timer, 2);
    assert_eq!(LOG.len(), 3);
}

#[test]
fn cancel_is_a_race_the_fired_timer_wins() {
    let (arena, reactor, timer) = timer_world!();
    static LOG: EventLog = EventLog::new();

    let h = reactor.register(arena, LOG.handler(), Priority(80), 4);
    reactor.prepare();

    let instance = timer.arm(h, timer.deadline_in(2), 0, payload(1));
    advance(reactor, timer, 3);

    assert_eq!(LOG.len(), 1);
    assert!(!timer.cancel(instance));
    assert!(!timer.cancel(TimerInstance::INVALID));
}

#[test]
fn cancelled_before_fire_never_delivers() {
    let (arena, reactor, timer) = timer_world!();
    static LOG: EventLog = EventLog::new();

    let h = reactor.register(arena, LOG.handler(), Priority(80), 4);
    reactor.prepare();

    let keep = timer.arm(h, timer.deadline_in(4), 0, payload(4));
    let drop = timer.arm(h, timer.deadline_in(2), 0, payload(2));
    assert!(timer.cancel(drop));
    assert_eq!(timer.pending_count(), 1);

    advance(reactor, timer, 6);
    assert_eq!(LOG.snapshot(), [4]);
    let _ = keep;
}

#[test]
fn deadlines_across_counter_rollover_sort_correctly() {
    let (arena, reactor, timer) = timer_world!();
    static LOG: EventLog = EventLog::new();

    let h = reactor.register(arena, LOG.handler(), Priority(80), 4);
    reactor.prepare();

    timer.set_now(u32::MAX - 2);
    // Both deadlines land past the 32-bit rollover.
    let _ = timer.arm(h, timer.deadline_in(8), 0, payload(8));
    let _ = timer.arm(h, timer.deadline_in(4), 0, payload(4));

    advance(reactor, timer, 4);
    assert_eq!(LOG.snapshot(), [4]);
    advance(reactor, timer, 4);
    assert_eq!(LOG.snapshot(), [4, 8]);
}

#[test]
fn elapsed_since_spans_rollover() {
    let (_, _, timer) = timer_world!();
    timer.set_now(u32::MAX - 1);
    let mark = timer.now();
    timer.on_tick_isr();
    timer.on_tick_isr();
    timer.on_tick_isr();
    assert_eq!(timer.elapsed_since(mark), 3);
}

#[test]
#[should_panic(expected = "timer wheel full")]
fn overfilling_the_wheel_faults() {
    let (arena, reactor, timer) = timer_world!();
    static LOG: EventLog = EventLog::new();

    let h = reactor.register(arena, LOG.handler(), Priority(80), 4);
    reactor.prepare();

    for i in 0..=crate::timer::MAX_FUTURES as u32 {
        let _ = timer.arm(h, timer.deadline_in(100 + i), 0, Payload::NONE);
    }
}
