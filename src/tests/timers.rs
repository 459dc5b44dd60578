use std::cell::RefCell;
use std::io::ErrorKind;
use std::rc::Rc;
use std::time::Duration;

use crate::pkt::Ctl;
use crate::tests::common::*;
use crate::{ConnFlags, State};

const WIN: u32 = 131072;

fn client_established(unit: &mut TestUnit) -> (crate::ConnId, Sink) {
    let (id, sink) = unit.connect(7, ConnFlags::TCP);
    unit.engine
        .recv(&raw(
            hdr(7, id.local, 4000, 1, WIN, Ctl::SYN | Ctl::ACK),
            &[],
        ))
        .unwrap();
    unit.clear_tx();
    (id, sink)
}

#[test]
fn tick_reports_the_next_deadline() {
    let clock = TestClock::new();
    let mut client = TestUnit::new(&clock);
    let (id, _) = client_established(&mut client);

    // Idle connection: nothing scheduled.
    assert_eq!(client.engine.tick(), Duration::from_secs(3600));

    // Unacknowledged data: the retransmission timer is next, at the
    // initial RTO.
    client.engine.send(id, &[1u8; 100]).unwrap();
    assert_eq!(client.engine.tick(), Duration::from_secs(1));
}

#[test]
fn retransmission_backs_off_to_the_cap() {
    let clock = TestClock::new();
    let mut client = TestUnit::new(&clock);

    let retransmits = Rc::new(RefCell::new(0usize));
    let counter = retransmits.clone();
    client
        .engine
        .set_retransmit_callback(Some(Box::new(move |_id| {
            *counter.borrow_mut() += 1;
        })));

    let (id, _) = client_established(&mut client);
    client.engine.send(id, &[1u8; 100]).unwrap();
    client.clear_tx();

    // 1 s, then 2 s, then 3 s capped.
    for expected_rto in [2_000_000u32, 3_000_000, 3_000_000] {
        let next = client.engine.tick();
        clock.advance(next + Duration::from_millis(1));
        client.engine.tick();
        assert_eq!(client.engine.connection(id).unwrap().rtt.rto, expected_rto);
    }

    assert_eq!(*retransmits.borrow(), 3);
    let pkts = client.take_tx();
    assert_eq!(pkts.len(), 3);
    assert!(pkts.iter().all(|p| decode(p).seq == 1));
}

#[test]
fn silent_peer_times_out_the_connection() {
    let clock = TestClock::new();
    let mut client = TestUnit::new(&clock);
    let (id, sink) = client_established(&mut client);

    client.engine.send(id, &[1u8; 100]).unwrap();

    let mut elapsed = Duration::ZERO;
    for _ in 0..100 {
        let next = client.engine.tick();

        if !sink.borrow().errors.is_empty() {
            break;
        }

        clock.advance(next + Duration::from_millis(1));
        elapsed += next;
    }

    assert_eq!(sink.borrow().errors, vec![ErrorKind::TimedOut]);
    assert_eq!(client.engine.state(id).unwrap(), State::Closed);
    assert!(elapsed <= 2 * Duration::from_secs(60));
}

#[test]
fn progress_rearms_the_connection_deadline() {
    let clock = TestClock::new();
    let mut client = TestUnit::new(&clock);
    let (id, sink) = client_established(&mut client);

    // Acked progress keeps the connection alive well past the timeout.
    for i in 0..10 {
        client.engine.send(id, &[i as u8; 100]).unwrap();
        clock.advance(Duration::from_secs(30));
        client
            .engine
            .recv(&raw(
                hdr(7, id.local, 4001, 1 + (i + 1) * 100, WIN, Ctl::ACK),
                &[],
            ))
            .unwrap();
        client.engine.tick();
    }

    assert_eq!(client.engine.state(id).unwrap(), State::Established);
    assert!(sink.borrow().errors.is_empty());
}

#[test]
fn reset_timers_makes_retransmissions_due_now() {
    let clock = TestClock::new();
    let mut client = TestUnit::new(&clock);
    let (id, _) = client_established(&mut client);

    client.engine.send(id, &[1u8; 100]).unwrap();
    client.clear_tx();

    // Without touching the clock, the timer is forced due.
    client.engine.reset_timers();
    client.engine.tick();

    let pkts = client.take_tx();
    assert_eq!(pkts.len(), 1);
    assert_eq!(decode(&pkts[0]).seq, 1);
}

#[test]
fn expect_data_arms_and_clears_the_deadline() {
    let clock = TestClock::new();
    let mut client = TestUnit::new(&clock);
    let (id, sink) = client_established(&mut client);

    client.engine.expect_data(id, true).unwrap();
    assert!(client.engine.tick() <= Duration::from_secs(60));

    // Nothing unacknowledged, so the deadline may be cleared again.
    client.engine.expect_data(id, false).unwrap();
    assert_eq!(client.engine.tick(), Duration::from_secs(3600));

    clock.advance(Duration::from_secs(120));
    client.engine.tick();
    assert!(sink.borrow().errors.is_empty());
}

#[test]
fn poll_callback_fires_once_per_edge() {
    let clock = TestClock::new();
    let mut client = TestUnit::new(&clock);
    let (id, _) = client_established(&mut client);

    let polls = Rc::new(RefCell::new(Vec::<usize>::new()));
    let log = polls.clone();
    client
        .engine
        .set_poll_callback(
            id,
            Some(Box::new(move |_ctl, room| {
                log.borrow_mut().push(room);
            })),
        )
        .unwrap();

    // Installing the callback on a writable connection primes one edge.
    client.engine.tick();
    assert_eq!(polls.borrow().len(), 1);

    // No new edge, no new callback.
    client.engine.tick();
    assert_eq!(polls.borrow().len(), 1);

    // Acked data frees buffer space: that is an edge.
    client.engine.send(id, &[1u8; 100]).unwrap();
    client
        .engine
        .recv(&raw(hdr(7, id.local, 4001, 101, WIN, Ctl::ACK), &[]))
        .unwrap();
    client.engine.tick();
    assert_eq!(polls.borrow().len(), 2);
    assert_eq!(polls.borrow()[1], 131072);
}
