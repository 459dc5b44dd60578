use std::time::Duration;

use crate::pkt::Ctl;
use crate::tests::common::*;
use crate::{ConnFlags, State};

const WIN: u32 = 131072;

fn client_established(unit: &mut TestUnit) -> crate::ConnId {
    let (id, _) = unit.connect(7, ConnFlags::TCP);
    unit.engine
        .recv(&raw(
            hdr(7, id.local, 4000, 1, WIN, Ctl::SYN | Ctl::ACK),
            &[],
        ))
        .unwrap();
    assert_eq!(unit.engine.state(id).unwrap(), State::Established);
    unit.clear_tx();
    id
}

#[test]
fn slow_start_grows_by_acked_segments() {
    let clock = TestClock::new();
    let mut client = TestUnit::new(&clock);
    let id = client_established(&mut client);

    // Initial window: four segments, plus the handshake ACK's one byte.
    let base: u32 = 4 * 980 + 1;
    assert_eq!(client.engine.connection(id).unwrap().cong.cwnd, base);

    client.engine.send(id, &vec![1u8; 1960]).unwrap();
    client.clear_tx();

    client
        .engine
        .recv(&raw(hdr(7, id.local, 4001, 981, WIN, Ctl::ACK), &[]))
        .unwrap();
    assert_eq!(client.engine.connection(id).unwrap().cong.cwnd, base + 980);

    client
        .engine
        .recv(&raw(hdr(7, id.local, 4001, 1961, WIN, Ctl::ACK), &[]))
        .unwrap();
    assert_eq!(
        client.engine.connection(id).unwrap().cong.cwnd,
        base + 2 * 980
    );
}

#[test]
fn timeout_collapses_window_to_one_segment() {
    let clock = TestClock::new();
    let mut client = TestUnit::new(&clock);
    let id = client_established(&mut client);

    client.engine.send(id, &vec![1u8; 980]).unwrap();
    client.clear_tx();

    clock.advance(Duration::from_millis(1100));
    client.engine.tick();

    // One segment in flight: ssthresh floors at two segments.
    let conn = client.engine.connection(id).unwrap();
    assert_eq!(conn.cong.cwnd, 980);
    assert_eq!(conn.cong.ssthresh, 2 * 980);
    assert_eq!(conn.rtt.rto, 2_000_000);

    // The retransmission went out again from snd.una.
    let pkts = client.take_tx();
    assert_eq!(pkts.len(), 1);
    assert_eq!(decode(&pkts[0]).seq, 1);
    assert_eq!(payload_of(&pkts[0]).len(), 980);
}

#[test]
fn three_duplicate_acks_halve_into_fast_recovery() {
    let clock = TestClock::new();
    let mut client = TestUnit::new(&clock);
    let id = client_established(&mut client);

    client.engine.send(id, &vec![1u8; 4900]).unwrap();

    // The initial window rounds down to four whole segments.
    let pkts = client.take_tx();
    assert_eq!(pkts.len(), 4);

    let dup = raw(hdr(7, id.local, 4001, 1, WIN, Ctl::ACK), &[]);
    client.engine.recv(&dup).unwrap();
    client.engine.recv(&dup).unwrap();
    assert!(client.take_tx().is_empty());
    assert_eq!(client.engine.connection(id).unwrap().cong.dupack, 2);

    // The third duplicate retransmits the lost segment and inflates the
    // window, letting one new segment out as well.
    client.engine.recv(&dup).unwrap();

    {
        let conn = client.engine.connection(id).unwrap();
        assert_eq!(conn.cong.ssthresh, 1960);
        assert_eq!(conn.cong.cwnd, 1960 + 3 * 980);
    }

    let pkts = client.take_tx();
    assert_eq!(pkts.len(), 2);
    assert_eq!(decode(&pkts[0]).seq, 1);
    assert_eq!(payload_of(&pkts[0]).len(), 980);
    assert_eq!(decode(&pkts[1]).seq, 3921);

    // Every further duplicate inflates by one more segment.
    client.engine.recv(&dup).unwrap();
    assert_eq!(client.engine.connection(id).unwrap().cong.cwnd, 1960 + 4 * 980);

    // A real advance deflates back to ssthresh, then grows additively.
    client
        .engine
        .recv(&raw(hdr(7, id.local, 4001, 3921, WIN, Ctl::ACK), &[]))
        .unwrap();

    let conn = client.engine.connection(id).unwrap();
    assert_eq!(conn.cong.dupack, 0);
    assert_eq!(conn.cong.cwnd, 1960 + 490);
}
