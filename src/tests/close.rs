use std::io::ErrorKind;
use std::net::Shutdown;
use std::time::Duration;

use crate::pkt::Ctl;
use crate::tests::common::*;
use crate::{ConnFlags, State};

const WIN: u32 = 131072;

#[test]
fn orderly_close_both_ways() {
    let clock = TestClock::new();
    let mut client = TestUnit::new(&clock);
    let mut server = TestUnit::new(&clock);
    let (cid, csink, sid, ssink) = establish(&mut client, &mut server, ConnFlags::TCP);

    client.engine.send(cid, b"hello").unwrap();
    client.pipe(&mut server);
    server.pipe(&mut client);
    assert_eq!(ssink.borrow().data, b"hello");

    // Client closes its write side: FIN out, peer sees EOF.
    client.engine.shutdown(cid, Shutdown::Write).unwrap();
    assert_eq!(client.engine.state(cid).unwrap(), State::FinWait1);

    client.pipe(&mut server);
    assert_eq!(server.engine.state(sid).unwrap(), State::CloseWait);
    assert!(ssink.borrow().eof);

    server.pipe(&mut client);
    assert_eq!(client.engine.state(cid).unwrap(), State::FinWait2);

    // Server closes too.
    server.engine.shutdown(sid, Shutdown::Write).unwrap();
    assert_eq!(server.engine.state(sid).unwrap(), State::Closing);

    server.pipe(&mut client);
    assert_eq!(client.engine.state(cid).unwrap(), State::TimeWait);
    assert!(csink.borrow().eof);

    client.pipe(&mut server);
    assert_eq!(server.engine.state(sid).unwrap(), State::TimeWait);

    // TIME_WAIT expires after the user timeout; close() lets tick reap.
    client.engine.close(cid).unwrap();
    server.engine.close(sid).unwrap();
    clock.advance(Duration::from_secs(61));
    client.engine.tick();
    client.engine.tick();
    server.engine.tick();
    server.engine.tick();
    assert!(client.engine.state(cid).is_err());
    assert!(server.engine.state(sid).is_err());
}

#[test]
fn simultaneous_close_passes_through_closing() {
    let clock = TestClock::new();
    let mut client = TestUnit::new(&clock);
    let mut server = TestUnit::new(&clock);
    let (cid, _, sid, _) = establish(&mut client, &mut server, ConnFlags::TCP);

    client.engine.shutdown(cid, Shutdown::Write).unwrap();
    server.engine.shutdown(sid, Shutdown::Write).unwrap();
    assert_eq!(client.engine.state(cid).unwrap(), State::FinWait1);
    assert_eq!(server.engine.state(sid).unwrap(), State::FinWait1);

    // Both FINs cross on the wire.
    let client_fin = client.take_tx();
    let server_fin = server.take_tx();
    for pkt in &server_fin {
        client.engine.recv(pkt).unwrap();
    }
    for pkt in &client_fin {
        server.engine.recv(pkt).unwrap();
    }

    assert_eq!(client.engine.state(cid).unwrap(), State::Closing);
    assert_eq!(server.engine.state(sid).unwrap(), State::Closing);

    // The crossing ACKs complete the close; nobody resets.
    let mut all_packets = Vec::new();
    for _ in 0..4 {
        let from_client = client.take_tx();
        let from_server = server.take_tx();
        all_packets.extend(from_client.iter().cloned());
        all_packets.extend(from_server.iter().cloned());
        for pkt in &from_server {
            client.engine.recv(pkt).unwrap();
        }
        for pkt in &from_client {
            server.engine.recv(pkt).unwrap();
        }
    }

    assert_eq!(client.engine.state(cid).unwrap(), State::TimeWait);
    assert_eq!(server.engine.state(sid).unwrap(), State::TimeWait);
    assert!(all_packets
        .iter()
        .all(|p| !decode(p).ctl.contains(Ctl::RST)));
}

#[test]
fn shutdown_write_is_idempotent() {
    let clock = TestClock::new();
    let mut client = TestUnit::new(&clock);
    let mut server = TestUnit::new(&clock);
    let (cid, _, _, _) = establish(&mut client, &mut server, ConnFlags::TCP);

    client.engine.shutdown(cid, Shutdown::Write).unwrap();
    let first = client.take_tx();
    assert_eq!(first.len(), 1);
    assert!(decode(&first[0]).ctl.contains(Ctl::FIN));

    // Again: no state change, no second FIN.
    client.engine.shutdown(cid, Shutdown::Write).unwrap();
    assert_eq!(client.engine.state(cid).unwrap(), State::FinWait1);
    assert!(client.take_tx().is_empty());
}

#[test]
fn send_after_local_fin_is_broken_pipe() {
    let clock = TestClock::new();
    let mut client = TestUnit::new(&clock);
    let mut server = TestUnit::new(&clock);
    let (cid, _, _, _) = establish(&mut client, &mut server, ConnFlags::TCP);

    client.engine.shutdown(cid, Shutdown::Write).unwrap();
    assert_eq!(
        client.engine.send(cid, b"late").unwrap_err().kind(),
        ErrorKind::BrokenPipe
    );

    // Still broken after the FIN is acknowledged.
    client.pipe(&mut server);
    server.pipe(&mut client);
    assert_eq!(client.engine.state(cid).unwrap(), State::FinWait2);
    assert_eq!(
        client.engine.send(cid, b"late").unwrap_err().kind(),
        ErrorKind::BrokenPipe
    );
}

#[test]
fn close_with_undelivered_data_resets() {
    let clock = TestClock::new();
    let mut server = TestUnit::new(&clock);
    server.listen();

    server
        .engine
        .recv(&raw(hdr(9000, 7, 4000, 0, WIN, Ctl::SYN), &[]))
        .unwrap();
    server
        .engine
        .recv(&raw(hdr(9000, 7, 4001, 1, WIN, Ctl::ACK), &[]))
        .unwrap();
    let (sid, _) = server.accepted_sink(0);

    // Park out-of-order bytes in the receive buffer.
    server
        .engine
        .recv(&raw(hdr(9000, 7, 4101, 1, WIN, Ctl::ACK), &[9; 100]))
        .unwrap();
    assert!(server.engine.recvq(sid).unwrap() > 0);
    server.clear_tx();

    server.engine.close(sid).unwrap();

    let pkts = server.take_tx();
    assert_eq!(pkts.len(), 1);
    assert_eq!(decode(&pkts[0]).ctl, Ctl::RST);

    server.engine.tick();
    assert!(server.engine.state(sid).is_err());
}

#[test]
fn shutdown_read_stops_deliveries_but_keeps_acking() {
    let clock = TestClock::new();
    let mut server = TestUnit::new(&clock);
    server.listen();

    server
        .engine
        .recv(&raw(hdr(9000, 7, 4000, 0, WIN, Ctl::SYN), &[]))
        .unwrap();
    server
        .engine
        .recv(&raw(hdr(9000, 7, 4001, 1, WIN, Ctl::ACK), &[]))
        .unwrap();
    let (sid, sink) = server.accepted_sink(0);

    server.engine.shutdown(sid, Shutdown::Read).unwrap();
    server.clear_tx();

    server
        .engine
        .recv(&raw(hdr(9000, 7, 4001, 1, WIN, Ctl::ACK), &[5; 100]))
        .unwrap();

    assert!(sink.borrow().data.is_empty());

    let pkts = server.take_tx();
    assert_eq!(decode(pkts.last().unwrap()).ack, 4101);
}

#[test]
fn receive_callback_may_close_its_own_connection() {
    let clock = TestClock::new();
    let mut client = TestUnit::new(&clock);
    let mut server = TestUnit::new(&clock);
    let (cid, _, _, _) = establish(&mut client, &mut server, ConnFlags::TCP);

    client
        .engine
        .set_recv_callback(
            cid,
            Some(Box::new(|ctl, event| match event {
                crate::RecvEvent::Data(data) => {
                    ctl.close();
                    data.len()
                }
                _ => 0,
            })),
        )
        .unwrap();

    client
        .engine
        .recv(&raw(hdr(7, cid.local, 4001, 1, WIN, Ctl::ACK), &[1; 10]))
        .unwrap();

    // The deferred close ran after the callback returned: FIN went out and
    // the handle is gone.
    assert_eq!(client.engine.state(cid).unwrap(), State::FinWait1);
    assert!(client
        .take_tx()
        .iter()
        .any(|p| decode(p).ctl.contains(Ctl::FIN)));
    assert_eq!(
        client.engine.send(cid, b"x").unwrap_err().kind(),
        ErrorKind::Other
    );
}
