use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::connection::RecvFn;
use crate::pkt::{Ctl, Header, HEADER_LEN};
use crate::table::ConnId;
use crate::{ConnFlags, Engine, RecvEvent};

/// A settable monotonic clock shared by the engines under test.
#[derive(Clone)]
pub(crate) struct TestClock(Arc<Mutex<Instant>>);

impl TestClock {
    pub fn new() -> Self {
        TestClock(Arc::new(Mutex::new(Instant::now())))
    }

    pub fn now(&self) -> Instant {
        *self.0.lock().unwrap()
    }

    pub fn advance(&self, d: Duration) {
        *self.0.lock().unwrap() += d;
    }
}

/// Everything one connection's receive callback observed.
#[derive(Debug, Default)]
pub(crate) struct SinkState {
    pub data: Vec<u8>,
    /// Length of each individual Data delivery, one per callback call.
    pub chunks: Vec<usize>,
    pub eof: bool,
    pub errors: Vec<ErrorKind>,
}

pub(crate) type Sink = Rc<RefCell<SinkState>>;

pub(crate) fn sink() -> (Sink, RecvFn) {
    let state: Sink = Rc::new(RefCell::new(SinkState::default()));
    let inner = state.clone();

    let recv: RecvFn = Box::new(move |_ctl, event| match event {
        RecvEvent::Data(data) => {
            let mut s = inner.borrow_mut();
            s.data.extend_from_slice(data);
            s.chunks.push(data.len());
            data.len()
        }
        RecvEvent::Eof => {
            inner.borrow_mut().eof = true;
            0
        }
        RecvEvent::Error(kind) => {
            inner.borrow_mut().errors.push(kind);
            0
        }
    });

    (state, recv)
}

/// One engine plus a queue capturing everything it sent on the carrier.
pub(crate) struct TestUnit {
    pub engine: Engine,
    pub tx: Rc<RefCell<VecDeque<Vec<u8>>>>,
    pub accepted: Rc<RefCell<Vec<(ConnId, Sink)>>>,
}

impl TestUnit {
    pub fn new(clock: &TestClock) -> Self {
        let tx: Rc<RefCell<VecDeque<Vec<u8>>>> = Rc::new(RefCell::new(VecDeque::new()));
        let tx_writer = tx.clone();

        let mut engine = Engine::new(move |dgram: &[u8]| {
            tx_writer.borrow_mut().push_back(dgram.to_vec());
            dgram.len() as isize
        });

        let reader = clock.clone();
        engine.set_clock(Arc::new(move || reader.now()));
        engine.set_clock_granularity(Duration::from_millis(1));

        TestUnit {
            engine,
            tx,
            accepted: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Installs an accept callback that confirms every incoming connection
    /// with a fresh sink.
    pub fn listen(&mut self) {
        let accepted = self.accepted.clone();

        self.engine.set_accept_callbacks(
            Some(Box::new(move |incoming, _port| {
                let (state, recv) = sink();
                incoming.confirm(recv);
                accepted.borrow_mut().push((incoming.id(), state));
            })),
            None,
        );
    }

    pub fn connect(&mut self, remote: u16, flags: ConnFlags) -> (ConnId, Sink) {
        let (state, recv) = sink();
        let id = self
            .engine
            .connect_with_flags(remote, recv, flags)
            .expect("connect failed");
        (id, state)
    }

    pub fn take_tx(&mut self) -> Vec<Vec<u8>> {
        self.tx.borrow_mut().drain(..).collect()
    }

    pub fn clear_tx(&mut self) {
        self.tx.borrow_mut().clear();
    }

    /// Feeds every queued outgoing packet into `peer`.
    pub fn pipe(&mut self, peer: &mut TestUnit) {
        for pkt in self.take_tx() {
            let _ = peer.engine.recv(&pkt);
        }
    }

    pub fn accepted_sink(&self, i: usize) -> (ConnId, Sink) {
        let accepted = self.accepted.borrow();
        let (id, sink) = &accepted[i];
        (*id, sink.clone())
    }
}

pub(crate) fn decode(pkt: &[u8]) -> Header {
    Header::decode(pkt).expect("undecodable test packet")
}

pub(crate) fn payload_of(pkt: &[u8]) -> &[u8] {
    let hdr = decode(pkt);
    let payload = &pkt[HEADER_LEN..];
    let (_, consumed) = crate::pkt::parse_aux(&hdr, payload).expect("bad aux in test packet");
    &payload[consumed..]
}

pub(crate) fn raw(hdr: Header, data: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0u8; HEADER_LEN + data.len()];
    hdr.encode(&mut pkt);
    pkt[HEADER_LEN..].copy_from_slice(data);
    pkt
}

pub(crate) fn hdr(src: u16, dst: u16, seq: u32, ack: u32, wnd: u32, ctl: Ctl) -> Header {
    Header {
        src,
        dst,
        seq,
        ack,
        wnd,
        ctl,
        aux: 0,
    }
}

/// Establishes a client/server pair over a lossless pipe and returns
/// `(client id, client sink, server id, server sink)`.
pub(crate) fn establish(
    client: &mut TestUnit,
    server: &mut TestUnit,
    flags: ConnFlags,
) -> (ConnId, Sink, ConnId, Sink) {
    server.listen();
    let (cid, csink) = client.connect(7, flags);

    client.pipe(server); // SYN
    server.pipe(client); // SYN+ACK
    client.pipe(server); // ACK

    let (sid, ssink) = server.accepted_sink(0);
    assert_eq!(client.engine.state(cid).unwrap(), crate::State::Established);
    assert_eq!(server.engine.state(sid).unwrap(), crate::State::Established);

    (cid, csink, sid, ssink)
}

/// Runs both engines until `done` reports success or `max_iters` passes of
/// exchange-then-tick elapse. `transform` may drop, hold or duplicate
/// packets; it sees `(from_client, packet)`. The clock only advances when
/// an iteration moved no packets, so timers fire exactly when the exchange
/// goes quiet.
pub(crate) fn run(
    clock: &TestClock,
    client: &mut TestUnit,
    server: &mut TestUnit,
    mut transform: impl FnMut(bool, Vec<u8>) -> Vec<Vec<u8>>,
    mut done: impl FnMut(&mut TestUnit, &mut TestUnit) -> bool,
    max_iters: usize,
) -> bool {
    for _ in 0..max_iters {
        let mut moved = false;

        for pkt in client.take_tx() {
            for out in transform(true, pkt) {
                let _ = server.engine.recv(&out);
                moved = true;
            }
        }

        for pkt in server.take_tx() {
            for out in transform(false, pkt) {
                let _ = client.engine.recv(&out);
                moved = true;
            }
        }

        if done(client, server) {
            return true;
        }

        if !moved {
            let next = client.engine.tick().min(server.engine.tick());

            // tick() may have queued retransmissions; the clock only moves
            // once the exchange is truly quiet.
            if client.tx.borrow().is_empty() && server.tx.borrow().is_empty() {
                clock.advance(next + Duration::from_millis(1));
            }
        }
    }

    false
}
