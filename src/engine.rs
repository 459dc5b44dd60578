use std::io::{Error, ErrorKind, Result};
use std::net::Shutdown;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::carrier::{AcceptFn, Carrier, Payload, PreAcceptFn, RetransmitFn, SendFn};
use crate::connection::{
    stale_handle, ConnFlags, Connection, Disposition, PollFn, RecvFn, State,
};
use crate::pkt::{parse_aux, Ctl, Header, HEADER_LEN};
use crate::table::{ConnId, ConnTable};

/// Default maximum packet size, including the header.
pub const DEFAULT_MTU: u16 = 1000;
/// Default connection-idle timeout.
pub const DEFAULT_USER_TIMEOUT: Duration = Duration::from_secs(60);

/// The carrier mux: multiplexes any number of logical connections over one
/// host-supplied datagram channel.
///
/// The engine is single-threaded cooperative. No entry point blocks, and
/// all callbacks fire synchronously from whichever entry point the host
/// called; calling into the engine from more than one thread at a time is
/// a contract violation. The host drives time by calling [`Engine::tick`],
/// which returns how long it may sleep.
pub struct Engine {
    send: SendFn,
    accept: Option<AcceptFn>,
    pre_accept: Option<PreAcceptFn>,
    retransmit: Option<RetransmitFn>,

    /// Scratch packet buffer shared by every outgoing transmission.
    scratch: Vec<u8>,

    mtu: u16,
    mss: u16,
    user_timeout: Duration,
    flush_timeout: Option<Duration>,
    granularity_us: u32,
    clock: Arc<dyn Fn() -> Instant>,

    table: ConnTable,
}

impl Engine {
    pub fn new(send: impl FnMut(&[u8]) -> isize + 'static) -> Self {
        let mut engine = Engine {
            send: Box::new(send),
            accept: None,
            pre_accept: None,
            retransmit: None,
            scratch: Vec::new(),
            mtu: 0,
            mss: 0,
            user_timeout: DEFAULT_USER_TIMEOUT,
            flush_timeout: None,
            granularity_us: measure_clock_granularity(),
            clock: Arc::new(Instant::now),
            table: ConnTable::new(),
        };

        engine.set_mtu(DEFAULT_MTU);
        engine
    }

    fn carrier_parts(&mut self) -> (&mut ConnTable, Carrier<'_>) {
        let now = (self.clock)();
        let Engine {
            send,
            scratch,
            mss,
            user_timeout,
            flush_timeout,
            granularity_us,
            accept,
            retransmit,
            table,
            ..
        } = self;

        (
            table,
            Carrier {
                send,
                scratch,
                mss: *mss,
                user_timeout: *user_timeout,
                flush_timeout: *flush_timeout,
                granularity_us: *granularity_us,
                now,
                accept: accept.as_mut(),
                retransmit: retransmit.as_mut(),
            },
        )
    }

    fn initial_seq(&self) -> u32 {
        if cfg!(debug_assertions) {
            0
        } else {
            rand::thread_rng().gen()
        }
    }

    // # Opening connections

    /// Active open of a reliable ordered connection.
    pub fn connect(&mut self, remote: u16, recv: RecvFn) -> Result<ConnId> {
        self.connect_with_flags(remote, recv, ConnFlags::TCP)
    }

    /// Active open with explicit traffic-mode flags.
    pub fn connect_with_flags(
        &mut self,
        remote: u16,
        recv: RecvFn,
        flags: ConnFlags,
    ) -> Result<ConnId> {
        let local = self.table.alloc_local_port(remote)?;
        let id = ConnId { local, remote };

        let mut conn = Connection::new(id, self.initial_seq(), flags, u32::from(self.mss));
        conn.recv = Some(recv);
        self.table.insert(conn)?;

        let (table, mut io) = self.carrier_parts();
        let conn = table.get_mut(id).expect("just inserted");
        conn.start_connect(&mut io);

        Ok(id)
    }

    // # Inbound datagrams

    /// Feeds one datagram from the carrier into the engine. Malformed
    /// packets are rejected with `InvalidData`; everything else is
    /// consumed, possibly generating replies through the send callback.
    pub fn recv(&mut self, dgram: &[u8]) -> Result<()> {
        if dgram.is_empty() {
            return Ok(());
        }

        let hdr = Header::decode(dgram)?;
        let payload = &dgram[HEADER_LEN..];

        let id = ConnId {
            local: hdr.dst,
            remote: hdr.src,
        };

        let (init, consumed) = match parse_aux(&hdr, payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                // A handshake attempt we cannot parse draws a reset; for an
                // existing connection the packet is just dropped.
                if self.table.get(id).is_none() && !hdr.ctl.contains(Ctl::RST) {
                    let _ = self.send_rst_reply(&hdr, 1);
                }

                return Err(e);
            }
        };

        let data = &payload[consumed..];

        tracing::trace!(
            ?id,
            seq = hdr.seq,
            ack = hdr.ack,
            ctl = ?hdr.ctl,
            len = data.len(),
            "recv"
        );

        if self.table.get(id).is_none() {
            return self.recv_unknown(id, &hdr, init.map(|i| (i.major, i.flags)));
        }

        let disp;
        {
            let (table, mut io) = self.carrier_parts();
            let conn = table.get_mut(id).expect("checked above");

            // TODO: make it so incoming packets can never match a fully
            // closed connection.
            if conn.state() == State::Closed {
                tracing::trace!(?id, "packet for closed connection");
                return Ok(());
            }

            disp = conn.on_packet(&mut io, hdr, data);
        }

        match disp {
            Disposition::Free => {
                self.table.remove(id);
            }
            Disposition::Keep => self.apply_pending(id),
        }

        Ok(())
    }

    /// A packet with no matching connection: either the start of a passive
    /// open, or it draws a RST.
    fn recv_unknown(
        &mut self,
        id: ConnId,
        hdr: &Header,
        init: Option<(u8, ConnFlags)>,
    ) -> Result<()> {
        if hdr.ctl.contains(Ctl::RST) {
            return Ok(());
        }

        let is_open = hdr.ctl.contains(Ctl::SYN) && !hdr.ctl.contains(Ctl::ACK);

        if !is_open || self.accept.is_none() {
            return self.send_rst_reply(hdr, 1);
        }

        if let Some(pre) = self.pre_accept.as_mut() {
            if !pre(hdr.dst) {
                tracing::trace!(port = hdr.dst, "passive open vetoed");
                return self.send_rst_reply(hdr, 1);
            }
        }

        let flags = match init {
            Some((major, _)) if major < 1 => {
                return self.send_rst_reply(hdr, 1);
            }
            Some((_, flags)) => flags,
            None => ConnFlags::TCP,
        };

        let mut conn = Connection::new(id, self.initial_seq(), flags, u32::from(self.mss));
        conn.init_seen = init.is_some();

        if self.table.insert(conn).is_err() {
            return self.send_rst_reply(hdr, 1);
        }

        let (table, mut io) = self.carrier_parts();
        let conn = table.get_mut(id).expect("just inserted");
        conn.begin_passive(&mut io, hdr);

        Ok(())
    }

    fn send_rst_reply(&mut self, hdr: &Header, len: u32) -> Result<()> {
        let rst = Header::rst_reply(hdr, len);
        let (_, mut io) = self.carrier_parts();
        io.transmit(&rst, Payload::None);
        Ok(())
    }

    /// Applies write-side requests a callback made through
    /// [`crate::ConnectionCtl`] while the engine was delivering to it.
    fn apply_pending(&mut self, id: ConnId) {
        let Some(conn) = self.table.get_mut(id) else {
            return;
        };

        let pending = conn.take_pending();

        if pending.shut_rd {
            conn.recv = None;
        }

        if !pending.any_write_op() {
            return;
        }

        if pending.abort {
            let _ = self.abort(id);
            return;
        }

        if pending.shut_wr {
            let _ = self.shutdown(id, Shutdown::Write);
        }

        if pending.close {
            let _ = self.close(id);
        }
    }

    // # Writing

    /// Queues `data` on the connection and sends whatever the windows
    /// allow. Reliable streams may accept a prefix; framed and NO_PARTIAL
    /// connections enqueue all or nothing (`WouldBlock`).
    pub fn send(&mut self, id: ConnId, data: &[u8]) -> Result<usize> {
        let (table, mut io) = self.carrier_parts();
        let Some(conn) = table.get_mut(id) else {
            return Err(stale_handle());
        };

        conn.write(&mut io, data)
    }

    // # Shutdown, close, abort

    pub fn shutdown(&mut self, id: ConnId, how: Shutdown) -> Result<()> {
        let (table, mut io) = self.carrier_parts();
        let Some(conn) = table.get_mut(id) else {
            return Err(stale_handle());
        };

        if conn.reapable {
            return Err(stale_handle());
        }

        if matches!(how, Shutdown::Read | Shutdown::Both) {
            conn.recv = None;
        }

        if matches!(how, Shutdown::Read) {
            return Ok(());
        }

        // The write side shuts down only once.
        if conn.shut_wr {
            return Ok(());
        }

        conn.shut_wr = true;

        match conn.state() {
            State::Closed | State::Listen => {
                return Err(Error::new(ErrorKind::NotConnected, "not connected"));
            }

            // The FIN is deferred until the handshake completes.
            State::SynSent => return Ok(()),

            State::SynReceived | State::Established => {
                if !conn.flags.is_reliable() && conn.flags.is_framed() {
                    conn.flush_framed(&mut io);
                }

                conn.set_state(State::FinWait1);
            }

            State::FinWait1 | State::FinWait2 => return Ok(()),

            State::CloseWait => conn.set_state(State::Closing),

            State::Closing | State::LastAck | State::TimeWait => return Ok(()),
        }

        // The FIN occupies one sequence number.
        conn.snd.last = conn.snd.last.wrapping_add(1);
        let force = !conn.flags.is_reliable();
        conn.push(&mut io, force);

        if conn.rtrx_deadline.is_none() {
            conn.start_rtrx_timer(&io);
        }

        Ok(())
    }

    /// Releases the host's handle. The read and write sides are shut down
    /// and the connection is reaped once the state machine finishes; if
    /// received data is still pending the connection is reset instead.
    pub fn close(&mut self, id: ConnId) -> Result<()> {
        let rcv_pending = {
            let Some(conn) = self.table.get_mut(id) else {
                return Err(stale_handle());
            };

            !conn.rcvbuf.is_empty()
        };

        if rcv_pending {
            tracing::debug!(?id, "receive buffer not empty, resetting");
            self.reset_connection(id)?;
        } else {
            match self.shutdown(id, Shutdown::Both) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotConnected => {}
                Err(e) => return Err(e),
            }
        }

        let conn = self.table.get_mut(id).expect("still present");
        conn.recv = None;
        conn.poll = None;
        conn.reapable = true;
        Ok(())
    }

    /// Immediate teardown: sends a RST if the peer could still have state,
    /// and releases the handle.
    pub fn abort(&mut self, id: ConnId) -> Result<()> {
        self.reset_connection(id)?;
        let conn = self.table.get_mut(id).expect("still present");
        conn.reapable = true;
        Ok(())
    }

    fn reset_connection(&mut self, id: ConnId) -> Result<()> {
        let (table, mut io) = self.carrier_parts();
        let Some(conn) = table.get_mut(id) else {
            return Err(stale_handle());
        };

        if conn.reapable {
            return Err(stale_handle());
        }

        conn.recv = None;
        conn.poll = None;

        match conn.state() {
            State::Closed => return Ok(()),

            State::Listen
            | State::SynSent
            | State::Closing
            | State::LastAck
            | State::TimeWait => {
                conn.set_state(State::Closed);
                return Ok(());
            }

            State::SynReceived
            | State::Established
            | State::FinWait1
            | State::FinWait2
            | State::CloseWait => {
                conn.set_state(State::Closed);
            }
        }

        let hdr = Header {
            src: id.local,
            dst: id.remote,
            seq: conn.snd.nxt,
            ack: 0,
            wnd: 0,
            ctl: Ctl::RST,
            aux: 0,
        };

        io.transmit(&hdr, Payload::None);
        Ok(())
    }

    /// Resets every live connection, notifying still-installed callbacks.
    pub fn abort_all(&mut self) {
        let mut i = 0;

        while i < self.table.len() {
            let id;
            {
                let (table, mut io) = self.carrier_parts();
                let conn = table.at_mut(i);
                id = conn.id();

                if conn.reapable || conn.state() == State::Closed {
                    i += 1;
                    continue;
                }

                match conn.state() {
                    State::SynReceived
                    | State::Established
                    | State::FinWait1
                    | State::FinWait2
                    | State::CloseWait => {
                        let hdr = Header {
                            src: id.local,
                            dst: id.remote,
                            seq: conn.snd.nxt,
                            ack: 0,
                            wnd: 0,
                            ctl: Ctl::RST,
                            aux: 0,
                        };
                        io.transmit(&hdr, Payload::None);
                    }
                    _ => {}
                }

                conn.set_state(State::Closed);
                conn.deliver_eof();

                if !conn.reapable {
                    conn.notify_poll(0);
                }

                conn.recv = None;
                conn.poll = None;
            }

            self.apply_pending(id);
            i += 1;
        }
    }

    // # Timers

    /// Reaps dead connections, fires expired timers and poll edges, and
    /// returns the time until the next scheduled event, so the host can
    /// sleep exactly that long.
    pub fn tick(&mut self) -> Duration {
        let now = (self.clock)();
        let mut next = now + Duration::from_secs(3600);
        let mut i = 0;

        while i < self.table.len() {
            let id;
            {
                let (table, mut io) = self.carrier_parts();
                let conn = table.at_mut(i);
                id = conn.id();

                if conn.state() == State::Closed {
                    if conn.reapable {
                        tracing::trace!(?id, "reaping");
                        table.remove_at(i);
                        continue;
                    }

                    i += 1;
                    continue;
                }

                if conn.conn_deadline.is_some_and(|d| d <= now) {
                    tracing::info!(?id, "connection timed out");
                    conn.state = State::Closed;
                    conn.deliver_err(ErrorKind::TimedOut);

                    if !conn.reapable {
                        conn.notify_poll(0);
                    }
                } else {
                    if conn.rtrx_deadline.is_some_and(|d| d <= now) {
                        conn.on_rtrx_timeout(&mut io);
                    }

                    if matches!(conn.state(), State::Established | State::CloseWait)
                        && conn.do_poll
                    {
                        conn.do_poll = false;
                        let room = conn.sndbuf.free();

                        if room > 0 {
                            conn.notify_poll(room);
                        }
                    } else if conn.state() == State::Closed {
                        conn.notify_poll(0);
                    }

                    if let Some(d) = conn.conn_deadline {
                        next = next.min(d);
                    }

                    if let Some(d) = conn.rtrx_deadline {
                        next = next.min(d);
                    }
                }
            }

            self.apply_pending(id);
            i += 1;
        }

        next.saturating_duration_since(now)
    }

    /// Whether any connection still has work to do.
    pub fn is_active(&self) -> bool {
        self.table
            .iter()
            .any(|c| c.state() != State::Closed && c.state() != State::TimeWait)
    }

    /// Makes every armed retransmission timer due immediately and pushes
    /// the connection deadlines out, e.g. after the host detects that the
    /// carrier path changed.
    pub fn reset_timers(&mut self) {
        let now = (self.clock)();
        let then = now + self.user_timeout;

        for conn in self.table.iter_mut() {
            if conn.reapable {
                continue;
            }

            if conn.rtrx_deadline.is_some() {
                conn.rtrx_deadline = Some(now);
            }

            if conn.conn_deadline.is_some() {
                conn.conn_deadline = Some(then);
            }

            conn.rtt.restart();
        }
    }

    /// Arms (or clears) the idle deadline of one connection depending on
    /// whether the host expects the peer to be responsive.
    pub fn expect_data(&mut self, id: ConnId, expect: bool) -> Result<()> {
        let now = (self.clock)();
        let timeout = self.user_timeout;
        let Some(conn) = self.table.get_mut(id) else {
            return Err(stale_handle());
        };

        if conn.reapable {
            return Err(stale_handle());
        }

        if !matches!(
            conn.state(),
            State::Established | State::FinWait1 | State::FinWait2
        ) {
            return Ok(());
        }

        if expect {
            if conn.conn_deadline.is_none() {
                conn.conn_deadline = Some(now + timeout);
            }
        } else if conn.snd.una == conn.snd.last {
            conn.conn_deadline = None;
        }

        Ok(())
    }

    /// Marks the carrier offline or online. Offline arms every idle
    /// deadline; coming back online additionally makes retransmissions due
    /// immediately.
    pub fn set_offline(&mut self, offline: bool) {
        let now = (self.clock)();
        let timeout = self.user_timeout;

        for conn in self.table.iter_mut() {
            if conn.reapable {
                continue;
            }

            if matches!(
                conn.state(),
                State::Established | State::FinWait1 | State::FinWait2
            ) {
                if offline {
                    if conn.conn_deadline.is_none() {
                        conn.conn_deadline = Some(now + timeout);
                    }
                } else if conn.snd.una == conn.snd.last {
                    conn.conn_deadline = None;
                }
            }

            if !offline {
                if conn.rtrx_deadline.is_some() {
                    conn.rtrx_deadline = Some(now);
                }

                conn.rtt.restart();
            }
        }
    }

    // # Engine options

    pub fn set_accept_callbacks(
        &mut self,
        accept: Option<AcceptFn>,
        pre_accept: Option<PreAcceptFn>,
    ) {
        self.accept = accept;
        self.pre_accept = pre_accept;
    }

    pub fn set_retransmit_callback(&mut self, retransmit: Option<RetransmitFn>) {
        self.retransmit = retransmit;
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn mss(&self) -> u16 {
        self.mss
    }

    pub fn set_mtu(&mut self, mtu: u16) {
        if usize::from(mtu) <= HEADER_LEN {
            return;
        }

        if mtu > self.mtu {
            self.scratch.resize(usize::from(mtu) + HEADER_LEN, 0);
        }

        self.mtu = mtu;
        self.mss = mtu - HEADER_LEN as u16;
    }

    pub fn user_timeout(&self) -> Duration {
        self.user_timeout
    }

    pub fn set_user_timeout(&mut self, timeout: Duration) {
        self.user_timeout = timeout;
    }

    pub fn flush_timeout(&self) -> Option<Duration> {
        self.flush_timeout
    }

    /// Delay before a trailing partial frame is flushed on an unreliable
    /// framed connection.
    pub fn set_flush_timeout(&mut self, timeout: Option<Duration>) {
        self.flush_timeout = timeout;
    }

    pub fn clock_granularity(&self) -> Duration {
        Duration::from_micros(u64::from(self.granularity_us))
    }

    pub fn set_clock_granularity(&mut self, granularity: Duration) {
        self.granularity_us = granularity.as_micros().max(1) as u32;
    }

    /// Replaces the monotonic clock, for simulation and tests.
    pub fn set_clock(&mut self, clock: Arc<dyn Fn() -> Instant>) {
        self.clock = clock;
    }

    // # Per-connection options

    pub fn state(&self, id: ConnId) -> Result<State> {
        self.with_conn(id, |c| c.state())
    }

    pub fn flags(&self, id: ConnId) -> Result<ConnFlags> {
        self.with_conn(id, |c| c.flags)
    }

    /// Changes the changeable flag subset ({FRAMED, DROP_LATE}); anything
    /// else is fixed at SYN time.
    pub fn set_flags(&mut self, id: ConnId, flags: ConnFlags) -> Result<()> {
        let Some(conn) = self.table.get_mut(id) else {
            return Err(stale_handle());
        };

        if !(flags ^ conn.flags).difference(ConnFlags::CHANGEABLE).is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "only FRAMED and DROP_LATE can change",
            ));
        }

        conn.flags = flags;
        Ok(())
    }

    pub fn set_recv_callback(&mut self, id: ConnId, recv: Option<RecvFn>) -> Result<()> {
        let Some(conn) = self.table.get_mut(id) else {
            return Err(stale_handle());
        };

        conn.pending.shut_rd = false;
        conn.recv = recv;
        Ok(())
    }

    pub fn set_poll_callback(&mut self, id: ConnId, poll: Option<PollFn>) -> Result<()> {
        let Some(conn) = self.table.get_mut(id) else {
            return Err(stale_handle());
        };

        conn.poll = poll;
        conn.do_poll = conn.flags.is_reliable() && conn.sndbuf.free() > 0;
        Ok(())
    }

    pub fn sndbuf_size(&self, id: ConnId) -> Result<usize> {
        self.with_conn(id, |c| c.sndbuf.max_size())
    }

    pub fn set_sndbuf_size(&mut self, id: ConnId, size: usize) -> Result<()> {
        let Some(conn) = self.table.get_mut(id) else {
            return Err(stale_handle());
        };

        conn.sndbuf.set_max_size(size);
        conn.do_poll = conn.flags.is_reliable() && conn.sndbuf.free() > 0;
        Ok(())
    }

    /// Send-buffer room, zero unless the connection can still take writes.
    pub fn sndbuf_free(&self, id: ConnId) -> Result<usize> {
        self.with_conn(id, |c| match c.state() {
            State::SynSent | State::SynReceived | State::Established | State::CloseWait => {
                c.sndbuf.free()
            }
            _ => 0,
        })
    }

    pub fn rcvbuf_size(&self, id: ConnId) -> Result<usize> {
        self.with_conn(id, |c| c.rcvbuf.max_size())
    }

    pub fn set_rcvbuf_size(&mut self, id: ConnId, size: usize) -> Result<()> {
        let Some(conn) = self.table.get_mut(id) else {
            return Err(stale_handle());
        };

        conn.rcvbuf.set_max_size(size);
        Ok(())
    }

    pub fn rcvbuf_free(&self, id: ConnId) -> Result<usize> {
        self.with_conn(id, |c| match c.state() {
            State::Established | State::CloseWait => c.rcvbuf.free(),
            _ => 0,
        })
    }

    /// Bytes queued in the send buffer (acknowledged ones are gone).
    pub fn sendq(&self, id: ConnId) -> Result<usize> {
        self.with_conn(id, |c| c.sndbuf.used())
    }

    /// Bytes buffered on the receive side (out-of-order or partial frames).
    pub fn recvq(&self, id: ConnId) -> Result<usize> {
        self.with_conn(id, |c| c.rcvbuf.used())
    }

    /// Bytes in flight: sent but not yet acknowledged.
    pub fn outq(&self, id: ConnId) -> Result<usize> {
        self.with_conn(id, |c| c.flightsize() as usize)
    }

    pub fn nodelay(&self, id: ConnId) -> Result<bool> {
        self.with_conn(id, |c| c.nodelay)
    }

    pub fn set_nodelay(&mut self, id: ConnId, nodelay: bool) -> Result<()> {
        let Some(conn) = self.table.get_mut(id) else {
            return Err(stale_handle());
        };

        conn.nodelay = nodelay;
        Ok(())
    }

    pub fn keepalive(&self, id: ConnId) -> Result<bool> {
        self.with_conn(id, |c| c.keepalive)
    }

    pub fn set_keepalive(&mut self, id: ConnId, keepalive: bool) -> Result<()> {
        let Some(conn) = self.table.get_mut(id) else {
            return Err(stale_handle());
        };

        conn.keepalive = keepalive;
        Ok(())
    }

    fn with_conn<T>(&self, id: ConnId, f: impl FnOnce(&Connection) -> T) -> Result<T> {
        self.table.get(id).map(f).ok_or_else(stale_handle)
    }

    #[cfg(test)]
    pub(crate) fn connection(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.table.get_mut(id)
    }
}

impl Drop for Engine {
    /// Tearing the engine down ends every connection; hosts that still
    /// hold callbacks get a final end-of-stream notification.
    fn drop(&mut self) {
        for conn in self.table.iter_mut() {
            if conn.reapable {
                continue;
            }

            conn.deliver_eof();
            conn.notify_poll(0);
        }
    }
}

/// Measures how far apart two distinguishable readings of the monotonic
/// clock are. Used as the floor of the RTO computation.
fn measure_clock_granularity() -> u32 {
    let start = Instant::now();

    for _ in 0..10_000 {
        let now = Instant::now();

        if now > start {
            return (now - start).as_micros().max(1) as u32;
        }
    }

    1
}
