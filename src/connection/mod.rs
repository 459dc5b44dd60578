use std::io::{Error, ErrorKind, Result};
use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};

use crate::buf::RingBuffer;
use crate::carrier::{Carrier, Payload};
use crate::pkt::{seq_diff, AuxInit, Ctl, Header, AUX_INIT_LEN};
use crate::table::ConnId;
use crate::MAX_UNRELIABLE_SIZE;

mod cong;
mod sack;

pub(crate) use cong::{CongestionControl, RttEstimator};
pub(crate) use sack::SackList;

bitflags::bitflags! {
    /// Traffic-mode flags of a connection, fixed at SYN time except for
    /// [`ConnFlags::CHANGEABLE`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnFlags: u32 {
        const ORDERED    = 1;
        const RELIABLE   = 2;
        const FRAMED     = 4;
        const DROP_LATE  = 8;
        const NO_PARTIAL = 16;

        /// Reliable ordered byte stream.
        const TCP = Self::ORDERED.bits() | Self::RELIABLE.bits();
        /// Unreliable unordered datagrams.
        const UDP = 0;

        /// The subset a host may change after the connection exists.
        const CHANGEABLE = Self::FRAMED.bits() | Self::DROP_LATE.bits();
        /// The subset carried in the SYN-time INIT descriptor.
        const INIT_MASK = Self::ORDERED.bits() | Self::RELIABLE.bits() | Self::FRAMED.bits();
    }
}

impl ConnFlags {
    pub fn is_reliable(&self) -> bool {
        self.contains(ConnFlags::RELIABLE)
    }

    pub fn is_framed(&self) -> bool {
        self.contains(ConnFlags::FRAMED)
    }
}

/// Connection states, RFC 793 shaped. LISTEN never occurs on a concrete
/// connection (passive opens are implied by the engine's accept callback)
/// but it participates in the state-dependent error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// What a connection's receive callback is handed.
#[derive(Debug)]
pub enum RecvEvent<'a> {
    /// In-order payload. The callback must consume all of it.
    Data(&'a [u8]),
    /// The peer closed its end of the connection.
    Eof,
    /// The connection failed; no more data will arrive.
    Error(ErrorKind),
}

/// Handed to receive and poll callbacks so they can act on the connection
/// they were invoked for without re-entering the engine. Reads are applied
/// immediately; write-side requests are applied after the callback returns.
pub struct ConnectionCtl<'a> {
    id: ConnId,
    flags: ConnFlags,
    pending: &'a mut PendingOps,
}

impl ConnectionCtl<'_> {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn flags(&self) -> ConnFlags {
        self.flags
    }

    /// Drops the receive callback. Takes effect immediately: a wrapped
    /// delivery will not invoke the callback for its second half.
    pub fn shutdown_read(&mut self) {
        self.pending.shut_rd = true;
    }

    pub fn shutdown_write(&mut self) {
        self.pending.shut_wr = true;
    }

    pub fn close(&mut self) {
        self.pending.close = true;
    }

    pub fn abort(&mut self) {
        self.pending.abort = true;
    }
}

/// Receives payload and end-of-stream events. For [`RecvEvent::Data`] the
/// returned value is the number of bytes consumed and must equal the slice
/// length; the engine has nowhere to put back a remainder.
pub type RecvFn = Box<dyn FnMut(&mut ConnectionCtl<'_>, RecvEvent<'_>) -> usize>;

/// Edge-triggered notification that the send buffer has room again.
pub type PollFn = Box<dyn FnMut(&mut ConnectionCtl<'_>, usize)>;

/// A passive open whose handshake just completed. Dropped unconfirmed, the
/// engine resets the connection.
pub struct Accepted<'a> {
    pub(crate) conn: &'a mut Connection,
}

impl Accepted<'_> {
    pub fn id(&self) -> ConnId {
        self.conn.id
    }

    pub fn flags(&self) -> ConnFlags {
        self.conn.flags
    }

    /// Keeps the connection, installing its receive callback.
    pub fn confirm(&mut self, recv: RecvFn) {
        if self.conn.reapable || self.conn.state != State::SynReceived {
            tracing::warn!(state = ?self.conn.state, "confirm() on invalid connection");
            return;
        }

        self.conn.recv = Some(recv);
        self.conn.pending.shut_rd = false;
        self.conn.do_poll = true;
        self.conn.set_state(State::Established);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PendingOps {
    pub shut_rd: bool,
    pub shut_wr: bool,
    pub close: bool,
    pub abort: bool,
}

impl PendingOps {
    pub fn any_write_op(&self) -> bool {
        self.shut_wr || self.close || self.abort
    }
}

/// What the engine should do with a connection after it processed a packet.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    Keep,
    Free,
}

/// Send sequence space.
///
/// ```text
///        una      nxt      last
///   ......|--------|.........|
///    acked  in flight  queued
/// ```
///
/// `last` points one past the final byte ever queued; a pending FIN
/// occupies one sequence number but no buffer byte.
#[derive(Debug)]
pub(crate) struct SendSeq {
    pub una: u32,
    pub nxt: u32,
    pub wnd: u32,
    pub iss: u32,
    pub last: u32,
}

/// Receive sequence space: the next expected byte and the initial receive
/// sequence from the peer's SYN.
#[derive(Debug)]
pub(crate) struct RecvSeq {
    pub nxt: u32,
    pub irs: u32,
}

pub struct Connection {
    id: ConnId,
    pub(crate) flags: ConnFlags,
    pub(crate) state: State,

    pub(crate) snd: SendSeq,
    pub(crate) rcv: RecvSeq,

    pub(crate) sndbuf: RingBuffer,
    pub(crate) rcvbuf: RingBuffer,
    pub(crate) sacks: SackList,

    pub(crate) cong: CongestionControl,
    pub(crate) rtt: RttEstimator,

    pub(crate) conn_deadline: Option<Instant>,
    pub(crate) rtrx_deadline: Option<Instant>,

    /// Bytes at the start of the send buffer belonging to the leading,
    /// possibly partial frame (unreliable framed mode only).
    pub(crate) frame_offset: u32,

    pub(crate) recv: Option<RecvFn>,
    pub(crate) poll: Option<PollFn>,
    pub(crate) pending: PendingOps,

    pub(crate) shut_wr: bool,
    pub(crate) reapable: bool,
    pub(crate) do_poll: bool,
    pub(crate) init_seen: bool,

    pub(crate) nodelay: bool,
    pub(crate) keepalive: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("state", &self.state)
            .field("snd", &self.snd)
            .field("rcv", &self.rcv)
            .field("sndbuf", &self.sndbuf)
            .field("rcvbuf", &self.rcvbuf)
            .field("sacks", &self.sacks)
            .field("cong", &self.cong)
            .field("rtt", &self.rtt)
            .field("conn_deadline", &self.conn_deadline)
            .field("rtrx_deadline", &self.rtrx_deadline)
            .field("frame_offset", &self.frame_offset)
            .field("recv", &self.recv.is_some())
            .field("poll", &self.poll.is_some())
            .field("pending", &self.pending)
            .field("shut_wr", &self.shut_wr)
            .field("reapable", &self.reapable)
            .field("do_poll", &self.do_poll)
            .field("init_seen", &self.init_seen)
            .field("nodelay", &self.nodelay)
            .field("keepalive", &self.keepalive)
            .finish()
    }
}

pub(crate) const DEFAULT_BUFFER_MAX: usize = 131072;

impl Connection {
    pub(crate) fn new(id: ConnId, iss: u32, flags: ConnFlags, mss: u32) -> Self {
        Connection {
            id,
            flags,
            state: State::Closed,
            snd: SendSeq {
                una: iss,
                nxt: iss.wrapping_add(1),
                wnd: 0,
                iss,
                last: iss.wrapping_add(1),
            },
            rcv: RecvSeq { nxt: 0, irs: 0 },
            sndbuf: RingBuffer::new(DEFAULT_BUFFER_MAX),
            rcvbuf: RingBuffer::new(DEFAULT_BUFFER_MAX),
            sacks: SackList::default(),
            cong: CongestionControl::new(mss),
            rtt: RttEstimator::new(),
            conn_deadline: None,
            rtrx_deadline: None,
            frame_offset: 0,
            recv: None,
            poll: None,
            pending: PendingOps::default(),
            shut_wr: false,
            reapable: false,
            do_poll: false,
            init_seen: false,
            nodelay: false,
            keepalive: false,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: State) {
        tracing::trace!(id = ?self.id, "{:?} -> {:?}", self.state, state);
        self.state = state;

        if state == State::Established {
            self.conn_deadline = None;
        }
    }

    pub(crate) fn take_pending(&mut self) -> PendingOps {
        std::mem::take(&mut self.pending)
    }

    fn fin_wanted(&self, seq: u32) -> bool {
        seq == self.snd.last
            && matches!(self.state, State::FinWait1 | State::Closing | State::LastAck)
    }

    /// Bytes sent but not yet acknowledged.
    pub(crate) fn flightsize(&self) -> u32 {
        seq_diff(self.snd.nxt, self.snd.una) as u32
    }

    pub(crate) fn start_rtrx_timer(&mut self, io: &Carrier<'_>) {
        self.rtrx_deadline = Some(io.now + std::time::Duration::from_micros(u64::from(self.rtt.rto)));
    }

    fn start_flush_timer(&mut self, io: &Carrier<'_>) {
        let timeout = io.flush_timeout.unwrap_or_default();
        self.rtrx_deadline = Some(io.now + timeout);
    }

    fn arm_conn_deadline(&mut self, io: &Carrier<'_>) {
        self.conn_deadline = Some(io.now + io.user_timeout);
    }

    // # Callback delivery

    fn deliver_data(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let Some(mut cb) = self.recv.take() else {
            return;
        };

        let mut ctl = ConnectionCtl {
            id: self.id,
            flags: self.flags,
            pending: &mut self.pending,
        };
        let consumed = cb(&mut ctl, RecvEvent::Data(data));

        if consumed != data.len() {
            tracing::error!(consumed, len = data.len(), "receive callback left data behind");
        }

        if !self.pending.shut_rd {
            self.recv = Some(cb);
        }
    }

    /// Delivers `[offset, offset + len)` of the receive buffer. A wrapped
    /// range takes two callback invocations; the read side may be shut
    /// down by the first, which suppresses the second.
    fn deliver_buf(&mut self, offset: usize, len: usize) {
        let Some(mut cb) = self.recv.take() else {
            return;
        };

        let (a, b) = self.rcvbuf.slices(offset, len);
        let mut ctl = ConnectionCtl {
            id: self.id,
            flags: self.flags,
            pending: &mut self.pending,
        };

        let mut consumed = 0;

        if !a.is_empty() {
            consumed += cb(&mut ctl, RecvEvent::Data(a));
        }

        if !b.is_empty() && !ctl.pending.shut_rd {
            consumed += cb(&mut ctl, RecvEvent::Data(b));
        }

        if consumed != a.len() + b.len() && !self.pending.shut_rd {
            tracing::error!(consumed, len, "receive callback left data behind");
        }

        if !self.pending.shut_rd {
            self.recv = Some(cb);
        }
    }

    pub(crate) fn deliver_eof(&mut self) {
        let Some(mut cb) = self.recv.take() else {
            return;
        };

        let mut ctl = ConnectionCtl {
            id: self.id,
            flags: self.flags,
            pending: &mut self.pending,
        };
        cb(&mut ctl, RecvEvent::Eof);

        if !self.pending.shut_rd {
            self.recv = Some(cb);
        }
    }

    pub(crate) fn deliver_err(&mut self, kind: ErrorKind) {
        let Some(mut cb) = self.recv.take() else {
            return;
        };

        let mut ctl = ConnectionCtl {
            id: self.id,
            flags: self.flags,
            pending: &mut self.pending,
        };
        cb(&mut ctl, RecvEvent::Error(kind));

        if !self.pending.shut_rd {
            self.recv = Some(cb);
        }
    }

    pub(crate) fn notify_poll(&mut self, room: usize) {
        let Some(mut cb) = self.poll.take() else {
            return;
        };

        let mut ctl = ConnectionCtl {
            id: self.id,
            flags: self.flags,
            pending: &mut self.pending,
        };
        cb(&mut ctl, room);
        self.poll = Some(cb);
    }

    // # Opening

    /// Active open: sends the SYN with its INIT descriptor and arms the
    /// handshake timers.
    pub(crate) fn start_connect(&mut self, io: &mut Carrier<'_>) {
        let mut aux = [0u8; AUX_INIT_LEN];
        AuxInit::new(self.flags).encode(&mut aux);

        let hdr = Header {
            src: self.id.local,
            dst: self.id.remote,
            seq: self.snd.iss,
            ack: 0,
            wnd: self.rcvbuf.max_size() as u32,
            ctl: Ctl::SYN,
            aux: AuxInit::aux_word(),
        };

        self.init_seen = true;
        self.set_state(State::SynSent);
        io.transmit(&hdr, Payload::Slice(&aux));

        self.arm_conn_deadline(io);
        self.start_rtrx_timer(io);
    }

    /// Passive open (or retransmitted SYN while half-open): records the
    /// peer's window and initial sequence, replies SYN+ACK.
    pub(crate) fn begin_passive(&mut self, io: &mut Carrier<'_>, hdr: &Header) {
        self.snd.wnd = hdr.wnd;
        self.rcv.irs = hdr.seq;
        self.rcv.nxt = hdr.seq.wrapping_add(1);
        self.set_state(State::SynReceived);

        self.send_synack(io);
        self.start_rtrx_timer(io);
    }

    fn send_synack(&mut self, io: &mut Carrier<'_>) {
        let mut hdr = Header {
            src: self.id.local,
            dst: self.id.remote,
            seq: self.snd.iss,
            ack: self.rcv.irs.wrapping_add(1),
            wnd: self.rcvbuf.max_size() as u32,
            ctl: Ctl::SYN | Ctl::ACK,
            aux: 0,
        };

        if self.init_seen {
            hdr.aux = AuxInit::aux_word();
            let mut aux = [0u8; AUX_INIT_LEN];
            AuxInit::new(self.flags).encode(&mut aux);
            io.transmit(&hdr, Payload::Slice(&aux));
        } else {
            io.transmit(&hdr, Payload::None);
        }
    }

    fn reset_reply(&self, io: &mut Carrier<'_>, hdr: &Header, len: u32) {
        io.transmit(&Header::rst_reply(hdr, len), Payload::None);
    }

    // # Sending

    /// Emits as much pending data as the congestion and flow windows
    /// allow, as MSS-sized segments. With `force_one`, at least one packet
    /// goes out even if it is a bare ACK.
    pub(crate) fn push(&mut self, io: &mut Carrier<'_>, force_one: bool) {
        let mss = i32::from(io.mss);
        let mut left = seq_diff(self.snd.last, self.snd.nxt);
        debug_assert!(left >= 0);

        let cwndleft = if self.flags.is_reliable() {
            self.cong.cwnd.min(self.snd.wnd) as i32 - seq_diff(self.snd.nxt, self.snd.una)
        } else {
            MAX_UNRELIABLE_SIZE as i32
        };

        if cwndleft <= 0 {
            left = 0;
        } else if cwndleft < left {
            left = cwndleft;

            if !force_one || cwndleft > mss {
                left -= left % mss;
            }
        }

        if left == 0 && !force_one {
            return;
        }

        let mut hdr = Header {
            src: self.id.local,
            dst: self.id.remote,
            seq: 0,
            ack: self.rcv.nxt,
            wnd: if self.flags.is_reliable() {
                self.rcvbuf.max_size() as u32
            } else {
                0
            },
            ctl: Ctl::ACK,
            aux: 0,
        };

        loop {
            let seglen = left.min(mss) as u32;
            hdr.seq = self.snd.nxt;

            let offset = seq_diff(hdr.seq, self.snd.una) as usize;

            self.snd.nxt = self.snd.nxt.wrapping_add(seglen);
            left -= seglen as i32;

            if !self.flags.is_reliable() {
                hdr.ctl.set(Ctl::MF, left > 0);
            }

            let mut payload_len = seglen;

            if seglen > 0 && self.fin_wanted(self.snd.nxt) {
                payload_len -= 1;
                hdr.ctl |= Ctl::FIN;
            }

            if !self.rtt.sample_in_flight() && self.flags.is_reliable() {
                self.rtt
                    .start_sample(io.now, hdr.seq.wrapping_add(payload_len));
            }

            io.transmit(
                &hdr,
                Payload::Buffer(&self.sndbuf, offset, payload_len as usize),
            );

            if left > 0 && !self.flags.is_reliable() {
                hdr.wnd += seglen;
            }

            if left <= 0 {
                break;
            }
        }
    }

    /// Unreliable framed transmission: only full MSS-sized packets leave;
    /// the header's `wnd` carries the offset of the first frame boundary
    /// inside the segment. Sent bytes are dropped immediately. A partial
    /// trailing frame arms the flush timer instead.
    pub(crate) fn push_unreliable_framed(&mut self, io: &mut Carrier<'_>) {
        let mut left = seq_diff(self.snd.last, self.snd.nxt);
        debug_assert!(left > 0);

        let mss = u32::from(io.mss);
        let mut hdr = Header {
            src: self.id.local,
            dst: self.id.remote,
            seq: 0,
            ack: self.rcv.nxt,
            wnd: 0,
            ctl: Ctl::ACK | Ctl::MF,
            aux: 0,
        };

        let mut sent_packet = false;

        while left >= mss as i32 {
            let seglen = mss;
            hdr.wnd = self.frame_offset;
            hdr.seq = self.snd.nxt;

            let offset = seq_diff(self.snd.nxt, self.snd.una) as usize;
            io.transmit(&hdr, Payload::Buffer(&self.sndbuf, offset, seglen as usize));
            sent_packet = true;

            self.snd.nxt = self.snd.nxt.wrapping_add(seglen);
            self.snd.una = self.snd.nxt;
            left -= seglen as i32;

            // Walk the length prefixes of the bytes just sent to find how
            // much of the last frame spills into the next packet.
            while self.frame_offset < seglen {
                let mut prefix = [0u8; 2];
                self.sndbuf.copy_to(&mut prefix, self.frame_offset as usize);
                let framelen = u32::from(LittleEndian::read_u16(&prefix));
                self.frame_offset += framelen + 2;
            }

            self.sndbuf.discard(seglen as usize);
            self.frame_offset -= seglen;
        }

        if left > 0 {
            // Partial frame left behind; (re)start the flush timer.
            self.start_flush_timer(io);
        } else if sent_packet {
            self.rtrx_deadline = None;
        }
    }

    /// Flush-timer expiry (or forced flush): emits the sub-MSS remainder
    /// and clears the frame bookkeeping.
    pub(crate) fn flush_framed(&mut self, io: &mut Carrier<'_>) {
        let mut left = seq_diff(self.snd.last, self.snd.nxt);

        // The MSS may have dropped since the last transmission, leaving
        // more than one segment's worth behind.
        if left > i32::from(io.mss) {
            self.push_unreliable_framed(io);
            left = seq_diff(self.snd.last, self.snd.nxt);
            debug_assert!(left <= i32::from(io.mss));
        }

        if left > 0 {
            let seglen = left as u32;
            let hdr = Header {
                src: self.id.local,
                dst: self.id.remote,
                seq: self.snd.nxt,
                ack: self.rcv.nxt,
                wnd: self.frame_offset,
                ctl: Ctl::ACK | Ctl::MF,
                aux: 0,
            };

            let offset = seq_diff(self.snd.nxt, self.snd.una) as usize;
            io.transmit(&hdr, Payload::Buffer(&self.sndbuf, offset, seglen as usize));
            self.sndbuf.discard(seglen as usize);

            self.snd.nxt = self.snd.nxt.wrapping_add(seglen);
            self.snd.una = self.snd.nxt;
        }

        self.frame_offset = 0;
        self.rtrx_deadline = None;
    }

    /// Queues application data. Partial writes are allowed on plain
    /// reliable streams; framed and NO_PARTIAL connections enqueue all or
    /// nothing.
    pub(crate) fn write(&mut self, io: &mut Carrier<'_>, data: &[u8]) -> Result<usize> {
        if self.reapable {
            return Err(stale_handle());
        }

        match self.state {
            State::Closed | State::Listen => {
                return Err(Error::new(ErrorKind::NotConnected, "not connected"));
            }
            State::SynSent | State::SynReceived | State::Established | State::CloseWait => {}
            State::FinWait1
            | State::FinWait2
            | State::Closing
            | State::LastAck
            | State::TimeWait => {
                return Err(Error::new(ErrorKind::BrokenPipe, "write side is shut down"));
            }
        }

        if self.flags.is_reliable() {
            self.write_reliable(io, data)
        } else {
            self.write_unreliable(io, data)
        }
    }

    fn write_reliable(&mut self, io: &mut Carrier<'_>, data: &[u8]) -> Result<usize> {
        let framing = if self.flags.is_framed() { 2 } else { 0 };
        let rlen = data.len() + framing;

        if rlen == 0 {
            return Ok(0);
        }

        if self
            .flags
            .intersects(ConnFlags::NO_PARTIAL | ConnFlags::FRAMED)
        {
            if rlen > self.sndbuf.max_size() {
                return Err(msg_too_large());
            }

            if self.flags.is_framed() && data.len() > MAX_UNRELIABLE_SIZE {
                return Err(msg_too_large());
            }

            if rlen > self.sndbuf.free() {
                return Err(Error::new(ErrorKind::WouldBlock, "send buffer full"));
            }
        }

        let queued;

        if self.flags.is_framed() {
            let mut prefix = [0u8; 2];
            LittleEndian::write_u16(&mut prefix, data.len() as u16);
            self.sndbuf.put(&prefix)?;
            let stored = self.sndbuf.put(data)?;
            debug_assert_eq!(stored, data.len());
            queued = rlen;
        } else {
            let stored = self.sndbuf.put(data)?;

            if stored == 0 {
                return Err(Error::new(ErrorKind::WouldBlock, "send buffer full"));
            }

            queued = stored;
        }

        self.snd.last = self.snd.last.wrapping_add(queued as u32);

        // Nothing goes out until the handshake completes; the queued data
        // rides the first window after ESTABLISHED.
        if matches!(self.state, State::SynSent | State::SynReceived) {
            return Ok(queued - framing);
        }

        self.push(io, false);

        if self.rtrx_deadline.is_none() {
            self.start_rtrx_timer(io);
        }

        if self.conn_deadline.is_none() {
            self.arm_conn_deadline(io);
        }

        Ok(queued - framing)
    }

    fn write_unreliable(&mut self, io: &mut Carrier<'_>, data: &[u8]) -> Result<usize> {
        if data.len() > MAX_UNRELIABLE_SIZE {
            return Err(msg_too_large());
        }

        let framing = if self.flags.is_framed() { 2 } else { 0 };
        let rlen = data.len() + framing;

        if rlen > self.sndbuf.free() {
            if rlen > self.sndbuf.max_size() {
                return Err(msg_too_large());
            }

            return Err(Error::new(ErrorKind::WouldBlock, "send buffer full"));
        }

        // Mid-handshake unreliable sends are accepted and dropped.
        if matches!(self.state, State::SynSent | State::SynReceived) {
            return Ok(data.len());
        }

        if self.flags.is_framed() {
            let mut prefix = [0u8; 2];
            LittleEndian::write_u16(&mut prefix, data.len() as u16);
            self.sndbuf.put(&prefix)?;
        }

        self.sndbuf.put(data)?;
        self.snd.last = self.snd.last.wrapping_add(rlen as u32);

        if self.flags.is_framed() {
            self.push_unreliable_framed(io);
        } else {
            self.push(io, false);
            self.snd.una = self.snd.last;
            self.snd.nxt = self.snd.last;
            self.sndbuf.clear();
        }

        Ok(data.len())
    }

    // # Retransmission

    pub(crate) fn fast_retransmit(&mut self, io: &mut Carrier<'_>) {
        if self.state == State::Closed || self.snd.last == self.snd.una {
            tracing::debug!("fast retransmit with nothing to send");
            return;
        }

        match self.state {
            State::Established
            | State::FinWait1
            | State::CloseWait
            | State::Closing
            | State::LastAck => {
                let mut hdr = Header {
                    src: self.id.local,
                    dst: self.id.remote,
                    seq: self.snd.una,
                    ack: self.rcv.nxt,
                    wnd: self.rcvbuf.max_size() as u32,
                    ctl: Ctl::ACK,
                    aux: 0,
                };

                let mut len = (seq_diff(self.snd.last, self.snd.una) as u32).min(io.mss.into());

                if self.fin_wanted(self.snd.una.wrapping_add(len)) {
                    len -= 1;
                    hdr.ctl |= Ctl::FIN;
                }

                tracing::info!(seq = hdr.seq, len, "fast retransmit");
                io.transmit(&hdr, Payload::Buffer(&self.sndbuf, 0, len as usize));
            }
            _ => {}
        }
    }

    /// Retransmission timer expiry.
    pub(crate) fn on_rtrx_timeout(&mut self, io: &mut Carrier<'_>) {
        if self.state == State::Closed || self.snd.last == self.snd.una {
            tracing::debug!("retransmit timer with nothing to send");
            self.rtrx_deadline = None;
            return;
        }

        if self.flags.is_reliable() {
            io.notify_retransmit(self.id);
        }

        match self.state {
            State::SynSent => {
                let mut aux = [0u8; AUX_INIT_LEN];
                AuxInit::new(self.flags).encode(&mut aux);

                let hdr = Header {
                    src: self.id.local,
                    dst: self.id.remote,
                    seq: self.snd.iss,
                    ack: 0,
                    wnd: self.rcvbuf.max_size() as u32,
                    ctl: Ctl::SYN,
                    aux: AuxInit::aux_word(),
                };

                tracing::info!("retransmitting syn");
                io.transmit(&hdr, Payload::Slice(&aux));
            }

            State::SynReceived => {
                tracing::info!("retransmitting syn+ack");
                self.send_synack(io);
            }

            State::Established
            | State::FinWait1
            | State::CloseWait
            | State::Closing
            | State::LastAck => {
                if !self.flags.is_reliable() && self.flags.is_framed() && !self.sndbuf.is_empty() {
                    self.flush_framed(io);
                    return;
                }

                let mut hdr = Header {
                    src: self.id.local,
                    dst: self.id.remote,
                    seq: self.snd.una,
                    ack: self.rcv.nxt,
                    wnd: self.rcvbuf.max_size() as u32,
                    ctl: Ctl::ACK,
                    aux: 0,
                };

                let mut len = (seq_diff(self.snd.last, self.snd.una) as u32).min(io.mss.into());

                if self.fin_wanted(self.snd.una.wrapping_add(len)) {
                    len -= 1;
                    hdr.ctl |= Ctl::FIN;
                }

                // RFC 5681: back into slow start after a timeout.
                self.cong.on_rto(self.flightsize(), io.mss.into());

                tracing::info!(seq = hdr.seq, len, "retransmitting after timeout");
                io.transmit(&hdr, Payload::Buffer(&self.sndbuf, 0, len as usize));

                self.snd.nxt = self.snd.una.wrapping_add(len);
            }

            State::Closed | State::Listen | State::TimeWait | State::FinWait2 => {
                self.rtrx_deadline = None;
                return;
            }
        }

        self.start_rtrx_timer(io);
        self.rtt.backoff();
        self.cong.dupack = 0;
    }

    // # Receiving

    /// Processes one packet addressed to this connection. `data` is the
    /// payload after the auxiliary chain.
    pub(crate) fn on_packet(
        &mut self,
        io: &mut Carrier<'_>,
        mut hdr: Header,
        mut data: &[u8],
    ) -> Disposition {
        let has_data = !data.is_empty() || hdr.ctl.intersects(Ctl::SYN | Ctl::FIN);

        // Discard data outside the receive window, trimming bytes that
        // overlap the already-delivered prefix.
        if self.flags.is_reliable() {
            let acceptable = if self.state == State::SynSent {
                true
            } else if data.is_empty() {
                seq_diff(hdr.seq, self.rcv.nxt) >= 0
            } else {
                let rcv_offset = seq_diff(hdr.seq, self.rcv.nxt);

                if rcv_offset < 0 {
                    if data.len() > (-rcv_offset) as usize {
                        data = &data[(-rcv_offset) as usize..];
                        hdr.seq = hdr.seq.wrapping_add((-rcv_offset) as u32);
                        true
                    } else {
                        false
                    }
                } else {
                    rcv_offset as usize + data.len() <= self.rcvbuf.max_size()
                }
            };

            if !acceptable {
                tracing::trace!(seq = hdr.seq, nxt = self.rcv.nxt, "packet not acceptable");

                if hdr.ctl.contains(Ctl::RST) {
                    return Disposition::Keep;
                }

                data = &[];
            }
        }

        self.snd.wnd = hdr.wnd;

        // An unreliable peer echoes stale ack numbers; coerce instead of
        // resetting.
        if !self.flags.is_reliable()
            && hdr.ack != self.snd.last
            && self.state >= State::Established
        {
            hdr.ack = self.snd.una;
        }

        // The ack must not roll back, nor acknowledge beyond what was sent.
        if hdr.ctl.contains(Ctl::ACK)
            && (seq_diff(hdr.ack, self.snd.last) > 0 || seq_diff(hdr.ack, self.snd.una) < 0)
        {
            tracing::trace!(
                ack = hdr.ack,
                una = self.snd.una,
                last = self.snd.last,
                "ack out of range"
            );

            if hdr.ctl.contains(Ctl::RST) {
                return Disposition::Keep;
            }

            self.reset_reply(io, &hdr, data.len() as u32);
            return Disposition::Keep;
        }

        if hdr.ctl.contains(Ctl::RST) {
            return self.on_rst(&hdr);
        }

        let mut advanced = 0u32;

        if hdr.ctl.contains(Ctl::ACK) {
            advanced = seq_diff(hdr.ack, self.snd.una) as u32;

            if advanced != 0 {
                self.rtt.on_ack(io.now, hdr.ack, io.granularity_us);

                let mut data_acked = advanced;

                if matches!(self.state, State::SynSent | State::SynReceived) {
                    // The SYN occupies a sequence number but no buffer byte.
                    data_acked -= 1;
                }

                debug_assert!(data_acked as i32 <= seq_diff(self.snd.last, self.snd.una));

                if data_acked != 0 {
                    self.sndbuf.discard(data_acked as usize);

                    if self.flags.is_reliable() {
                        self.do_poll = true;
                    }
                }

                if seq_diff(self.snd.nxt, hdr.ack) < 0 {
                    self.snd.nxt = hdr.ack;
                }

                self.snd.una = hdr.ack;

                self.cong
                    .on_advance(advanced, io.mss.into(), self.sndbuf.max_size() as u32);

                match self.state {
                    State::FinWait1 if self.snd.una == self.snd.last => {
                        self.set_state(State::FinWait2);
                    }
                    State::Closing if self.snd.una == self.snd.last => {
                        self.arm_conn_deadline(io);
                        self.set_state(State::TimeWait);
                    }
                    State::LastAck if self.snd.una == self.snd.last => {
                        self.set_state(State::Closed);
                    }
                    _ => {}
                }
            } else if data.is_empty()
                && self.flags.is_reliable()
                && self.snd.una != self.snd.last
            {
                // A pure duplicate ACK while data is outstanding.
                let fast = self.cong.on_dup_ack(
                    self.flightsize(),
                    io.mss.into(),
                    self.sndbuf.max_size() as u32,
                );

                if fast {
                    tracing::info!("fast recovery started");
                    self.fast_retransmit(io);
                }

                // The peer did receive something; reset the retransmission
                // timer but leave the connection deadline alone.
                self.start_rtrx_timer(io);
            }

            if advanced != 0 {
                if self.snd.una == self.snd.last {
                    self.rtrx_deadline = None;
                    self.conn_deadline = None;
                } else if self.flags.is_reliable() {
                    self.start_rtrx_timer(io);
                    self.arm_conn_deadline(io);
                }
            }
        }

        if hdr.ctl.contains(Ctl::SYN) {
            match self.state {
                State::SynSent => {
                    // A SYN+ACK; it must acknowledge our SYN.
                    if advanced == 0 {
                        self.reset_reply(io, &hdr, data.len() as u32);
                        return Disposition::Keep;
                    }

                    self.rcv.irs = hdr.seq;
                    self.rcv.nxt = hdr.seq.wrapping_add(1);

                    if self.shut_wr {
                        self.snd.last = self.snd.last.wrapping_add(1);
                        self.set_state(State::FinWait1);
                    } else {
                        self.do_poll = true;
                        self.set_state(State::Established);
                    }
                }

                State::SynReceived => {
                    // Retransmitted SYN; our SYN+ACK was lost.
                    self.begin_passive(io, &hdr);
                    return Disposition::Keep;
                }

                // A stray SYN on a synchronized connection; the ACK sent
                // below covers it.
                _ => {}
            }
        }

        if self.state == State::SynReceived {
            // The ACK completing the handshake.
            if advanced == 0 {
                self.reset_reply(io, &hdr, data.len() as u32);
                return Disposition::Keep;
            }

            if let Some(cb) = io.accept.as_mut() {
                let local = self.id.local;
                let mut accepted = Accepted { conn: self };
                cb(&mut accepted, local);
            }

            if self.state != State::Established {
                tracing::info!("passive open not confirmed, resetting");
                self.set_state(State::Closed);
                self.reapable = true;
                self.reset_reply(io, &hdr, data.len() as u32);
                return Disposition::Keep;
            }
        }

        if !data.is_empty() {
            match self.state {
                State::SynSent | State::SynReceived => {
                    return Disposition::Keep;
                }

                State::Established | State::FinWait1 | State::FinWait2 => {
                    self.handle_incoming_data(&hdr, data);
                }

                State::CloseWait | State::Closing | State::LastAck | State::TimeWait => {
                    // Data after the peer's FIN.
                    self.reset_reply(io, &hdr, data.len() as u32);
                    return Disposition::Keep;
                }

                State::Closed | State::Listen => return Disposition::Keep,
            }
        }

        // A FIN is only honoured once everything before it was received.
        if hdr.ctl.contains(Ctl::FIN)
            && (!self.flags.is_reliable()
                || hdr.seq.wrapping_add(data.len() as u32) == self.rcv.nxt)
        {
            match self.state {
                State::SynSent | State::SynReceived | State::Closed | State::Listen => {
                    return Disposition::Keep;
                }

                State::Established => self.set_state(State::CloseWait),
                State::FinWait1 => self.set_state(State::Closing),
                State::FinWait2 => {
                    self.arm_conn_deadline(io);
                    self.set_state(State::TimeWait);
                }

                State::CloseWait | State::Closing | State::LastAck | State::TimeWait => {
                    // A second FIN.
                    self.reset_reply(io, &hdr, data.len() as u32);
                    return Disposition::Keep;
                }
            }

            // The FIN counts as one sequence number.
            self.rcv.nxt = self.rcv.nxt.wrapping_add(1);
            self.deliver_eof();
        }

        // Received data wants an ACK back; a received ACK may have opened
        // the window for more of our own data.
        if self.flags.is_reliable() || hdr.ctl.intersects(Ctl::SYN | Ctl::FIN) {
            self.push(io, has_data);
        }

        Disposition::Keep
    }

    fn on_rst(&mut self, hdr: &Header) -> Disposition {
        match self.state {
            State::SynSent => {
                if !hdr.ctl.contains(Ctl::ACK) {
                    return Disposition::Keep;
                }

                tracing::info!("connection refused by peer");
                self.set_state(State::Closed);
                self.deliver_err(ErrorKind::ConnectionRefused);

                if !self.reapable {
                    self.notify_poll(0);
                }

                Disposition::Keep
            }

            State::SynReceived => {
                if hdr.ctl.contains(Ctl::ACK) {
                    return Disposition::Keep;
                }

                // The application never saw this connection; delete it
                // silently.
                Disposition::Free
            }

            State::Established | State::FinWait1 | State::FinWait2 | State::CloseWait => {
                if hdr.ctl.contains(Ctl::ACK) {
                    return Disposition::Keep;
                }

                tracing::info!("connection reset by peer");
                self.set_state(State::Closed);
                self.deliver_err(ErrorKind::ConnectionReset);

                if !self.reapable {
                    self.notify_poll(0);
                }

                Disposition::Keep
            }

            State::Closing | State::LastAck | State::TimeWait => {
                if hdr.ctl.contains(Ctl::ACK) {
                    return Disposition::Keep;
                }

                // The application already considers this closed.
                if self.reapable {
                    return Disposition::Free;
                }

                self.set_state(State::Closed);
                Disposition::Keep
            }

            State::Closed | State::Listen => Disposition::Keep,
        }
    }

    // # Payload handling

    fn handle_incoming_data(&mut self, hdr: &Header, data: &[u8]) {
        if !self.flags.is_reliable() {
            if self.flags.is_framed() {
                self.recv_unreliable_framed(hdr, data);
            } else {
                self.recv_unreliable(hdr, data);
            }

            return;
        }

        let offset = seq_diff(hdr.seq, self.rcv.nxt) as u32;

        if self.flags.is_framed() {
            if offset != 0 {
                self.recv_out_of_order_framed(offset, data);
            } else {
                self.recv_in_order_framed(data);
            }
        } else if offset != 0 {
            self.recv_out_of_order(offset, data);
        } else {
            self.recv_in_order(data);
        }
    }

    fn recv_out_of_order(&mut self, offset: u32, data: &[u8]) {
        tracing::trace!(offset, len = data.len(), "out of order packet");

        let stored = match self.rcvbuf.put_at(offset as usize, data) {
            Ok(0) | Err(_) => {
                tracing::trace!("packet outside receive buffer, dropping");
                return;
            }
            Ok(n) => n,
        };

        self.sacks.record(offset, stored as u32);
    }

    fn recv_out_of_order_framed(&mut self, offset: u32, data: &[u8]) {
        // Undelivered leading-frame bytes shift the whole offset space.
        let in_order_offset = match self.sacks.first() {
            Some(first) if first.offset == 0 => first.len,
            _ => 0,
        };

        self.recv_out_of_order(offset + in_order_offset, data);
    }

    fn recv_in_order(&mut self, data: &[u8]) {
        let mut len = data.len();
        self.deliver_data(data);

        // The new data may close the gap to buffered out-of-order bytes.
        if let Some(first) = self.sacks.first() {
            if len as u32 >= first.offset && (len as u32) < first.end() {
                let total = first.end() as usize;
                self.deliver_buf(len, total - len);
                len = total;
            }
        }

        if !self.rcvbuf.is_empty() {
            self.sack_consume(len);
        }

        self.rcv.nxt = self.rcv.nxt.wrapping_add(len as u32);
    }

    fn recv_in_order_framed(&mut self, data: &[u8]) {
        // Stage everything: the packet boundary almost never coincides
        // with a frame boundary, so bytes are pulled back out only as
        // whole frames.
        let in_order_offset = match self.sacks.first() {
            Some(first) if first.offset == 0 => first.len,
            _ => 0,
        };
        self.recv_out_of_order(in_order_offset, data);

        loop {
            let Some(first) = self.sacks.first() else {
                break;
            };

            if first.offset != 0 || first.len < 2 {
                break;
            }

            let mut prefix = [0u8; 2];
            self.rcvbuf.copy_to(&mut prefix, 0);
            let framelen = usize::from(LittleEndian::read_u16(&prefix));

            if framelen as u32 > first.len - 2 {
                break;
            }

            self.deliver_buf(2, framelen);
            self.sack_consume(framelen + 2);
        }

        self.rcv.nxt = self.rcv.nxt.wrapping_add(data.len() as u32);
    }

    fn sack_consume(&mut self, len: usize) {
        if len > self.rcvbuf.used() {
            // Everything buffered was overtaken by the in-order stream.
            self.sacks.clear();
            return;
        }

        self.rcvbuf.discard(len);
        self.sacks.consume(len as u32);
    }

    fn recv_unreliable(&mut self, hdr: &Header, data: &[u8]) {
        // Fast path for unfragmented datagrams.
        if hdr.wnd == 0 && !hdr.ctl.contains(Ctl::MF) {
            self.deliver_data(data);
            self.rcv.nxt = hdr.seq.wrapping_add(data.len() as u32);
            return;
        }

        // `wnd` is the fragment offset here; cap the reassembled size.
        if hdr.wnd as usize > MAX_UNRELIABLE_SIZE
            || hdr.wnd as usize + data.len() > MAX_UNRELIABLE_SIZE
        {
            return;
        }

        // Fragments must arrive in order.
        if hdr.wnd != 0 && hdr.seq != self.rcv.nxt {
            return;
        }

        if hdr.wnd == 0 {
            self.rcvbuf.clear();
        }

        match self.rcvbuf.put_at(hdr.wnd as usize, data) {
            Ok(n) if n == data.len() => {}
            _ => return,
        }

        if !hdr.ctl.contains(Ctl::MF) {
            self.deliver_buf(0, hdr.wnd as usize + data.len());
        }

        self.rcv.nxt = hdr.seq.wrapping_add(data.len() as u32);
    }

    fn recv_unreliable_framed(&mut self, hdr: &Header, data: &[u8]) {
        let in_order = hdr.seq == self.rcv.nxt;
        self.rcv.nxt = hdr.seq.wrapping_add(data.len() as u32);

        let mut pos = 0usize;
        let mut left = data.len();
        let boundary = hdr.wnd as usize;

        // Leading bytes belonging to the previous packet's partial frame.
        if boundary > 0 {
            if in_order && !self.rcvbuf.is_empty() {
                let take = boundary.min(data.len());
                let _ = self.rcvbuf.put(&data[..take]);

                if boundary <= data.len() {
                    // The accumulated frame is complete.
                    let framelen = self.rcvbuf.used().saturating_sub(2);
                    self.deliver_buf(2, framelen);
                }
            }

            if boundary > data.len() {
                // The whole packet continues a frame we may not have.
                if !in_order {
                    self.rcvbuf.clear();
                }

                return;
            }

            pos += boundary;
            left -= boundary;
        }

        // From here on only whole frames; the accumulator restarts.
        self.rcvbuf.clear();

        while left > 2 {
            let framelen = usize::from(LittleEndian::read_u16(&data[pos..pos + 2]));

            if left < framelen + 2 {
                break;
            }

            self.deliver_data(&data[pos + 2..pos + 2 + framelen]);
            pos += framelen + 2;
            left -= framelen + 2;
        }

        if left > 0 {
            let _ = self.rcvbuf.put(&data[pos..]);
        }
    }
}

pub(crate) fn stale_handle() -> Error {
    Error::new(ErrorKind::Other, "stale connection handle")
}

fn msg_too_large() -> Error {
    Error::new(ErrorKind::InvalidInput, "message too large")
}
