use std::time::{Duration, Instant};

use crate::buf::RingBuffer;
use crate::connection::Accepted;
use crate::pkt::{Header, HEADER_LEN};
use crate::table::ConnId;

/// Transmits one datagram on the host's carrier. A return value matching
/// the datagram size means success; anything ≤ 0 is a transient failure
/// that the retransmission machinery recovers from.
pub type SendFn = Box<dyn FnMut(&[u8]) -> isize>;

/// Announces a completed passive open. The host must call
/// [`Accepted::confirm`] to keep the connection; otherwise it is reset.
pub type AcceptFn = Box<dyn FnMut(&mut Accepted<'_>, u16)>;

/// Vetoes a passive open before any state is allocated.
pub type PreAcceptFn = Box<dyn FnMut(u16) -> bool>;

/// Observes every timer-driven retransmission on a reliable connection.
pub type RetransmitFn = Box<dyn FnMut(ConnId)>;

/// Engine context lent to a connection for the duration of one entry
/// point: the send callback, the shared scratch packet buffer, and the
/// engine-wide options a connection needs to act on.
pub(crate) struct Carrier<'a> {
    pub send: &'a mut SendFn,
    pub scratch: &'a mut Vec<u8>,
    pub mss: u16,
    pub user_timeout: Duration,
    pub flush_timeout: Option<Duration>,
    pub granularity_us: u32,
    pub now: Instant,
    pub accept: Option<&'a mut AcceptFn>,
    pub retransmit: Option<&'a mut RetransmitFn>,
}

/// What goes after the header of an outgoing packet.
pub(crate) enum Payload<'a> {
    None,
    Slice(&'a [u8]),
    /// `len` bytes starting at the given logical offset of a buffer.
    Buffer(&'a RingBuffer, usize, usize),
}

impl Carrier<'_> {
    /// Encodes `hdr` plus `payload` into the scratch buffer and hands the
    /// datagram to the host. Transient send failures are logged and
    /// otherwise ignored.
    pub fn transmit(&mut self, hdr: &Header, payload: Payload<'_>) {
        hdr.encode(&mut self.scratch[..HEADER_LEN]);

        let len = match payload {
            Payload::None => 0,
            Payload::Slice(data) => {
                self.scratch[HEADER_LEN..HEADER_LEN + data.len()].copy_from_slice(data);
                data.len()
            }
            Payload::Buffer(buf, offset, len) => {
                buf.copy_to(&mut self.scratch[HEADER_LEN..HEADER_LEN + len], offset)
            }
        };

        let total = HEADER_LEN + len;
        tracing::trace!(
            seq = hdr.seq,
            ack = hdr.ack,
            ctl = ?hdr.ctl,
            len,
            "send"
        );

        let rv = (self.send)(&self.scratch[..total]);

        if rv < total as isize {
            tracing::warn!(rv, total, "carrier send fell short, leaving it to the timers");
        }
    }

    pub fn notify_retransmit(&mut self, id: ConnId) {
        if let Some(cb) = self.retransmit.as_mut() {
            cb(id);
        }
    }
}
