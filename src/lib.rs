//! Connection-oriented transport over an unreliable datagram carrier.
//!
//! The engine layers TCP-like semantics on top of whatever delivers whole
//! datagrams or nothing: the host feeds inbound packets into
//! [`Engine::recv`], hands writes to [`Engine::send`], and supplies an
//! outbound send callback at construction. The engine itself opens no
//! sockets, runs no timers and spawns no threads; the host calls
//! [`Engine::tick`] and sleeps for the returned duration.
//!
//! Every connection picks one of three traffic modes at open time, all
//! sharing the same lifecycle: a reliable ordered byte stream
//! ([`ConnFlags::TCP`]), unreliable datagrams ([`ConnFlags::UDP`]), or
//! unreliable length-prefixed frames ([`ConnFlags::FRAMED`]). Reliable
//! connections get congestion control, selective-ack reassembly, RTT-based
//! retransmission and flow control against bounded buffers.
//!
//! ```no_run
//! use std::net::Shutdown;
//! use virtcp::{Engine, RecvEvent};
//!
//! let mut engine = Engine::new(|datagram: &[u8]| {
//!     // hand the datagram to the carrier
//!     datagram.len() as isize
//! });
//!
//! let conn = engine
//!     .connect(
//!         7,
//!         Box::new(|_ctl, event| match event {
//!             RecvEvent::Data(data) => {
//!                 println!("got {} bytes", data.len());
//!                 data.len()
//!             }
//!             RecvEvent::Eof | RecvEvent::Error(_) => 0,
//!         }),
//!     )
//!     .unwrap();
//!
//! engine.send(conn, b"hello").unwrap();
//! engine.shutdown(conn, Shutdown::Write).unwrap();
//!
//! loop {
//!     let sleep = engine.tick();
//!     // feed inbound datagrams with engine.recv(..), then sleep
//!     # let _ = sleep;
//!     # break;
//! }
//! ```
//!
//! Errors follow `std::io` conventions: `NotConnected` for operations on
//! unopened connections, `BrokenPipe` after a local shutdown,
//! `WouldBlock` for all-or-nothing writes that do not fit, `InvalidData`
//! for malformed packets, `TimedOut`/`ConnectionRefused`/`ConnectionReset`
//! for peer-fatal conditions (also surfaced as [`RecvEvent::Error`]).

mod buf;
mod carrier;
mod connection;
mod engine;
mod pkt;
mod table;

#[cfg(test)]
mod tests;

pub use carrier::{AcceptFn, PreAcceptFn, RetransmitFn, SendFn};
pub use connection::{Accepted, ConnFlags, ConnectionCtl, PollFn, RecvEvent, RecvFn, State};
pub use engine::{Engine, DEFAULT_MTU, DEFAULT_USER_TIMEOUT};
pub use pkt::{AuxInit, Ctl, Header, HEADER_LEN};
pub use table::ConnId;

/// Largest message a single unreliable or framed send may carry, and the
/// cap on reassembled fragmented datagrams.
pub const MAX_UNRELIABLE_SIZE: usize = 65536;
