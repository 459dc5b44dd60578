use std::io::{Error, ErrorKind, Result};

use byteorder::{ByteOrder, LittleEndian};

use crate::connection::ConnFlags;

/// Size of the fixed wire header.
pub const HEADER_LEN: usize = 20;

bitflags::bitflags! {
    /// Control bits of the wire header. Any other bit set fails the packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ctl: u16 {
        const SYN = 1;
        const ACK = 2;
        const FIN = 4;
        const RST = 8;
        const MF  = 16;
    }
}

/// The fixed wire header, little-endian on the wire.
///
/// `wnd` is overloaded: receive-window advertisement on reliable
/// connections, fragment offset on unreliable ones, and in-segment frame
/// boundary offset in unreliable framed mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub src: u16,
    pub dst: u16,
    pub seq: u32,
    pub ack: u32,
    pub wnd: u32,
    pub ctl: Ctl,
    pub aux: u16,
}

impl Header {
    pub fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u16(&mut buf[0..2], self.src);
        LittleEndian::write_u16(&mut buf[2..4], self.dst);
        LittleEndian::write_u32(&mut buf[4..8], self.seq);
        LittleEndian::write_u32(&mut buf[8..12], self.ack);
        LittleEndian::write_u32(&mut buf[12..16], self.wnd);
        LittleEndian::write_u16(&mut buf[16..18], self.ctl.bits());
        LittleEndian::write_u16(&mut buf[18..20], self.aux);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::new(ErrorKind::InvalidData, "short packet"));
        }

        let ctl = Ctl::from_bits(LittleEndian::read_u16(&buf[16..18]))
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "unknown ctl bits"))?;

        Ok(Header {
            src: LittleEndian::read_u16(&buf[0..2]),
            dst: LittleEndian::read_u16(&buf[2..4]),
            seq: LittleEndian::read_u32(&buf[4..8]),
            ack: LittleEndian::read_u32(&buf[8..12]),
            wnd: LittleEndian::read_u32(&buf[12..16]),
            ctl,
            aux: LittleEndian::read_u16(&buf[18..20]),
        })
    }

    /// The RST reply to an unacceptable packet. If the offender carried an
    /// ACK the reset takes its sequence number from it; otherwise it
    /// acknowledges the offending segment instead.
    pub fn rst_reply(hdr: &Header, len: u32) -> Header {
        let mut rst = Header {
            src: hdr.dst,
            dst: hdr.src,
            seq: 0,
            ack: 0,
            wnd: 0,
            ctl: Ctl::RST,
            aux: 0,
        };

        if hdr.ctl.contains(Ctl::ACK) {
            rst.seq = hdr.ack;
        } else {
            rst.ack = hdr.seq.wrapping_add(len);
            rst.ctl |= Ctl::ACK;
        }

        rst
    }
}

/// Signed distance between two sequence numbers, wraparound-aware.
pub(crate) fn seq_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

const AUX_TYPE_INIT: u8 = 1;
const AUX_MORE: u16 = 0x800;

/// The SYN-time INIT descriptor, the only auxiliary header currently
/// defined. Wire form: aux word `0x0101`, then `{major, minor, 0, flags}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxInit {
    pub major: u8,
    pub minor: u8,
    pub flags: ConnFlags,
}

pub const AUX_INIT_LEN: usize = 4;

impl AuxInit {
    pub fn new(flags: ConnFlags) -> Self {
        AuxInit {
            major: 1,
            minor: 0,
            flags: flags & ConnFlags::INIT_MASK,
        }
    }

    /// The aux word announcing this descriptor: type 1, one 4-byte unit.
    pub fn aux_word() -> u16 {
        0x0101
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0] = self.major;
        buf[1] = self.minor;
        buf[2] = 0;
        buf[3] = (self.flags & ConnFlags::INIT_MASK).bits() as u8;
    }
}

/// Walks the auxiliary chain announced by `hdr.aux` at the front of
/// `payload`. Returns the recognized descriptors and the byte count
/// consumed; a chain that does not parse to its end fails the packet.
pub fn parse_aux(hdr: &Header, payload: &[u8]) -> Result<(Option<AuxInit>, usize)> {
    let mut init = None;
    let mut aux = hdr.aux;
    let mut pos = 0usize;

    while aux != 0 {
        let len = 4 * ((aux >> 8) & 0xf) as usize;
        let typ = (aux & 0xff) as u8;

        if payload.len() - pos < len {
            return Err(Error::new(ErrorKind::InvalidData, "truncated aux header"));
        }

        match typ {
            AUX_TYPE_INIT => {
                if !hdr.ctl.contains(Ctl::SYN) || len != AUX_INIT_LEN {
                    return Err(Error::new(ErrorKind::InvalidData, "malformed init header"));
                }

                let raw = &payload[pos..pos + AUX_INIT_LEN];
                init = Some(AuxInit {
                    major: raw[0],
                    minor: raw[1],
                    flags: ConnFlags::from_bits_truncate(u32::from(raw[3]))
                        & ConnFlags::INIT_MASK,
                });
            }
            _ => {
                return Err(Error::new(ErrorKind::InvalidData, "unknown aux type"));
            }
        }

        pos += len;

        if aux & AUX_MORE == 0 {
            break;
        }

        if payload.len() - pos < 2 {
            return Err(Error::new(ErrorKind::InvalidData, "truncated aux chain"));
        }

        aux = LittleEndian::read_u16(&payload[pos..pos + 2]);
        pos += 2;
    }

    Ok((init, pos))
}
