//! Format of a burrow tunnel UDP packet.
//!
//! Every datagram is either a data packet or a control packet, told apart by
//! the first 8 bytes:
//!
//! ```text
//! data:    +----------+-----------+---------+
//!          | SEQUENCE | STREAM_ID | PAYLOAD |
//!          +----------+-----------+---------+
//!          |  8 (≠0)  |     8     | 0..1328 |
//!          +----------+-----------+---------+
//!
//! control: +----------+------+--------------+
//!          |    0     | CODE | CODE PAYLOAD |
//!          +----------+------+--------------+
//!          |    8     |  1   |   VARIABLE   |
//!          +----------+------+--------------+
//! ```
//!
//! Sequence numbers start at 1, so a leading zero word unambiguously marks a
//! control packet. All multi-byte integers are big-endian.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::{DATA_HEADER_LEN, MAX_PAYLOAD};

/// The control code byte, directly after the zero sequence word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ControlCode {
    PeerAddr = 1,
    Heartbeat = 2,
    NewStream = 3,
    Paired = 4,
    Status = 5,
    Miss = 6,
    Fin1 = 7,
    GotFin1 = 8,
    Fin2 = 9,
    GotFin2 = 10,
    SessionFin = 11,
}

/// A parsed control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// The rendezvous service handing over the peer's observed address.
    PeerAddr(SocketAddr),

    /// NAT punch / keepalive. Carries one random filler byte so consecutive
    /// heartbeats don't look identical on the wire.
    Heartbeat(u8),

    /// The originating side announcing a freshly accepted local connection.
    NewStream { stream_id: u64 },

    /// The terminating side's answer to [`Control::NewStream`]: the local
    /// port of the dialed destination socket, or 0 if the dial failed and
    /// the originator should abandon the stream id.
    Paired { stream_id: u64, dial_port: u16 },

    /// Periodic per-stream report: the highest sequence transmitted so far
    /// and the highest contiguous sequence received so far.
    Status { stream_id: u64, highest_sent: u64, continue_seq: u64 },

    /// Request to retransmit the inclusive sequence range `first..=last`.
    Miss { stream_id: u64, first: u64, last: u64 },

    /// First close announcement, from the side whose endpoint closed first.
    /// Carries the stream's final sequence number so the peer knows when it
    /// has drained everything.
    Fin1 { stream_id: u64, highest_sent: u64, continue_seq: u64 },

    /// Acknowledges [`Control::Fin1`], stopping its retry loop.
    GotFin1 { stream_id: u64 },

    /// Second close announcement, from the side that finished draining.
    Fin2 { stream_id: u64 },

    /// Acknowledges [`Control::Fin2`], stopping its retry loop.
    GotFin2 { stream_id: u64 },

    /// Whole-session close on graceful shutdown. No per-stream handshake.
    SessionFin,
}

/// A parsed datagram, borrowing its payload from the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet<'a> {
    Data { sequence: u64, stream_id: u64, payload: &'a [u8] },
    Control(Control),
}

/// Errors from parsing a raw datagram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("datagram too short to carry a packet header")]
    TooShort,

    #[error("unknown control code {0}")]
    UnknownCode(u8),

    #[error("control packet {0:?} is missing payload bytes")]
    Truncated(ControlCode),

    #[error("unknown address family tag {0}")]
    BadAddressTag(u8),
}

impl<'a> Packet<'a> {
    /// Parses a received datagram.
    pub fn parse(buf: &'a [u8]) -> Result<Self, PacketError> {
        if buf.len() < 8 {
            return Err(PacketError::TooShort);
        }

        let word = u64::from_be_bytes(buf[..8].try_into().unwrap());
        if word != 0 {
            if buf.len() < DATA_HEADER_LEN {
                return Err(PacketError::TooShort);
            }

            let stream_id = u64::from_be_bytes(buf[8..16].try_into().unwrap());
            return Ok(Packet::Data {
                sequence: word,
                stream_id,
                payload: &buf[DATA_HEADER_LEN..],
            });
        }

        if buf.len() < 9 {
            return Err(PacketError::TooShort);
        }

        let code = ControlCode::try_from(buf[8]).map_err(|_| PacketError::UnknownCode(buf[8]))?;
        Control::parse_body(code, &buf[9..]).map(Packet::Control)
    }
}

/// Builds a data packet ready for transmission.
///
/// Panics if the payload exceeds [`MAX_PAYLOAD`] or the sequence is 0; both
/// would corrupt the framing and indicate a caller bug.
pub fn data_packet(sequence: u64, stream_id: u64, payload: &[u8]) -> Vec<u8> {
    if sequence == 0 {
        panic!("data packets start at sequence 1; 0 marks a control packet");
    }

    if payload.len() > MAX_PAYLOAD {
        panic!("payload of {} bytes is over the limit of {MAX_PAYLOAD}", payload.len());
    }

    let mut buf = Vec::with_capacity(DATA_HEADER_LEN + payload.len());
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(&stream_id.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

impl Control {
    /// Serializes this control message into a datagram.
    pub fn to_datagram(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(33);
        buf.extend_from_slice(&0u64.to_be_bytes());
        buf.push(self.code().into());

        match *self {
            Control::PeerAddr(addr) => put_addr(&mut buf, addr),
            Control::Heartbeat(filler) => buf.push(filler),
            Control::NewStream { stream_id } => buf.extend_from_slice(&stream_id.to_be_bytes()),
            Control::Paired { stream_id, dial_port } => {
                buf.extend_from_slice(&stream_id.to_be_bytes());
                buf.extend_from_slice(&dial_port.to_be_bytes());
            }
            Control::Status { stream_id, highest_sent, continue_seq }
            | Control::Fin1 { stream_id, highest_sent, continue_seq } => {
                buf.extend_from_slice(&stream_id.to_be_bytes());
                buf.extend_from_slice(&highest_sent.to_be_bytes());
                buf.extend_from_slice(&continue_seq.to_be_bytes());
            }
            Control::Miss { stream_id, first, last } => {
                buf.extend_from_slice(&stream_id.to_be_bytes());
                buf.extend_from_slice(&first.to_be_bytes());
                buf.extend_from_slice(&last.to_be_bytes());
            }
            Control::GotFin1 { stream_id } | Control::Fin2 { stream_id } | Control::GotFin2 { stream_id } => {
                buf.extend_from_slice(&stream_id.to_be_bytes());
            }
            Control::SessionFin => {}
        }

        buf
    }

    /// The code byte this message is serialized under.
    pub fn code(&self) -> ControlCode {
        match self {
            Control::PeerAddr(_) => ControlCode::PeerAddr,
            Control::Heartbeat(_) => ControlCode::Heartbeat,
            Control::NewStream { .. } => ControlCode::NewStream,
            Control::Paired { .. } => ControlCode::Paired,
            Control::Status { .. } => ControlCode::Status,
            Control::Miss { .. } => ControlCode::Miss,
            Control::Fin1 { .. } => ControlCode::Fin1,
            Control::GotFin1 { .. } => ControlCode::GotFin1,
            Control::Fin2 { .. } => ControlCode::Fin2,
            Control::GotFin2 { .. } => ControlCode::GotFin2,
            Control::SessionFin => ControlCode::SessionFin,
        }
    }

    fn parse_body(code: ControlCode, body: &[u8]) -> Result<Self, PacketError> {
        let control = match code {
            ControlCode::PeerAddr => Control::PeerAddr(take_addr(body).ok_or_else(|| match body.first() {
                Some(&tag) if tag != 4 && tag != 6 => PacketError::BadAddressTag(tag),
                _ => PacketError::Truncated(code),
            })?),
            ControlCode::Heartbeat => Control::Heartbeat(*body.first().ok_or(PacketError::Truncated(code))?),
            ControlCode::NewStream => Control::NewStream {
                stream_id: take_u64(body, 0).ok_or(PacketError::Truncated(code))?,
            },
            ControlCode::Paired => Control::Paired {
                stream_id: take_u64(body, 0).ok_or(PacketError::Truncated(code))?,
                dial_port: take_u16(body, 8).ok_or(PacketError::Truncated(code))?,
            },
            ControlCode::Status => Control::Status {
                stream_id: take_u64(body, 0).ok_or(PacketError::Truncated(code))?,
                highest_sent: take_u64(body, 8).ok_or(PacketError::Truncated(code))?,
                continue_seq: take_u64(body, 16).ok_or(PacketError::Truncated(code))?,
            },
            ControlCode::Miss => Control::Miss {
                stream_id: take_u64(body, 0).ok_or(PacketError::Truncated(code))?,
                first: take_u64(body, 8).ok_or(PacketError::Truncated(code))?,
                last: take_u64(body, 16).ok_or(PacketError::Truncated(code))?,
            },
            ControlCode::Fin1 => Control::Fin1 {
                stream_id: take_u64(body, 0).ok_or(PacketError::Truncated(code))?,
                highest_sent: take_u64(body, 8).ok_or(PacketError::Truncated(code))?,
                continue_seq: take_u64(body, 16).ok_or(PacketError::Truncated(code))?,
            },
            ControlCode::GotFin1 => Control::GotFin1 {
                stream_id: take_u64(body, 0).ok_or(PacketError::Truncated(code))?,
            },
            ControlCode::Fin2 => Control::Fin2 {
                stream_id: take_u64(body, 0).ok_or(PacketError::Truncated(code))?,
            },
            ControlCode::GotFin2 => Control::GotFin2 {
                stream_id: take_u64(body, 0).ok_or(PacketError::Truncated(code))?,
            },
            ControlCode::SessionFin => Control::SessionFin,
        };

        Ok(control)
    }
}

fn take_u64(body: &[u8], offset: usize) -> Option<u64> {
    let bytes = body.get(offset..offset + 8)?;
    Some(u64::from_be_bytes(bytes.try_into().unwrap()))
}

fn take_u16(body: &[u8], offset: usize) -> Option<u16> {
    let bytes = body.get(offset..offset + 2)?;
    Some(u16::from_be_bytes(bytes.try_into().unwrap()))
}

/// Appends a socket address as `[family tag][port][address octets]`, the tag
/// being 4 or 6.
fn put_addr(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(4);
            buf.extend_from_slice(&addr.port().to_be_bytes());
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(6);
            buf.extend_from_slice(&addr.port().to_be_bytes());
            buf.extend_from_slice(&ip.octets());
        }
    }
}

fn take_addr(body: &[u8]) -> Option<SocketAddr> {
    let tag = *body.first()?;
    let port = take_u16(body, 1)?;

    let ip = match tag {
        4 => IpAddr::V4(Ipv4Addr::from(<[u8; 4]>::try_from(body.get(3..7)?).unwrap())),
        6 => IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(body.get(3..19)?).unwrap())),
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}
