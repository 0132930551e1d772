use std::fmt::{Debug, Display, Formatter};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::sequence_number::SequenceNumber;

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

macro_rules! checked_get {
    ($buf: expr, $ty:ty, $getter: ident) => {
        {
            if $buf.remaining() < size_of::<$ty>() {
                Err(anyhow!("buffer underflow"))
            }
            else {
                Ok::<$ty, anyhow::Error>($buf.$getter())
            }
        }
    }
}

/// A session id scopes envelopes to one incarnation of the connection between two peers: the
///  owner picks a fresh id for every (re-)connect, and envelopes with a different id are
///  discarded. This prevents data or acks that are still in flight from an earlier connection
///  from interfering with the current one.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SessionId(pub u16);
impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u32);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x?}", self.0)
    }
}
impl Checksum {
    pub fn new(covered: &[u8]) -> Checksum {
        Checksum(CHECKSUM.checksum(covered))
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
enum EnvelopeKindId {
    Handshake = 0,
    HandshakeAck = 1,
    Data = 2,
    Ack = 3,
    Goodbye = 4,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EnvelopeKind {
    /// sent by the initiating side to open a session, carrying the sender's receive watermark
    Handshake { last_received: Option<SequenceNumber> },
    /// the responding side's reply to a handshake, carrying the responder's receive watermark
    HandshakeAck { last_received: Option<SequenceNumber> },
    Data { sequence: SequenceNumber, payload: Bytes },
    /// cumulative: acknowledges all messages up to and including `sequence`
    Ack { sequence: SequenceNumber },
    /// orderly close of the session by the initiating side
    Goodbye,
}
impl EnvelopeKind {
    fn id(&self) -> EnvelopeKindId {
        match self {
            EnvelopeKind::Handshake { .. } => EnvelopeKindId::Handshake,
            EnvelopeKind::HandshakeAck { .. } => EnvelopeKindId::HandshakeAck,
            EnvelopeKind::Data { .. } => EnvelopeKindId::Data,
            EnvelopeKind::Ack { .. } => EnvelopeKindId::Ack,
            EnvelopeKind::Goodbye => EnvelopeKindId::Goodbye,
        }
    }
}

/// An envelope is the unit of exchange between two peers. Envelopes are serialized into a
///  frame for the transport, and a received frame is parsed back into an envelope. Frames
///  that fail to parse are never processed.
///
/// ```ascii
/// 0: CRC-32 checksum over the rest of the frame (u32)
/// 4: protocol version (u8)
/// 5: session id (u16)
/// 7: kind (u8)
/// 8: sequence number or watermark (u32) - absent for GOODBYE
/// 12: DATA only: payload length (varint), followed by the payload
/// ```
///
/// All fixed-width numbers are in network byte order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Envelope {
    pub session_id: SessionId,
    pub kind: EnvelopeKind,
}
impl Envelope {
    pub const PROTOCOL_VERSION: u8 = 0;

    const OFFS_VERSION: usize = size_of::<u32>();
    const HEADER_LEN: usize = size_of::<u32>() + size_of::<u8>() + size_of::<u16>() + size_of::<u8>();

    pub fn handshake(session_id: SessionId, last_received: Option<SequenceNumber>) -> Envelope {
        Envelope { session_id, kind: EnvelopeKind::Handshake { last_received } }
    }

    pub fn handshake_ack(session_id: SessionId, last_received: Option<SequenceNumber>) -> Envelope {
        Envelope { session_id, kind: EnvelopeKind::HandshakeAck { last_received } }
    }

    pub fn data(session_id: SessionId, sequence: SequenceNumber, payload: Bytes) -> Envelope {
        Envelope { session_id, kind: EnvelopeKind::Data { sequence, payload } }
    }

    pub fn ack(session_id: SessionId, sequence: SequenceNumber) -> Envelope {
        Envelope { session_id, kind: EnvelopeKind::Ack { sequence } }
    }

    pub fn goodbye(session_id: SessionId) -> Envelope {
        Envelope { session_id, kind: EnvelopeKind::Goodbye }
    }

    /// an upper bound for the serialized size, used for buffer allocation
    pub fn max_serialized_len(&self) -> usize {
        let body = match &self.kind {
            EnvelopeKind::Data { payload, .. } => size_of::<u32>() + 10 + payload.len(),
            EnvelopeKind::Goodbye => 0,
            _ => size_of::<u32>(),
        };
        Self::HEADER_LEN + body
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();

        buf.put_u32(0); // placeholder for the checksum
        buf.put_u8(Self::PROTOCOL_VERSION);
        buf.put_u16(self.session_id.0);
        buf.put_u8(self.kind.id().into());

        match &self.kind {
            EnvelopeKind::Handshake { last_received } |
            EnvelopeKind::HandshakeAck { last_received } => {
                buf.put_u32(SequenceNumber::watermark_to_wire(*last_received));
            }
            EnvelopeKind::Data { sequence, payload } => {
                buf.put_u32(sequence.to_raw());
                buf.put_u64_varint(payload.len() as u64);
                buf.put_slice(payload);
            }
            EnvelopeKind::Ack { sequence } => {
                buf.put_u32(sequence.to_raw());
            }
            EnvelopeKind::Goodbye => {}
        }

        let checksum = Checksum::new(&buf[start + Self::OFFS_VERSION..]);
        buf[start..start + Self::OFFS_VERSION].copy_from_slice(&checksum.0.to_be_bytes());
    }

    /// Parses a complete frame. The frame must contain exactly one envelope: a checksum
    ///  mismatch, unknown protocol version or kind, a payload larger than `max_payload_size`
    ///  or trailing bytes are all reported as errors.
    pub fn deser(frame: &[u8], max_payload_size: usize) -> anyhow::Result<Envelope> {
        let mut buf = frame;

        let checksum = Checksum(checked_get!(buf, u32, get_u32)?);
        let actual_checksum = Checksum::new(buf);
        if checksum != actual_checksum {
            bail!("checksum mismatch: frame has {:?}, calculated {:?}", checksum, actual_checksum);
        }

        let version = checked_get!(buf, u8, get_u8)?;
        if version != Self::PROTOCOL_VERSION {
            bail!("unsupported protocol version {}", version);
        }

        let session_id = SessionId(checked_get!(buf, u16, get_u16)?);
        let kind_id = EnvelopeKindId::try_from_primitive(checked_get!(buf, u8, get_u8)?)?;

        let kind = match kind_id {
            EnvelopeKindId::Handshake => EnvelopeKind::Handshake {
                last_received: SequenceNumber::watermark_from_wire(checked_get!(buf, u32, get_u32)?),
            },
            EnvelopeKindId::HandshakeAck => EnvelopeKind::HandshakeAck {
                last_received: SequenceNumber::watermark_from_wire(checked_get!(buf, u32, get_u32)?),
            },
            EnvelopeKindId::Data => {
                let sequence = Self::try_get_sequence(&mut buf)?;
                let payload_len = buf.get_u64_varint()
                    .map_err(|e| anyhow!("invalid payload length: {:?}", e))?;
                if payload_len > max_payload_size as u64 {
                    bail!("payload length {} exceeds the configured maximum of {}", payload_len, max_payload_size);
                }
                let payload_len = payload_len as usize;
                if payload_len > buf.remaining() {
                    bail!("payload length {} exceeds remaining frame length {}", payload_len, buf.remaining());
                }
                let payload = Bytes::copy_from_slice(&buf[..payload_len]);
                buf.advance(payload_len);
                EnvelopeKind::Data { sequence, payload }
            }
            EnvelopeKindId::Ack => EnvelopeKind::Ack {
                sequence: Self::try_get_sequence(&mut buf)?,
            },
            EnvelopeKindId::Goodbye => EnvelopeKind::Goodbye,
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after envelope", buf.remaining());
        }

        Ok(Envelope { session_id, kind })
    }

    fn try_get_sequence(buf: &mut &[u8]) -> anyhow::Result<SequenceNumber> {
        let raw = checked_get!(buf, u32, get_u32)?;
        if raw == SequenceNumber::NONE_ON_WIRE {
            bail!("reserved value {:x} used as sequence number", raw);
        }
        Ok(SequenceNumber::from_raw(raw))
    }
}
