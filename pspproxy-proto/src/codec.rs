//! PDU framing over any byte stream.
//!
//! Each PDU is `[header][payload][footer]`, all integers little-endian:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 4    | start magic (`PSP>` or `PSP<`)          |
//! | 4      | 4    | payload length                          |
//! | 8      | 4    | sequence number                         |
//! | 12     | 4    | message id                              |
//! | 16     | 4    | CCD the PDU is addressed to or from     |
//! | 20     | 4    | status (responses only, 0 otherwise)    |
//! | 24     | 8    | sender timestamp in milliseconds        |
//!
//! The footer holds a checksum chosen so that the wrapping byte sum of
//! header bytes 4..32, the payload and the checksum itself is zero, followed
//! by the end magic (`>PSP` or `<PSP`).

use crate::error::{Error, Result};
use crate::message::{Message, MsgId, Op};

/// Largest PDU either side may send, header and footer included.
pub const MAX_PDU: usize = 4096;
/// Header size in bytes.
pub const HEADER_LEN: usize = 32;
/// Footer size in bytes.
pub const FOOTER_LEN: usize = 8;
/// Largest payload a PDU may carry.
pub const MAX_PAYLOAD: usize = MAX_PDU - HEADER_LEN - FOOTER_LEN;

/// Which way a PDU travels; selects the magics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Direction {
    /// Sent by the proxy host.
    HostToTarget,
    /// Sent by the target stub.
    TargetToHost,
}

impl Direction {
    /// Start magic for this direction.
    const fn start_magic(self) -> u32 {
        match self {
            Self::HostToTarget => u32::from_le_bytes(*b"PSP>"),
            Self::TargetToHost => u32::from_le_bytes(*b"PSP<"),
        }
    }

    /// End magic for this direction.
    const fn end_magic(self) -> u32 {
        match self {
            Self::HostToTarget => u32::from_le_bytes(*b">PSP"),
            Self::TargetToHost => u32::from_le_bytes(*b"<PSP"),
        }
    }
}

/// One protocol data unit, with the payload still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    /// Sender-assigned sequence number.
    pub seq: u32,
    /// Message id.
    pub id: MsgId,
    /// CCD the PDU is addressed to (requests) or comes from (responses).
    pub ccd: u32,
    /// Target status; non-zero marks a rejected request.
    pub status: i32,
    /// Milliseconds since the sender started.
    pub timestamp_ms: u64,
    /// Postcard-encoded message.
    pub payload: Vec<u8>,
}

impl Pdu {
    /// Encodes `msg` into a PDU addressed to `ccd`.
    ///
    /// Sequence number and timestamp are left at zero for the sender to fill.
    pub fn from_message(msg: &impl Message, ccd: u32) -> Result<Self> {
        let payload = postcard::to_allocvec(msg)?;
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::TooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        Ok(Self {
            seq: 0,
            id: msg.id(),
            ccd,
            status: 0,
            timestamp_ms: 0,
            payload,
        })
    }

    /// A response that rejects a request for `op` with `status`.
    pub const fn rejected(op: Op, ccd: u32, status: i32) -> Self {
        Self {
            seq: 0,
            id: MsgId::Response(op),
            ccd,
            status,
            timestamp_ms: 0,
            payload: Vec::new(),
        }
    }

    /// Decodes the payload, requiring it to match the header id exactly.
    pub fn decode<M: Message>(&self) -> Result<M> {
        let (msg, rest) = postcard::take_from_bytes::<M>(&self.payload)?;
        if !rest.is_empty() {
            return Err(Error::LengthMismatch {
                declared: self.payload.len(),
                used: self.payload.len() - rest.len(),
            });
        }
        let actual = msg.id();
        if actual != self.id {
            return Err(Error::IdMismatch {
                declared: self.id,
                actual,
            });
        }
        Ok(msg)
    }
}

/// Serializes `pdu` into a complete frame for `dir`.
pub fn encode(dir: Direction, pdu: &Pdu) -> Result<Vec<u8>> {
    let len = pdu.payload.len();
    if len > MAX_PAYLOAD {
        return Err(Error::TooLarge {
            len,
            max: MAX_PAYLOAD,
        });
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + len + FOOTER_LEN);
    frame.extend_from_slice(&dir.start_magic().to_le_bytes());
    frame.extend_from_slice(&u32::try_from(len).unwrap_or(u32::MAX).to_le_bytes());
    frame.extend_from_slice(&pdu.seq.to_le_bytes());
    frame.extend_from_slice(&pdu.id.to_u32().to_le_bytes());
    frame.extend_from_slice(&pdu.ccd.to_le_bytes());
    frame.extend_from_slice(&pdu.status.to_le_bytes());
    frame.extend_from_slice(&pdu.timestamp_ms.to_le_bytes());
    frame.extend_from_slice(&pdu.payload);
    let sum = byte_sum(&frame[4..]);
    frame.extend_from_slice(&0u32.wrapping_sub(sum).to_le_bytes());
    frame.extend_from_slice(&dir.end_magic().to_le_bytes());
    Ok(frame)
}

/// Wrapping sum of every byte.
fn byte_sum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

/// Reads a little-endian `u32` at `off`. The caller guarantees the bounds.
fn le_u32(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(raw)
}

/// Reads a little-endian `u64` at `off`. The caller guarantees the bounds.
fn le_u64(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(raw)
}

/// Incremental PDU decoder for one direction of a byte stream.
///
/// Bytes go in with [`feed`](Self::feed) in whatever chunks the transport
/// delivers; [`decode`](Self::decode) yields complete PDUs. An error leaves
/// the stream unsynchronised and the decoder must be discarded.
#[derive(Debug)]
pub struct Decoder {
    /// Direction of the PDUs this decoder accepts.
    dir: Direction,
    /// Bytes received but not yet consumed.
    buf: Vec<u8>,
}

impl Decoder {
    /// Creates a decoder for PDUs travelling in `dir`.
    pub const fn new(dir: Direction) -> Self {
        Self {
            dir,
            buf: Vec::new(),
        }
    }

    /// Appends received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet part of a complete PDU.
    pub const fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete PDU, or `None` if more bytes are needed.
    ///
    /// The header is validated as soon as it is complete, so a corrupt
    /// length never makes the decoder wait for bytes that will not come.
    pub fn decode(&mut self) -> Result<Option<Pdu>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let magic = le_u32(&self.buf, 0);
        if magic != self.dir.start_magic() {
            return Err(Error::BadMagic { found: magic });
        }
        let len = usize::try_from(le_u32(&self.buf, 4)).unwrap_or(usize::MAX);
        if len > MAX_PAYLOAD {
            return Err(Error::TooLarge {
                len,
                max: MAX_PAYLOAD,
            });
        }
        let raw_id = le_u32(&self.buf, 12);
        let id = MsgId::from_u32(raw_id).ok_or(Error::UnknownId(raw_id))?;

        let total = HEADER_LEN + len + FOOTER_LEN;
        if self.buf.len() < total {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..total).collect();
        let footer = HEADER_LEN + len;
        let end = le_u32(&frame, footer + 4);
        if end != self.dir.end_magic() {
            return Err(Error::BadEndMagic { found: end });
        }
        if byte_sum(&frame[4..footer]).wrapping_add(le_u32(&frame, footer)) != 0 {
            return Err(Error::Checksum);
        }
        Ok(Some(Pdu {
            seq: le_u32(&frame, 8),
            id,
            ccd: le_u32(&frame, 16),
            status: i32::from_le_bytes(le_u32(&frame, 20).to_le_bytes()),
            timestamp_ms: le_u64(&frame, 24),
            payload: frame[HEADER_LEN..footer].to_vec(),
        }))
    }
}
