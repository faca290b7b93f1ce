//! Wire protocol between a PSP proxy host and the stub running on the target.
//!
//! Every exchange is a PDU: a fixed 32-byte little-endian header, a
//! [`postcard`] payload and an 8-byte footer carrying a checksum and an end
//! magic. Start and end magics differ per direction so a host never mistakes
//! its own echo for a target reply.

mod codec;
mod error;
mod message;
mod scalar;

pub use codec::{
    Decoder, Direction, FOOTER_LEN, HEADER_LEN, MAX_PAYLOAD, MAX_PDU, Pdu, encode,
};
pub use error::{Error, Result};
pub use message::{
    CoProcReg, Message, MsgId, Notification, NotifyKind, Op, PspAddr, R0Ptr, Request, Response,
    SmnAddr, TargetInfo, X86PAddr, rc,
};
pub use scalar::{Scalar, Width};
