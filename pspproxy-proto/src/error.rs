//! Protocol-level errors.

use crate::message::MsgId;

/// Alias for `Result<T, pspproxy_proto::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while framing or decoding PDUs.
///
/// None of these are recoverable on a live stream: once a decoder reports
/// one, the byte stream can no longer be trusted.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The header does not start with the start magic for this direction.
    #[error("bad start magic {found:#010x}")]
    BadMagic {
        /// The word found where the magic was expected.
        found: u32,
    },

    /// The footer does not end with the end magic for this direction.
    #[error("bad end magic {found:#010x}")]
    BadEndMagic {
        /// The word found where the magic was expected.
        found: u32,
    },

    /// The payload exceeds the PDU size limit.
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    TooLarge {
        /// Declared or actual payload length.
        len: usize,
        /// Largest payload allowed.
        max: usize,
    },

    /// The footer checksum does not cancel the header and payload sum.
    #[error("checksum mismatch")]
    Checksum,

    /// The header carries a message id outside the known set.
    #[error("unknown message id {0:#010x}")]
    UnknownId(u32),

    /// The payload decodes to a message other than the one the header names.
    #[error("header declares {declared} but payload holds {actual}")]
    IdMismatch {
        /// Id from the header.
        declared: MsgId,
        /// Id of the decoded payload.
        actual: MsgId,
    },

    /// The payload holds bytes beyond the encoded message.
    #[error("payload is {declared} bytes but the message occupies {used}")]
    LengthMismatch {
        /// Payload length from the header.
        declared: usize,
        /// Bytes consumed by the message.
        used: usize,
    },

    /// A scalar width other than 1, 2, 4 or 8 bytes.
    #[error("invalid scalar width {0}")]
    InvalidWidth(usize),

    /// The payload is not a valid encoding of the expected message.
    #[error("payload encoding: {0}")]
    Payload(#[from] postcard::Error),
}
