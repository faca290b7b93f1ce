//! Error and status types for proxy sessions.

use std::fmt;
use std::io;
use std::time::Duration;

use pspproxy_proto::Op;

/// Alias for `Result<T, pspproxy::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable status code recorded for every operation.
///
/// Zero is success and every failure kind has its own negative code, so
/// callers that only keep the number can still tell failures apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Status(i32);

impl Status {
    /// The operation completed.
    pub const SUCCESS: Self = Self(0);
    /// An argument was rejected before anything was sent.
    pub const INVALID_ARGUMENT: Self = Self(-1);
    /// The transport failed or timed out.
    pub const TRANSPORT: Self = Self(-2);
    /// The target sent something the protocol does not allow.
    pub const PROTOCOL: Self = Self(-3);
    /// The target answered with a non-zero status.
    pub const TARGET_REJECTED: Self = Self(-4);
    /// The session was closed.
    pub const INVALID_CONTEXT: Self = Self(-5);

    /// Numeric code.
    pub const fn code(self) -> i32 {
        self.0
    }

    /// Whether this is [`Status::SUCCESS`].
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Whether failures of this kind leave the session unusable.
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::TRANSPORT | Self::PROTOCOL)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::SUCCESS => "success",
            Self::INVALID_ARGUMENT => "invalid argument",
            Self::TRANSPORT => "transport failure",
            Self::PROTOCOL => "protocol violation",
            Self::TARGET_REJECTED => "rejected by target",
            Self::INVALID_CONTEXT => "invalid context",
            _ => "unknown",
        };
        write!(f, "{name} ({})", self.0)
    }
}

impl From<Status> for i32 {
    fn from(s: Status) -> Self {
        s.0
    }
}

/// Errors returned by session operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An argument failed local validation; nothing was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The session has been closed.
    #[error("session is closed")]
    Closed,

    /// The transport failed.
    #[error("transport: {0}")]
    Transport(#[from] io::Error),

    /// No response arrived before the deadline.
    #[error("{op}: no response within {after:?}")]
    Timeout {
        /// Operation that timed out.
        op: Op,
        /// Deadline that elapsed.
        after: Duration,
    },

    /// A PDU failed framing or payload validation.
    #[error("protocol: {0}")]
    Protocol(#[from] pspproxy_proto::Error),

    /// The PDU stream broke an ordering rule or the target reset.
    #[error("protocol desync: {0}")]
    Desync(String),

    /// A response payload has the wrong shape for the request.
    #[error("{op}: expected {expected} bytes, target returned {actual}")]
    Mismatch {
        /// Operation whose response was malformed.
        op: Op,
        /// Bytes requested.
        expected: usize,
        /// Bytes received.
        actual: usize,
    },

    /// The target refused the request.
    #[error("{op}: rejected by target with status {code}")]
    Rejected {
        /// Operation the target refused.
        op: Op,
        /// Status the target reported.
        code: i32,
    },

    /// An earlier fatal failure left the session unusable.
    #[error("session unusable after earlier {status}")]
    Faulted {
        /// Status of the failure that broke the session.
        status: Status,
    },
}

impl Error {
    /// Shorthand for [`Error::InvalidArgument`].
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Status code reported for this error.
    pub const fn status(&self) -> Status {
        match self {
            Self::InvalidArgument(_) => Status::INVALID_ARGUMENT,
            Self::Closed => Status::INVALID_CONTEXT,
            Self::Transport(_) | Self::Timeout { .. } => Status::TRANSPORT,
            Self::Protocol(_) | Self::Desync(_) | Self::Mismatch { .. } => Status::PROTOCOL,
            Self::Rejected { .. } => Status::TARGET_REJECTED,
            Self::Faulted { status } => *status,
        }
    }

    /// Whether this error left the session unusable.
    pub const fn is_fatal(&self) -> bool {
        self.status().is_fatal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_are_distinct() {
        let all = [
            Status::SUCCESS,
            Status::INVALID_ARGUMENT,
            Status::TRANSPORT,
            Status::PROTOCOL,
            Status::TARGET_REJECTED,
            Status::INVALID_CONTEXT,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }

    #[test]
    fn only_transport_and_protocol_are_fatal() {
        let timeout = Error::Timeout {
            op: Op::PspSmnRead,
            after: Duration::from_secs(1),
        };
        assert!(timeout.is_fatal());
        assert!(Error::Desync("seq".into()).is_fatal());
        assert!(!Error::invalid("size").is_fatal());
        assert!(!Error::Closed.is_fatal());
        let rejected = Error::Rejected {
            op: Op::X86MemFree,
            code: 4,
        };
        assert!(!rejected.is_fatal());
        assert_eq!(rejected.status(), Status::TARGET_REJECTED);
    }

    #[test]
    fn faulted_keeps_original_status() {
        let e = Error::Faulted {
            status: Status::TRANSPORT,
        };
        assert_eq!(e.status(), Status::TRANSPORT);
        assert_eq!(e.to_string(), "session unusable after earlier transport failure (-2)");
    }
}
