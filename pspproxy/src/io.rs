//! Side channels the target can use while a request is in flight.
//!
//! Target firmware may log, write to numbered output buffers and read from
//! numbered input buffers. The session routes those notifications to an
//! [`IoCallbacks`] implementation supplied by the caller.

use std::io;

/// Caller-supplied handlers for target I/O.
///
/// Every method has a no-op default, so implementors only override what they
/// care about.
pub trait IoCallbacks: Send {
    /// A log line from the target firmware.
    fn log_message(&mut self, _msg: &str) {}

    /// Data the target wrote to output buffer `id`.
    fn write_out_buf(&mut self, _id: u32, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }

    /// Bytes available on input buffer `id`, without consuming them.
    fn peek_in_buf(&mut self, _id: u32) -> usize {
        0
    }

    /// Consumes up to `buf.len()` bytes from input buffer `id`.
    fn read_in_buf(&mut self, _id: u32, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

/// Discards output and never offers input.
#[derive(Debug, Default, Clone, Copy)]
#[non_exhaustive]
pub struct NoIo;

impl IoCallbacks for NoIo {}
