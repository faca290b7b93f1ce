//! Terminal I/O for running code modules.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver};
use std::thread;

use pspproxy::IoCallbacks;
use tracing::{debug, warn};

/// Buffer wired to the terminal.
const CONSOLE: u32 = 0;

/// Forwards stdin to input buffer 0 and output buffer 0 to stdout.
///
/// Stdin is read on a background thread so the session can poll it without
/// blocking.
#[derive(Debug)]
pub struct ConsoleIo {
    /// Chunks read from stdin.
    rx: Receiver<Vec<u8>>,
    /// Bytes received but not yet taken by the session.
    pending: VecDeque<u8>,
}

impl ConsoleIo {
    /// Starts the stdin reader.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel();
        let reader = thread::Builder::new()
            .name("pspproxy-stdin".into())
            .spawn(move || {
                let mut stdin = io::stdin().lock();
                let mut buf = [0u8; 1024];
                loop {
                    match stdin.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            debug!(error = %e, "stdin closed");
                            break;
                        }
                    }
                }
            });
        if let Err(e) = reader {
            warn!(error = %e, "console input unavailable");
        }
        Self::from_receiver(rx)
    }

    /// Takes input from `rx` instead of stdin.
    pub fn from_receiver(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: VecDeque::new(),
        }
    }

    /// Moves everything the reader has produced into `pending`.
    fn fill(&mut self) {
        while let Ok(chunk) = self.rx.try_recv() {
            self.pending.extend(chunk);
        }
    }
}

impl IoCallbacks for ConsoleIo {
    fn log_message(&mut self, msg: &str) {
        eprintln!("psp: {}", msg.trim_end());
    }

    fn write_out_buf(&mut self, id: u32, data: &[u8]) -> io::Result<()> {
        if id != CONSOLE {
            debug!(id, len = data.len(), "dropping output for unknown buffer");
            return Ok(());
        }
        let mut out = io::stdout().lock();
        out.write_all(data)?;
        out.flush()
    }

    fn peek_in_buf(&mut self, id: u32) -> usize {
        if id != CONSOLE {
            return 0;
        }
        self.fill();
        self.pending.len()
    }

    fn read_in_buf(&mut self, id: u32, buf: &mut [u8]) -> io::Result<usize> {
        if id != CONSOLE {
            return Ok(0);
        }
        self.fill();
        let n = buf.len().min(self.pending.len());
        for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_is_served_in_order() {
        let (tx, rx) = mpsc::channel();
        let mut io = ConsoleIo::from_receiver(rx);
        assert_eq!(io.peek_in_buf(CONSOLE), 0);

        tx.send(b"hel".to_vec()).unwrap();
        tx.send(b"lo\n".to_vec()).unwrap();
        assert_eq!(io.peek_in_buf(CONSOLE), 6);
        assert_eq!(io.peek_in_buf(1), 0);

        let mut buf = [0u8; 4];
        assert_eq!(io.read_in_buf(CONSOLE, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"hell");
        assert_eq!(io.peek_in_buf(CONSOLE), 2);
        assert_eq!(io.read_in_buf(CONSOLE, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"o\n");
    }

    #[test]
    fn closed_input_stays_empty() {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        drop(tx);
        let mut io = ConsoleIo::from_receiver(rx);
        assert_eq!(io.peek_in_buf(CONSOLE), 0);
        assert_eq!(io.read_in_buf(CONSOLE, &mut [0; 8]).unwrap(), 0);
    }
}
