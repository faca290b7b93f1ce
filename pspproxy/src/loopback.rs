//! In-process transport wired straight to a [`SimTarget`], for tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pspproxy_proto::{Decoder, Direction, Message, Pdu};
use pspproxy_stub::SimTarget;

use crate::session::{Session, SessionBuilder};
use crate::transport::Transport;

/// Shared controls and counters for a [`Loopback`].
#[derive(Debug, Default)]
pub struct Wire {
    /// Read calls seen by the transport.
    pub reads: AtomicUsize,
    /// Write calls seen by the transport.
    pub writes: AtomicUsize,
    /// Every read and write fails once set.
    down: AtomicBool,
    /// Host PDUs are swallowed without reply once set.
    mute: AtomicBool,
    /// PDUs delivered ahead of the next batch of target replies.
    injected: Mutex<Vec<Pdu>>,
    /// Rewrites every target PDU before it is framed.
    tamper: Mutex<Option<fn(&mut Pdu)>>,
}

impl Wire {
    /// Total transport calls so far.
    pub fn io_calls(&self) -> usize {
        self.reads.load(Ordering::SeqCst) + self.writes.load(Ordering::SeqCst)
    }

    /// Simulates the peer disappearing.
    pub fn cut(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    /// Stops the target from answering.
    pub fn mute(&self) {
        self.mute.store(true, Ordering::SeqCst);
    }

    /// Queues `msg` from CCD 0 ahead of the target's next replies.
    pub fn inject(&self, msg: &impl Message) {
        let pdu = Pdu::from_message(msg, 0).unwrap();
        self.injected.lock().unwrap().push(pdu);
    }

    /// Installs a hook applied to each target PDU.
    pub fn tamper(&self, f: fn(&mut Pdu)) {
        *self.tamper.lock().unwrap() = Some(f);
    }
}

/// Transport that feeds host PDUs to a [`SimTarget`] and queues its replies.
#[derive(Debug)]
pub struct Loopback {
    /// The simulated target.
    target: SimTarget,
    /// Decoder for host PDUs.
    decoder: Decoder,
    /// Target bytes not yet read by the host.
    rx: VecDeque<u8>,
    /// Read timeout requested by the session.
    timeout: Option<Duration>,
    /// Sequence number of the last PDU queued.
    seq: u32,
    /// Shared controls.
    wire: Arc<Wire>,
}

impl Loopback {
    /// Wraps `target`; the first beacon is already queued.
    pub fn new(mut target: SimTarget) -> (Self, Arc<Wire>) {
        let wire = Arc::new(Wire::default());
        let beacon = target.beacon().unwrap();
        let mut this = Self {
            target,
            decoder: Decoder::new(Direction::HostToTarget),
            rx: VecDeque::new(),
            timeout: None,
            seq: 0,
            wire: Arc::clone(&wire),
        };
        this.push(beacon);
        (this, wire)
    }

    /// Numbers and frames a target PDU into the receive queue.
    fn push(&mut self, mut pdu: Pdu) {
        self.seq = self.seq.wrapping_add(1);
        pdu.seq = self.seq;
        if let Some(f) = *self.wire.tamper.lock().unwrap() {
            f(&mut pdu);
        }
        let frame = pspproxy_proto::encode(Direction::TargetToHost, &pdu).unwrap();
        self.rx.extend(frame);
    }
}

impl Read for Loopback {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.wire.reads.fetch_add(1, Ordering::SeqCst);
        if self.wire.down.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::ConnectionReset.into());
        }
        if self.rx.is_empty() {
            std::thread::sleep(self.timeout.unwrap_or(Duration::from_millis(1)));
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.rx.len());
        for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for Loopback {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.wire.writes.fetch_add(1, Ordering::SeqCst);
        if self.wire.down.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if self.wire.mute.load(Ordering::SeqCst) {
            return Ok(buf.len());
        }
        self.decoder.feed(buf);
        while let Some(pdu) = self
            .decoder
            .decode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        {
            let injected = std::mem::take(&mut *self.wire.injected.lock().unwrap());
            for note in injected {
                self.push(note);
            }
            let replies = self
                .target
                .handle(&pdu)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            for reply in replies {
                self.push(reply);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for Loopback {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }
}

/// Opens a session on a default [`SimTarget`] with a short timeout.
pub fn session() -> (Session, Arc<Wire>) {
    session_with(
        SimTarget::default(),
        Session::builder().timeout(Duration::from_millis(200)),
    )
}

/// Opens a session on `target` through `builder`.
pub fn session_with(target: SimTarget, builder: SessionBuilder) -> (Session, Arc<Wire>) {
    let (transport, wire) = Loopback::new(target);
    let session = builder.open_with(Box::new(transport)).unwrap();
    (session, wire)
}
