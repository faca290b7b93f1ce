//! Proxy sessions.
//!
//! A [`Session`] owns the transport to one target stub. It performs the
//! connect handshake, numbers outgoing PDUs, checks the ordering of incoming
//! ones and matches each request with its response. Notifications that
//! arrive while waiting are handed to the session's [`IoCallbacks`].

use std::fmt;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use pspproxy_proto::{
    Decoder, Direction, FOOTER_LEN, HEADER_LEN, MAX_PDU, Message, MsgId, Notification, Op, Pdu,
    Request, Response, TargetInfo,
};
use tracing::{debug, error, info, trace, warn};

use crate::device::Device;
use crate::error::{Error, Result, Status};
use crate::io::{IoCallbacks, NoIo};
use crate::transport::{self, Transport};

/// Default deadline for a single request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for the connect handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest a single transport read blocks before input buffers are polled.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Payload bytes kept free for operands in buffer transfers.
const XFER_OVERHEAD: usize = 32;

/// Input buffer forwarded to the target while a code module runs.
pub(crate) const CONSOLE_IN_BUF: u32 = 0;

/// Builder for a [`Session`].
///
/// Defaults: 10 s request timeout, 10 s connect timeout, no I/O callbacks.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// use pspproxy::Session;
///
/// let mut psp = Session::builder()
///     .device("tcp://10.0.0.2:4711")
///     .timeout(Duration::from_secs(5))
///     .open()?;
/// let id = psp.read_smn(0, 0x5a078, 4)?;
/// # Ok::<(), pspproxy::Error>(())
/// ```
#[must_use = "a SessionBuilder does nothing until .open() is called"]
pub struct SessionBuilder {
    /// Device string, parsed on open.
    device: Option<String>,
    /// Per-request deadline.
    timeout: Duration,
    /// Deadline for the first beacon and the connect response.
    connect_timeout: Duration,
    /// Read slice while waiting.
    poll_interval: Duration,
    /// Notification handlers.
    io: Option<Box<dyn IoCallbacks>>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            device: None,
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            io: None,
        }
    }
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("device", &self.device)
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("io", &self.io.is_some())
            .finish()
    }
}

impl SessionBuilder {
    /// Sets the device string, e.g. `tcp://host:port`.
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Sets the per-request deadline (default: 10 s).
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the handshake deadline (default: 10 s).
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets how long one transport read may block while input buffers wait
    /// to be forwarded (default: 10 ms).
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Installs handlers for target logs and buffer I/O.
    pub fn io(mut self, io: impl IoCallbacks + 'static) -> Self {
        self.io = Some(Box::new(io));
        self
    }

    /// Connects to the configured device and performs the handshake.
    pub fn open(self) -> Result<Session> {
        let raw = self
            .device
            .as_deref()
            .ok_or_else(|| Error::invalid("no device given"))?;
        let device = Device::parse(raw)?;
        let transport = device.connect(self.connect_timeout)?;
        info!(%device, "transport established");
        self.open_with(transport)
    }

    /// Performs the handshake over an already established transport.
    pub fn open_with(self, transport: Box<dyn Transport>) -> Result<Session> {
        let mut session = Session {
            transport: Some(transport),
            decoder: Decoder::new(Direction::TargetToHost),
            io: self.io.unwrap_or_else(|| Box::new(NoIo)),
            timeout: self.timeout.max(Duration::from_millis(1)),
            connect_timeout: self.connect_timeout.max(Duration::from_millis(1)),
            poll_interval: self.poll_interval.max(Duration::from_millis(1)),
            info: TargetInfo::default(),
            ccd: 0,
            tx_seq: 0,
            rx_next: None,
            beacons_seen: None,
            epoch: Instant::now(),
            last_status: Status::SUCCESS,
            last_request_rc: 0,
            fault: None,
        };
        session.handshake()?;
        Ok(session)
    }
}

/// Deadline for one wait on the target.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    /// Operation being waited on.
    op: Op,
    /// Instant the wait gives up.
    at: Instant,
    /// Total budget, for error messages.
    budget: Duration,
}

impl Deadline {
    /// Starts a deadline of `budget` from now.
    pub(crate) fn new(op: Op, budget: Duration) -> Self {
        Self {
            op,
            at: Instant::now() + budget,
            budget,
        }
    }

    /// Time left, or `None` once expired.
    fn remaining(&self) -> Option<Duration> {
        self.at
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
    }

    /// The error reported once the deadline has passed.
    fn expired(&self) -> Error {
        Error::Timeout {
            op: self.op,
            after: self.budget,
        }
    }
}

/// A connection to one PSP target stub.
///
/// All operations are blocking and the session is meant for one thread at a
/// time. Transport and protocol failures are sticky: after the first one,
/// every operation fails with [`Error::Faulted`] without touching the
/// transport. Dropping the session closes it.
pub struct Session {
    /// Transport; `None` once closed.
    transport: Option<Box<dyn Transport>>,
    /// Incoming PDU decoder.
    decoder: Decoder,
    /// Notification handlers.
    io: Box<dyn IoCallbacks>,
    /// Per-request deadline.
    timeout: Duration,
    /// Handshake deadline.
    connect_timeout: Duration,
    /// Read slice while waiting.
    poll_interval: Duration,
    /// What the target reported at connect time.
    info: TargetInfo,
    /// CCD requests are addressed to.
    ccd: u32,
    /// Sequence number of the last PDU sent.
    tx_seq: u32,
    /// Sequence number expected on the next PDU; `None` before connect.
    rx_next: Option<u32>,
    /// Last beacon counter seen.
    beacons_seen: Option<u32>,
    /// Session start, for PDU timestamps.
    epoch: Instant,
    /// Status of the most recent operation.
    last_status: Status,
    /// Raw target status of the most recent response.
    last_request_rc: i32,
    /// Status of the first fatal failure.
    fault: Option<Status>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("transport", &self.transport)
            .field("info", &self.info)
            .field("ccd", &self.ccd)
            .field("tx_seq", &self.tx_seq)
            .field("rx_next", &self.rx_next)
            .field("last_status", &self.last_status)
            .field("fault", &self.fault)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Returns a new [`SessionBuilder`].
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Connects to `device` with default settings.
    pub fn open(device: &str) -> Result<Self> {
        Self::builder().device(device).open()
    }

    /// What the target reported during the handshake.
    pub const fn target_info(&self) -> &TargetInfo {
        &self.info
    }

    /// Deadline applied to each request.
    pub const fn request_timeout(&self) -> Duration {
        self.timeout
    }

    /// CCD requests are currently addressed to.
    pub const fn ccd(&self) -> u32 {
        self.ccd
    }

    /// Status of the most recent operation.
    pub const fn last_status(&self) -> Status {
        self.last_status
    }

    /// Raw status the target put in its most recent response header.
    pub const fn last_request_rc(&self) -> i32 {
        self.last_request_rc
    }

    /// Status of the failure that made the session unusable, if any.
    pub const fn fault(&self) -> Option<Status> {
        self.fault
    }

    /// Whether [`close`](Self::close) has been called.
    pub const fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    /// Directs subsequent requests to CCD `ccd`.
    pub fn set_target(&mut self, ccd: u32) -> Result<()> {
        self.run(|s| {
            let count = s.info.ccd_count();
            if ccd >= count {
                return Err(Error::invalid(format!(
                    "CCD {ccd} out of range, target has {count}"
                )));
            }
            debug!(ccd, "target CCD selected");
            s.ccd = ccd;
            Ok(())
        })
    }

    /// Shuts the transport down. Later operations fail with
    /// [`Error::Closed`]; closing twice is a no-op.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.shutdown() {
                debug!(error = %e, "transport shutdown failed");
            }
            info!("session closed");
        }
    }

    /// Runs one operation and records its status.
    ///
    /// A closed or failed session answers every operation with its latched
    /// status before any argument is looked at.
    pub(crate) fn run<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = self.ensure_usable().and_then(|()| f(self));
        match &result {
            Ok(_) => self.last_status = Status::SUCCESS,
            Err(e) => {
                self.last_status = e.status();
                if e.is_fatal() && self.fault.is_none() {
                    error!(error = %e, "session failed");
                    self.fault = Some(e.status());
                }
            }
        }
        result
    }

    /// Fails if the session is closed or faulted.
    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.transport.is_none() {
            return Err(Error::Closed);
        }
        if let Some(status) = self.fault {
            return Err(Error::Faulted { status });
        }
        Ok(())
    }

    /// Largest buffer a single transfer may carry.
    pub(crate) fn max_xfer(&self) -> usize {
        usize::try_from(self.info.max_pdu)
            .unwrap_or(MAX_PDU)
            .min(MAX_PDU)
            .saturating_sub(HEADER_LEN + FOOTER_LEN + XFER_OVERHEAD)
    }

    /// Sends `req` and waits for its response using the session timeout.
    pub(crate) fn transact(&mut self, req: Request) -> Result<Response> {
        self.ensure_usable()?;
        let deadline = Deadline::new(req.op(), self.timeout);
        self.exchange(req, deadline, false)
    }

    /// Sends `req` and waits for its response, routing notifications.
    ///
    /// With `pump` set, pending data on the console input buffer is forwarded
    /// to the target while waiting.
    pub(crate) fn exchange(
        &mut self,
        req: Request,
        deadline: Deadline,
        pump: bool,
    ) -> Result<Response> {
        let op = req.op();
        self.send(&req)?;
        loop {
            let pdu = self.recv(&deadline, pump)?;
            match pdu.id {
                MsgId::Notification(_) => self.on_notification(&pdu)?,
                MsgId::Response(got) if got == op => {
                    if self.rx_next.is_none() {
                        self.rx_next = Some(pdu.seq.wrapping_add(1));
                    }
                    self.last_request_rc = pdu.status;
                    if pdu.status != 0 {
                        debug!(%op, status = pdu.status, "request rejected");
                        return Err(Error::Rejected {
                            op,
                            code: pdu.status,
                        });
                    }
                    return Ok(pdu.decode()?);
                }
                other => {
                    return Err(Error::Desync(format!("waiting for {op}, got {other}")));
                }
            }
        }
    }

    /// Waits for the first beacon, then connects.
    fn handshake(&mut self) -> Result<()> {
        let deadline = Deadline::new(Op::Connect, self.connect_timeout);
        while self.beacons_seen.is_none() {
            let pdu = self.recv(&deadline, false)?;
            match pdu.id {
                MsgId::Notification(_) => self.on_notification(&pdu)?,
                other => {
                    return Err(Error::Desync(format!("expected a beacon, got {other}")));
                }
            }
        }
        match self.exchange(Request::Connect, deadline, false)? {
            Response::Connect(info) => {
                if info.ccd_count() == 0 {
                    return Err(Error::Desync("target reports no CCDs".into()));
                }
                info!(
                    sockets = info.sockets,
                    ccds_per_socket = info.ccds_per_socket,
                    max_pdu = info.max_pdu,
                    "connected to PSP"
                );
                self.info = info;
                Ok(())
            }
            other => Err(Error::Desync(format!("unexpected {} to connect", other.op()))),
        }
    }

    /// Encodes and writes one message.
    pub(crate) fn send(&mut self, msg: &impl Message) -> Result<()> {
        let mut pdu = Pdu::from_message(msg, self.ccd)?;
        self.tx_seq = self.tx_seq.wrapping_add(1);
        pdu.seq = self.tx_seq;
        pdu.timestamp_ms = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        let frame = pspproxy_proto::encode(Direction::HostToTarget, &pdu)?;
        let transport = self.transport.as_mut().ok_or(Error::Closed)?;
        transport.write_all(&frame)?;
        transport.flush()?;
        debug!(id = %pdu.id, seq = pdu.seq, ccd = pdu.ccd, len = pdu.payload.len(), "sent");
        Ok(())
    }

    /// Reads until one complete, correctly sequenced PDU is available.
    fn recv(&mut self, deadline: &Deadline, pump: bool) -> Result<Pdu> {
        let mut buf = [0u8; MAX_PDU];
        loop {
            if let Some(pdu) = self.decoder.decode()? {
                self.check_order(&pdu)?;
                trace!(id = %pdu.id, seq = pdu.seq, ccd = pdu.ccd, "received");
                return Ok(pdu);
            }
            if pump {
                self.pump_input()?;
            }
            let remaining = deadline.remaining().ok_or_else(|| deadline.expired())?;
            let transport = self.transport.as_mut().ok_or(Error::Closed)?;
            transport.set_read_timeout(Some(remaining.min(self.poll_interval)))?;
            match transport.read(&mut buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "target closed the connection",
                    )
                    .into());
                }
                Ok(n) => self.decoder.feed(&buf[..n]),
                Err(e) if transport::is_timeout(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Enforces sequence continuity and CCD range once connected.
    fn check_order(&mut self, pdu: &Pdu) -> Result<()> {
        let Some(next) = self.rx_next else {
            return Ok(());
        };
        if pdu.seq != next {
            return Err(Error::Desync(format!(
                "received sequence {} but expected {next}",
                pdu.seq
            )));
        }
        self.rx_next = Some(next.wrapping_add(1));
        let count = self.info.ccd_count();
        if pdu.ccd >= count {
            return Err(Error::Desync(format!(
                "PDU from CCD {} but the target has {count}",
                pdu.ccd
            )));
        }
        Ok(())
    }

    /// Handles a beacon, log or output notification.
    fn on_notification(&mut self, pdu: &Pdu) -> Result<()> {
        match pdu.decode::<Notification>()? {
            Notification::Beacon { count } => {
                if let (Some(seen), Some(_)) = (self.beacons_seen, self.rx_next) {
                    if count != seen.wrapping_add(1) {
                        return Err(Error::Desync(format!(
                            "beacon {count} after {seen}, target was reset"
                        )));
                    }
                }
                trace!(count, "beacon");
                self.beacons_seen = Some(count);
            }
            Notification::LogMsg { msg } => {
                debug!(ccd = pdu.ccd, "target: {msg}");
                self.io.log_message(&msg);
            }
            Notification::OutBuf { id, data } => {
                if let Err(e) = self.io.write_out_buf(id, &data) {
                    warn!(id, error = %e, "output buffer handler failed");
                }
            }
            other => {
                return Err(Error::Desync(format!("unexpected {} from target", other.id())));
            }
        }
        Ok(())
    }

    /// Forwards pending console input to the target.
    fn pump_input(&mut self) -> Result<()> {
        let avail = self.io.peek_in_buf(CONSOLE_IN_BUF);
        if avail == 0 {
            return Ok(());
        }
        let mut chunk = vec![0u8; avail.min(self.max_xfer())];
        let n = match self.io.read_in_buf(CONSOLE_IN_BUF, &mut chunk) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "input buffer handler failed");
                return Ok(());
            }
        };
        if n == 0 {
            return Ok(());
        }
        chunk.truncate(n);
        self.send(&Notification::InBuf {
            id: CONSOLE_IN_BUF,
            data: chunk,
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    use pspproxy_proto::rc;
    use pspproxy_stub::{DEFAULT_INFO, SVC_SUM, SimTarget};

    use super::*;
    use crate::loopback::{self, Loopback};

    /// Records everything the target sends through the callbacks.
    #[derive(Debug, Default, Clone)]
    struct Recorder {
        logs: Arc<Mutex<Vec<String>>>,
        out: Arc<Mutex<Vec<u8>>>,
        input: Arc<Mutex<Vec<u8>>>,
    }

    impl IoCallbacks for Recorder {
        fn log_message(&mut self, msg: &str) {
            self.logs.lock().unwrap().push(msg.to_owned());
        }

        fn write_out_buf(&mut self, _id: u32, data: &[u8]) -> io::Result<()> {
            self.out.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn peek_in_buf(&mut self, _id: u32) -> usize {
            self.input.lock().unwrap().len()
        }

        fn read_in_buf(&mut self, _id: u32, buf: &mut [u8]) -> io::Result<usize> {
            let mut input = self.input.lock().unwrap();
            let n = buf.len().min(input.len());
            buf[..n].copy_from_slice(&input[..n]);
            input.drain(..n);
            Ok(n)
        }
    }

    #[test]
    fn handshake_reports_geometry() {
        let (psp, _wire) = loopback::session();
        assert_eq!(*psp.target_info(), DEFAULT_INFO);
        assert_eq!(psp.ccd(), 0);
        assert_eq!(psp.last_status(), Status::SUCCESS);
        assert!(psp.fault().is_none());
    }

    #[test]
    fn handshake_times_out_without_beacon() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let err = Session::builder()
            .device(format!("tcp://{addr}"))
            .connect_timeout(Duration::from_millis(100))
            .open()
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { op: Op::Connect, .. }), "{err}");
        drop(listener);
    }

    #[test]
    fn open_rejects_bad_device() {
        let err = Session::open("sev:///dev/sev").unwrap_err();
        assert_eq!(err.status(), Status::INVALID_ARGUMENT);
        let err = Session::builder().open().unwrap_err();
        assert_eq!(err.status(), Status::INVALID_ARGUMENT);
    }

    #[test]
    fn set_target_is_checked_locally() {
        let (mut psp, wire) = loopback::session();
        let calls = wire.io_calls();
        let err = psp.set_target(2).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(psp.last_status(), Status::INVALID_ARGUMENT);
        assert_eq!(wire.io_calls(), calls);

        psp.set_target(1).unwrap();
        assert_eq!(psp.ccd(), 1);
        assert_eq!(psp.last_status(), Status::SUCCESS);
    }

    #[test]
    fn requests_carry_the_selected_ccd() {
        let (mut psp, _wire) = loopback::session();
        psp.write_mem(0x200, &[0xaa]).unwrap();
        psp.set_target(1).unwrap();
        assert_eq!(psp.read_mem(0x200, 1).unwrap(), vec![0]);
        psp.set_target(0).unwrap();
        assert_eq!(psp.read_mem(0x200, 1).unwrap(), vec![0xaa]);
    }

    #[test]
    fn rejection_is_not_fatal() {
        let (mut psp, _wire) = loopback::session();
        let err = psp.free_x86_mem(0xdead_0000).unwrap_err();
        assert!(matches!(
            err,
            Error::Rejected {
                op: Op::X86MemFree,
                code: rc::INVALID_TOKEN
            }
        ));
        assert_eq!(psp.last_status(), Status::TARGET_REJECTED);
        assert_eq!(psp.last_request_rc(), rc::INVALID_TOKEN);

        psp.write_mmio(0x10, 4, 1).unwrap();
        assert_eq!(psp.last_request_rc(), rc::SUCCESS);
        assert!(psp.fault().is_none());
    }

    #[test]
    fn disconnect_latches_fault() {
        let (mut psp, wire) = loopback::session();
        wire.cut();
        let err = psp.read_mem(0, 16).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(psp.fault(), Some(Status::TRANSPORT));

        let calls = wire.io_calls();
        let again = psp.read_smn(0, 0x100, 4).unwrap_err();
        assert!(matches!(
            again,
            Error::Faulted {
                status: Status::TRANSPORT
            }
        ));
        assert_eq!(again.status(), Status::TRANSPORT);
        assert_eq!(psp.last_status(), Status::TRANSPORT);
        assert_eq!(wire.io_calls(), calls);
    }

    #[test]
    fn malformed_calls_still_see_the_latched_fault() {
        let (mut psp, wire) = loopback::session();
        wire.cut();
        psp.read_mem(0, 16).unwrap_err();
        let calls = wire.io_calls();

        let faulted = [
            psp.read_smn(0, 0, 3).unwrap_err(),
            psp.alloc_x86_mem(0).unwrap_err(),
            psp.write_mmio(0, 5, 0).unwrap_err(),
            psp.load_code_module(&[]).unwrap_err(),
            psp.exec_code_module([0; 4], Some(Duration::ZERO)).unwrap_err(),
        ];
        for err in faulted {
            assert!(matches!(err, Error::Faulted { .. }), "{err:?}");
            assert_eq!(err.status(), Status::TRANSPORT);
        }
        assert_eq!(psp.last_status(), Status::TRANSPORT);
        assert_eq!(wire.io_calls(), calls);
    }

    #[test]
    fn malformed_calls_after_close_see_closed() {
        let (mut psp, _wire) = loopback::session();
        psp.close();
        assert!(matches!(psp.read_smn(0, 0, 3), Err(Error::Closed)));
        assert!(matches!(psp.alloc_x86_mem(0), Err(Error::Closed)));
        assert!(matches!(psp.write_mmio(0, 5, 0), Err(Error::Closed)));
        assert!(matches!(psp.set_target(99), Err(Error::Closed)));
        assert_eq!(psp.last_status(), Status::INVALID_CONTEXT);
    }

    #[test]
    fn timeout_is_fatal() {
        let (mut psp, wire) = loopback::session();
        wire.mute();
        let err = psp.read_smn(0, 0x5a078, 4).unwrap_err();
        assert!(matches!(err, Error::Timeout { op: Op::PspSmnRead, .. }));
        assert!(err.is_fatal());
        assert!(matches!(psp.read_mmio(0, 4), Err(Error::Faulted { .. })));
    }

    #[test]
    fn sequence_gap_is_a_protocol_failure() {
        let (mut psp, wire) = loopback::session();
        wire.tamper(|pdu| pdu.seq += 1);
        let err = psp.read_mem(0, 4).unwrap_err();
        assert!(matches!(err, Error::Desync(_)), "{err}");
        assert_eq!(psp.last_status(), Status::PROTOCOL);
        assert!(matches!(psp.read_mem(0, 4), Err(Error::Faulted { .. })));
    }

    #[test]
    fn unknown_ccd_in_reply_is_a_protocol_failure() {
        let (mut psp, wire) = loopback::session();
        wire.tamper(|pdu| pdu.ccd = 7);
        let err = psp.read_mmio(0, 4).unwrap_err();
        assert_eq!(err.status(), Status::PROTOCOL);
    }

    #[test]
    fn beacon_in_order_is_tolerated() {
        let (mut psp, wire) = loopback::session();
        wire.inject(&Notification::Beacon { count: 2 });
        psp.write_smn(0, 0x100, 2, 0xbeef).unwrap();
        assert_eq!(psp.read_smn(0, 0x100, 2).unwrap(), 0xbeef);
    }

    #[test]
    fn beacon_out_of_order_means_reset() {
        let (mut psp, wire) = loopback::session();
        wire.inject(&Notification::Beacon { count: 1 });
        let err = psp.read_smn(0, 0x100, 4).unwrap_err();
        assert!(matches!(&err, Error::Desync(msg) if msg.contains("reset")), "{err}");
        assert_eq!(psp.fault(), Some(Status::PROTOCOL));
    }

    #[test]
    fn input_notification_from_target_is_rejected() {
        let (mut psp, wire) = loopback::session();
        wire.inject(&Notification::InBuf {
            id: 0,
            data: vec![1],
        });
        assert_eq!(psp.read_mem(0, 1).unwrap_err().status(), Status::PROTOCOL);
    }

    #[test]
    fn logs_reach_callbacks() {
        let rec = Recorder::default();
        let (mut psp, _wire) = loopback::session_with(
            SimTarget::default(),
            Session::builder()
                .timeout(Duration::from_millis(200))
                .io(rec.clone()),
        );
        assert_eq!(psp.call_svc(SVC_SUM, [1, 2, 3, 4]).unwrap(), 10);
        let logs = rec.logs.lock().unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].contains("0xa"), "{}", logs[0]);
    }

    #[test]
    fn code_module_exec_pumps_input() {
        let rec = Recorder::default();
        rec.input.lock().unwrap().extend_from_slice(b"ping\n");
        let (mut psp, _wire) = loopback::session_with(
            SimTarget::default(),
            Session::builder()
                .timeout(Duration::from_millis(200))
                .io(rec.clone()),
        );
        psp.load_code_module(&[1, 1, 1]).unwrap();
        let r0 = psp.exec_code_module([0; 4], None).unwrap();
        assert_eq!(r0, 3);
        assert!(rec.input.lock().unwrap().is_empty());

        // The echo of forwarded input may trail the exec response.
        psp.read_mmio(0, 4).unwrap();
        let out = rec.out.lock().unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("code module running"), "{text}");
        assert!(text.contains("ping"), "{text}");
    }

    #[test]
    fn exec_without_module_is_rejected() {
        let (mut psp, _wire) = loopback::session();
        let err = psp.exec_code_module([0; 4], Some(Duration::from_millis(100)));
        assert!(matches!(
            err,
            Err(Error::Rejected {
                code: rc::NO_CODE_MODULE,
                ..
            })
        ));
    }

    #[test]
    fn close_is_idempotent() {
        let (mut psp, wire) = loopback::session();
        psp.close();
        psp.close();
        assert!(psp.is_closed());
        let calls = wire.io_calls();
        let err = psp.read_mem(0, 4).unwrap_err();
        assert!(matches!(err, Error::Closed));
        assert_eq!(psp.last_status(), Status::INVALID_CONTEXT);
        assert!(matches!(psp.set_target(0), Err(Error::Closed)));
        assert_eq!(wire.io_calls(), calls);
    }

    /// Transport that replays fixed bytes and discards writes.
    #[derive(Debug)]
    struct Canned(io::Cursor<Vec<u8>>);

    impl Read for Canned {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.read(buf)? {
                0 => Err(io::ErrorKind::WouldBlock.into()),
                n => Ok(n),
            }
        }
    }

    impl Write for Canned {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for Canned {
        fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn handshake_requires_beacon_first() {
        let mut pdu = Pdu::from_message(&Response::Connect(DEFAULT_INFO), 0).unwrap();
        pdu.seq = 1;
        let frame = pspproxy_proto::encode(Direction::TargetToHost, &pdu).unwrap();
        let err = Session::builder()
            .connect_timeout(Duration::from_millis(100))
            .open_with(Box::new(Canned(io::Cursor::new(frame))))
            .unwrap_err();
        assert!(matches!(&err, Error::Desync(msg) if msg.contains("beacon")), "{err}");
    }

    #[test]
    fn target_without_ccds_is_refused() {
        let target = SimTarget::new(TargetInfo {
            sockets: 0,
            ..DEFAULT_INFO
        });
        let (transport, _wire) = Loopback::new(target);
        let err = Session::builder().open_with(Box::new(transport)).unwrap_err();
        assert_eq!(err.status(), Status::PROTOCOL);
    }
}
