//! Socket listeners and per-connection PDU pumping.

use std::io;
use std::net::SocketAddr;

use pspproxy_proto::{Decoder, Direction, MAX_PDU, Pdu};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::target::SimTarget;

/// Maps a protocol error onto `InvalidData`.
fn invalid_data(e: pspproxy_proto::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Frames and writes PDUs, then flushes.
async fn send(w: &mut (impl AsyncWrite + Unpin), pdus: &[Pdu]) -> io::Result<()> {
    for pdu in pdus {
        let frame = pspproxy_proto::encode(Direction::TargetToHost, pdu).map_err(invalid_data)?;
        w.write_all(&frame).await?;
    }
    w.flush().await
}

/// Serves one host connection: announces the target with a beacon, then
/// answers PDUs until the host disconnects.
pub async fn session(
    mut stream: impl AsyncRead + AsyncWrite + Unpin,
    target: &mut SimTarget,
) -> io::Result<()> {
    let beacon = target.beacon().map_err(invalid_data)?;
    send(&mut stream, &[beacon]).await?;

    let mut decoder = Decoder::new(Direction::HostToTarget);
    let mut buf = vec![0u8; MAX_PDU];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Ok(()),
            Err(e) => return Err(e),
        };
        decoder.feed(&buf[..n]);
        while let Some(pdu) = decoder.decode().map_err(invalid_data)? {
            let replies = target.handle(&pdu).map_err(invalid_data)?;
            send(&mut stream, &replies).await?;
        }
    }
}

/// Accepts TCP connections one at a time.
///
/// The target keeps its state across connections.
pub async fn serve_tcp(listener: TcpListener, target: &mut SimTarget) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        info!(%peer, "host connected");
        match session(stream, target).await {
            Ok(()) => info!(%peer, "host disconnected"),
            Err(e) => warn!(%peer, error = %e, "session ended"),
        }
    }
}

/// Accepts Unix socket connections one at a time.
#[cfg(unix)]
pub async fn serve_unix(
    listener: tokio::net::UnixListener,
    target: &mut SimTarget,
) -> io::Result<()> {
    info!(addr = ?listener.local_addr()?, "listening");
    loop {
        let (stream, _) = listener.accept().await?;
        info!("host connected");
        match session(stream, target).await {
            Ok(()) => info!("host disconnected"),
            Err(e) => warn!(error = %e, "session ended"),
        }
    }
}

/// Binds `addr` and serves `target` from a background thread.
///
/// Returns the bound address, so port 0 picks a free port. The thread runs
/// until the process exits.
pub fn spawn_tcp(addr: SocketAddr, mut target: SimTarget) -> io::Result<SocketAddr> {
    let std_listener = std::net::TcpListener::bind(addr)?;
    std_listener.set_nonblocking(true)?;
    let local = std_listener.local_addr()?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;
    std::thread::Builder::new()
        .name("pspproxy-stub".into())
        .spawn(move || {
            runtime.block_on(async move {
                let result = match TcpListener::from_std(std_listener) {
                    Ok(listener) => serve_tcp(listener, &mut target).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(error = %e, "stub server stopped");
                }
            });
        })?;
    Ok(local)
}
