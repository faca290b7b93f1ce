//! Serves a simulated PSP target over TCP or a Unix socket.

#![allow(clippy::print_stderr, clippy::missing_docs_in_private_items)]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use pspproxy_proto::{MAX_PDU, TargetInfo};
use pspproxy_stub::{DEFAULT_INFO, SimTarget};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Smallest PDU limit that still leaves room for useful transfers.
const MIN_PDU: u32 = 256;

#[derive(Parser)]
#[command(name = "pspproxy-stub", version, about = "Simulated PSP target for pspproxy")]
struct Cli {
    /// TCP address to listen on [default: 127.0.0.1:4711].
    #[arg(long, conflicts_with = "unix")]
    tcp: Option<SocketAddr>,

    /// Unix socket path to listen on.
    #[arg(long)]
    unix: Option<PathBuf>,

    /// Number of sockets reported to hosts.
    #[arg(long, default_value_t = DEFAULT_INFO.sockets)]
    sockets: u32,

    /// CCDs per socket reported to hosts.
    #[arg(long, default_value_t = DEFAULT_INFO.ccds_per_socket)]
    ccds_per_socket: u32,

    /// Largest PDU the target accepts.
    #[arg(long, default_value_t = DEFAULT_INFO.max_pdu)]
    max_pdu: u32,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = cli.run().await {
        eprintln!("pspproxy-stub: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

impl Cli {
    async fn run(self) -> Result<()> {
        if self.sockets == 0 || self.ccds_per_socket == 0 {
            bail!("the target needs at least one socket and one CCD");
        }
        if !(MIN_PDU..=u32::try_from(MAX_PDU)?).contains(&self.max_pdu) {
            bail!("--max-pdu must be between {MIN_PDU} and {MAX_PDU}");
        }
        let mut target = SimTarget::new(TargetInfo {
            max_pdu: self.max_pdu,
            sockets: self.sockets,
            ccds_per_socket: self.ccds_per_socket,
            ..DEFAULT_INFO
        });

        tokio::select! {
            result = self.serve(&mut target) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                Ok(())
            }
        }
    }

    async fn serve(&self, target: &mut SimTarget) -> Result<()> {
        if let Some(path) = &self.unix {
            return serve_unix(path, target).await;
        }
        let addr = self
            .tcp
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 4711)));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        Ok(pspproxy_stub::serve_tcp(listener, target).await?)
    }
}

#[cfg(unix)]
async fn serve_unix(path: &std::path::Path, target: &mut SimTarget) -> Result<()> {
    let listener = tokio::net::UnixListener::bind(path)
        .with_context(|| format!("binding {}", path.display()))?;
    Ok(pspproxy_stub::serve_unix(listener, target).await?)
}

#[cfg(not(unix))]
async fn serve_unix(_path: &std::path::Path, _target: &mut SimTarget) -> Result<()> {
    bail!("Unix sockets are not available on this platform")
}
