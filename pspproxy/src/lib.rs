//! Remote access to the AMD Platform Security Processor.
//!
//! `pspproxy` talks to a small stub running on the PSP (or to the simulated
//! target in `pspproxy-stub`) over TCP, a Unix socket or a serial line, and
//! exposes PSP memory, MMIO, SMN, co-processor registers, supervisor calls
//! and host memory as typed, blocking operations on a [`Session`].
//!
//! # Quick start
//!
//! ```no_run
//! use pspproxy::{CoProcReg, Session};
//!
//! let mut psp = Session::open("tcp://10.0.0.2:4711")?;
//! let info = *psp.target_info();
//! println!("{} sockets x {} CCDs", info.sockets, info.ccds_per_socket);
//!
//! psp.set_target(1)?;
//! let sram = psp.read_mem(0x3_f000, 64)?;
//! let midr = psp.read_coproc(CoProcReg::new(15, 0, 0, 0, 0))?;
//! # Ok::<(), pspproxy::Error>(())
//! ```

mod device;
mod error;
mod io;
#[cfg(test)]
mod loopback;
mod ops;
mod session;
mod transport;

pub use device::{Device, Parity, SerialConfig};
pub use error::{Error, Result, Status};
pub use io::{IoCallbacks, NoIo};
pub use ops::X86Alloc;
pub use pspproxy_proto::{CoProcReg, PspAddr, R0Ptr, SmnAddr, TargetInfo, X86PAddr};
pub use session::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_TIMEOUT, Session, SessionBuilder};
#[cfg(unix)]
pub use transport::SerialPort;
pub use transport::Transport;
