//! Simulated PSP target for pspproxy.
//!
//! [`SimTarget`] implements the target side of the protocol in memory; the
//! server functions expose it on a socket so a real [`pspproxy`] session can
//! connect to it.
//!
//! [`pspproxy`]: https://docs.rs/pspproxy

mod server;
mod target;

pub use server::{serve_tcp, session, spawn_tcp};
#[cfg(unix)]
pub use server::serve_unix;
pub use target::{DEFAULT_INFO, SRAM_LEN, STUB_VERSION, SVC_SUM, SVC_VERSION, SimTarget};
