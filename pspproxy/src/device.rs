//! Device identifiers naming where a target stub can be reached.
//!
//! Supported forms:
//!
//! - `tcp://host:port`
//! - `unix:///path/to/socket`
//! - `serial:///dev/ttyUSB0[:baud[:parity[:data_bits]]]`, parity one of
//!   `n`, `e`, `o`; defaults `115200:n:8`

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Serial line parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Parity {
    /// No parity bit.
    #[default]
    None,
    /// Even parity.
    Even,
    /// Odd parity.
    Odd,
}

impl Parity {
    /// Single-letter form used in device strings.
    const fn letter(self) -> char {
        match self {
            Self::None => 'n',
            Self::Even => 'e',
            Self::Odd => 'o',
        }
    }
}

/// Serial line settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct SerialConfig {
    /// TTY device node.
    pub path: PathBuf,
    /// Line speed.
    pub baud: u32,
    /// Parity mode.
    pub parity: Parity,
    /// Bits per character, 5..=8.
    pub data_bits: u8,
}

impl SerialConfig {
    /// Line speeds the serial transport can configure.
    pub const BAUD_RATES: [u32; 6] = [9600, 19200, 38400, 57600, 115_200, 230_400];
}

/// A parsed device identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Device {
    /// Stub listening on a TCP port.
    Tcp {
        /// Host name or address, without brackets.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// Stub listening on a Unix domain socket.
    Unix {
        /// Socket path.
        path: PathBuf,
    },
    /// Stub attached to a serial line.
    Serial(SerialConfig),
}

impl Device {
    /// Parses a device string.
    pub fn parse(input: &str) -> Result<Self> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| Error::invalid(format!("{input}: missing scheme (tcp://, unix://, serial://)")))?;
        match scheme {
            "tcp" => parse_tcp(rest),
            "unix" => {
                if rest.is_empty() {
                    return Err(Error::invalid("unix://: empty socket path"));
                }
                Ok(Self::Unix { path: rest.into() })
            }
            "serial" => parse_serial(rest).map(Self::Serial),
            other => Err(Error::invalid(format!("unsupported device scheme {other:?}"))),
        }
    }

    /// Opens a transport to the device.
    pub(crate) fn connect(&self, timeout: Duration) -> Result<Box<dyn Transport>> {
        match self {
            Self::Tcp { host, port } => Ok(Box::new(crate::transport::connect_tcp(
                host, *port, timeout,
            )?)),
            #[cfg(unix)]
            Self::Unix { path } => Ok(Box::new(std::os::unix::net::UnixStream::connect(path)?)),
            #[cfg(unix)]
            Self::Serial(cfg) => Ok(Box::new(crate::transport::SerialPort::open(cfg)?)),
            #[cfg(not(unix))]
            _ => Err(Error::invalid(format!("{self}: requires a Unix host"))),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "tcp://[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Unix { path } => write!(f, "unix://{}", path.display()),
            Self::Serial(cfg) => write!(
                f,
                "serial://{}:{}:{}:{}",
                cfg.path.display(),
                cfg.baud,
                cfg.parity.letter(),
                cfg.data_bits
            ),
        }
    }
}

/// Parses `host:port`, accepting `[v6addr]:port`.
fn parse_tcp(rest: &str) -> Result<Device> {
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| Error::invalid(format!("tcp://{rest}: missing port")))?;
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if host.is_empty() {
        return Err(Error::invalid(format!("tcp://{rest}: missing host")));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::invalid(format!("tcp://{rest}: invalid port {port:?}")))?;
    Ok(Device::Tcp {
        host: host.to_owned(),
        port,
    })
}

/// Parses `path[:baud[:parity[:data_bits]]]`.
fn parse_serial(rest: &str) -> Result<SerialConfig> {
    let mut parts = rest.split(':');
    let path = parts.next().unwrap_or_default();
    if path.is_empty() {
        return Err(Error::invalid("serial://: empty device path"));
    }
    let mut cfg = SerialConfig {
        path: path.into(),
        baud: 115_200,
        parity: Parity::None,
        data_bits: 8,
    };
    if let Some(baud) = parts.next() {
        cfg.baud = baud
            .parse()
            .ok()
            .filter(|b| SerialConfig::BAUD_RATES.contains(b))
            .ok_or_else(|| Error::invalid(format!("unsupported baud rate {baud:?}")))?;
    }
    if let Some(parity) = parts.next() {
        cfg.parity = match parity.to_ascii_lowercase().as_str() {
            "n" | "none" => Parity::None,
            "e" | "even" => Parity::Even,
            "o" | "odd" => Parity::Odd,
            _ => return Err(Error::invalid(format!("unknown parity {parity:?}"))),
        };
    }
    if let Some(bits) = parts.next() {
        cfg.data_bits = bits
            .parse()
            .ok()
            .filter(|b| (5..=8).contains(b))
            .ok_or_else(|| Error::invalid(format!("unsupported data bits {bits:?}")))?;
    }
    if let Some(extra) = parts.next() {
        return Err(Error::invalid(format!("unexpected serial option {extra:?}")));
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp() {
        let d = Device::parse("tcp://psp-box:4711").unwrap();
        assert_eq!(
            d,
            Device::Tcp {
                host: "psp-box".into(),
                port: 4711
            }
        );
        assert_eq!(d.to_string(), "tcp://psp-box:4711");
    }

    #[test]
    fn tcp_v6() {
        let d = Device::parse("tcp://[::1]:4711").unwrap();
        assert_eq!(
            d,
            Device::Tcp {
                host: "::1".into(),
                port: 4711
            }
        );
        assert_eq!(d.to_string(), "tcp://[::1]:4711");
    }

    #[test]
    fn tcp_errors() {
        assert!(Device::parse("tcp://host").is_err());
        assert!(Device::parse("tcp://:80").is_err());
        assert!(Device::parse("tcp://host:99999").is_err());
    }

    #[test]
    fn unix() {
        assert_eq!(
            Device::parse("unix:///run/psp.sock").unwrap(),
            Device::Unix {
                path: "/run/psp.sock".into()
            }
        );
        assert!(Device::parse("unix://").is_err());
    }

    #[test]
    fn serial_defaults() {
        let Device::Serial(cfg) = Device::parse("serial:///dev/ttyUSB0").unwrap() else {
            panic!("expected serial");
        };
        assert_eq!(cfg.path, PathBuf::from("/dev/ttyUSB0"));
        assert_eq!(cfg.baud, 115_200);
        assert_eq!(cfg.parity, Parity::None);
        assert_eq!(cfg.data_bits, 8);
    }

    #[test]
    fn serial_full() {
        let d = Device::parse("serial:///dev/ttyS1:57600:e:7").unwrap();
        let Device::Serial(cfg) = &d else {
            panic!("expected serial");
        };
        assert_eq!(cfg.baud, 57600);
        assert_eq!(cfg.parity, Parity::Even);
        assert_eq!(cfg.data_bits, 7);
        assert_eq!(d.to_string(), "serial:///dev/ttyS1:57600:e:7");
    }

    #[test]
    fn serial_errors() {
        assert!(Device::parse("serial://").is_err());
        assert!(Device::parse("serial:///dev/ttyS0:12345").is_err());
        assert!(Device::parse("serial:///dev/ttyS0:9600:x").is_err());
        assert!(Device::parse("serial:///dev/ttyS0:9600:n:9").is_err());
        assert!(Device::parse("serial:///dev/ttyS0:9600:n:8:1").is_err());
    }

    #[test]
    fn unknown_scheme() {
        let err = Device::parse("sev://0").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(Device::parse("/dev/sev").is_err());
    }
}
