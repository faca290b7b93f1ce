//! Raw-mode serial line transport.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::termios::{self, BaudRate, ControlFlags, FlushArg, SetArg};

use super::Transport;
use crate::device::{Parity, SerialConfig};

/// A TTY configured for raw 8-bit transfer.
#[derive(Debug)]
pub struct SerialPort {
    /// The open TTY.
    file: File,
    /// Read timeout, enforced with `poll`.
    timeout: Option<Duration>,
}

impl SerialPort {
    /// Opens and configures the line described by `cfg`.
    pub fn open(cfg: &SerialConfig) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_NOCTTY.bits())
            .open(&cfg.path)?;

        let mut tio = termios::tcgetattr(&file)?;
        termios::cfmakeraw(&mut tio);
        termios::cfsetspeed(&mut tio, baud_rate(cfg.baud)?)?;
        tio.control_flags.remove(
            ControlFlags::CSIZE | ControlFlags::PARENB | ControlFlags::PARODD | ControlFlags::CSTOPB,
        );
        tio.control_flags
            .insert(ControlFlags::CLOCAL | ControlFlags::CREAD | char_size(cfg.data_bits)?);
        match cfg.parity {
            Parity::None => {}
            Parity::Even => tio.control_flags.insert(ControlFlags::PARENB),
            Parity::Odd => tio
                .control_flags
                .insert(ControlFlags::PARENB | ControlFlags::PARODD),
        }
        termios::tcsetattr(&file, SetArg::TCSANOW, &tio)?;
        termios::tcflush(&file, FlushArg::TCIOFLUSH)?;

        Ok(Self {
            file,
            timeout: None,
        })
    }
}

/// Maps a line speed to its termios constant.
fn baud_rate(baud: u32) -> io::Result<BaudRate> {
    Ok(match baud {
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {baud}"),
            ));
        }
    })
}

/// Maps a character size to its termios flag.
fn char_size(bits: u8) -> io::Result<ControlFlags> {
    Ok(match bits {
        5 => ControlFlags::CS5,
        6 => ControlFlags::CS6,
        7 => ControlFlags::CS7,
        8 => ControlFlags::CS8,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported data bits {bits}"),
            ));
        }
    })
}

impl Read for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(timeout) = self.timeout {
            let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
            if poll(&mut fds, PollTimeout::from(ms))? == 0 {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "serial read timed out"));
            }
        }
        self.file.read(buf)
    }
}

impl Write for SerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        termios::tcdrain(&self.file)?;
        Ok(())
    }
}

impl Transport for SerialPort {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }
}
