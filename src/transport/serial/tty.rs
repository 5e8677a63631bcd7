//! # TTY Serial Line
//!
//! [`SerialLine`] over a Linux serial device using `termios` and modem-line
//! ioctls.
//!
//! ## TTY Configuration
//!
//! The device is opened `O_RDWR | O_NOCTTY | O_NDELAY` and configured raw:
//!
//! - **Speed**: input and output set to the requested baud rate
//! - **Receiver on, modem control ignored**: CLOCAL | CREAD
//! - **Parity**: PARENB/PARODD per settings, INPCK | ISTRIP when enabled
//! - **Character size**: CS7 or CS8
//! - **Stop bits**: CSTOPB for two
//! - **No flow control in the driver**: CRTSCTS, IXON, IXOFF, IXANY cleared.
//!   Hardware flow control is done by polling DSR in the backend.
//! - **Non-canonical, no echo, no signals, no output processing**

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::mem::MaybeUninit;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

use super::settings::{BaudRate, DataBits, FlowControl, Parity, SerialSettings, StopBits};
use super::{SerialConnector, SerialLine};
use crate::error::{Result, StarIoError};

/// Opens real `/dev/ttyS*` devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct TtyConnector;

impl SerialConnector for TtyConnector {
    fn connect(&self, path: &str) -> Result<Box<dyn SerialLine>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NDELAY)
            .open(path)
            .map_err(|e| StarIoError::NotOpen(format!("{}: {}", path, e)))?;

        Ok(Box::new(TtyLine { file }))
    }
}

pub struct TtyLine {
    file: File,
}

impl TtyLine {
    fn fd(&self) -> i32 {
        self.file.as_raw_fd()
    }

    fn modem_lines(&self) -> Result<libc::c_int> {
        let mut lines: libc::c_int = 0;
        let result = unsafe { libc::ioctl(self.fd(), libc::TIOCMGET, &mut lines) };
        if result != 0 {
            return Err(StarIoError::io("TIOCMGET failed", io::Error::last_os_error()));
        }
        Ok(lines)
    }
}

fn speed(baud: BaudRate) -> libc::speed_t {
    match baud {
        BaudRate::B2400 => libc::B2400,
        BaudRate::B4800 => libc::B4800,
        BaudRate::B9600 => libc::B9600,
        BaudRate::B19200 => libc::B19200,
        BaudRate::B38400 => libc::B38400,
    }
}

impl SerialLine for TtyLine {
    fn configure(&mut self, settings: &SerialSettings) -> Result<()> {
        let fd = self.fd();

        let mut termios = MaybeUninit::uninit();
        let result = unsafe { libc::tcgetattr(fd, termios.as_mut_ptr()) };
        if result != 0 {
            return Err(StarIoError::io("tcgetattr failed", io::Error::last_os_error()));
        }
        let mut termios = unsafe { termios.assume_init() };

        let baud = speed(settings.baud);
        let input = unsafe { libc::cfsetispeed(&mut termios, baud) };
        let output = unsafe { libc::cfsetospeed(&mut termios, baud) };
        if input != 0 || output != 0 {
            return Err(StarIoError::io("cfsetspeed failed", io::Error::last_os_error()));
        }
        termios.c_cflag |= libc::CLOCAL | libc::CREAD;

        match settings.parity {
            Parity::None => termios.c_cflag &= !libc::PARENB,
            Parity::Even => {
                termios.c_cflag |= libc::PARENB;
                termios.c_cflag &= !libc::PARODD;
                termios.c_iflag |= libc::INPCK | libc::ISTRIP;
            }
            Parity::Odd => {
                termios.c_cflag |= libc::PARENB | libc::PARODD;
                termios.c_iflag |= libc::INPCK | libc::ISTRIP;
            }
        }

        termios.c_cflag &= !libc::CSIZE;
        termios.c_cflag |= match settings.data_bits {
            DataBits::Seven => libc::CS7,
            DataBits::Eight => libc::CS8,
        };

        match settings.stop_bits {
            StopBits::One => termios.c_cflag &= !libc::CSTOPB,
            StopBits::Two => termios.c_cflag |= libc::CSTOPB,
        }

        // DSR is polled by hand under hdwr, so the driver does no flow control either way
        match settings.flow_control {
            FlowControl::None | FlowControl::Hardware => {
                termios.c_cflag &= !libc::CRTSCTS;
                termios.c_iflag &= !(libc::IXON | libc::IXOFF | libc::IXANY);
            }
        }

        termios.c_lflag &= !(libc::ICANON | libc::ECHO | libc::ECHOE | libc::ISIG);
        termios.c_oflag &= !libc::OPOST;

        unsafe { libc::tcflush(fd, libc::TCIFLUSH) };

        let result = unsafe { libc::tcsetattr(fd, libc::TCSANOW, &termios) };
        if result != 0 {
            return Err(StarIoError::io("tcsetattr failed", io::Error::last_os_error()));
        }

        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        match self.file.write(data) {
            Ok(written) => Ok(written),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(StarIoError::io("serial write failed", e)),
        }
    }

    fn drain(&mut self) -> Result<()> {
        let result = unsafe { libc::tcdrain(self.fd()) };
        if result != 0 {
            return Err(StarIoError::io("tcdrain failed", io::Error::last_os_error()));
        }
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize> {
        let mut available: libc::c_int = 0;
        let result = unsafe { libc::ioctl(self.fd(), libc::FIONREAD, &mut available) };
        if result != 0 {
            return Err(StarIoError::io("FIONREAD failed", io::Error::last_os_error()));
        }
        Ok(available.max(0) as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.file.read(buf) {
            Ok(count) => Ok(count),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(StarIoError::io("serial read failed", e)),
        }
    }

    fn dsr(&mut self) -> Result<bool> {
        Ok(self.modem_lines()? & libc::TIOCM_DSR != 0)
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        let mut lines = self.modem_lines()?;
        if level {
            lines |= libc::TIOCM_DTR;
        } else {
            lines &= !libc::TIOCM_DTR;
        }

        let result = unsafe { libc::ioctl(self.fd(), libc::TIOCMSET, &lines) };
        if result != 0 {
            return Err(StarIoError::io("TIOCMSET failed", io::Error::last_os_error()));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let result = unsafe { libc::tcflush(self.fd(), libc::TCIOFLUSH) };
        if result != 0 {
            return Err(StarIoError::io("tcflush failed", io::Error::last_os_error()));
        }
        Ok(())
    }
}
