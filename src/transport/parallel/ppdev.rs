//! # ppdev Parallel Line
//!
//! [`ParallelLine`] over the Linux user-space parallel port driver
//! (`/dev/parport<N>`).
//!
//! ## ioctls
//!
//! `libc` does not export the ppdev request numbers, so they are built here
//! from the kernel's `_IOC` layout (`dir << 30 | size << 16 | 'p' << 8 | nr`).
//!
//! | Request | Direction | Argument |
//! |---------|-----------|----------|
//! | PPRSTATUS | read | `u8` status register |
//! | PPCLAIM | none | |
//! | PPRELEASE | none | |
//! | PPFCONTROL | write | `{ mask: u8, val: u8 }` |
//! | PPNEGOT | write | `c_int` IEEE-1284 mode |

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

use tracing::warn;

use super::{Ieee1284Mode, ParallelConnector, ParallelLine};
use crate::error::{Result, StarIoError};

const PP_IOCTL: libc::c_ulong = b'p' as libc::c_ulong;
const IOC_NONE: libc::c_ulong = 0;
const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const fn ioc(dir: libc::c_ulong, nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | (PP_IOCTL << 8) | nr
}

#[repr(C)]
struct FrobControl {
    mask: libc::c_uchar,
    val: libc::c_uchar,
}

const PPRSTATUS: libc::c_ulong = ioc(IOC_READ, 0x81, size_of::<libc::c_uchar>());
const PPCLAIM: libc::c_ulong = ioc(IOC_NONE, 0x8B, 0);
const PPRELEASE: libc::c_ulong = ioc(IOC_NONE, 0x8C, 0);
const PPFCONTROL: libc::c_ulong = ioc(IOC_WRITE, 0x8E, size_of::<FrobControl>());
const PPNEGOT: libc::c_ulong = ioc(IOC_WRITE, 0x91, size_of::<libc::c_int>());

const IEEE1284_MODE_NIBBLE: libc::c_int = 0;
const IEEE1284_MODE_COMPAT: libc::c_int = 1 << 8;

/// Opens and claims real `/dev/parport*` devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct PpdevConnector;

impl ParallelConnector for PpdevConnector {
    fn connect(&self, path: &str) -> Result<Box<dyn ParallelLine>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| StarIoError::NotOpen(format!("{}: {}", path, e)))?;

        let result = unsafe { libc::ioctl(file.as_raw_fd(), PPCLAIM as _) };
        if result != 0 {
            return Err(StarIoError::NotOpen(format!(
                "{}: PPCLAIM failed: {}",
                path,
                io::Error::last_os_error()
            )));
        }

        Ok(Box::new(PpdevLine { file }))
    }
}

pub struct PpdevLine {
    file: File,
}

impl PpdevLine {
    fn fd(&self) -> i32 {
        self.file.as_raw_fd()
    }
}

impl ParallelLine for PpdevLine {
    fn negotiate(&mut self, mode: Ieee1284Mode) -> Result<()> {
        let mode: libc::c_int = match mode {
            Ieee1284Mode::Compatibility => IEEE1284_MODE_COMPAT,
            Ieee1284Mode::Nibble => IEEE1284_MODE_NIBBLE,
        };
        let result = unsafe { libc::ioctl(self.fd(), PPNEGOT as _, &mode) };
        if result != 0 {
            return Err(StarIoError::io("PPNEGOT failed", io::Error::last_os_error()));
        }
        Ok(())
    }

    fn read_status(&mut self) -> Result<u8> {
        let mut status: libc::c_uchar = 0;
        let result = unsafe { libc::ioctl(self.fd(), PPRSTATUS as _, &mut status) };
        if result != 0 {
            return Err(StarIoError::io("PPRSTATUS failed", io::Error::last_os_error()));
        }
        Ok(status)
    }

    fn frob_control(&mut self, mask: u8, value: u8) -> Result<()> {
        let frob = FrobControl { mask, val: value };
        let result = unsafe { libc::ioctl(self.fd(), PPFCONTROL as _, &frob) };
        if result != 0 {
            return Err(StarIoError::io("PPFCONTROL failed", io::Error::last_os_error()));
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        match self.file.write(data) {
            Ok(written) => Ok(written),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(StarIoError::io("parallel write failed", e)),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.file.read(buf) {
            Ok(count) => Ok(count),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(StarIoError::io("parallel read failed", e)),
        }
    }
}

impl Drop for PpdevLine {
    fn drop(&mut self) {
        let result = unsafe { libc::ioctl(self.fd(), PPRELEASE as _) };
        if result != 0 {
            warn!(error = %io::Error::last_os_error(), "PPRELEASE failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_numbers_match_kernel_headers() {
        assert_eq!(PPRSTATUS, 0x8001_7081);
        assert_eq!(PPCLAIM, 0x708B);
        assert_eq!(PPRELEASE, 0x708C);
        assert_eq!(PPFCONTROL, 0x4002_708E);
        assert_eq!(PPNEGOT, 0x4004_7091);
    }
}
