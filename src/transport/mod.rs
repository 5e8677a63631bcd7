//! # Printer Transport Layer
//!
//! Backends that move raw bytes between the host and a Star printer, each
//! behind the same [`Transport`] contract so the registry can dispatch on the
//! port name alone.
//!
//! ## Available Transports
//!
//! | Backend | Port name | Module |
//! |---------|-----------|--------|
//! | USB (vendor class) | `usb:<model>[;sn:<serial>]` | [`usb`] |
//! | IEEE-1284 parallel | `/dev/parport<N>` | [`parallel`] |
//! | RS-232 serial | `/dev/ttyS<N>` | [`serial`] |
//!
//! ## Port Lifecycle
//!
//! Each backend owns a bounded [`table::PortTable`]. `open` inserts a port
//! (opening a name twice is a no-op), every other operation looks the port up
//! by name, and `close` removes it. A name that is not in the table fails
//! with `NotOpen` without touching the device.
//!
//! ## OS Seams
//!
//! Backends never call the OS directly. Each one talks through a small line
//! trait (`SerialLine`, `ParallelLine`, `UsbLink`) produced by a connector,
//! so the protocols can run against simulated devices in tests.

pub mod parallel;
pub mod serial;
pub mod table;
pub mod usb;

pub use parallel::ParallelTransport;
pub use serial::SerialTransport;
pub use table::PortTable;
pub use usb::UsbTransport;

use std::fmt;
use std::time::Duration;

use crate::error::{Result, StarIoError};
use crate::protocol::{StarPrinterStatus, VisualCardCommand};

/// Which physical interface a backend drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Usb,
    Parallel,
    Serial,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Usb => write!(f, "usb"),
            TransportKind::Parallel => write!(f, "parallel"),
            TransportKind::Serial => write!(f, "serial"),
        }
    }
}

/// # Transport Backend Contract
///
/// All methods take `&self`; backends keep their open ports behind a
/// [`PortTable`] so one registry can be shared between threads.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Pure syntactic test on the port name.
    fn matches(&self, name: &str) -> bool;

    /// Open (or reuse) the named port.
    fn open(&self, name: &str, settings: &str) -> Result<()>;

    /// Write bytes, returning how many the device accepted.
    fn write(&self, name: &str, data: &[u8]) -> Result<usize>;

    /// Read up to `buf.len()` bytes.
    fn read(&self, name: &str, buf: &mut [u8]) -> Result<usize>;

    /// Fetch and decode one status block.
    fn status(&self, name: &str) -> Result<StarPrinterStatus>;

    fn begin_checked_block(&self, name: &str) -> Result<()>;

    fn end_checked_block(&self, name: &str) -> Result<StarPrinterStatus>;

    fn hard_reset(&self, name: &str) -> Result<()>;

    /// Run one Visual Card command. Unsupported unless the backend overrides it.
    fn visual_card(
        &self,
        name: &str,
        _request: &VisualCardCommand,
        _timeout: Duration,
    ) -> Result<VisualCardCommand> {
        Err(StarIoError::NotAvailable(format!(
            "{}: Visual Card commands need a bidirectional {} channel",
            name,
            self.kind()
        )))
    }

    /// Release the port. Unknown names succeed silently.
    fn close(&self, name: &str) -> Result<()>;

    /// Close every open port.
    fn release_all(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display() {
        assert_eq!(TransportKind::Usb.to_string(), "usb");
        assert_eq!(TransportKind::Parallel.to_string(), "parallel");
        assert_eq!(TransportKind::Serial.to_string(), "serial");
    }
}
