//! # Port Registry
//!
//! The uniform API: every call names a port, and the registry hands it to the
//! first backend whose `matches` accepts that name.
//!
//! ## Dispatch Order
//!
//! | Priority | Backend | Port name |
//! |----------|---------|-----------|
//! | 1 | USB | `usb:...` |
//! | 2 | Parallel | `/dev/parport...` |
//! | 3 | Serial | `/dev/ttyS...` |
//!
//! A name no backend accepts fails with `NotAvailable`.
//!
//! ## Lifetime
//!
//! Backends live as long as the registry. Dropping the registry closes every
//! port still open.
//!
//! ## Example
//!
//! ```no_run
//! use stario::PortRegistry;
//!
//! let registry = PortRegistry::new();
//! registry.open("/dev/ttyS0", "9600,none,8,1,none")?;
//! registry.write("/dev/ttyS0", b"Hello\n")?;
//! let status = registry.status("/dev/ttyS0")?;
//! println!("online: {}", status.is_online());
//! registry.close("/dev/ttyS0")?;
//! # Ok::<(), stario::StarIoError>(())
//! ```

use std::time::Duration;

use tracing::debug;

use crate::error::{Result, StarIoError};
use crate::printer::IoConfig;
use crate::protocol::{StarPrinterStatus, VisualCardCommand};
use crate::transport::{ParallelTransport, SerialTransport, Transport, UsbTransport};

pub struct PortRegistry {
    transports: Vec<Box<dyn Transport>>,
}

impl PortRegistry {
    /// Registry on the host's real USB, parallel and serial devices.
    pub fn new() -> Self {
        Self::with_config(&IoConfig::DEFAULT)
    }

    pub fn with_config(config: &IoConfig) -> Self {
        Self::with_transports(vec![
            Box::new(UsbTransport::new(config)),
            Box::new(ParallelTransport::new(config)),
            Box::new(SerialTransport::new(config)),
        ])
    }

    /// Registry over an explicit backend list, tried in the order given.
    pub fn with_transports(transports: Vec<Box<dyn Transport>>) -> Self {
        Self { transports }
    }

    /// Backend responsible for `name`.
    pub fn transport_for(&self, name: &str) -> Result<&dyn Transport> {
        self.transports
            .iter()
            .find(|transport| transport.matches(name))
            .map(|transport| transport.as_ref())
            .ok_or_else(|| StarIoError::NotAvailable(format!("{}: unrecognized port name", name)))
    }

    pub fn open(&self, name: &str, settings: &str) -> Result<()> {
        let transport = self.transport_for(name)?;
        debug!(port = name, transport = %transport.kind(), "open");
        transport.open(name, settings)
    }

    pub fn close(&self, name: &str) -> Result<()> {
        self.transport_for(name)?.close(name)
    }

    /// Write bytes, returning how many the printer accepted.
    pub fn write(&self, name: &str, data: &[u8]) -> Result<usize> {
        self.transport_for(name)?.write(name, data)
    }

    /// Read up to `max_len` bytes. A buffer that cannot be allocated is
    /// `Runtime`.
    pub fn read(&self, name: &str, max_len: usize) -> Result<Vec<u8>> {
        let transport = self.transport_for(name)?;

        let mut buf = Vec::new();
        buf.try_reserve_exact(max_len).map_err(|e| {
            StarIoError::Runtime(format!("{}: read buffer of {} bytes: {}", name, max_len, e))
        })?;
        buf.resize(max_len, 0);

        let count = transport.read(name, &mut buf)?;
        buf.truncate(count);
        Ok(buf)
    }

    pub fn status(&self, name: &str) -> Result<StarPrinterStatus> {
        self.transport_for(name)?.status(name)
    }

    /// Start a checked block. Fails `NotAvailable` when the firmware has no
    /// ETB counter.
    pub fn begin_checked_block(&self, name: &str) -> Result<()> {
        self.transport_for(name)?.begin_checked_block(name)
    }

    /// Finish a checked block. `status.offline` set means the block did not
    /// print and the printer has been hardware reset.
    pub fn end_checked_block(&self, name: &str) -> Result<StarPrinterStatus> {
        self.transport_for(name)?.end_checked_block(name)
    }

    pub fn hard_reset(&self, name: &str) -> Result<()> {
        self.transport_for(name)?.hard_reset(name)
    }

    /// Run one Visual Card command (serial and USB only).
    pub fn visual_card(
        &self,
        name: &str,
        request: &VisualCardCommand,
        timeout: Duration,
    ) -> Result<VisualCardCommand> {
        self.transport_for(name)?.visual_card(name, request, timeout)
    }
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PortRegistry {
    fn drop(&mut self) {
        for transport in &self.transports {
            transport.release_all();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;
    use std::sync::{Arc, Mutex};

    /// Backend that records which calls reached it.
    struct Recorder {
        kind: TransportKind,
        prefix: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn log(&self, call: &str, name: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{}:{}", self.kind, call, name));
        }
    }

    impl Transport for Recorder {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn matches(&self, name: &str) -> bool {
            name.starts_with(self.prefix)
        }

        fn open(&self, name: &str, _settings: &str) -> Result<()> {
            self.log("open", name);
            Ok(())
        }

        fn write(&self, name: &str, data: &[u8]) -> Result<usize> {
            self.log("write", name);
            Ok(data.len())
        }

        fn read(&self, name: &str, buf: &mut [u8]) -> Result<usize> {
            self.log("read", name);
            let count = buf.len().min(2);
            buf[..count].fill(0xAA);
            Ok(count)
        }

        fn status(&self, name: &str) -> Result<StarPrinterStatus> {
            self.log("status", name);
            Ok(StarPrinterStatus::default())
        }

        fn begin_checked_block(&self, name: &str) -> Result<()> {
            self.log("begin", name);
            Ok(())
        }

        fn end_checked_block(&self, name: &str) -> Result<StarPrinterStatus> {
            self.log("end", name);
            Ok(StarPrinterStatus::default())
        }

        fn hard_reset(&self, name: &str) -> Result<()> {
            self.log("reset", name);
            Ok(())
        }

        fn close(&self, name: &str) -> Result<()> {
            self.log("close", name);
            Ok(())
        }

        fn release_all(&self) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:release_all", self.kind));
        }
    }

    fn registry() -> (PortRegistry, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorder = |kind: TransportKind, prefix: &'static str| -> Box<dyn Transport> {
            Box::new(Recorder {
                kind,
                prefix,
                calls: calls.clone(),
            })
        };
        let registry = PortRegistry::with_transports(vec![
            recorder(TransportKind::Usb, "usb:"),
            recorder(TransportKind::Parallel, "/dev/parport"),
            recorder(TransportKind::Serial, "/dev/ttyS"),
        ]);
        (registry, calls)
    }

    #[test]
    fn test_dispatch_by_prefix() {
        let (registry, calls) = registry();
        registry.open("usb:TSP700", "").unwrap();
        registry.write("/dev/parport0", b"x").unwrap();
        registry.hard_reset("/dev/ttyS1").unwrap();
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "usb:open:usb:TSP700".to_string(),
                "parallel:write:/dev/parport0".to_string(),
                "serial:reset:/dev/ttyS1".to_string(),
            ]
        );
    }

    #[test]
    fn test_unknown_name_not_available() {
        let (registry, calls) = registry();
        let err = registry.open("COM1", "").unwrap_err();
        assert!(matches!(err, StarIoError::NotAvailable(_)));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_read_truncates_to_count() {
        let (registry, _) = registry();
        assert_eq!(registry.read("/dev/ttyS0", 10).unwrap(), vec![0xAA, 0xAA]);
    }

    #[test]
    fn test_read_unallocatable_buffer_is_runtime() {
        let (registry, calls) = registry();
        let err = registry.read("/dev/ttyS0", usize::MAX).unwrap_err();
        assert!(matches!(err, StarIoError::Runtime(_)));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_default_visual_card_not_available() {
        let (registry, _) = registry();
        let request = VisualCardCommand::new(0x41, vec![]);
        let err = registry
            .visual_card("/dev/parport0", &request, Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, StarIoError::NotAvailable(_)));
    }

    #[test]
    fn test_drop_releases_every_backend() {
        let (registry, calls) = registry();
        drop(registry);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "usb:release_all".to_string(),
                "parallel:release_all".to_string(),
                "serial:release_all".to_string(),
            ]
        );
    }
}
