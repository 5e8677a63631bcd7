//! # IEEE-1284 Parallel Transport
//!
//! Drives Star printers on `/dev/parport<N>` through ppdev.
//!
//! ## Online Detection
//!
//! The printer counts as online when, after negotiating compatibility mode,
//! both the nError (0x08) and Busy (0x80) bits of the status register are
//! set. A failed negotiation or status read counts as offline.
//!
//! ## Timing
//!
//! | Operation | Behavior |
//! |-----------|----------|
//! | write | write at once if online; otherwise poll every 50 ms, giving up after 5 s without progress |
//! | read | compatibility mode, then nibble mode, then one read |
//! | status | one read of up to 63 bytes, no request sent |
//! | hard reset | pulse INIT low for 1 ms |
//!
//! Parallel ports have no Visual Card channel.

mod ppdev;

pub use ppdev::{PpdevConnector, PpdevLine};

use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::table::PortTable;
use super::{Transport, TransportKind};
use crate::error::{Result, StarIoError};
use crate::printer::IoConfig;
use crate::protocol::asb::{self, MAX_BLOCK_LEN, MIN_BLOCK_LEN, StarPrinterStatus};
use crate::protocol::checked_block::{self, CheckedBlockDevice};

/// Port names handled by this backend start with this prefix
pub const PORT_PREFIX: &str = "/dev/parport";

/// nError status line
pub const STATUS_ERROR: u8 = 0x08;

/// Busy status line
pub const STATUS_BUSY: u8 = 0x80;

/// INIT control line
pub const CONTROL_INIT: u8 = 0x04;

/// Poll interval while the printer is offline during a write
const WRITE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Write gives up after this long without progress
const WRITE_IDLE_TIMEOUT: Duration = Duration::from_millis(5000);

/// How long INIT stays low during a hardware reset
const RESET_PULSE: Duration = Duration::from_millis(1);

/// IEEE-1284 transfer modes used by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ieee1284Mode {
    Compatibility,
    Nibble,
}

// ============================================================================
// OS SEAM
// ============================================================================

/// A claimed parallel port. Dropping it releases the claim.
pub trait ParallelLine: Send {
    fn negotiate(&mut self, mode: Ieee1284Mode) -> Result<()>;

    /// Raw status register.
    fn read_status(&mut self) -> Result<u8>;

    /// Set the control lines in `mask` to the matching bits of `value`.
    fn frob_control(&mut self, mask: u8, value: u8) -> Result<()>;

    /// Non-blocking write. `Ok(0)` when the port would block.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Opens and claims parallel ports by path. Failure is `NotOpen`.
pub trait ParallelConnector: Send + Sync {
    fn connect(&self, path: &str) -> Result<Box<dyn ParallelLine>>;
}

// ============================================================================
// PORT
// ============================================================================

pub struct ParallelPort {
    name: String,
    line: Box<dyn ParallelLine>,
    status_cache: Option<StarPrinterStatus>,
}

impl ParallelPort {
    fn new(name: &str, line: Box<dyn ParallelLine>) -> Self {
        Self {
            name: name.to_string(),
            line,
            status_cache: None,
        }
    }

    fn online(&mut self) -> bool {
        if self.line.negotiate(Ieee1284Mode::Compatibility).is_err() {
            return false;
        }
        match self.line.read_status() {
            Ok(status) => status & STATUS_ERROR != 0 && status & STATUS_BUSY != 0,
            Err(_) => false,
        }
    }

    /// One write attempt; errors count as no progress.
    fn try_write(&mut self, data: &[u8]) -> usize {
        match self.line.write(data) {
            Ok(written) => written,
            Err(e) => {
                debug!(port = %self.name, error = %e, "parallel write attempt failed");
                0
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut total = 0;
        let mut last = 0;
        let mut remaining = WRITE_IDLE_TIMEOUT;

        if self.online() {
            last = self.try_write(data);
            total = last;
        }

        while total < data.len() && !remaining.is_zero() {
            if last == 0 {
                thread::sleep(WRITE_POLL_INTERVAL);
                remaining = remaining.saturating_sub(WRITE_POLL_INTERVAL);
            } else {
                remaining = WRITE_IDLE_TIMEOUT;
            }

            last = 0;
            if !self.online() {
                continue;
            }

            last = self.try_write(&data[total..]);
            total += last;
        }

        if total < data.len() {
            warn!(port = %self.name, written = total, requested = data.len(), "parallel write timed out");
        }

        Ok(total)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        // Nibble mode can only be entered from compatibility mode
        let _ = self.line.negotiate(Ieee1284Mode::Compatibility);
        self.line.negotiate(Ieee1284Mode::Nibble)?;
        self.line.read(buf)
    }

    fn status(&mut self) -> Result<StarPrinterStatus> {
        let mut raw = [0u8; MAX_BLOCK_LEN];
        let len = self.read(&mut raw)?;
        if len < MIN_BLOCK_LEN {
            return Err(StarIoError::IoFail(format!(
                "{}: status block of {} bytes",
                self.name, len
            )));
        }
        asb::decode(&raw[..len])
    }

    fn hard_reset(&mut self) -> Result<()> {
        self.line.negotiate(Ieee1284Mode::Compatibility)?;
        self.line.frob_control(CONTROL_INIT, 0)?;
        thread::sleep(RESET_PULSE);
        self.line.frob_control(CONTROL_INIT, CONTROL_INIT)?;
        info!(port = %self.name, "hardware reset");
        Ok(())
    }
}

impl CheckedBlockDevice for ParallelPort {
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize> {
        self.write(data)
    }

    fn read_status(&mut self) -> Result<StarPrinterStatus> {
        self.status()
    }

    fn probe_offline(&mut self) -> Result<bool> {
        Ok(!self.online())
    }

    fn hard_reset(&mut self) -> Result<()> {
        ParallelPort::hard_reset(self)
    }

    fn status_cache(&self) -> Option<&StarPrinterStatus> {
        self.status_cache.as_ref()
    }

    fn set_status_cache(&mut self, status: StarPrinterStatus) {
        self.status_cache = Some(status);
    }
}

// ============================================================================
// BACKEND
// ============================================================================

pub struct ParallelTransport {
    connector: Box<dyn ParallelConnector>,
    ports: PortTable<ParallelPort>,
}

impl ParallelTransport {
    /// Backend on real ppdev devices.
    pub fn new(config: &IoConfig) -> Self {
        Self::with_connector(config, PpdevConnector)
    }

    pub fn with_connector(config: &IoConfig, connector: impl ParallelConnector + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            ports: PortTable::new(config.port_capacity),
        }
    }

    pub fn open_ports(&self) -> Vec<String> {
        self.ports.names()
    }
}

impl Transport for ParallelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Parallel
    }

    fn matches(&self, name: &str) -> bool {
        name.starts_with(PORT_PREFIX)
    }

    fn open(&self, name: &str, _settings: &str) -> Result<()> {
        if self.ports.contains(name) {
            return Ok(());
        }
        self.ports.ensure_room(name)?;

        let line = self.connector.connect(name)?;
        self.ports.insert(name, ParallelPort::new(name, line))?;
        info!(port = name, "parallel port open");
        Ok(())
    }

    fn write(&self, name: &str, data: &[u8]) -> Result<usize> {
        self.ports.with_port(name, |port| port.write(data))
    }

    fn read(&self, name: &str, buf: &mut [u8]) -> Result<usize> {
        self.ports.with_port(name, |port| port.read(buf))
    }

    fn status(&self, name: &str) -> Result<StarPrinterStatus> {
        self.ports.with_port(name, |port| port.status())
    }

    fn begin_checked_block(&self, name: &str) -> Result<()> {
        self.ports.with_port(name, |port| checked_block::begin(port))
    }

    fn end_checked_block(&self, name: &str) -> Result<StarPrinterStatus> {
        self.ports.with_port(name, |port| checked_block::end(port))
    }

    fn hard_reset(&self, name: &str) -> Result<()> {
        self.ports.with_port(name, |port| port.hard_reset())
    }

    fn close(&self, name: &str) -> Result<()> {
        if self.ports.remove(name).is_some() {
            info!(port = name, "parallel port closed");
        }
        Ok(())
    }

    fn release_all(&self) {
        for (name, _) in self.ports.drain() {
            debug!(port = %name, "released");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct LineState {
        status_register: u8,
        negotiations: Vec<Ieee1284Mode>,
        nibble_fails: bool,
        control_log: Vec<(u8, u8)>,
        written: Vec<u8>,
        incoming: Vec<u8>,
        online_after_polls: usize,
        released: bool,
    }

    struct FakeLine(Arc<Mutex<LineState>>);

    impl ParallelLine for FakeLine {
        fn negotiate(&mut self, mode: Ieee1284Mode) -> Result<()> {
            let mut state = self.0.lock().unwrap();
            state.negotiations.push(mode);
            if mode == Ieee1284Mode::Nibble && state.nibble_fails {
                return Err(StarIoError::IoFail("PPNEGOT".into()));
            }
            Ok(())
        }

        fn read_status(&mut self) -> Result<u8> {
            let mut state = self.0.lock().unwrap();
            if state.online_after_polls > 0 {
                state.online_after_polls -= 1;
                return Ok(0);
            }
            Ok(state.status_register)
        }

        fn frob_control(&mut self, mask: u8, value: u8) -> Result<()> {
            self.0.lock().unwrap().control_log.push((mask, value));
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> Result<usize> {
            self.0.lock().unwrap().written.extend_from_slice(data);
            Ok(data.len())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let state = self.0.lock().unwrap();
            let count = buf.len().min(state.incoming.len());
            buf[..count].copy_from_slice(&state.incoming[..count]);
            Ok(count)
        }
    }

    impl Drop for FakeLine {
        fn drop(&mut self) {
            if let Ok(mut state) = self.0.lock() {
                state.released = true;
            }
        }
    }

    struct FakeConnector(Arc<Mutex<LineState>>);

    impl ParallelConnector for FakeConnector {
        fn connect(&self, _path: &str) -> Result<Box<dyn ParallelLine>> {
            Ok(Box::new(FakeLine(self.0.clone())))
        }
    }

    const ONLINE: u8 = STATUS_ERROR | STATUS_BUSY;

    fn backend(status_register: u8) -> (ParallelTransport, Arc<Mutex<LineState>>) {
        let state = Arc::new(Mutex::new(LineState {
            status_register,
            ..Default::default()
        }));
        let transport = ParallelTransport::with_connector(&IoConfig::DEFAULT, FakeConnector(state.clone()));
        transport.open("/dev/parport0", "").unwrap();
        (transport, state)
    }

    #[test]
    fn test_write_when_online() {
        let (transport, state) = backend(ONLINE);
        assert_eq!(transport.write("/dev/parport0", b"hello").unwrap(), 5);
        assert_eq!(state.lock().unwrap().written, b"hello".to_vec());
    }

    #[test]
    fn test_write_waits_for_online() {
        let (transport, state) = backend(ONLINE);
        state.lock().unwrap().online_after_polls = 3;
        assert_eq!(transport.write("/dev/parport0", b"abc").unwrap(), 3);
    }

    #[test]
    fn test_write_gives_up_while_offline() {
        let (transport, state) = backend(0x00);
        let started = std::time::Instant::now();
        assert_eq!(transport.write("/dev/parport0", b"abc").unwrap(), 0);
        assert!(started.elapsed() >= WRITE_IDLE_TIMEOUT);
        assert!(state.lock().unwrap().written.is_empty());
    }

    #[test]
    fn test_online_needs_both_bits() {
        for register in [0x00, STATUS_ERROR, STATUS_BUSY] {
            let (transport, _) = backend(register);
            transport
                .ports
                .with_port("/dev/parport0", |port| {
                    assert!(!port.online());
                    Ok(())
                })
                .unwrap();
        }
    }

    #[test]
    fn test_read_negotiates_nibble() {
        let (transport, state) = backend(ONLINE);
        state.lock().unwrap().incoming = vec![1, 2, 3];
        let mut buf = [0u8; 8];
        assert_eq!(transport.read("/dev/parport0", &mut buf).unwrap(), 3);
        assert_eq!(
            state.lock().unwrap().negotiations,
            vec![Ieee1284Mode::Compatibility, Ieee1284Mode::Nibble]
        );
    }

    #[test]
    fn test_read_nibble_failure() {
        let (transport, state) = backend(ONLINE);
        state.lock().unwrap().nibble_fails = true;
        let mut buf = [0u8; 8];
        let err = transport.read("/dev/parport0", &mut buf).unwrap_err();
        assert!(matches!(err, StarIoError::IoFail(_)));
    }

    #[test]
    fn test_short_status_block() {
        let (transport, state) = backend(ONLINE);
        state.lock().unwrap().incoming = vec![0x0F, 0, 0];
        let err = transport.status("/dev/parport0").unwrap_err();
        assert!(matches!(err, StarIoError::IoFail(_)));
    }

    #[test]
    fn test_hard_reset_pulses_init() {
        let (transport, state) = backend(ONLINE);
        transport.hard_reset("/dev/parport0").unwrap();
        assert_eq!(
            state.lock().unwrap().control_log,
            vec![(CONTROL_INIT, 0), (CONTROL_INIT, CONTROL_INIT)]
        );
    }

    #[test]
    fn test_visual_card_not_available() {
        let (transport, _) = backend(ONLINE);
        let request = crate::protocol::VisualCardCommand::new(0x41, vec![]);
        let err = transport
            .visual_card("/dev/parport0", &request, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, StarIoError::NotAvailable(_)));
    }

    #[test]
    fn test_close_releases_claim() {
        let (transport, state) = backend(ONLINE);
        transport.close("/dev/parport0").unwrap();
        assert!(state.lock().unwrap().released);
        assert!(transport.open_ports().is_empty());
    }
}
