//! # RS-232 Serial Transport
//!
//! Drives Star printers on `/dev/ttyS<N>`.
//!
//! ## Timing
//!
//! | Operation | Behavior |
//! |-----------|----------|
//! | write | drain after every chunk; under `hdwr` flow control send 256-byte chunks, each after DSR goes high (polled every 20 ms); give up after 5 s without progress |
//! | read | poll the input queue every 20 ms until the wanted bytes are there or 200 ms pass without new bytes |
//! | status | send `ESC ACK SOH`, read the 7-byte head, then the rest of the block its header announces |
//! | hard reset | drop DTR for 10 ms |
//!
//! ## First Open
//!
//! The first time a numbered port (`/dev/ttyS0`, `/dev/ttyS1`, ...) is opened
//! during the life of the backend, the printer is hardware reset. Reopening
//! the same port later does not reset it again.

mod settings;
mod tty;

pub use settings::{BaudRate, DataBits, FlowControl, Parity, SerialSettings, StopBits};
pub use tty::{TtyConnector, TtyLine};

use std::collections::HashSet;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::table::PortTable;
use super::{Transport, TransportKind};
use crate::error::{Result, StarIoError};
use crate::printer::IoConfig;
use crate::protocol::asb::{self, MAX_BLOCK_LEN, MIN_BLOCK_LEN, StarPrinterStatus};
use crate::protocol::checked_block::{self, CheckedBlockDevice};
use crate::protocol::visual_card::{self, CardChannel, VisualCardCommand};
use crate::protocol::STATUS_REQUEST;

/// Port names handled by this backend start with this prefix
pub const PORT_PREFIX: &str = "/dev/ttyS";

/// Interval between modem-line and input-queue polls
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Write gives up after this long without sending a byte
const WRITE_IDLE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Read gives up after this long without a new byte arriving
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Chunk size under hardware flow control
const FLOW_CONTROL_CHUNK: usize = 256;

/// How long DTR stays low during a hardware reset
const RESET_PULSE: Duration = Duration::from_millis(10);

// ============================================================================
// OS SEAM
// ============================================================================

/// An open serial device.
pub trait SerialLine: Send {
    fn configure(&mut self, settings: &SerialSettings) -> Result<()>;

    /// Non-blocking write. `Ok(0)` when the driver would block.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Block until queued output has been transmitted.
    fn drain(&mut self) -> Result<()>;

    /// Bytes waiting in the input queue.
    fn bytes_available(&mut self) -> Result<usize>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Level of the DSR input line.
    fn dsr(&mut self) -> Result<bool>;

    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Discard both input and output queues.
    fn flush(&mut self) -> Result<()>;
}

/// Opens serial devices by path. Failure to open is `NotOpen`.
pub trait SerialConnector: Send + Sync {
    fn connect(&self, path: &str) -> Result<Box<dyn SerialLine>>;
}

// ============================================================================
// PORT
// ============================================================================

pub struct SerialPort {
    name: String,
    line: Box<dyn SerialLine>,
    settings: SerialSettings,
    status_cache: Option<StarPrinterStatus>,
}

impl SerialPort {
    fn new(name: &str, line: Box<dyn SerialLine>, settings: SerialSettings) -> Self {
        Self {
            name: name.to_string(),
            line,
            settings,
            status_cache: None,
        }
    }

    /// Wait for DSR, charging the wait against `remaining`. Returns `false`
    /// once the budget is gone.
    fn await_dsr(&mut self, remaining: &mut Duration) -> Result<bool> {
        while !remaining.is_zero() {
            if self.line.dsr()? {
                return Ok(true);
            }
            thread::sleep(POLL_INTERVAL);
            *remaining = remaining.saturating_sub(POLL_INTERVAL);
        }
        Ok(false)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let hardware = self.settings.hardware_flow();
        let mut remaining = WRITE_IDLE_TIMEOUT;
        let mut total = 0;

        while total < data.len() && !remaining.is_zero() {
            if hardware && !self.await_dsr(&mut remaining)? {
                debug!(port = %self.name, "DSR stayed low");
                break;
            }

            let end = if hardware {
                (total + FLOW_CONTROL_CHUNK).min(data.len())
            } else {
                data.len()
            };

            let written = self.line.write(&data[total..end])?;
            total += written;
            self.line.drain()?;

            if written > 0 {
                remaining = WRITE_IDLE_TIMEOUT;
            } else {
                thread::sleep(POLL_INTERVAL);
                remaining = remaining.saturating_sub(POLL_INTERVAL);
            }
        }

        if total < data.len() {
            warn!(port = %self.name, written = total, requested = data.len(), "serial write timed out");
        }

        Ok(total)
    }

    /// Read once at least `min_len` bytes are queued.
    ///
    /// The wait restarts from `timeout` whenever the queue grows; fewer than
    /// `min_len` bytes when it runs out is `IoFail`.
    fn read_with(&mut self, buf: &mut [u8], min_len: usize, timeout: Duration) -> Result<usize> {
        let mut available = 0;
        let mut remaining = timeout;

        while !remaining.is_zero() {
            let before = available;
            available = self.line.bytes_available()?;
            if available >= min_len {
                break;
            }

            thread::sleep(POLL_INTERVAL);

            if available != before {
                remaining = timeout;
            } else {
                remaining = remaining.saturating_sub(POLL_INTERVAL);
            }
        }

        if available < min_len {
            return Err(StarIoError::IoFail(format!(
                "{}: {} of {} bytes arrived",
                self.name, available, min_len
            )));
        }

        if available == 0 {
            return Ok(0);
        }

        let len = buf.len().min(available);
        self.line.read(&mut buf[..len])
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.read_with(buf, 1, READ_TIMEOUT)
    }

    fn status(&mut self) -> Result<StarPrinterStatus> {
        if self.line.write(&STATUS_REQUEST)? != STATUS_REQUEST.len() {
            return Err(StarIoError::IoFail(format!(
                "{}: status request not sent",
                self.name
            )));
        }

        let mut raw = [0u8; MAX_BLOCK_LEN];
        let mut len = self.read_with(&mut raw, MIN_BLOCK_LEN, READ_TIMEOUT)?;
        if len < MIN_BLOCK_LEN {
            return Err(StarIoError::IoFail(format!(
                "{}: status block of {} bytes",
                self.name, len
            )));
        }

        let expected = asb::block_length(raw[0]).ok_or_else(|| {
            StarIoError::IoFail(format!(
                "{}: unrecognized status header {:#04x}",
                self.name, raw[0]
            ))
        })?;

        if len < expected {
            len += self.read_with(&mut raw[len..expected], expected - len, READ_TIMEOUT)?;
        }

        if len != expected {
            return Err(StarIoError::IoFail(format!(
                "{}: status block of {} bytes, header announced {}",
                self.name, len, expected
            )));
        }

        asb::decode(&raw[..len])
    }

    fn hard_reset(&mut self) -> Result<()> {
        self.line.set_dtr(false)?;
        thread::sleep(RESET_PULSE);
        self.line.set_dtr(true)?;
        info!(port = %self.name, "hardware reset");
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.line.flush() {
            warn!(port = %self.name, error = %e, "flush on close failed");
        }
    }
}

impl CheckedBlockDevice for SerialPort {
    /// Single raw write, not paced by DSR.
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize> {
        self.line.write(data)
    }

    fn read_status(&mut self) -> Result<StarPrinterStatus> {
        self.status()
    }

    fn probe_offline(&mut self) -> Result<bool> {
        Ok(!self.line.dsr()?)
    }

    fn hard_reset(&mut self) -> Result<()> {
        SerialPort::hard_reset(self)
    }

    fn status_cache(&self) -> Option<&StarPrinterStatus> {
        self.status_cache.as_ref()
    }

    fn set_status_cache(&mut self, status: StarPrinterStatus) {
        self.status_cache = Some(status);
    }
}

impl CardChannel for SerialPort {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.write(data)
    }

    fn receive(&mut self, buf: &mut [u8], min_len: usize, wait: Duration) -> Result<usize> {
        self.read_with(buf, min_len, wait)
    }
}

// ============================================================================
// BACKEND
// ============================================================================

/// Number after `/dev/ttyS`, if the name has one.
fn port_number(name: &str) -> Option<u32> {
    let suffix = name.strip_prefix(PORT_PREFIX)?;
    let digits: String = suffix.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

pub struct SerialTransport {
    connector: Box<dyn SerialConnector>,
    ports: PortTable<SerialPort>,
    reset_once: Mutex<HashSet<u32>>,
}

impl SerialTransport {
    /// Backend on real TTY devices.
    pub fn new(config: &IoConfig) -> Self {
        Self::with_connector(config, TtyConnector)
    }

    pub fn with_connector(config: &IoConfig, connector: impl SerialConnector + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            ports: PortTable::new(config.port_capacity),
            reset_once: Mutex::new(HashSet::new()),
        }
    }

    pub fn open_ports(&self) -> Vec<String> {
        self.ports.names()
    }

    /// True the first time a given port number is seen.
    fn first_open(&self, name: &str) -> bool {
        let Some(number) = port_number(name) else {
            return false;
        };
        match self.reset_once.lock() {
            Ok(mut seen) => seen.insert(number),
            Err(_) => false,
        }
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn matches(&self, name: &str) -> bool {
        name.starts_with(PORT_PREFIX)
    }

    fn open(&self, name: &str, settings: &str) -> Result<()> {
        if self.ports.contains(name) {
            return Ok(());
        }
        self.ports.ensure_room(name)?;

        let settings: SerialSettings = settings.parse()?;
        let mut line = self.connector.connect(name)?;
        line.configure(&settings)?;

        let mut port = SerialPort::new(name, line, settings);
        if self.first_open(name) {
            if let Err(e) = port.hard_reset() {
                warn!(port = name, error = %e, "initial hardware reset failed");
            }
        }

        self.ports.insert(name, port)?;
        info!(port = name, %settings, "serial port open");
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

    fn visual_card(
        &self,
        name: &str,
        request: &VisualCardCommand,
        timeout: Duration,
    ) -> Result<VisualCardCommand> {
        self.ports
            .with_port(name, |port| visual_card::execute(port, request, timeout))
    }

    fn close(&self, name: &str) -> Result<()> {
        if let Some(slot) = self.ports.remove(name) {
            if let Ok(mut port) = slot.lock() {
                port.shutdown();
            }
            info!(port = name, "serial port closed");
        }
        Ok(())
    }

    fn release_all(&self) {
        for (name, slot) in self.ports.drain() {
            if let Ok(mut port) = slot.lock() {
                port.shutdown();
            }
            debug!(port = %name, "released");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
