//! # USB Transport
//!
//! Drives vendor-class Star printers (VID 0x0519, PID 0x0002) over bulk
//! endpoints plus a handful of vendor control requests.
//!
//! ## Port Names
//!
//! ```text
//! usb:<model>                 first printer whose device ID contains <model>
//! usb:<model>;sn:<serial>     ...and whose 8-character serial number matches
//! ```
//!
//! ## Vendor Requests
//!
//! | bmRequestType | bRequest | wValue | Reply | Meaning |
//! |---------------|----------|--------|-------|---------|
//! | 0xC0 | 0 | 0 | up to 256 bytes | IEEE-1284 device ID (2-byte length prefix) |
//! | 0xC0 | 1 | 0 | 1 byte | port signals, 0x10 set = online |
//! | 0x40 | 2 | 0 | none | hardware reset |
//! | 0xC0 | 3 | wanted length | 2 bytes LE | bytes ready to read |
//!
//! ## Device Removal
//!
//! When any transfer reports that the device is gone, the port is closed on
//! the spot and the call fails with `NotOpen`. Later calls on the same name
//! fail with `NotOpen` without touching the bus.

mod link;

pub use link::{RusbConnector, RusbLink};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::table::{PortTable, with_slot};
use super::{Transport, TransportKind};
use crate::error::{Result, StarIoError};
use crate::printer::IoConfig;
use crate::protocol::asb::{self, MAX_BLOCK_LEN, MIN_BLOCK_LEN, StarPrinterStatus};
use crate::protocol::checked_block::{self, CheckedBlockDevice};
use crate::protocol::visual_card::{self, CardChannel, VisualCardCommand};

/// Port names handled by this backend start with this prefix
pub const PORT_PREFIX: &str = "usb:";

/// Separator between model and serial number in a port name
const SERIAL_MARKER: &str = ";sn:";

pub const REQUEST_DEVICE_ID: u8 = 0;
pub const REQUEST_PORT_SIGNALS: u8 = 1;
pub const REQUEST_RESET: u8 = 2;
pub const REQUEST_BYTES_AVAILABLE: u8 = 3;

/// Port-signal bit set while the printer is online
pub const SIGNAL_ONLINE: u8 = 0x10;

/// Largest single bulk OUT transfer
const BULK_CHUNK: usize = 4096;

/// Extra pause after an empty read during a Visual Card exchange
const EMPTY_READ_PAUSE: Duration = Duration::from_millis(20);

/// Characters in a Star serial number
pub const SERIAL_NUMBER_LEN: usize = 8;

const DT_STRING: u8 = 0x03;

// ============================================================================
// PORT NAME
// ============================================================================

/// Which printer a `usb:` port name selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbTarget {
    pub model: String,
    pub serial: Option<String>,
}

impl FromStr for UsbTarget {
    type Err = StarIoError;

    fn from_str(name: &str) -> Result<Self> {
        let rest = name
            .strip_prefix(PORT_PREFIX)
            .ok_or_else(|| StarIoError::NotOpen(format!("{}: not a USB port name", name)))?;

        Ok(match rest.split_once(SERIAL_MARKER) {
            Some((model, serial)) => Self {
                model: model.to_string(),
                serial: Some(serial.to_string()),
            },
            None => Self {
                model: rest.to_string(),
                serial: None,
            },
        })
    }
}

impl fmt::Display for UsbTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PORT_PREFIX, self.model)?;
        if let Some(serial) = &self.serial {
            write!(f, "{}{}", SERIAL_MARKER, serial)?;
        }
        Ok(())
    }
}

/// Whether `model` occurs in a device ID reply.
///
/// The first two bytes are the length prefix; the text ends at the first NUL.
pub fn device_id_matches(device_id: &[u8], model: &str) -> bool {
    let text = device_id.get(2..).unwrap_or_default();
    let text = match text.iter().position(|&b| b == 0) {
        Some(end) => &text[..end],
        None => text,
    };

    let needle = model.as_bytes();
    needle.is_empty() || text.windows(needle.len()).any(|window| window == needle)
}

/// Decode a serial-number string descriptor.
///
/// Only 8-character descriptors are accepted. UTF-16 code units outside
/// ASCII decode as `?`.
pub fn decode_serial_descriptor(raw: &[u8]) -> Option<String> {
    let expected = 2 + SERIAL_NUMBER_LEN * 2;
    if raw.len() < expected || raw[0] as usize != expected || raw[1] != DT_STRING {
        return None;
    }

    Some(
        raw[2..expected]
            .chunks_exact(2)
            .map(|unit| if unit[1] != 0 { '?' } else { unit[0] as char })
            .collect(),
    )
}

// ============================================================================
// OS SEAM
// ============================================================================

/// Failure reported by a USB transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbFault {
    /// Device unplugged
    NoDevice,
    Timeout,
    Other(String),
}

impl fmt::Display for UsbFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbFault::NoDevice => write!(f, "no such device"),
            UsbFault::Timeout => write!(f, "timed out"),
            UsbFault::Other(reason) => write!(f, "{}", reason),
        }
    }
}

pub type UsbResult<T> = std::result::Result<T, UsbFault>;

/// An opened, claimed Star USB printer. Dropping it releases the interface.
pub trait UsbLink: Send {
    fn bulk_write(&mut self, data: &[u8]) -> UsbResult<usize>;

    fn bulk_read(&mut self, buf: &mut [u8]) -> UsbResult<usize>;

    /// Vendor IN request (bmRequestType 0xC0).
    fn control_in(&mut self, request: u8, value: u16, buf: &mut [u8]) -> UsbResult<usize>;

    /// Vendor OUT request (bmRequestType 0x40) without data.
    fn control_out(&mut self, request: u8) -> UsbResult<()>;

    fn clear_halt_out(&mut self) -> UsbResult<()>;
}

/// Finds and opens the printer a port name selects. No match is `NotOpen`.
pub trait UsbConnector: Send + Sync {
    fn connect(&self, target: &UsbTarget) -> Result<Box<dyn UsbLink>>;
}

// ============================================================================
// PORT
// ============================================================================

pub struct UsbPort {
    name: String,
    link: Box<dyn UsbLink>,
    status_cache: Option<StarPrinterStatus>,
}

impl UsbPort {
    fn new(name: &str, link: Box<dyn UsbLink>) -> Self {
        Self {
            name: name.to_string(),
            link,
            status_cache: None,
        }
    }

    fn fault(&self, context: &str, fault: UsbFault) -> StarIoError {
        match fault {
            UsbFault::NoDevice => StarIoError::NotOpen(format!("{}: device removed", self.name)),
            other => StarIoError::IoFail(format!("{}: {}: {}", self.name, context, other)),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut sent = 0;

        while sent < data.len() {
            let chunk = (data.len() - sent).min(BULK_CHUNK);
            let written = match self.link.bulk_write(&data[sent..sent + chunk]) {
                Ok(written) => written,
                Err(UsbFault::NoDevice) => return Err(self.fault("bulk write", UsbFault::NoDevice)),
                Err(fault) => {
                    debug!(port = %self.name, %fault, "bulk write failed");
                    0
                }
            };
            sent += written;

            if written != chunk {
                if let Err(UsbFault::NoDevice) = self.link.clear_halt_out() {
                    return Err(self.fault("clear halt", UsbFault::NoDevice));
                }
                debug!(port = %self.name, sent, requested = data.len(), "short bulk write");
                return Ok(sent);
            }
        }

        Ok(sent)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let wanted = buf.len().min(u16::MAX as usize) as u16;
        let mut reply = [0u8; 2];
        self.link
            .control_in(REQUEST_BYTES_AVAILABLE, wanted, &mut reply)
            .map_err(|fault| self.fault("bytes-available request", fault))?;

        let available = u16::from_le_bytes(reply) as usize;
        if available == 0 {
            return Ok(0);
        }

        let len = buf.len().min(available);
        match self.link.bulk_read(&mut buf[..len]) {
            Ok(0) => Err(StarIoError::IoFail(format!("{}: empty bulk read", self.name))),
            Ok(count) => Ok(count),
            Err(fault) => Err(self.fault("bulk read", fault)),
        }
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

    fn port_signals(&mut self) -> Result<u8> {
        let mut reply = [0u8; 1];
        self.link
            .control_in(REQUEST_PORT_SIGNALS, 0, &mut reply)
            .map_err(|fault| self.fault("port-signals request", fault))?;
        Ok(reply[0])
    }

    fn hard_reset(&mut self) -> Result<()> {
        self.link
            .control_out(REQUEST_RESET)
            .map_err(|fault| self.fault("reset request", fault))?;
        info!(port = %self.name, "hardware reset");
        Ok(())
    }
}

impl CheckedBlockDevice for UsbPort {
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize> {
        self.write(data)
    }

    fn read_status(&mut self) -> Result<StarPrinterStatus> {
        self.status()
    }

    fn probe_offline(&mut self) -> Result<bool> {
        Ok(self.port_signals()? & SIGNAL_ONLINE == 0)
    }

    fn hard_reset(&mut self) -> Result<()> {
        UsbPort::hard_reset(self)
    }

    fn status_cache(&self) -> Option<&StarPrinterStatus> {
        self.status_cache.as_ref()
    }

    fn set_status_cache(&mut self, status: StarPrinterStatus) {
        self.status_cache = Some(status);
    }
}

impl CardChannel for UsbPort {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.write(data)
    }

    /// USB reads return whatever is ready; the minimum is not enforced.
    fn receive(&mut self, buf: &mut [u8], _min_len: usize, _wait: Duration) -> Result<usize> {
        self.read(buf)
    }

    fn idle_pause(&self) -> Duration {
        EMPTY_READ_PAUSE
    }
}

// ============================================================================
// BACKEND
// ============================================================================

pub struct UsbTransport {
    connector: Box<dyn UsbConnector>,
    ports: PortTable<UsbPort>,
}

impl UsbTransport {
    /// Backend on the host's USB stack.
    pub fn new(config: &IoConfig) -> Self {
        Self::with_connector(config, RusbConnector::new(*config))
    }

    pub fn with_connector(config: &IoConfig, connector: impl UsbConnector + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            ports: PortTable::new(config.port_capacity),
        }
    }

    pub fn open_ports(&self) -> Vec<String> {
        self.ports.names()
    }

    /// Run `op` on the port, closing it if the device turned out to be gone.
    fn on_port<T>(&self, name: &str, op: impl FnOnce(&mut UsbPort) -> Result<T>) -> Result<T> {
        let slot = self.ports.slot(name)?;
        let result = with_slot(&slot, name, op);
        if let Err(StarIoError::NotOpen(_)) = &result {
            if self.ports.remove_slot(name, &slot) {
                warn!(port = name, "USB device removed, port closed");
            }
        }
        result
    }
}

impl Transport for UsbTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn matches(&self, name: &str) -> bool {
        name.starts_with(PORT_PREFIX)
    }

    fn open(&self, name: &str, _settings: &str) -> Result<()> {
        if self.ports.contains(name) {
            return Ok(());
        }
        self.ports.ensure_room(name)?;

        let target: UsbTarget = name.parse()?;
        let link = self.connector.connect(&target)?;
        self.ports.insert(name, UsbPort::new(name, link))?;
        info!(port = name, "USB port open");
        Ok(())
    }

    fn write(&self, name: &str, data: &[u8]) -> Result<usize> {
        self.on_port(name, |port| port.write(data))
    }

    fn read(&self, name: &str, buf: &mut [u8]) -> Result<usize> {
        self.on_port(name, |port| port.read(buf))
    }

    fn status(&self, name: &str) -> Result<StarPrinterStatus> {
        self.on_port(name, |port| port.status())
    }

    fn begin_checked_block(&self, name: &str) -> Result<()> {
        self.on_port(name, |port| checked_block::begin(port))
    }

    fn end_checked_block(&self, name: &str) -> Result<StarPrinterStatus> {
        self.on_port(name, |port| checked_block::end(port))
    }

    fn hard_reset(&self, name: &str) -> Result<()> {
        self.on_port(name, |port| port.hard_reset())
    }

    fn visual_card(
        &self,
        name: &str,
        request: &VisualCardCommand,
        timeout: Duration,
    ) -> Result<VisualCardCommand> {
        self.on_port(name, |port| visual_card::execute(port, request, timeout))
    }

    fn close(&self, name: &str) -> Result<()> {
        if self.ports.remove(name).is_some() {
            info!(port = name, "USB port closed");
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
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_parse_model_only() {
        let target: UsbTarget = "usb:TSP700".parse().unwrap();
        assert_eq!(
            target,
            UsbTarget {
                model: "TSP700".to_string(),
                serial: None
            }
        );
        assert_eq!(target.to_string(), "usb:TSP700");
    }

    #[test]
    fn test_parse_model_and_serial() {
        let target: UsbTarget = "usb:TSP700;sn:12345678".parse().unwrap();
        assert_eq!(target.model, "TSP700");
        assert_eq!(target.serial.as_deref(), Some("12345678"));
        assert_eq!(target.to_string(), "usb:TSP700;sn:12345678");
    }

    #[test]
    fn test_parse_rejects_other_names() {
        assert!("/dev/ttyS0".parse::<UsbTarget>().unwrap_err().is_not_open());
    }

    #[test]
    fn test_device_id_match_skips_length_prefix() {
        let mut reply = vec![0x00, 0x2A];
        reply.extend_from_slice(b"MFG:Star;CMD:STAR;MDL:TSP743II (STR_T-001);");
        assert!(device_id_matches(&reply, "TSP743"));
        assert!(!device_id_matches(&reply, "TUP900"));
        // Model text sitting in the prefix bytes does not count
        assert!(!device_id_matches(b"TS", "TS"));
    }

    #[test]
    fn test_device_id_stops_at_nul() {
        let reply = b"\x00\x10MDL:TSP100\x00TUP900";
        assert!(device_id_matches(reply, "TSP100"));
        assert!(!device_id_matches(reply, "TUP900"));
    }

    #[test]
    fn test_decode_serial_descriptor() {
        let mut raw = vec![18, DT_STRING];
        for c in "A1B2C3D4".bytes() {
            raw.extend_from_slice(&[c, 0]);
        }
        assert_eq!(decode_serial_descriptor(&raw).as_deref(), Some("A1B2C3D4"));

        raw[5] = 0x30;
        assert_eq!(decode_serial_descriptor(&raw).as_deref(), Some("A?B2C3D4"));
    }

    #[test]
    fn test_decode_serial_descriptor_rejects_other_lengths() {
        assert_eq!(decode_serial_descriptor(&[10, DT_STRING, b'A', 0]), None);
        let mut raw = vec![18, 0x02];
        raw.extend_from_slice(&[b'A', 0].repeat(8));
        assert_eq!(decode_serial_descriptor(&raw), None);
    }

    #[derive(Default)]
    struct LinkState {
        incoming: VecDeque<u8>,
        written: Vec<u8>,
        chunk_sizes: Vec<usize>,
        accept_per_write: Option<usize>,
        gone: bool,
        clear_halts: usize,
        signals: u8,
        resets: usize,
        transfers: usize,
    }

    struct FakeLink(Arc<Mutex<LinkState>>);

    impl UsbLink for FakeLink {
        fn bulk_write(&mut self, data: &[u8]) -> UsbResult<usize> {
            let mut state = self.0.lock().unwrap();
            state.transfers += 1;
            if state.gone {
                return Err(UsbFault::NoDevice);
            }
            let accepted = state.accept_per_write.map_or(data.len(), |n| n.min(data.len()));
            state.chunk_sizes.push(data.len());
            state.written.extend_from_slice(&data[..accepted]);
            Ok(accepted)
        }

        fn bulk_read(&mut self, buf: &mut [u8]) -> UsbResult<usize> {
            let mut state = self.0.lock().unwrap();
            state.transfers += 1;
            let count = buf.len().min(state.incoming.len());
            for slot in buf.iter_mut().take(count) {
                *slot = state.incoming.pop_front().unwrap();
            }
            Ok(count)
        }

        fn control_in(&mut self, request: u8, value: u16, buf: &mut [u8]) -> UsbResult<usize> {
            let mut state = self.0.lock().unwrap();
            state.transfers += 1;
            if state.gone {
                return Err(UsbFault::NoDevice);
            }
            match request {
                REQUEST_BYTES_AVAILABLE => {
                    let ready = state.incoming.len().min(value as usize) as u16;
                    buf[..2].copy_from_slice(&ready.to_le_bytes());
                    Ok(2)
                }
                REQUEST_PORT_SIGNALS => {
                    buf[0] = state.signals;
                    Ok(1)
                }
                _ => Err(UsbFault::Other("unsupported request".into())),
            }
        }

        fn control_out(&mut self, request: u8) -> UsbResult<()> {
            let mut state = self.0.lock().unwrap();
            state.transfers += 1;
            if state.gone {
                return Err(UsbFault::NoDevice);
            }
            if request == REQUEST_RESET {
                state.resets += 1;
            }
            Ok(())
        }

        fn clear_halt_out(&mut self) -> UsbResult<()> {
            let mut state = self.0.lock().unwrap();
            state.clear_halts += 1;
            Ok(())
        }
    }

    struct FakeConnector(Arc<Mutex<LinkState>>);

    impl UsbConnector for FakeConnector {
        fn connect(&self, target: &UsbTarget) -> Result<Box<dyn UsbLink>> {
            if target.model != "TSP700" {
                return Err(StarIoError::NotOpen(format!("no match for {}", target)));
            }
            Ok(Box::new(FakeLink(self.0.clone())))
        }
    }

    const PORT: &str = "usb:TSP700";

    fn backend() -> (UsbTransport, Arc<Mutex<LinkState>>) {
        let state = Arc::new(Mutex::new(LinkState::default()));
        let transport = UsbTransport::with_connector(&IoConfig::DEFAULT, FakeConnector(state.clone()));
        transport.open(PORT, "").unwrap();
        (transport, state)
    }

    #[test]
    fn test_open_unknown_model() {
        let (transport, _) = backend();
        assert!(transport.open("usb:TUP900", "").unwrap_err().is_not_open());
    }

    #[test]
    fn test_write_chunks_at_4096() {
        let (transport, state) = backend();
        let data = vec![0x55; 10_000];
        assert_eq!(transport.write(PORT, &data).unwrap(), 10_000);
        assert_eq!(state.lock().unwrap().chunk_sizes, vec![4096, 4096, 1808]);
    }

    #[test]
    fn test_short_write_clears_halt() {
        let (transport, state) = backend();
        state.lock().unwrap().accept_per_write = Some(1000);
        assert_eq!(transport.write(PORT, &vec![0; 5000]).unwrap(), 1000);
        assert_eq!(state.lock().unwrap().clear_halts, 1);
    }

    #[test]
    fn test_read_limited_to_available() {
        let (transport, state) = backend();
        state.lock().unwrap().incoming.extend([1, 2, 3]);
        let mut buf = [0u8; 2];
        assert_eq!(transport.read(PORT, &mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
    }

    #[test]
    fn test_read_nothing_available() {
        let (transport, _) = backend();
        let mut buf = [0u8; 16];
        assert_eq!(transport.read(PORT, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_status_from_bulk_read() {
        let (transport, state) = backend();
        state
            .lock()
            .unwrap()
            .incoming
            .extend([0x23, 0, 0x20, 0, 0, 0x08, 0, 0, 0x0E]);
        let status = transport.status(PORT).unwrap();
        assert!(status.cover_open);
        assert!(status.paper_empty);
        assert_eq!(status.presenter_state, Some(7));
    }

    #[test]
    fn test_device_removed_closes_port() {
        let (transport, state) = backend();
        state.lock().unwrap().gone = true;

        assert!(transport.write(PORT, b"data").unwrap_err().is_not_open());
        assert!(transport.open_ports().is_empty());

        let before = state.lock().unwrap().transfers;
        assert!(transport.status(PORT).unwrap_err().is_not_open());
        assert_eq!(state.lock().unwrap().transfers, before);
    }

    #[test]
    fn test_device_removed_spares_reopened_port() {
        let (transport, _) = backend();

        // The port is closed and reopened while the failing call still runs
        let err = transport
            .on_port(PORT, |_port| -> Result<()> {
                transport.close(PORT)?;
                transport.open(PORT, "")?;
                Err(StarIoError::NotOpen(format!("{}: device removed", PORT)))
            })
            .unwrap_err();

        assert!(err.is_not_open());
        assert_eq!(transport.open_ports(), vec![PORT.to_string()]);
    }

    #[test]
    fn test_checked_block_probe_uses_port_signals() {
        let (transport, state) = backend();
        state
            .lock()
            .unwrap()
            .incoming
            .extend([0x23, 0, 0, 0, 0, 0, 0, 0, 0]);
        transport.begin_checked_block(PORT).unwrap();

        // No status arrives, signals report offline
        state.lock().unwrap().signals = 0;
        let status = transport.end_checked_block(PORT).unwrap();
        assert!(status.offline);
        assert_eq!(state.lock().unwrap().resets, 1);
        assert_eq!(state.lock().unwrap().written, vec![crate::protocol::ETB]);
    }

    #[test]
    fn test_hard_reset_request() {
        let (transport, state) = backend();
        transport.hard_reset(PORT).unwrap();
        assert_eq!(state.lock().unwrap().resets, 1);
    }
}
