//! # Star Printer I/O Protocols
//!
//! Printer-level protocols that sit on top of a transport backend's raw
//! read/write primitives.
//!
//! ## Module Structure
//!
//! - [`asb`]: Automatic Status Back block decoding
//! - [`checked_block`]: ETB-counter print confirmation handshake
//! - [`visual_card`]: STX/ETX framed command exchange for Visual Card devices
//!
//! ## Control Bytes
//!
//! | Name | Hex | Use |
//! |------|-----|-----|
//! | STX | 0x02 | Visual Card frame start |
//! | ETX | 0x03 | Visual Card frame end |
//! | ACK | 0x06 | Frame accepted |
//! | DLE | 0x10 | Command rejected |
//! | NAK | 0x15 | Frame corrupted, resend |
//! | ETB | 0x17 | Checked block marker, bumps the ETB counter |

pub mod asb;
pub mod checked_block;
pub mod visual_card;

pub use asb::StarPrinterStatus;
pub use visual_card::VisualCardCommand;

/// Start of text
pub const STX: u8 = 0x02;

/// End of text
pub const ETX: u8 = 0x03;

/// Acknowledge
pub const ACK: u8 = 0x06;

/// Data link escape, used by Visual Card devices to refuse a command
pub const DLE: u8 = 0x10;

/// Negative acknowledge
pub const NAK: u8 = 0x15;

/// End of transmission block
pub const ETB: u8 = 0x17;

/// ESC (Escape) - Command prefix byte
pub const ESC: u8 = 0x1B;

/// # Status Request (ESC ACK SOH)
///
/// Asks a serial-attached printer to send its ASB block. USB and parallel
/// printers return status on a plain read and never need this.
///
/// | Format | Bytes |
/// |--------|-------|
/// | ASCII  | ESC ACK SOH |
/// | Hex    | 1B 06 01 |
pub const STATUS_REQUEST: [u8; 3] = [ESC, ACK, 0x01];
