//! # I/O Configuration
//!
//! Fixed parameters shared by every transport backend: how many ports one
//! backend may hold open, which USB device IDs identify a Star printer, and
//! the OS-level timeouts applied to individual USB transfers.
//!
//! ## Defaults
//!
//! | Parameter | Value |
//! |-----------|-------|
//! | Port table capacity (per backend) | 20 |
//! | USB vendor ID | 0x0519 (Star Micronics) |
//! | USB product ID | 0x0002 (vendor-class printer) |
//! | USB control transfer timeout | 500 ms |
//! | USB bulk write timeout (per chunk) | 10 s |
//! | USB bulk read timeout | 200 ms |
//!
//! ## Usage
//!
//! ```
//! use stario::printer::IoConfig;
//!
//! let config = IoConfig {
//!     port_capacity: 4,
//!     ..IoConfig::DEFAULT
//! };
//! assert_eq!(config.usb_vendor_id, 0x0519);
//! ```

use std::time::Duration;

/// Star Micronics USB vendor ID
pub const STAR_VENDOR_ID: u16 = 0x0519;

/// Product ID reported by vendor-class Star printers
pub const VENDOR_CLASS_PRODUCT_ID: u16 = 0x0002;

/// # I/O Configuration
///
/// Handed to each backend when the registry is built. Timeouts here bound a
/// single OS call; the protocol-level budgets (checked block polling, Visual
/// Card handshakes) live with the protocols themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoConfig {
    /// Maximum concurrently open ports per backend
    pub port_capacity: usize,

    /// USB vendor ID to enumerate
    pub usb_vendor_id: u16,

    /// USB product ID to enumerate
    pub usb_product_id: u16,

    /// Timeout for USB control requests
    pub usb_control_timeout: Duration,

    /// Timeout for one bulk OUT chunk
    pub usb_bulk_write_timeout: Duration,

    /// Timeout for one bulk IN transfer
    pub usb_bulk_read_timeout: Duration,
}

impl IoConfig {
    /// Values matching the stock Star Linux driver.
    pub const DEFAULT: Self = Self {
        port_capacity: 20,
        usb_vendor_id: STAR_VENDOR_ID,
        usb_product_id: VENDOR_CLASS_PRODUCT_ID,
        usb_control_timeout: Duration::from_millis(500),
        usb_bulk_write_timeout: Duration::from_millis(10_000),
        usb_bulk_read_timeout: Duration::from_millis(200),
    };

    /// Same as [`IoConfig::DEFAULT`] with a different table capacity.
    pub fn with_capacity(port_capacity: usize) -> Self {
        Self {
            port_capacity,
            ..Self::DEFAULT
        }
    }
}

impl Default for IoConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = IoConfig::default();
        assert_eq!(config.port_capacity, 20);
        assert_eq!(config.usb_vendor_id, 0x0519);
        assert_eq!(config.usb_product_id, 0x0002);
        assert_eq!(config.usb_bulk_write_timeout, Duration::from_secs(10));
        assert_eq!(config.usb_bulk_read_timeout, Duration::from_millis(200));
    }

    #[test]
    fn test_with_capacity_keeps_usb_ids() {
        let config = IoConfig::with_capacity(3);
        assert_eq!(config.port_capacity, 3);
        assert_eq!(config.usb_vendor_id, STAR_VENDOR_ID);
    }
}
