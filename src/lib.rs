//! # Stario - Star Printer I/O Library
//!
//! Stario talks to Star Micronics receipt printers over USB, RS-232 serial
//! and IEEE-1284 parallel through one API keyed by port name. It provides:
//!
//! - **Uniform port API**: open, write, read, status, reset, close
//! - **Status decoding**: Automatic Status Back (ASB) blocks into typed flags
//! - **Checked blocks**: confirm a print job actually printed via the ETB counter
//! - **Visual Card commands**: framed request/response exchange with ACK/NAK
//!
//! ## Quick Start
//!
//! ```no_run
//! use stario::PortRegistry;
//!
//! let registry = PortRegistry::new();
//! let port = "usb:TSP700";
//! registry.open(port, "")?;
//!
//! registry.begin_checked_block(port)?;
//! registry.write(port, b"Hello, printer\n")?;
//! let status = registry.end_checked_block(port)?;
//!
//! if status.offline {
//!     eprintln!("printer went offline: {:?}", status.active_conditions());
//! }
//!
//! registry.close(port)?;
//! # Ok::<(), stario::StarIoError>(())
//! ```
//!
//! ## Module Overview
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`registry`] | Port-name dispatch, the public API |
//! | [`transport`] | USB, parallel and serial backends |
//! | [`protocol`] | ASB decoding, checked blocks, Visual Card framing |
//! | [`printer`] | Static I/O configuration |
//! | [`error`] | Error types |

pub mod error;
pub mod printer;
pub mod protocol;
pub mod registry;
pub mod transport;

// Re-exports for convenience
pub use error::{Result, StarIoError};
pub use printer::IoConfig;
pub use protocol::{StarPrinterStatus, VisualCardCommand};
pub use registry::PortRegistry;
pub use transport::{Transport, TransportKind};
