//! # Printer Module
//!
//! Static configuration for talking to Star printers.
//!
//! ## Modules
//!
//! - [`config`]: Port capacity, USB device IDs and transfer timeouts

pub mod config;

pub use config::IoConfig;
