//! # rusb Link
//!
//! [`UsbLink`] on top of `rusb` (libusb-1.0).
//!
//! ## Device Selection
//!
//! 1. Enumerate devices with the configured vendor and product ID
//! 2. Take the first interface alt-setting that has endpoints; it must offer
//!    both a bulk IN and a bulk OUT endpoint
//! 3. Open, detach any kernel driver, claim the interface
//! 4. Ask for the device ID and require the model name in it
//! 5. If a serial number was given, read the serial-number string
//!    descriptor and require an exact match
//!
//! The first device passing every step wins.

use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Direction, TransferType, UsbContext};
use tracing::{debug, warn};

use super::{
    REQUEST_DEVICE_ID, UsbConnector, UsbFault, UsbLink, UsbResult, UsbTarget,
    decode_serial_descriptor, device_id_matches,
};
use crate::error::{Result, StarIoError};
use crate::printer::IoConfig;

const VENDOR_IN: u8 = 0xC0;
const VENDOR_OUT: u8 = 0x40;
const STANDARD_IN: u8 = 0x80;
const GET_DESCRIPTOR: u8 = 0x06;
const DT_STRING: u16 = 0x03;

fn fault(err: rusb::Error) -> UsbFault {
    match err {
        rusb::Error::NoDevice => UsbFault::NoDevice,
        rusb::Error::Timeout => UsbFault::Timeout,
        other => UsbFault::Other(other.to_string()),
    }
}

/// Interface and bulk endpoint addresses of a candidate printer
#[derive(Debug, Clone, Copy)]
struct Endpoints {
    interface: u8,
    bulk_in: u8,
    bulk_out: u8,
}

fn find_endpoints(device: &Device<Context>, descriptor: &DeviceDescriptor) -> Option<Endpoints> {
    for index in 0..descriptor.num_configurations() {
        let Ok(config) = device.config_descriptor(index) else {
            continue;
        };

        for interface in config.interfaces() {
            for setting in interface.descriptors() {
                if setting.num_endpoints() == 0 {
                    continue;
                }

                let bulk = |direction: Direction| {
                    setting
                        .endpoint_descriptors()
                        .find(|ep| ep.transfer_type() == TransferType::Bulk && ep.direction() == direction)
                        .map(|ep| ep.address())
                };

                return Some(Endpoints {
                    interface: setting.interface_number(),
                    bulk_in: bulk(Direction::In)?,
                    bulk_out: bulk(Direction::Out)?,
                });
            }
        }
    }
    None
}

/// Finds Star printers on the host's USB buses.
#[derive(Debug, Clone, Copy)]
pub struct RusbConnector {
    config: IoConfig,
}

impl RusbConnector {
    pub fn new(config: IoConfig) -> Self {
        Self { config }
    }

    fn try_open(
        &self,
        device: &Device<Context>,
        descriptor: &DeviceDescriptor,
        endpoints: Endpoints,
        target: &UsbTarget,
    ) -> std::result::Result<RusbLink, String> {
        let mut handle = device.open().map_err(|e| format!("open failed: {}", e))?;

        if let Ok(true) = handle.kernel_driver_active(endpoints.interface) {
            if let Err(e) = handle.detach_kernel_driver(endpoints.interface) {
                warn!(error = %e, "could not detach kernel driver");
            }
        }

        handle
            .claim_interface(endpoints.interface)
            .map_err(|e| format!("claim failed: {}", e))?;

        let mut link = RusbLink {
            handle,
            endpoints,
            config: self.config,
        };

        let mut device_id = [0u8; 256];
        let len = link
            .control_in(REQUEST_DEVICE_ID, 0, &mut device_id)
            .map_err(|f| format!("device ID request failed: {}", f))?;
        if !device_id_matches(&device_id[..len], &target.model) {
            return Err(format!("device ID does not name {}", target.model));
        }

        if let Some(wanted) = &target.serial {
            let index = descriptor
                .serial_number_string_index()
                .ok_or_else(|| "no serial number descriptor".to_string())?;
            let found = link
                .serial_number(index)
                .map_err(|f| format!("serial number request failed: {}", f))?
                .ok_or_else(|| "malformed serial number descriptor".to_string())?;
            if &found != wanted {
                return Err(format!("serial number {} does not match", found));
            }
        }

        Ok(link)
    }
}

impl UsbConnector for RusbConnector {
    fn connect(&self, target: &UsbTarget) -> Result<Box<dyn UsbLink>> {
        let context = Context::new()
            .map_err(|e| StarIoError::NotOpen(format!("{}: libusb init failed: {}", target, e)))?;
        let devices = context
            .devices()
            .map_err(|e| StarIoError::NotOpen(format!("{}: enumeration failed: {}", target, e)))?;

        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if descriptor.vendor_id() != self.config.usb_vendor_id
                || descriptor.product_id() != self.config.usb_product_id
            {
                continue;
            }

            let Some(endpoints) = find_endpoints(&device, &descriptor) else {
                continue;
            };

            match self.try_open(&device, &descriptor, endpoints, target) {
                Ok(link) => return Ok(Box::new(link)),
                Err(reason) => {
                    debug!(bus = device.bus_number(), address = device.address(), %reason, "skipping device");
                }
            }
        }

        Err(StarIoError::NotOpen(format!("{}: no matching printer", target)))
    }
}

/// A claimed Star printer interface
pub struct RusbLink {
    handle: DeviceHandle<Context>,
    endpoints: Endpoints,
    config: IoConfig,
}

impl RusbLink {
    fn serial_number(&mut self, index: u8) -> UsbResult<Option<String>> {
        let mut raw = [0u8; 256];
        let len = self
            .handle
            .read_control(
                STANDARD_IN,
                GET_DESCRIPTOR,
                (DT_STRING << 8) | index as u16,
                0,
                &mut raw,
                self.config.usb_control_timeout,
            )
            .map_err(fault)?;
        Ok(decode_serial_descriptor(&raw[..len]))
    }
}

impl UsbLink for RusbLink {
    fn bulk_write(&mut self, data: &[u8]) -> UsbResult<usize> {
        self.handle
            .write_bulk(self.endpoints.bulk_out, data, self.config.usb_bulk_write_timeout)
            .map_err(fault)
    }

    fn bulk_read(&mut self, buf: &mut [u8]) -> UsbResult<usize> {
        self.handle
            .read_bulk(self.endpoints.bulk_in, buf, self.config.usb_bulk_read_timeout)
            .map_err(fault)
    }

    fn control_in(&mut self, request: u8, value: u16, buf: &mut [u8]) -> UsbResult<usize> {
        self.handle
            .read_control(VENDOR_IN, request, value, 0, buf, self.config.usb_control_timeout)
            .map_err(fault)
    }

    fn control_out(&mut self, request: u8) -> UsbResult<()> {
        self.handle
            .write_control(VENDOR_OUT, request, 0, 0, &[], self.config.usb_control_timeout)
            .map(|_| ())
            .map_err(fault)
    }

    fn clear_halt_out(&mut self) -> UsbResult<()> {
        self.handle.clear_halt(self.endpoints.bulk_out).map_err(fault)
    }
}

impl Drop for RusbLink {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.endpoints.interface) {
            debug!(error = %e, "release_interface failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fault_mapping() {
        assert_eq!(fault(rusb::Error::NoDevice), UsbFault::NoDevice);
        assert_eq!(fault(rusb::Error::Timeout), UsbFault::Timeout);
        assert!(matches!(fault(rusb::Error::Pipe), UsbFault::Other(_)));
    }

    #[test]
    fn test_timeouts_come_from_config() {
        let connector = RusbConnector::new(IoConfig::DEFAULT);
        assert_eq!(connector.config.usb_bulk_write_timeout, Duration::from_secs(10));
        assert_eq!(connector.config.usb_bulk_read_timeout, Duration::from_millis(200));
        assert_eq!(connector.config.usb_control_timeout, Duration::from_millis(500));
    }
}
