//! # Checked Block Protocol
//!
//! Confirms that everything written between `begin` and `end` actually
//! printed, using the ETB counter carried in 9+ byte status blocks.
//!
//! ## Sequence
//!
//! ```text
//! begin:  read status ──► cache it (needs an ETB counter)
//!   ... application writes print data ...
//! end:    write ETB ──► printer bumps its counter once all prior data printed
//!         poll status every 200ms
//!           counter == cached + 1 (mod 32) ──► done, printed
//!           offline                        ──► hardware reset, report status
//! ```
//!
//! The polling loop has no timeout of its own. It ends when the counter
//! advances, when the printer reports (or is probed as) offline, or when the
//! device disappears.
//!
//! Each backend supplies its own offline probe for the case where a status
//! read fails outright: a modem line on serial, the status register on
//! parallel, a vendor control request on USB.

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Result, StarIoError};
use crate::protocol::ETB;
use crate::protocol::asb::{ETB_COUNTER_MODULUS, StarPrinterStatus};

/// Delay between status polls while waiting for the ETB counter
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// An open port that can take part in a checked block.
pub trait CheckedBlockDevice {
    /// Write raw bytes, returning how many were accepted.
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize>;

    /// Fetch and decode one status block.
    fn read_status(&mut self) -> Result<StarPrinterStatus>;

    /// Cheap line check used when a status read fails. `true` means offline.
    fn probe_offline(&mut self) -> Result<bool>;

    /// Pulse the device's hardware reset.
    fn hard_reset(&mut self) -> Result<()>;

    /// Status captured by the last `begin`.
    fn status_cache(&self) -> Option<&StarPrinterStatus>;

    fn set_status_cache(&mut self, status: StarPrinterStatus);
}

/// # Begin a Checked Block
///
/// Caches the current status. Fails with `NotAvailable` when the firmware's
/// status block carries no ETB counter.
pub fn begin<D: CheckedBlockDevice + ?Sized>(device: &mut D) -> Result<()> {
    let status = device.read_status()?;
    let supported = status.etb_available;
    debug!(etb_counter = ?status.etb_counter, "checked block begin");
    device.set_status_cache(status);

    if !supported {
        return Err(StarIoError::NotAvailable(
            "printer status has no ETB counter".to_string(),
        ));
    }

    Ok(())
}

/// # End a Checked Block
///
/// Returns the last status seen. `status.offline == false` means the block
/// printed; `true` means the printer went offline and has been hardware
/// reset. Errors only when the block was never begun (`NotAvailable`), the
/// device vanished (`NotOpen`), or the reset itself failed.
pub fn end<D: CheckedBlockDevice + ?Sized>(device: &mut D) -> Result<StarPrinterStatus> {
    let cached = device
        .status_cache()
        .filter(|status| status.etb_available)
        .and_then(|status| status.etb_counter)
        .ok_or_else(|| {
            StarIoError::NotAvailable("no checked block in progress".to_string())
        })?;

    let expected = (cached + 1) % ETB_COUNTER_MODULUS;
    let mut status = StarPrinterStatus::offline_marker();

    match device.write_bytes(&[ETB]) {
        Ok(1) => status = await_counter(device, expected)?,
        Ok(_) => warn!("printer did not accept ETB"),
        Err(e) if e.is_not_open() => return Err(e),
        Err(e) => warn!(error = %e, "ETB write failed"),
    }

    if status.offline {
        warn!("printer offline during checked block, hardware resetting");
        device.hard_reset()?;
    }

    Ok(status)
}

/// Poll until the counter reaches `expected` or the printer is offline.
fn await_counter<D: CheckedBlockDevice + ?Sized>(
    device: &mut D,
    expected: u8,
) -> Result<StarPrinterStatus> {
    loop {
        let status = match device.read_status() {
            Ok(status) => status,
            Err(StarIoError::IoFail(reason)) => {
                debug!(%reason, "status read failed, probing line state");
                match device.probe_offline() {
                    Ok(offline) => StarPrinterStatus::from_probe(offline),
                    Err(e) if e.is_not_open() => return Err(e),
                    Err(e) => {
                        warn!(error = %e, "offline probe failed, treating as offline");
                        StarPrinterStatus::offline_marker()
                    }
                }
            }
            Err(e) => return Err(e),
        };

        if status.offline || status.etb_counter == Some(expected) {
            return Ok(status);
        }

        thread::sleep(POLL_INTERVAL);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn status_with_counter(counter: u8, offline: bool) -> StarPrinterStatus {
        let mut raw = vec![0x23, 0, 0, 0, 0, 0, 0, 0, 0];
        if offline {
            raw[2] = 0x08;
        }
        raw[7] = ((counter & 0x18) << 2) | ((counter & 0x07) << 1);
        crate::protocol::asb::decode(&raw).unwrap()
    }

    #[derive(Default)]
    struct FakeDevice {
        statuses: VecDeque<Result<StarPrinterStatus>>,
        probes: VecDeque<Result<bool>>,
        write_result: Option<Result<usize>>,
        written: Vec<u8>,
        resets: usize,
        cache: Option<StarPrinterStatus>,
    }

    impl CheckedBlockDevice for FakeDevice {
        fn write_bytes(&mut self, data: &[u8]) -> Result<usize> {
            self.written.extend_from_slice(data);
            self.write_result.clone().unwrap_or(Ok(data.len()))
        }

        fn read_status(&mut self) -> Result<StarPrinterStatus> {
            self.statuses
                .pop_front()
                .unwrap_or_else(|| Err(StarIoError::IoFail("script exhausted".into())))
        }

        fn probe_offline(&mut self) -> Result<bool> {
            self.probes.pop_front().unwrap_or(Ok(true))
        }

        fn hard_reset(&mut self) -> Result<()> {
            self.resets += 1;
            Ok(())
        }

        fn status_cache(&self) -> Option<&StarPrinterStatus> {
            self.cache.as_ref()
        }

        fn set_status_cache(&mut self, status: StarPrinterStatus) {
            self.cache = Some(status);
        }
    }

    #[test]
    fn test_counter_encoding_helper() {
        for counter in 0..32 {
            assert_eq!(status_with_counter(counter, false).etb_counter, Some(counter));
        }
    }

    #[test]
    fn test_begin_caches_status() {
        let mut device = FakeDevice::default();
        device.statuses.push_back(Ok(status_with_counter(5, false)));
        begin(&mut device).unwrap();
        assert_eq!(device.cache.unwrap().etb_counter, Some(5));
    }

    #[test]
    fn test_begin_without_etb_counter() {
        let mut device = FakeDevice::default();
        let short = crate::protocol::asb::decode(&[0x0F, 0, 0, 0, 0, 0, 0]).unwrap();
        device.statuses.push_back(Ok(short));
        let err = begin(&mut device).unwrap_err();
        assert!(matches!(err, StarIoError::NotAvailable(_)));
    }

    #[test]
    fn test_end_without_begin() {
        let mut device = FakeDevice::default();
        let err = end(&mut device).unwrap_err();
        assert!(matches!(err, StarIoError::NotAvailable(_)));
        assert!(device.written.is_empty());
    }

    #[test]
    fn test_end_success_after_poll() {
        let mut device = FakeDevice::default();
        device.cache = Some(status_with_counter(3, false));
        device.statuses.push_back(Ok(status_with_counter(3, false)));
        device.statuses.push_back(Ok(status_with_counter(4, false)));

        let status = end(&mut device).unwrap();
        assert!(!status.offline);
        assert_eq!(status.etb_counter, Some(4));
        assert_eq!(device.written, vec![ETB]);
        assert_eq!(device.resets, 0);
    }

    #[test]
    fn test_end_counter_wraps() {
        let mut device = FakeDevice::default();
        device.cache = Some(status_with_counter(31, false));
        device.statuses.push_back(Ok(status_with_counter(0, false)));

        let status = end(&mut device).unwrap();
        assert_eq!(status.etb_counter, Some(0));
        assert_eq!(device.resets, 0);
    }

    #[test]
    fn test_end_offline_resets() {
        let mut device = FakeDevice::default();
        device.cache = Some(status_with_counter(3, false));
        device.statuses.push_back(Ok(status_with_counter(3, true)));

        let status = end(&mut device).unwrap();
        assert!(status.offline);
        assert_eq!(device.resets, 1);
    }

    #[test]
    fn test_end_probe_fallback_offline() {
        let mut device = FakeDevice::default();
        device.cache = Some(status_with_counter(3, false));
        device.statuses.push_back(Err(StarIoError::IoFail("short".into())));
        device.probes.push_back(Ok(true));

        let status = end(&mut device).unwrap();
        assert!(status.offline);
        assert_eq!(device.resets, 1);
    }

    #[test]
    fn test_end_probe_online_keeps_polling() {
        let mut device = FakeDevice::default();
        device.cache = Some(status_with_counter(9, false));
        device.statuses.push_back(Err(StarIoError::IoFail("short".into())));
        device.probes.push_back(Ok(false));
        device.statuses.push_back(Ok(status_with_counter(10, false)));

        let status = end(&mut device).unwrap();
        assert!(!status.offline);
        assert_eq!(status.etb_counter, Some(10));
    }

    #[test]
    fn test_end_probe_failure_counts_as_offline() {
        let mut device = FakeDevice::default();
        device.cache = Some(status_with_counter(1, false));
        device.statuses.push_back(Err(StarIoError::IoFail("short".into())));
        device.probes.push_back(Err(StarIoError::IoFail("ioctl".into())));

        let status = end(&mut device).unwrap();
        assert!(status.offline);
        assert_eq!(device.resets, 1);
    }

    #[test]
    fn test_end_write_failure_goes_to_reset() {
        let mut device = FakeDevice::default();
        device.cache = Some(status_with_counter(1, false));
        device.write_result = Some(Err(StarIoError::IoFail("write".into())));

        let status = end(&mut device).unwrap();
        assert!(status.offline);
        assert_eq!(device.resets, 1);
    }

    #[test]
    fn test_end_device_removed() {
        let mut device = FakeDevice::default();
        device.cache = Some(status_with_counter(1, false));
        device.statuses.push_back(Err(StarIoError::NotOpen("usb:TSP700".into())));

        let err = end(&mut device).unwrap_err();
        assert!(err.is_not_open());
        assert_eq!(device.resets, 0);
    }

    #[test]
    fn test_repeated_end_with_dead_device_always_resets() {
        let mut device = FakeDevice::default();
        device.cache = Some(status_with_counter(7, false));

        for round in 1..=3 {
            let status = end(&mut device).unwrap();
            assert!(status.offline);
            assert_eq!(device.resets, round);
        }
    }
}
