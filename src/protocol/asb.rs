//! # Automatic Status Back (ASB)
//!
//! Star printers report their state as a variable-length binary block of
//! 7 to 63 bytes. Byte 0 is a header encoding the block length, byte 1 the
//! firmware version, and bytes 2.. carry condition bits.
//!
//! ## Bit Layout
//!
//! | Byte | Mask | Field |
//! |------|------|-------|
//! | 2 | 0x20 | cover open |
//! | 2 | 0x08 | offline |
//! | 2 | 0x04 | compulsion switch |
//! | 3 | 0x40 | over temperature |
//! | 3 | 0x20 | unrecoverable error |
//! | 3 | 0x08 | cutter error |
//! | 3 | 0x04 | mechanical error |
//! | 4 | 0x20 | page mode command error |
//! | 4 | 0x08 | paper size error |
//! | 4 | 0x04 | presenter paper jam |
//! | 4 | 0x02 | head up error |
//! | 5 | 0x20 | black mark detected |
//! | 5 | 0x08 | paper empty |
//! | 5 | 0x04 | paper near empty (inner) |
//! | 5 | 0x02 | paper near empty (outer) |
//! | 6 | 0x02 | stacker full |
//! | 7 | 0x6E | ETB counter (5 bits, blocks of 9+ bytes) |
//! | 8 | 0x0E | presenter state (3 bits, blocks of 9+ bytes) |
//!
//! Decoding is driven by the tables below and one generic routine, so the
//! layout can be checked against the printer manual line by line.

use serde::Serialize;

use crate::error::{Result, StarIoError};

/// Shortest block any Star printer sends
pub const MIN_BLOCK_LEN: usize = 7;

/// Longest block the ASB header can describe
pub const MAX_BLOCK_LEN: usize = 63;

/// Blocks at least this long carry the ETB counter and presenter state
pub const ETB_BLOCK_LEN: usize = 9;

/// Number of distinct ETB counter values (the counter wraps at 32)
pub const ETB_COUNTER_MODULUS: u8 = 32;

/// # Printer Status
///
/// One decoded status block. Built fresh by every status read and never
/// modified afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StarPrinterStatus {
    pub cover_open: bool,
    pub offline: bool,
    pub compulsion_switch: bool,
    pub over_temp: bool,
    pub unrecoverable_error: bool,
    pub cutter_error: bool,
    pub mech_error: bool,
    pub page_mode_cmd_error: bool,
    pub paper_size_error: bool,
    pub presenter_paper_jam_error: bool,
    pub head_up_error: bool,
    pub black_mark_detect_status: bool,
    pub paper_empty: bool,
    pub paper_near_empty_inner: bool,
    pub paper_near_empty_outer: bool,
    pub stacker_full: bool,

    /// True when the block was long enough to carry the ETB counter
    pub etb_available: bool,

    /// ETB counter, 0..=31. `None` for blocks shorter than 9 bytes.
    pub etb_counter: Option<u8>,

    /// Presenter state, 0..=7. `None` for blocks shorter than 9 bytes.
    pub presenter_state: Option<u8>,

    /// The bytes this status was decoded from
    pub raw: Vec<u8>,
}

// ============================================================================
// BIT TABLES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flag {
    CoverOpen,
    Offline,
    CompulsionSwitch,
    OverTemp,
    UnrecoverableError,
    CutterError,
    MechError,
    PageModeCmdError,
    PaperSizeError,
    PresenterPaperJamError,
    HeadUpError,
    BlackMarkDetectStatus,
    PaperEmpty,
    PaperNearEmptyInner,
    PaperNearEmptyOuter,
    StackerFull,
}

impl Flag {
    fn slot(self, status: &mut StarPrinterStatus) -> &mut bool {
        match self {
            Flag::CoverOpen => &mut status.cover_open,
            Flag::Offline => &mut status.offline,
            Flag::CompulsionSwitch => &mut status.compulsion_switch,
            Flag::OverTemp => &mut status.over_temp,
            Flag::UnrecoverableError => &mut status.unrecoverable_error,
            Flag::CutterError => &mut status.cutter_error,
            Flag::MechError => &mut status.mech_error,
            Flag::PageModeCmdError => &mut status.page_mode_cmd_error,
            Flag::PaperSizeError => &mut status.paper_size_error,
            Flag::PresenterPaperJamError => &mut status.presenter_paper_jam_error,
            Flag::HeadUpError => &mut status.head_up_error,
            Flag::BlackMarkDetectStatus => &mut status.black_mark_detect_status,
            Flag::PaperEmpty => &mut status.paper_empty,
            Flag::PaperNearEmptyInner => &mut status.paper_near_empty_inner,
            Flag::PaperNearEmptyOuter => &mut status.paper_near_empty_outer,
            Flag::StackerFull => &mut status.stacker_full,
        }
    }

    fn get(self, status: &StarPrinterStatus) -> bool {
        match self {
            Flag::CoverOpen => status.cover_open,
            Flag::Offline => status.offline,
            Flag::CompulsionSwitch => status.compulsion_switch,
            Flag::OverTemp => status.over_temp,
            Flag::UnrecoverableError => status.unrecoverable_error,
            Flag::CutterError => status.cutter_error,
            Flag::MechError => status.mech_error,
            Flag::PageModeCmdError => status.page_mode_cmd_error,
            Flag::PaperSizeError => status.paper_size_error,
            Flag::PresenterPaperJamError => status.presenter_paper_jam_error,
            Flag::HeadUpError => status.head_up_error,
            Flag::BlackMarkDetectStatus => status.black_mark_detect_status,
            Flag::PaperEmpty => status.paper_empty,
            Flag::PaperNearEmptyInner => status.paper_near_empty_inner,
            Flag::PaperNearEmptyOuter => status.paper_near_empty_outer,
            Flag::StackerFull => status.stacker_full,
        }
    }
}

/// One boolean condition: `raw[byte] & mask != 0`
struct FlagBit {
    byte: usize,
    mask: u8,
    flag: Flag,
    name: &'static str,
}

const fn bit(byte: usize, mask: u8, flag: Flag, name: &'static str) -> FlagBit {
    FlagBit {
        byte,
        mask,
        flag,
        name,
    }
}

const FLAG_BITS: [FlagBit; 16] = [
    bit(2, 0x20, Flag::CoverOpen, "cover open"),
    bit(2, 0x08, Flag::Offline, "offline"),
    bit(2, 0x04, Flag::CompulsionSwitch, "compulsion switch"),
    bit(3, 0x40, Flag::OverTemp, "over temperature"),
    bit(3, 0x20, Flag::UnrecoverableError, "unrecoverable error"),
    bit(3, 0x08, Flag::CutterError, "cutter error"),
    bit(3, 0x04, Flag::MechError, "mechanical error"),
    bit(4, 0x20, Flag::PageModeCmdError, "page mode command error"),
    bit(4, 0x08, Flag::PaperSizeError, "paper size error"),
    bit(4, 0x04, Flag::PresenterPaperJamError, "presenter paper jam"),
    bit(4, 0x02, Flag::HeadUpError, "head up error"),
    bit(5, 0x20, Flag::BlackMarkDetectStatus, "black mark detected"),
    bit(5, 0x08, Flag::PaperEmpty, "paper empty"),
    bit(5, 0x04, Flag::PaperNearEmptyInner, "paper near empty (inner)"),
    bit(5, 0x02, Flag::PaperNearEmptyOuter, "paper near empty (outer)"),
    bit(6, 0x02, Flag::StackerFull, "stacker full"),
];

/// A small integer scattered over non-contiguous bits of one byte.
///
/// Each `(mask, shift)` pair contributes `(raw[byte] & mask) >> shift`.
struct BitField {
    byte: usize,
    parts: &'static [(u8, u8)],
}

/// 5-bit counter in byte 7: bits 6,5 land at 4,3 and bits 3,2,1 at 2,1,0
const ETB_COUNTER: BitField = BitField {
    byte: 7,
    parts: &[(0x40, 2), (0x20, 2), (0x08, 1), (0x04, 1), (0x02, 1)],
};

/// 3-bit state in byte 8: bits 3,2,1 land at 2,1,0
const PRESENTER_STATE: BitField = BitField {
    byte: 8,
    parts: &[(0x08, 1), (0x04, 1), (0x02, 1)],
};

impl BitField {
    fn extract(&self, raw: &[u8]) -> u8 {
        let value = raw[self.byte];
        self.parts
            .iter()
            .fold(0, |acc, &(mask, shift)| acc | ((value & mask) >> shift))
    }
}

// ============================================================================
// DECODING
// ============================================================================

/// # Decode a Status Block
///
/// Pure and total for inputs of at least [`MIN_BLOCK_LEN`] bytes. Shorter
/// input is an `IoFail`, never a partial record.
///
/// ## Example
///
/// ```
/// use stario::protocol::asb;
///
/// let status = asb::decode(&[0x23, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]).unwrap();
/// assert!(status.offline);
/// assert_eq!(status.etb_counter, Some(0));
/// ```
pub fn decode(raw: &[u8]) -> Result<StarPrinterStatus> {
    if raw.len() < MIN_BLOCK_LEN {
        return Err(StarIoError::IoFail(format!(
            "status block too short: {} bytes",
            raw.len()
        )));
    }

    let mut status = StarPrinterStatus {
        raw: raw.to_vec(),
        ..Default::default()
    };

    for entry in FLAG_BITS.iter() {
        *entry.flag.slot(&mut status) = raw[entry.byte] & entry.mask != 0;
    }

    if raw.len() >= ETB_BLOCK_LEN {
        status.etb_available = true;
        status.etb_counter = Some(ETB_COUNTER.extract(raw));
        status.presenter_state = Some(PRESENTER_STATE.extract(raw));
    }

    Ok(status)
}

/// Full block length announced by an ASB header byte.
///
/// The header spreads the length over bit 5 (adds 8) and bits 3..1, with
/// bit 0 always set and bits 4, 6 and 7 clear: 0x0F → 7, 0x21 → 8, 0x23 → 9,
/// up to 0x2F → 15. Anything else is not a header.
pub fn block_length(header: u8) -> Option<usize> {
    if header & 0xD1 != 0x01 {
        return None;
    }

    let len = (((header >> 2) & 0x08) | ((header >> 1) & 0x07)) as usize;
    if len < MIN_BLOCK_LEN { None } else { Some(len) }
}

impl StarPrinterStatus {
    /// Record standing in for a status the device could not deliver, with
    /// only the offline flag set.
    pub fn offline_marker() -> Self {
        Self {
            offline: true,
            ..Default::default()
        }
    }

    /// Record carrying only a probed online/offline line state.
    pub fn from_probe(offline: bool) -> Self {
        Self {
            offline,
            ..Default::default()
        }
    }

    pub fn is_online(&self) -> bool {
        !self.offline
    }

    /// Human-readable names of every condition bit that is set.
    pub fn active_conditions(&self) -> Vec<&'static str> {
        FLAG_BITS
            .iter()
            .filter(|entry| entry.flag.get(self))
            .map(|entry| entry.name)
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
