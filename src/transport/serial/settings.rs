//! # Serial Port Settings
//!
//! Parses the comma-separated settings string handed to `open`:
//!
//! ```text
//! <baud>,<parity>,<data bits>,<stop bits>,<flow control>
//! 9600,none,8,1,none
//! ```
//!
//! | Field | Accepted values |
//! |-------|-----------------|
//! | baud | 2400, 4800, 9600, 19200, 38400 |
//! | parity | none, even, odd |
//! | data bits | 7, 8 |
//! | stop bits | 1, 2 |
//! | flow control | none, hdwr |
//!
//! Any other value, a missing field or an extra field fails with
//! `NotAvailable`.

use std::fmt;
use std::str::FromStr;

use crate::error::StarIoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaudRate {
    B2400,
    B4800,
    B9600,
    B19200,
    B38400,
}

impl BaudRate {
    pub fn bits_per_second(self) -> u32 {
        match self {
            BaudRate::B2400 => 2400,
            BaudRate::B4800 => 4800,
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B38400 => 38400,
        }
    }

    fn from_bits_per_second(value: u32) -> Option<Self> {
        match value {
            2400 => Some(BaudRate::B2400),
            4800 => Some(BaudRate::B4800),
            9600 => Some(BaudRate::B9600),
            19200 => Some(BaudRate::B19200),
            38400 => Some(BaudRate::B38400),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Seven,
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    /// Wait for DSR before each 256-byte chunk
    Hardware,
}

/// Parsed line settings for one serial port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud: BaudRate,
    pub parity: Parity,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl SerialSettings {
    pub const DEFAULT: Self = Self {
        baud: BaudRate::B9600,
        parity: Parity::None,
        data_bits: DataBits::Eight,
        stop_bits: StopBits::One,
        flow_control: FlowControl::None,
    };

    pub fn hardware_flow(&self) -> bool {
        self.flow_control == FlowControl::Hardware
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn invalid(field: &str, value: &str) -> StarIoError {
    StarIoError::NotAvailable(format!("invalid serial {}: {:?}", field, value))
}

impl FromStr for SerialSettings {
    type Err = StarIoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(',').map(str::trim).collect();
        let [baud, parity, data_bits, stop_bits, flow_control] = fields.as_slice() else {
            return Err(StarIoError::NotAvailable(format!(
                "serial settings need 5 comma-separated fields, got {:?}",
                s
            )));
        };

        let baud = baud
            .parse::<u32>()
            .ok()
            .and_then(BaudRate::from_bits_per_second)
            .ok_or_else(|| invalid("baud rate", baud))?;

        let parity = match *parity {
            "none" => Parity::None,
            "even" => Parity::Even,
            "odd" => Parity::Odd,
            other => return Err(invalid("parity", other)),
        };

        let data_bits = match *data_bits {
            "7" => DataBits::Seven,
            "8" => DataBits::Eight,
            other => return Err(invalid("data bits", other)),
        };

        let stop_bits = match *stop_bits {
            "1" => StopBits::One,
            "2" => StopBits::Two,
            other => return Err(invalid("stop bits", other)),
        };

        let flow_control = match *flow_control {
            "none" => FlowControl::None,
            "hdwr" => FlowControl::Hardware,
            other => return Err(invalid("flow control", other)),
        };

        Ok(Self {
            baud,
            parity,
            data_bits,
            stop_bits,
            flow_control,
        })
    }
}

impl fmt::Display for SerialSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => "none",
            Parity::Even => "even",
            Parity::Odd => "odd",
        };
        let data_bits = match self.data_bits {
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        };
        let stop_bits = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        let flow_control = match self.flow_control {
            FlowControl::None => "none",
            FlowControl::Hardware => "hdwr",
        };
        write!(
            f,
            "{},{},{},{},{}",
            self.baud.bits_per_second(),
            parity,
            data_bits,
            stop_bits,
            flow_control
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_default_string() {
        let settings: SerialSettings = "9600,none,8,1,none".parse().unwrap();
        assert_eq!(settings, SerialSettings::DEFAULT);
        assert!(!settings.hardware_flow());
    }

    #[test]
    fn test_parse_all_fields() {
        let settings: SerialSettings = "38400,odd,7,2,hdwr".parse().unwrap();
        assert_eq!(
            settings,
            SerialSettings {
                baud: BaudRate::B38400,
                parity: Parity::Odd,
                data_bits: DataBits::Seven,
                stop_bits: StopBits::Two,
                flow_control: FlowControl::Hardware,
            }
        );
        assert!(settings.hardware_flow());
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let settings: SerialSettings = " 19200 , even , 8 , 1 , none ".parse().unwrap();
        assert_eq!(settings.baud, BaudRate::B19200);
        assert_eq!(settings.parity, Parity::Even);
    }

    #[test]
    fn test_display_round_trip() {
        for text in ["2400,even,7,1,hdwr", "4800,none,8,2,none", "9600,odd,8,1,none"] {
            let settings: SerialSettings = text.parse().unwrap();
            assert_eq!(settings.to_string(), text);
        }
    }

    #[test]
    fn test_rejects_bad_values() {
        for text in [
            "",
            "9600",
            "9600,none,8,1",
            "9600,none,8,1,none,extra",
            "1200,none,8,1,none",
            "fast,none,8,1,none",
            "9600,mark,8,1,none",
            "9600,none,6,1,none",
            "9600,none,8,3,none",
            "9600,none,8,1,xon",
            "9600,NONE,8,1,none",
        ] {
            let err = text.parse::<SerialSettings>().unwrap_err();
            assert!(
                matches!(err, StarIoError::NotAvailable(_)),
                "{:?} should be rejected",
                text
            );
        }
    }
}
