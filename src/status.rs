//! Status byte, valve status and syringe status decoding.
//!
//! A device answer carries a status byte laid out as `0b01R?EEEE`: bit 6 is
//! always set on a genuine answer, `R` (0x20) is the ready bit and the low
//! nibble is the error code. Valve and syringe status words come from the
//! `?20000` and `?10000` queries and decode additively.

use crate::codec::is_broadcast;
use crate::constants::{INVALID_FRAMING, NO_ANSWER};
use crate::error::{PumpError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ready bit of the status byte; cleared while the device is busy
pub const READY_BIT: u8 = 0x20;

/// Bit set on every genuine status byte
pub const ANSWER_BIT: u8 = 0x40;

/// Status byte error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    InitError,
    InvalidCommand,
    InvalidOperand,
    InvalidSequence,
    Eeprom,
    NotInitialized,
    SyringeOverload,
    ValveOverload,
    MoveNotAllowed,
    BufferFull,
    /// Synthetic code for a frame that could not be parsed
    InvalidFraming,
    /// Byte without the answer bit, raw value preserved
    InvalidStatusByte(u8),
    NoAnswer,
    Unknown(u8),
}

impl StatusCode {
    pub fn description(&self) -> &'static str {
        match self {
            Self::Ok => "No error",
            Self::InitError => "Initialization error",
            Self::InvalidCommand => "Invalid command",
            Self::InvalidOperand => "Invalid operand",
            Self::InvalidSequence => "Invalid command sequence",
            Self::Eeprom => "EEPROM failure",
            Self::NotInitialized => "Device not initialized",
            Self::SyringeOverload => "Syringe overload",
            Self::ValveOverload => "Valve overload",
            Self::MoveNotAllowed => "Syringe move not allowed",
            Self::BufferFull => "Command buffer full",
            Self::InvalidFraming => "Invalid framing",
            Self::InvalidStatusByte(_) => "Invalid status byte",
            Self::NoAnswer => "No answer",
            Self::Unknown(_) => "Unknown error",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidStatusByte(raw) | Self::Unknown(raw) => {
                write!(f, "{} ({:#04x})", self.description(), raw)
            }
            _ => f.write_str(self.description()),
        }
    }
}

/// Raw status byte as last reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusByte(pub u8);

impl StatusByte {
    pub const NO_ANSWER: StatusByte = StatusByte(NO_ANSWER);
    pub const INVALID_FRAMING: StatusByte = StatusByte(INVALID_FRAMING);

    /// Status byte of an idle device without error
    pub const READY: StatusByte = StatusByte(ANSWER_BIT | READY_BIT);

    /// Status byte forced onto a device right after a move is dispatched
    pub const BUSY: StatusByte = StatusByte(ANSWER_BIT);

    pub fn raw(&self) -> u8 {
        self.0
    }

    /// True while the ready bit is cleared on a genuine answer
    pub fn is_busy(&self) -> bool {
        self.0 & ANSWER_BIT != 0 && self.0 != NO_ANSWER && self.0 & READY_BIT == 0
    }

    pub fn code(&self) -> StatusCode {
        match self.0 {
            NO_ANSWER => StatusCode::NoAnswer,
            INVALID_FRAMING => StatusCode::InvalidFraming,
            raw if raw & 0xC0 != ANSWER_BIT => StatusCode::InvalidStatusByte(raw),
            raw => match raw & 0x0F {
                0 => StatusCode::Ok,
                1 => StatusCode::InitError,
                2 => StatusCode::InvalidCommand,
                3 => StatusCode::InvalidOperand,
                4 => StatusCode::InvalidSequence,
                6 => StatusCode::Eeprom,
                7 => StatusCode::NotInitialized,
                9 => StatusCode::SyringeOverload,
                10 => StatusCode::ValveOverload,
                11 => StatusCode::MoveNotAllowed,
                15 => StatusCode::BufferFull,
                other => StatusCode::Unknown(other),
            },
        }
    }

    /// Fail with `PumpError::Device` unless the answer is clean.
    ///
    /// Broadcast addresses never answer, so this is a no-op for them.
    pub fn raise_if_error(&self, device: u8, address: u8) -> Result<()> {
        if is_broadcast(address) {
            return Ok(());
        }
        let code = self.code();
        if code.is_ok() {
            Ok(())
        } else {
            Err(PumpError::Device { device, code })
        }
    }
}

impl Default for StatusByte {
    fn default() -> Self {
        StatusByte::NO_ANSWER
    }
}

/// Sentinel meaning the subsystem status could not be read
pub const STATUS_UNAVAILABLE: u16 = 512;

/// Sentinel reported while the subsystem is moving
pub const STATUS_BUSY: u16 = 255;

const VALVE_FLAGS: &[(u16, &str)] = &[
    (1, "valve not initialized"),
    (2, "valve initialization error"),
    (4, "valve overload"),
    (16, "valve not in position"),
    (32, "valve drive fault"),
];

const SYRINGE_FLAGS: &[(u16, &str)] = &[
    (1, "syringe not initialized"),
    (2, "syringe initialization error"),
    (4, "syringe overload"),
    (8, "plunger position lost"),
];

fn decode_flags(code: u16, flags: &[(u16, &'static str)]) -> Vec<&'static str> {
    match code {
        0 => vec!["ok"],
        STATUS_BUSY => vec!["busy"],
        STATUS_UNAVAILABLE => vec!["status unavailable"],
        _ => flags
            .iter()
            .filter(|(bit, _)| code & bit != 0)
            .map(|(_, phrase)| *phrase)
            .collect(),
    }
}

/// Valve status word (`?20000`), codes `{0,1,2,4,16,32,255,512}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValveStatus(pub u16);

impl ValveStatus {
    pub fn phrases(&self) -> Vec<&'static str> {
        decode_flags(self.0, VALVE_FLAGS)
    }

    /// Busy and unavailable are not errors
    pub fn is_error(&self) -> bool {
        !matches!(self.0, 0 | STATUS_BUSY | STATUS_UNAVAILABLE)
    }

    pub fn raise_if_error(&self, device: u8, address: u8) -> Result<()> {
        if is_broadcast(address) || !self.is_error() {
            return Ok(());
        }
        Err(PumpError::Valve {
            device,
            status: *self,
        })
    }
}

impl Default for ValveStatus {
    fn default() -> Self {
        ValveStatus(STATUS_UNAVAILABLE)
    }
}

impl fmt::Display for ValveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.phrases().join(", "), self.0)
    }
}

/// Syringe status word (`?10000`), codes `{0,1,6,8,255,512}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyringeStatus(pub u16);

impl SyringeStatus {
    pub fn phrases(&self) -> Vec<&'static str> {
        decode_flags(self.0, SYRINGE_FLAGS)
    }

    pub fn is_error(&self) -> bool {
        !matches!(self.0, 0 | STATUS_BUSY | STATUS_UNAVAILABLE)
    }

    pub fn raise_if_error(&self, device: u8, address: u8) -> Result<()> {
        if is_broadcast(address) || !self.is_error() {
            return Ok(());
        }
        Err(PumpError::Syringe {
            device,
            status: *self,
        })
    }
}

impl Default for SyringeStatus {
    fn default() -> Self {
        SyringeStatus(STATUS_UNAVAILABLE)
    }
}

impl fmt::Display for SyringeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.phrases().join(", "), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_and_busy_bits() {
        assert!(!StatusByte(0x60).is_busy());
        assert!(StatusByte(0x40).is_busy());
        assert!(StatusByte::BUSY.is_busy());
        assert!(!StatusByte::NO_ANSWER.is_busy());
        assert_eq!(StatusByte(0x60).code(), StatusCode::Ok);
    }

    #[test]
    fn error_nibble_decodes() {
        assert_eq!(StatusByte(0x67).code(), StatusCode::NotInitialized);
        assert_eq!(StatusByte(0x49).code(), StatusCode::SyringeOverload);
        assert_eq!(StatusByte(0x6F).code(), StatusCode::BufferFull);
        assert_eq!(StatusByte(0x65).code(), StatusCode::Unknown(5));
    }

    #[test]
    fn synthetic_codes_keep_raw_byte() {
        assert_eq!(StatusByte(32).code(), StatusCode::InvalidFraming);
        assert_eq!(StatusByte(255).code(), StatusCode::NoAnswer);
        assert_eq!(StatusByte(0x21).code(), StatusCode::InvalidStatusByte(0x21));
        assert_eq!(StatusByte(32).raw(), 0x20);
    }

    #[test]
    fn raise_if_error_skips_broadcasts() {
        let failed = StatusByte(0x62);
        assert!(failed.raise_if_error(1, 0x31).is_err());
        assert!(failed.raise_if_error(1, 0x41).is_ok());
        assert!(StatusByte::NO_ANSWER.raise_if_error(1, 0x5F).is_ok());
    }

    #[test]
    fn subsystem_codes_decode_additively() {
        assert_eq!(
            SyringeStatus(6).phrases(),
            vec!["syringe initialization error", "syringe overload"]
        );
        assert!(SyringeStatus(6).is_error());
        assert!(!SyringeStatus(255).is_error());
        assert!(!ValveStatus(512).is_error());
        assert_eq!(ValveStatus(16 + 4).phrases().len(), 2);
        assert!(ValveStatus(1).raise_if_error(2, 0x32).is_err());
    }
}
