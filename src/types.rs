use crate::status::{StatusByte, SyringeStatus, ValveStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Device family detected at discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Unknown,
    /// Multi-port valve positioner without a syringe
    Mvp,
    /// Syringe drive with valve
    Psd,
}

impl DeviceType {
    pub fn from_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "mvp" => DeviceType::Mvp,
            s if s.starts_with("psd") => DeviceType::Psd,
            _ => DeviceType::Unknown,
        }
    }
}

/// Per-device state as last observed by the bus server
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub id: u8,
    pub status_byte: StatusByte,
    pub busy: bool,
    pub valve_status: ValveStatus,
    pub syringe_status: SyringeStatus,
    pub valve_pos: Option<u8>,
    pub syringe_pos: Option<u32>,
    pub device_type: DeviceType,
}

impl DeviceSnapshot {
    pub fn empty(id: u8) -> Self {
        DeviceSnapshot {
            id,
            status_byte: StatusByte::NO_ANSWER,
            busy: false,
            valve_status: ValveStatus::default(),
            syringe_status: SyringeStatus::default(),
            valve_pos: None,
            syringe_pos: None,
            device_type: DeviceType::Unknown,
        }
    }
}

/// Valve target given either numerically or through the alias table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValveTarget {
    Position(u8),
    Alias(String),
}

impl From<u8> for ValveTarget {
    fn from(position: u8) -> Self {
        ValveTarget::Position(position)
    }
}

impl From<&str> for ValveTarget {
    fn from(text: &str) -> Self {
        match text.parse::<u8>() {
            Ok(position) => ValveTarget::Position(position),
            Err(_) => ValveTarget::Alias(text.to_string()),
        }
    }
}

impl From<String> for ValveTarget {
    fn from(text: String) -> Self {
        ValveTarget::from(text.as_str())
    }
}

impl fmt::Display for ValveTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValveTarget::Position(p) => write!(f, "{}", p),
            ValveTarget::Alias(a) => f.write_str(a),
        }
    }
}

/// Valve reading: the alias when one is known, else the number
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ValveReading {
    Alias(String),
    Position(u8),
}

/// Plunger direction seen by the volume bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Plunger moves up, liquid leaves the syringe
    Dispense,
    /// Plunger moves down, liquid enters the syringe
    Pickup,
}

/// Transmission flags shared by every proxy operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    /// Transmit the command; when false only the command string is returned
    pub send: bool,
    /// Omit the terminal `R` so the device buffers the command
    pub enqueue: bool,
}

impl Dispatch {
    /// Send and run immediately
    pub const RUN: Dispatch = Dispatch {
        send: true,
        enqueue: false,
    };

    /// Send and buffer until a later run command
    pub const ENQUEUE: Dispatch = Dispatch {
        send: true,
        enqueue: true,
    };

    /// Build the command string only, to be concatenated by the caller
    pub const COMPOSE: Dispatch = Dispatch {
        send: false,
        enqueue: true,
    };
}

impl Default for Dispatch {
    fn default() -> Self {
        Dispatch::RUN
    }
}
