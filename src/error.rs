//! Error types for pump bus and orchestration operations.

use crate::status::{StatusCode, SyringeStatus, ValveStatus};
use serde::Serialize;
use thiserror::Error;

/// Result type alias for pump operations.
pub type Result<T> = std::result::Result<T, PumpError>;

/// Error types for pump bus communication and fluidic operations.
#[derive(Error, Debug)]
pub enum PumpError {
    /// Serial port communication error
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed or written
    #[error("Configuration error: {0}")]
    Config(#[from] serde_yaml::Error),

    /// No answer after all retries
    #[error("Bus timeout: no answer from address {address:#04x}")]
    BusTimeout {
        /// Address the frame was sent to
        address: u8,
    },

    /// Frame could not be parsed (checksum, markers)
    #[error("Bus framing error: {0}")]
    BusFraming(String),

    /// Status byte carried a non-zero error code
    #[error("Device {device} reported {code}")]
    Device {
        /// Device id (1-based)
        device: u8,
        /// Decoded status byte error
        code: StatusCode,
    },

    /// Valve subsystem reported an error
    #[error("Device {device} valve error: {status}")]
    Valve {
        /// Device id (1-based)
        device: u8,
        /// Decoded valve status
        status: ValveStatus,
    },

    /// Syringe subsystem reported an error
    #[error("Device {device} syringe error: {status}")]
    Syringe {
        /// Device id (1-based)
        device: u8,
        /// Decoded syringe status
        status: SyringeStatus,
    },

    /// Argument rejected before anything was transmitted
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Valve position outside 1..8
    #[error("Invalid valve position: {0}")]
    InvalidPosition(u16),

    /// Rate outside the allowed envelope
    #[error("Rate {rate:.3} uL/s out of bounds [{min:.3}, {max:.3}]")]
    RateOutOfBounds {
        /// Requested rate
        rate: f64,
        /// Lowest accepted rate
        min: f64,
        /// Highest accepted rate
        max: f64,
    },

    /// Dispense request larger than the syringe content
    #[error("Insufficient volume: requested {requested:.2} uL, available {available:.2} uL")]
    InsufficientVolume {
        /// Requested volume
        requested: f64,
        /// Volume currently held
        available: f64,
    },

    /// Pickup request beyond the syringe capacity
    #[error("Capacity exceeded: requested {requested:.2} uL, headroom {headroom:.2} uL")]
    CapacityExceeded {
        /// Requested volume
        requested: f64,
        /// Volume that still fits
        headroom: f64,
    },

    /// Volume tripwire fired; latched until acknowledged
    #[error("Volume bounds tripped: {0}")]
    BoundsTripped(String),

    /// Pump settings do not match the topology a mode requires
    #[error("Topology mismatch: {0}")]
    TopologyMismatch(String),

    /// Another operation mode is active
    #[error("Mode busy: {0} is running")]
    ModeBusy(String),

    /// Task was drained from the queue by a stop
    #[error("Cancelled by stop")]
    CancelledByStop,

    /// No bus server is connected
    #[error("Not connected")]
    NotConnected,

    /// The bus dispatcher is gone
    #[error("Bus dispatcher disconnected")]
    Disconnected,

    /// No device with that id was discovered or configured
    #[error("Unknown device: {0}")]
    UnknownDevice(u8),

    /// Alias not present in the valve alias table
    #[error("Unknown valve alias: {0}")]
    UnknownAlias(String),
}

/// Machine-readable error kind carried on the event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Io,
    Config,
    BusTimeout,
    BusFraming,
    DeviceError,
    ValveError,
    SyringeError,
    InvalidArgument,
    BoundsTripped,
    TopologyMismatch,
    ModeBusy,
    CancelledByStop,
    NotConnected,
}

impl PumpError {
    /// Map the error onto the taxonomy reported to consumers
    pub fn kind(&self) -> ErrorKind {
        match self {
            PumpError::SerialPort(_) | PumpError::Io(_) | PumpError::Disconnected => ErrorKind::Io,
            PumpError::Config(_) => ErrorKind::Config,
            PumpError::BusTimeout { .. } => ErrorKind::BusTimeout,
            PumpError::BusFraming(_) => ErrorKind::BusFraming,
            PumpError::Device { .. } => ErrorKind::DeviceError,
            PumpError::Valve { .. } => ErrorKind::ValveError,
            PumpError::Syringe { .. } => ErrorKind::SyringeError,
            PumpError::InvalidArgument(_)
            | PumpError::InvalidPosition(_)
            | PumpError::RateOutOfBounds { .. }
            | PumpError::InsufficientVolume { .. }
            | PumpError::CapacityExceeded { .. }
            | PumpError::UnknownDevice(_)
            | PumpError::UnknownAlias(_) => ErrorKind::InvalidArgument,
            PumpError::BoundsTripped(_) => ErrorKind::BoundsTripped,
            PumpError::TopologyMismatch(_) => ErrorKind::TopologyMismatch,
            PumpError::ModeBusy(_) => ErrorKind::ModeBusy,
            PumpError::CancelledByStop => ErrorKind::CancelledByStop,
            PumpError::NotConnected => ErrorKind::NotConnected,
        }
    }
}
