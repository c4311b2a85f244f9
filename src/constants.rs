//! Protocol constants for the Hamilton-style RS-485 pump bus.
//!
//! This module defines the framing bytes, address ranges, command offsets,
//! plunger geometry and timing parameters shared by the codec, the bus
//! server and the device proxies.

use std::time::Duration;

/// Start-of-text marker opening every frame
pub const STX: u8 = 0x02;

/// End-of-text marker closing every frame payload
pub const ETX: u8 = 0x03;

/// Address byte used by devices when answering the master
pub const MASTER_ADDRESS: u8 = 0x30;

/// Base of the individual address range (`0x30 + id`)
pub const INDIVIDUAL_BASE: u8 = 0x30;

/// Address byte excluded from the broadcast classification
pub const RESERVED_ADDRESS: u8 = 0x40;

/// Address of the global broadcast reaching every device
pub const GLOBAL_ADDRESS: u8 = 0x5F;

/// Number of addressable devices on one bus
pub const MAX_DEVICES: u8 = 16;

/// Sequence byte base; the rolling counter 1..7 is OR-ed into it
pub const SEQUENCE_BASE: u8 = 0x30;

/// Bit OR-ed into the sequence byte when a frame is repeated
pub const RETRY_BIT: u8 = 0x08;

/// Highest value of the per-device rolling sequence counter
pub const SEQUENCE_MAX: u8 = 7;

/// Full plunger travel in fine positioning units
pub const MAX_MICROSTEPS: u32 = 192_000;

/// Full plunger travel in velocity units
pub const MAX_STEPS: u32 = 48_000;

/// Highest top velocity accepted at rest (steps per second)
pub const MAX_VELOCITY: u32 = 5_800;

/// Lowest velocity the drive can hold (steps per second)
pub const MIN_VELOCITY: u32 = 2;

/// Highest velocity accepted while the plunger is moving (steps per second)
pub const MAX_ONFLY_VELOCITY: u32 = 800;

/// Valve positions available on the documented valve family
pub const VALVE_POSITIONS: std::ops::RangeInclusive<u8> = 1..=8;

/// Offset of the syringe init speed parameter (`h10000 + code`)
pub const SYRINGE_INIT_OFFSET: u32 = 10_000;

/// Valve init command (`h20000`)
pub const VALVE_INIT: u32 = 20_000;

/// Offset of the valve type parameter (`h21000 + type`)
pub const VALVE_TYPE_OFFSET: u32 = 21_000;

/// Offset of the valve move parameter (`h26000 + position`)
pub const VALVE_MOVE_OFFSET: u32 = 26_000;

/// Enables the extended `h` command set on every device
pub const ENABLE_EXTENDED: u32 = 30_001;

/// Highest valve type code (0 Y, 1 T, 2 distribution, 3 8-way, 4 4-way 90°, 5 reserved, 6 6-way 45°)
pub const MAX_VALVE_TYPE: u8 = 6;

/// Highest acceleration code accepted by `L`
pub const MAX_ACCELERATION_CODE: u8 = 20;

/// Highest init speed code
pub const MAX_INIT_SPEED_CODE: u8 = 40;

/// Last code of the fast init speed region
pub const FAST_INIT_LAST_CODE: u8 = 15;

/// Fastest init speed in steps per second (codes 0 and 1)
pub const FAST_INIT_VELOCITY: f64 = 3_400.0;

/// Decrement between consecutive fast init speed codes
pub const FAST_INIT_STEP: f64 = 200.0;

/// Velocity of the first slow init speed code (16)
pub const SLOW_INIT_VELOCITY: f64 = 200.0;

/// Decrement between consecutive slow init speed codes
pub const SLOW_INIT_STEP: f64 = 8.25;

/// Status byte reported for a device that did not answer
pub const NO_ANSWER: u8 = 255;

/// Synthetic status code for a frame that could not be parsed
pub const INVALID_FRAMING: u8 = 32;

/// Highest task priority; used by terminate and pause broadcasts
pub const PRIORITY_STOP: u8 = 0;

/// Priority of motion and configuration commands
pub const PRIORITY_COMMAND: u8 = 100;

/// Priority of operator queries
pub const PRIORITY_QUERY: u8 = 200;

/// Default serial baud rate
pub const BAUD_RATE: u32 = 9600;

/// Per-attempt read timeout
pub const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Default write timeout
pub const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between idle checks while joining a device
pub const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Period of the mode scheduler tick
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Period of the volume tripwire loop
pub const TRIPWIRE_INTERVAL: Duration = Duration::from_millis(10);

/// Send latency subtracted from rate-trim sleeps
pub const SEND_LATENCY: Duration = Duration::from_millis(60);

/// Dispatcher wait when neither tasks nor devices are pending
pub const IDLE_WAIT: Duration = Duration::from_millis(20);
