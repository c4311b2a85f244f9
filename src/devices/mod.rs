//! Device proxies: physical quantities in, command strings out.

mod registry;
mod syringe;
mod valve;

pub use registry::{Constructor, DeviceRegistry, DeviceSet};
pub use syringe::{init_velocity, Syringe};
pub use valve::Valve;

use crate::bus::{CommandFuture, Reply};
use crate::command::{Command, CommandString};
use crate::constants::*;
use crate::error::{PumpError, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// A proxy created from configuration
pub trait Device: Send + Sync {
    fn id(&self) -> u8;

    fn name(&self) -> &str;

    /// Valve half of the device; every drive has one
    fn as_valve(&self) -> &Valve;

    /// Syringe view when the device carries a plunger
    fn into_syringe(self: Arc<Self>) -> Option<Arc<Syringe>>;
}

/// A command string built by a proxy, and its pending answer when transmitted
#[derive(Debug)]
pub struct Issued {
    command: CommandString,
    device: u8,
    address: u8,
    future: Option<CommandFuture>,
}

impl Issued {
    pub(crate) fn composed(device: u8, address: u8, command: CommandString) -> Self {
        Issued {
            command,
            device,
            address,
            future: None,
        }
    }

    pub(crate) fn sent(device: u8, address: u8, command: CommandString, future: CommandFuture) -> Self {
        Issued {
            command,
            device,
            address,
            future: Some(future),
        }
    }

    pub fn command(&self) -> &CommandString {
        &self.command
    }

    pub fn into_command(self) -> CommandString {
        self.command
    }

    pub fn is_sent(&self) -> bool {
        self.future.is_some()
    }

    /// Wait for the answer and raise the status byte error, if any
    pub fn wait(self) -> Result<Option<Reply>> {
        match self.future {
            Some(future) => {
                let reply = future.wait()?;
                reply.status.raise_if_error(self.device, self.address)?;
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<Option<Reply>> {
        match self.future {
            Some(future) => {
                let reply = future.wait_timeout(timeout)?;
                reply.status.raise_if_error(self.device, self.address)?;
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }
}

/// Motion settings pushed to or read from a drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceConfig {
    pub valve_type: Option<u8>,
    /// Steps per second
    pub start_velocity: Option<u32>,
    pub top_velocity: Option<u32>,
    pub stop_velocity: Option<u32>,
    pub return_steps: Option<u32>,
    pub acceleration: Option<u8>,
}

impl DeviceConfig {
    /// Primitives that push this configuration, validated
    pub fn commands(&self) -> Result<Vec<Command>> {
        let mut commands = Vec::new();
        if let Some(valve_type) = self.valve_type {
            if valve_type > MAX_VALVE_TYPE {
                return Err(PumpError::InvalidArgument(format!("valve type {}", valve_type)));
            }
            commands.push(Command::SetValveType(valve_type));
        }
        let velocities: [(&str, Option<u32>, fn(u32) -> Command); 3] = [
            ("start", self.start_velocity, Command::StartVelocity),
            ("top", self.top_velocity, Command::TopVelocity),
            ("stop", self.stop_velocity, Command::StopVelocity),
        ];
        for (label, velocity, command) in velocities {
            if let Some(v) = velocity {
                if !(MIN_VELOCITY..=MAX_VELOCITY).contains(&v) {
                    return Err(PumpError::InvalidArgument(format!(
                        "{} velocity {} outside {}..{}",
                        label, v, MIN_VELOCITY, MAX_VELOCITY
                    )));
                }
                commands.push(command(v));
            }
        }
        if let Some(steps) = self.return_steps {
            if steps > MAX_STEPS {
                return Err(PumpError::InvalidArgument(format!("return steps {}", steps)));
            }
            commands.push(Command::ReturnSteps(steps));
        }
        if let Some(code) = self.acceleration {
            if code > MAX_ACCELERATION_CODE {
                return Err(PumpError::InvalidArgument(format!("acceleration code {}", code)));
            }
            commands.push(Command::Acceleration(code));
        }
        Ok(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_commands_in_push_order() {
        let config = DeviceConfig {
            valve_type: Some(2),
            start_velocity: Some(900),
            top_velocity: None,
            stop_velocity: Some(900),
            return_steps: Some(12),
            acceleration: Some(14),
        };
        let text: CommandString = config.commands().unwrap().into_iter().collect();
        assert_eq!(text.to_string(), "h21002v900c900K12L14");
    }

    #[test]
    fn config_rejects_out_of_range() {
        let too_fast = DeviceConfig {
            top_velocity: Some(MAX_VELOCITY + 1),
            ..DeviceConfig::default()
        };
        assert!(matches!(too_fast.commands(), Err(PumpError::InvalidArgument(_))));
        let bad_valve = DeviceConfig {
            valve_type: Some(7),
            ..DeviceConfig::default()
        };
        assert!(bad_valve.commands().is_err());
    }
}
