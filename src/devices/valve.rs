use super::{Device, Issued, Syringe};
use crate::bus::BusHandle;
use crate::codec;
use crate::command::{Command, CommandString, Query};
use crate::constants::*;
use crate::error::{PumpError, Result};
use crate::status::{ValveStatus, STATUS_UNAVAILABLE};
use crate::types::{DeviceSnapshot, Dispatch, ValveReading, ValveTarget};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct ValveState {
    aliases: BTreeMap<u8, String>,
    valve_type: Option<u8>,
}

/// Proxy of a valve positioner, or of the valve half of a syringe drive
pub struct Valve {
    bus: BusHandle,
    id: u8,
    address: u8,
    name: String,
    state: Mutex<ValveState>,
}

impl Valve {
    pub fn new(bus: BusHandle, id: u8, name: impl Into<String>) -> Result<Self> {
        Ok(Valve {
            address: codec::individual_address(id)?,
            bus,
            id,
            name: name.into(),
            state: Mutex::new(ValveState {
                aliases: BTreeMap::new(),
                valve_type: None,
            }),
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &BusHandle {
        &self.bus
    }

    pub fn valve_type(&self) -> Option<u8> {
        self.state.lock().valve_type
    }

    pub fn set_valve_type(&self, valve_type: Option<u8>) -> Result<()> {
        if let Some(t) = valve_type {
            if t > MAX_VALVE_TYPE {
                return Err(PumpError::InvalidArgument(format!("valve type {}", t)));
            }
        }
        self.state.lock().valve_type = valve_type;
        Ok(())
    }

    pub fn aliases(&self) -> BTreeMap<u8, String> {
        self.state.lock().aliases.clone()
    }

    /// Name a valve position; an alias names at most one position
    pub fn set_alias(&self, position: u8, alias: &str) -> Result<()> {
        check_position(position)?;
        let mut state = self.state.lock();
        state.aliases.retain(|_, a| a != alias);
        state.aliases.insert(position, alias.to_string());
        log::debug!("{}: position {} is now {}", self.name, position, alias);
        Ok(())
    }

    pub fn remove_alias(&self, position: u8) -> Option<String> {
        self.state.lock().aliases.remove(&position)
    }

    /// Numeric position of a target, resolving aliases
    pub fn resolve(&self, target: &ValveTarget) -> Result<u8> {
        match target {
            ValveTarget::Position(p) => {
                check_position(*p)?;
                Ok(*p)
            }
            ValveTarget::Alias(alias) => self
                .state
                .lock()
                .aliases
                .iter()
                .find(|(_, a)| a.eq_ignore_ascii_case(alias))
                .map(|(p, _)| *p)
                .ok_or_else(|| PumpError::UnknownAlias(alias.clone())),
        }
    }

    pub fn has_alias(&self, alias: &str) -> bool {
        self.resolve(&ValveTarget::Alias(alias.to_string())).is_ok()
    }

    /// Initialise the valve drive, keeping the configured valve type
    pub fn init_valve(&self, dispatch: Dispatch) -> Result<Issued> {
        let mut command = CommandString::new();
        let valve_type = self.valve_type();
        if let Some(t) = valve_type {
            command.push(Command::SetValveType(t));
        }
        command.push(Command::InitValve);
        if let Some(t) = valve_type {
            command.push(Command::SetValveType(t));
        }
        self.issue(command, dispatch)
    }

    /// Turn the valve; a faulted valve is refused before anything is sent
    pub fn move_valve(&self, target: impl Into<ValveTarget>, dispatch: Dispatch) -> Result<Issued> {
        let position = self.resolve(&target.into())?;
        if dispatch.send {
            self.check_valve_error()?;
        }
        self.issue(CommandString::from(Command::MoveValve(position)), dispatch)
    }

    /// Current position, reported by alias when one is known
    pub fn valve(&self) -> Option<ValveReading> {
        let position = self.valve_position()?;
        Some(match self.state.lock().aliases.get(&position) {
            Some(alias) => ValveReading::Alias(alias.clone()),
            None => ValveReading::Position(position),
        })
    }

    pub fn valve_position(&self) -> Option<u8> {
        self.status().and_then(|s| s.valve_pos)
    }

    pub fn status(&self) -> Option<DeviceSnapshot> {
        self.bus.device(self.id)
    }

    pub fn is_busy(&self) -> bool {
        self.bus.is_busy(self.id)
    }

    /// Raise the last status byte error, if any
    pub fn check_status(&self) -> Result<()> {
        match self.status() {
            Some(snapshot) => snapshot.status_byte.raise_if_error(self.id, self.address),
            None => Err(PumpError::UnknownDevice(self.id)),
        }
    }

    /// Read the valve status word and raise a valve fault
    pub fn check_valve_error(&self) -> Result<()> {
        ValveStatus(self.status_word(Query::ValveStatus)?).raise_if_error(self.id, self.address)
    }

    /// Fresh subsystem status word. The answer's status byte is left to
    /// `check_status` so a stale command error does not mask the word.
    pub(crate) fn status_word(&self, query: Query) -> Result<u16> {
        let reply = self
            .bus
            .send(self.address, &CommandString::from(Command::Query(query)), PRIORITY_QUERY)?
            .wait()?;
        Ok(reply
            .numeric()
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(STATUS_UNAVAILABLE))
    }

    /// Wait until the device reports ready
    pub fn join(&self, timeout: Option<Duration>) -> Result<()> {
        let started = Instant::now();
        while self.is_busy() {
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    return Err(PumpError::BusTimeout {
                        address: self.address,
                    });
                }
            }
            std::thread::sleep(JOIN_POLL_INTERVAL);
        }
        self.check_status()?;
        self.check_valve_error()
    }

    pub fn stop(&self) -> Result<()> {
        self.bus.stop(self.address)?.wait()?;
        Ok(())
    }

    pub fn pause_buffered(&self) -> Result<()> {
        self.bus.pause_buffer(self.address)?.wait()?;
        Ok(())
    }

    /// Read the valve type from the device
    pub fn fetch_valve_type(&self) -> Result<u8> {
        let value = self.bus.query(self.id, Query::ValveType)?;
        u8::try_from(value).map_err(|_| PumpError::BusFraming(format!("valve type {}", value)))
    }

    pub fn firmware(&self) -> Result<String> {
        let reply = self
            .bus
            .send(self.address, &CommandString::from(Command::Firmware), PRIORITY_QUERY)?
            .wait()?;
        reply.status.raise_if_error(self.id, self.address)?;
        Ok(reply.text())
    }

    /// Terminate or buffer `command` and transmit it when asked to
    pub(crate) fn issue(&self, command: CommandString, dispatch: Dispatch) -> Result<Issued> {
        let command = command.finish(dispatch.enqueue);
        if !dispatch.send {
            return Ok(Issued::composed(self.id, self.address, command));
        }
        log::debug!("{}: {}", self.name, command);
        let future = self.bus.send(self.address, &command, PRIORITY_COMMAND)?;
        Ok(Issued::sent(self.id, self.address, command, future))
    }
}

fn check_position(position: u8) -> Result<()> {
    if VALVE_POSITIONS.contains(&position) {
        Ok(())
    } else {
        Err(PumpError::InvalidPosition(position as u16))
    }
}

impl Device for Valve {
    fn id(&self) -> u8 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn as_valve(&self) -> &Valve {
        self
    }

    fn into_syringe(self: Arc<Self>) -> Option<Arc<Syringe>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusOptions, BusServer};
    use crate::transport::SimulatedBus;

    fn server(sim: &SimulatedBus) -> BusServer {
        let options = BusOptions {
            timeout: Duration::from_millis(10),
            scan_ids: vec![1, 5],
            ..BusOptions::default()
        };
        BusServer::with_transport(Box::new(sim.clone()), options).unwrap()
    }

    #[test]
    fn aliases_resolve_case_insensitively() {
        let sim = SimulatedBus::new().with_valve(5);
        let server = server(&sim);
        let valve = Valve::new(server.handle(), 5, "Inlet").unwrap();
        valve.set_alias(3, "Cell").unwrap();
        assert_eq!(valve.resolve(&"cell".into()).unwrap(), 3);
        assert_eq!(valve.resolve(&4.into()).unwrap(), 4);
        assert!(matches!(valve.resolve(&"Waste".into()), Err(PumpError::UnknownAlias(_))));
        assert!(matches!(valve.resolve(&9.into()), Err(PumpError::InvalidPosition(9))));
        valve.set_alias(4, "Cell").unwrap();
        assert_eq!(valve.aliases().len(), 1);
    }

    #[test]
    fn init_keeps_valve_type() {
        let sim = SimulatedBus::new().with_valve(5);
        let server = server(&sim);
        let valve = Valve::new(server.handle(), 5, "Inlet").unwrap();
        valve.set_valve_type(Some(3)).unwrap();
        let issued = valve.init_valve(Dispatch::COMPOSE).unwrap();
        assert!(!issued.is_sent());
        assert_eq!(issued.command().to_string(), "h21003h20000h21003");
        assert_eq!(
            valve.init_valve(Dispatch::RUN).unwrap().command().to_string(),
            "h21003h20000h21003R"
        );
    }

    #[test]
    fn move_reports_alias() {
        let sim = SimulatedBus::new().with_valve(5);
        let server = server(&sim);
        let valve = Valve::new(server.handle(), 5, "Inlet").unwrap();
        valve.set_alias(2, "Cell").unwrap();
        valve.move_valve("Cell", Dispatch::RUN).unwrap().wait().unwrap();
        valve.join(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(sim.valve(5), Some(2));
        assert_eq!(valve.valve(), Some(ValveReading::Alias("Cell".to_string())));
        assert_eq!(valve.fetch_valve_type().unwrap(), 0);
    }

    #[test]
    fn faulted_valve_refuses_to_move() {
        let sim = SimulatedBus::new().with_valve(5);
        let server = server(&sim);
        let valve = Valve::new(server.handle(), 5, "Inlet").unwrap();
        sim.fault_valve(5, 16);
        assert!(matches!(
            valve.move_valve(3, Dispatch::RUN),
            Err(PumpError::Valve { device: 5, .. })
        ));
        assert_eq!(sim.valve(5), Some(1));
        assert!(sim.commands().iter().all(|(address, _)| *address != 0x35));
        // Composing sends nothing, so nothing is inspected
        assert!(valve.move_valve(3, Dispatch::COMPOSE).is_ok());

        sim.fault_valve(5, 0);
        valve.move_valve(3, Dispatch::RUN).unwrap().wait().unwrap();
        sim.fault_valve(5, 4);
        assert!(matches!(
            valve.join(Some(Duration::from_secs(2))),
            Err(PumpError::Valve { device: 5, .. })
        ));
    }
}
