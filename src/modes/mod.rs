//! Operation modes.
//!
//! Every mode is a small state machine driven by the orchestrator's
//! scheduler: `start` programs the first motion, `tick` observes readiness
//! and advances to the next phase, `stop` halts what the mode moved. Ticks
//! never wait for motion; they only check whether the devices are idle.

mod cell_fill;
mod clean;
mod continuous;
mod init;
mod intermittent;
mod normal;

pub use cell_fill::{CellFillMode, CellFillParams};
pub use clean::{CleanMode, CleanParams};
pub use continuous::{ContinuousMode, ContinuousParams};
pub use init::{InitAction, InitMode, InitParams};
pub use intermittent::{IntermittentMode, IntermittentParams};
pub use normal::{NormalMode, NormalParams};

use crate::bus::BusHandle;
use crate::devices::{DeviceSet, Syringe, Valve};
use crate::error::{PumpError, Result};
use crate::exchange::{ExchangePair, SidePorts};
use crate::settings::{PortLabel, PortPositions, PumpSettings, Role};
use crate::types::{Direction, Dispatch, ValveTarget};
use crate::volume::VolumeModel;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Mode names as used by operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModeKind {
    Init,
    Normal,
    Intermittent,
    Continuous,
    CellFill,
    Clean,
}

impl ModeKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().replace('_', "-").as_str() {
            "init" => Ok(ModeKind::Init),
            "normal" => Ok(ModeKind::Normal),
            "intermittent" | "simple" => Ok(ModeKind::Intermittent),
            "continuous" | "advanced" => Ok(ModeKind::Continuous),
            "cell-fill" | "cellfill" => Ok(ModeKind::CellFill),
            "clean" => Ok(ModeKind::Clean),
            other => Err(PumpError::InvalidArgument(format!("unknown mode {}", other))),
        }
    }
}

impl fmt::Display for ModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModeKind::Init => "init",
            ModeKind::Normal => "normal",
            ModeKind::Intermittent => "intermittent",
            ModeKind::Continuous => "continuous",
            ModeKind::CellFill => "cell-fill",
            ModeKind::Clean => "clean",
        })
    }
}

/// Result of one scheduler tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Running,
    Finished,
}

/// Operator request to add liquid to or remove it from the cell
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dose {
    pub direction: DoseDirection,
    /// uL
    pub volume: f64,
    /// uL/s; the mode's configured dose rate when absent
    pub rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoseDirection {
    Add,
    Remove,
}

impl Dose {
    pub fn add(volume: f64) -> Self {
        Dose {
            direction: DoseDirection::Add,
            volume,
            rate: None,
        }
    }

    pub fn remove(volume: f64) -> Self {
        Dose {
            direction: DoseDirection::Remove,
            volume,
            rate: None,
        }
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn parse(direction: &str, volume: f64) -> Result<Self> {
        if !volume.is_finite() || volume <= 0.0 {
            return Err(PumpError::InvalidArgument(format!("dose volume {}", volume)));
        }
        match direction.to_ascii_lowercase().as_str() {
            "add" | "+" => Ok(Dose::add(volume)),
            "remove" | "-" => Ok(Dose::remove(volume)),
            other => Err(PumpError::InvalidArgument(format!("dose direction {}", other))),
        }
    }
}

/// Everything a mode may touch during a session
#[derive(Clone)]
pub struct ModeContext {
    pub bus: BusHandle,
    pub devices: Arc<DeviceSet>,
    pub pairs: Arc<BTreeMap<String, Arc<ExchangePair>>>,
    pub settings: PumpSettings,
    pub ports: PortPositions,
    pub volumes: Arc<Mutex<VolumeModel>>,
    /// Device id of the cell-inlet valve positioner
    pub mvp: Option<u8>,
}

impl ModeContext {
    pub fn syringe(&self, id: u8) -> Result<Arc<Syringe>> {
        self.devices.syringe(id)
    }

    pub fn pair(&self, name: &str) -> Result<Arc<ExchangePair>> {
        self.pairs
            .get(name)
            .cloned()
            .ok_or_else(|| PumpError::InvalidArgument(format!("unknown pair {}", name)))
    }

    /// Valve position of the port of syringe `id` plumbed to `role`
    pub fn port(&self, id: u8, role: Role) -> Result<u8> {
        let label = self.settings.require_port(id, role)?;
        Ok(self.ports.position(label))
    }

    pub fn position(&self, label: PortLabel) -> u8 {
        self.ports.position(label)
    }

    /// Valve targets of syringe `id` taken from its pump settings
    pub fn side_ports(&self, id: u8, cell: Role) -> Result<SidePorts> {
        let target = |role| self.port(id, role).ok().map(ValveTarget::Position);
        Ok(SidePorts {
            reservoir: target(Role::Reservoir),
            waste: target(Role::Waste),
            cell: Some(ValveTarget::Position(self.port(id, cell)?)),
        })
    }

    /// Role of port `target` of syringe `id`, resolving aliases
    pub fn role_of(&self, id: u8, target: &ValveTarget) -> Result<(u8, Role)> {
        let position = match target {
            ValveTarget::Alias(alias) => match PortLabel::parse(alias) {
                Ok(label) => self.ports.position(label),
                Err(_) => self.syringe(id)?.valve().resolve(target)?,
            },
            ValveTarget::Position(_) => self.syringe(id)?.valve().resolve(target)?,
        };
        let role = self
            .ports
            .label(position)
            .and_then(|label| self.settings.role(id, label))
            .unwrap_or(Role::NotUsed);
        Ok((position, role))
    }

    pub fn mvp_valve(&self) -> Option<&Valve> {
        self.mvp.and_then(|id| self.devices.valve(id).ok())
    }

    /// Route the cell inlet to syringe `id` through the valve positioner
    pub fn route_inlet(&self, id: u8) -> Result<()> {
        let Some(channel) = self.settings.mvp_channel(id) else {
            return Ok(());
        };
        match self.mvp_valve() {
            Some(valve) => {
                log::info!("Cell inlet routed to S{} (channel {})", id, channel);
                valve.move_valve(channel, Dispatch::RUN)?.wait()?;
                Ok(())
            }
            None => {
                log::warn!("S{} names inlet channel {} but no valve positioner is connected", id, channel);
                Ok(())
            }
        }
    }

    /// True once every listed device and the valve positioner are idle; raises
    /// device errors and valve or syringe faults
    pub fn settled(&self, syringes: &[&Arc<Syringe>]) -> Result<bool> {
        let mvp = self.mvp_valve();
        if mvp.map(Valve::is_busy).unwrap_or(false) || syringes.iter().any(|s| s.is_busy()) {
            return Ok(false);
        }
        for syringe in syringes {
            syringe.check_errors()?;
        }
        if let Some(valve) = mvp {
            valve.check_valve_error()?;
        }
        Ok(true)
    }
}

/// A running operation mode
pub trait ModeEngine: Send {
    fn kind(&self) -> ModeKind;

    /// Name of the current phase
    fn phase(&self) -> &'static str;

    /// Program the first motion
    fn start(&mut self, ctx: &ModeContext) -> Result<()>;

    /// Observe the devices and advance
    fn tick(&mut self, ctx: &ModeContext) -> Result<Progress>;

    /// Halt everything this mode moves
    fn stop(&mut self, ctx: &ModeContext) -> Result<()>;

    fn set_rate(&mut self, _ctx: &ModeContext, _rate: f64) -> Result<()> {
        Err(PumpError::InvalidArgument(format!(
            "{} mode has no adjustable rate",
            self.kind()
        )))
    }

    fn dose(&mut self, _ctx: &ModeContext, _dose: Dose) -> Result<()> {
        Err(PumpError::InvalidArgument(format!(
            "{} mode does not take doses",
            self.kind()
        )))
    }
}

/// Mode and parameters requested by an operator
#[derive(Debug, Clone, PartialEq)]
pub enum ModeRequest {
    Init(InitParams),
    Normal(NormalParams),
    Intermittent(IntermittentParams),
    Continuous(ContinuousParams),
    CellFill(CellFillParams),
    Clean(CleanParams),
}

impl ModeRequest {
    /// Parse `name key=value ...`; values are read as YAML scalars or flow lists
    pub fn parse(name: &str, args: &[String]) -> Result<Self> {
        Ok(match ModeKind::parse(name)? {
            ModeKind::Init => ModeRequest::Init(parse_params(args)?),
            ModeKind::Normal => ModeRequest::Normal(parse_params(args)?),
            ModeKind::Intermittent => ModeRequest::Intermittent(parse_params(args)?),
            ModeKind::Continuous => ModeRequest::Continuous(parse_params(args)?),
            ModeKind::CellFill => ModeRequest::CellFill(parse_params(args)?),
            ModeKind::Clean => ModeRequest::Clean(parse_params(args)?),
        })
    }

    pub fn kind(&self) -> ModeKind {
        match self {
            ModeRequest::Init(_) => ModeKind::Init,
            ModeRequest::Normal(_) => ModeKind::Normal,
            ModeRequest::Intermittent(_) => ModeKind::Intermittent,
            ModeRequest::Continuous(_) => ModeKind::Continuous,
            ModeRequest::CellFill(_) => ModeKind::CellFill,
            ModeRequest::Clean(_) => ModeKind::Clean,
        }
    }

    pub fn into_engine(self) -> Box<dyn ModeEngine> {
        match self {
            ModeRequest::Init(p) => Box::new(InitMode::new(p)),
            ModeRequest::Normal(p) => Box::new(NormalMode::new(p)),
            ModeRequest::Intermittent(p) => Box::new(IntermittentMode::new(p)),
            ModeRequest::Continuous(p) => Box::new(ContinuousMode::new(p)),
            ModeRequest::CellFill(p) => Box::new(CellFillMode::new(p)),
            ModeRequest::Clean(p) => Box::new(CleanMode::new(p)),
        }
    }
}

fn parse_params<T: DeserializeOwned>(args: &[String]) -> Result<T> {
    let mut mapping = serde_yaml::Mapping::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| PumpError::InvalidArgument(format!("expected key=value, got {}", arg)))?;
        let value: serde_yaml::Value = serde_yaml::from_str(value.trim())
            .map_err(|e| PumpError::InvalidArgument(format!("{}: {}", key, e)))?;
        mapping.insert(serde_yaml::Value::String(key.trim().to_string()), value);
    }
    serde_yaml::from_value(serde_yaml::Value::Mapping(mapping))
        .map_err(|e| PumpError::InvalidArgument(e.to_string()))
}

/// Issue one move of `syringe` through `target`, the way every mode does.
/// A drive reporting a fault is refused before anything is sent.
pub(crate) fn move_syringe(
    syringe: &Syringe,
    direction: Direction,
    volume: f64,
    rate: f64,
    target: ValveTarget,
) -> Result<()> {
    syringe.check_faults()?;
    let issued = match direction {
        Direction::Dispense => syringe.dispense(volume, Some(rate), Some(target), Dispatch::RUN)?,
        Direction::Pickup => syringe.pickup(volume, Some(rate), Some(target), Dispatch::RUN)?,
    };
    issued.wait()?;
    Ok(())
}

/// Rate checked against the at-rest envelope of every syringe
pub(crate) fn check_rate(syringes: &[&Arc<Syringe>], rate: f64) -> Result<()> {
    for syringe in syringes {
        syringe.check_rate(rate, false)?;
    }
    Ok(())
}
