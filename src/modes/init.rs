use super::{check_rate, move_syringe, ModeContext, ModeEngine, ModeKind, Progress};
use crate::error::{PumpError, Result};
use crate::settings::Role;
use crate::types::{Direction, ValveTarget};
use serde::{Deserialize, Serialize};

/// Which side of the cell the priming volume moves on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitAction {
    /// Push syringe dispenses into the cell inlet
    Dispense,
    /// Pull syringe fills itself from the cell outlet
    Fill,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InitParams {
    pub push: u8,
    pub pull: u8,
    pub action: InitAction,
    /// uL
    pub volume: f64,
    /// uL/s
    pub rate: f64,
}

impl Default for InitParams {
    fn default() -> Self {
        InitParams {
            push: 1,
            pull: 3,
            action: InitAction::Dispense,
            volume: 1_000.0,
            rate: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    MovingDispense,
    MovingFill,
}

/// Adds a volume to, or removes it from, the cell
pub struct InitMode {
    params: InitParams,
    phase: Phase,
}

impl InitMode {
    pub fn new(params: InitParams) -> Self {
        InitMode {
            params,
            phase: Phase::Idle,
        }
    }

    fn mover(&self) -> (u8, Role, Direction) {
        match self.params.action {
            InitAction::Dispense => (self.params.push, Role::CellInlet, Direction::Dispense),
            InitAction::Fill => (self.params.pull, Role::CellOutlet, Direction::Pickup),
        }
    }
}

impl ModeEngine for InitMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Init
    }

    fn phase(&self) -> &'static str {
        match self.phase {
            Phase::Idle => "idle",
            Phase::MovingDispense => "moving_dispense",
            Phase::MovingFill => "moving_fill",
        }
    }

    fn start(&mut self, ctx: &ModeContext) -> Result<()> {
        let (id, role, direction) = self.mover();
        let syringe = ctx.syringe(id)?;
        let port = ctx.port(id, role)?;
        check_rate(&[&syringe], self.params.rate)?;

        let volume = self.params.volume;
        match direction {
            Direction::Dispense => {
                let available = syringe.volume().unwrap_or(0.0);
                if volume > available {
                    return Err(PumpError::InsufficientVolume {
                        requested: volume,
                        available,
                    });
                }
                ctx.route_inlet(id)?;
            }
            Direction::Pickup => {
                let headroom = syringe.headroom().unwrap_or(0.0);
                if volume > headroom {
                    return Err(PumpError::CapacityExceeded {
                        requested: volume,
                        headroom,
                    });
                }
            }
        }

        self.phase = match direction {
            Direction::Dispense => Phase::MovingDispense,
            Direction::Pickup => Phase::MovingFill,
        };
        move_syringe(&syringe, direction, volume, self.params.rate, ValveTarget::Position(port))?;
        log::info!("Init: S{} {:?} {:.1} uL at {:.1} uL/s", id, direction, volume, self.params.rate);
        Ok(())
    }

    fn tick(&mut self, ctx: &ModeContext) -> Result<Progress> {
        if self.phase == Phase::Idle {
            return Ok(Progress::Finished);
        }
        let (id, _, _) = self.mover();
        if ctx.settled(&[&ctx.syringe(id)?])? {
            self.phase = Phase::Idle;
            return Ok(Progress::Finished);
        }
        Ok(Progress::Running)
    }

    fn stop(&mut self, ctx: &ModeContext) -> Result<()> {
        if self.phase != Phase::Idle {
            let (id, _, _) = self.mover();
            ctx.syringe(id)?.stop()?;
            self.phase = Phase::Idle;
        }
        Ok(())
    }
}
