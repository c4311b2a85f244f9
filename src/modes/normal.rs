use super::{check_rate, move_syringe, ModeContext, ModeEngine, ModeKind, Progress};
use crate::error::{PumpError, Result};
use crate::settings::Role;
use crate::types::{Direction, ValveTarget};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalParams {
    pub syringe: u8,
    /// Port label (`left`, `up`, `right`), valve position or alias
    pub port: String,
    pub direction: Direction,
    /// uL; takes precedence over `stroke`
    pub volume: Option<f64>,
    /// Fraction of the syringe capacity
    pub stroke: Option<f64>,
    /// uL/s
    pub rate: f64,
}

impl Default for NormalParams {
    fn default() -> Self {
        NormalParams {
            syringe: 1,
            port: "left".to_string(),
            direction: Direction::Pickup,
            volume: None,
            stroke: Some(1.0),
            rate: 500.0,
        }
    }
}

/// One manual move of one syringe
pub struct NormalMode {
    params: NormalParams,
    moving: bool,
}

impl NormalMode {
    pub fn new(params: NormalParams) -> Self {
        NormalMode {
            params,
            moving: false,
        }
    }
}

impl ModeEngine for NormalMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Normal
    }

    fn phase(&self) -> &'static str {
        if self.moving {
            "moving"
        } else {
            "idle"
        }
    }

    fn start(&mut self, ctx: &ModeContext) -> Result<()> {
        let p = &self.params;
        let syringe = ctx.syringe(p.syringe)?;
        check_rate(&[&syringe], p.rate)?;
        let volume = match (p.volume, p.stroke) {
            (Some(volume), _) => volume,
            (None, Some(stroke)) if (0.0..=1.0).contains(&stroke) => stroke * syringe.max_volume(),
            (None, Some(stroke)) => {
                return Err(PumpError::InvalidArgument(format!("stroke fraction {}", stroke)))
            }
            (None, None) => {
                return Err(PumpError::InvalidArgument("either volume or stroke is required".to_string()))
            }
        };
        let (position, role) = ctx.role_of(p.syringe, &ValveTarget::from(p.port.as_str()))?;
        if role == Role::CellInlet {
            ctx.route_inlet(p.syringe)?;
        }
        self.moving = true;
        move_syringe(&syringe, p.direction, volume, p.rate, ValveTarget::Position(position))?;
        log::info!(
            "Normal: S{} {:?} {:.1} uL via port {} ({})",
            p.syringe,
            p.direction,
            volume,
            position,
            role
        );
        Ok(())
    }

    fn tick(&mut self, ctx: &ModeContext) -> Result<Progress> {
        if !self.moving || ctx.settled(&[&ctx.syringe(self.params.syringe)?])? {
            self.moving = false;
            return Ok(Progress::Finished);
        }
        Ok(Progress::Running)
    }

    fn stop(&mut self, ctx: &ModeContext) -> Result<()> {
        if self.moving {
            ctx.syringe(self.params.syringe)?.stop()?;
            self.moving = false;
        }
        Ok(())
    }

    /// Applied on the fly to the moving syringe
    fn set_rate(&mut self, ctx: &ModeContext, rate: f64) -> Result<()> {
        let syringe = ctx.syringe(self.params.syringe)?;
        if let Some(issued) = syringe.set_rate(rate)? {
            issued.wait()?;
        }
        self.params.rate = rate;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::Rig;
    use super::*;
    use crate::config::Config;
    use std::time::Duration;

    #[test]
    fn half_stroke_from_labelled_port() {
        let rig = Rig::new(Config::default());
        rig.settle();
        let mut mode = NormalMode::new(NormalParams {
            syringe: 3,
            port: "up".to_string(),
            stroke: Some(0.5),
            rate: 1_000.0,
            ..NormalParams::default()
        });
        mode.start(&rig.ctx).unwrap();
        rig.run(&mut mode, Duration::from_secs(5)).unwrap();
        assert_eq!(rig.sim.position(3), Some(96_000));
        assert_eq!(rig.sim.valve(3), Some(2));
    }

    #[test]
    fn alias_port_resolves_and_rejects_bad_stroke() {
        let rig = Rig::new(Config::default());
        rig.sim.set_position(1, 192_000);
        rig.settle();
        let mut mode = NormalMode::new(NormalParams {
            port: "Cell".to_string(),
            direction: Direction::Dispense,
            volume: Some(500.0),
            rate: 250.0,
            ..NormalParams::default()
        });
        mode.start(&rig.ctx).unwrap();
        rig.run(&mut mode, Duration::from_secs(5)).unwrap();
        assert_eq!(rig.sim.valve(1), Some(3));
        assert_eq!(rig.sim.position(1), Some(192_000 - 7_680));

        let mut bad = NormalMode::new(NormalParams {
            stroke: Some(1.5),
            ..NormalParams::default()
        });
        assert!(bad.start(&rig.ctx).is_err());
    }
}
