use super::{check_rate, ModeContext, ModeEngine, ModeKind, Progress};
use crate::command::Command;
use crate::devices::Syringe;
use crate::error::{PumpError, Result};
use crate::types::{Dispatch, ValveTarget};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CleanParams {
    pub syringes: Vec<u8>,
    /// Port drawn from: label, position or alias
    pub inlet: String,
    /// Port flushed to
    pub outlet: String,
    /// uL/s
    pub rate: f64,
    pub strokes: u32,
    /// Hold after each plunger move
    pub dwell_ms: u32,
}

impl Default for CleanParams {
    fn default() -> Self {
        CleanParams {
            syringes: vec![1, 2, 3, 4],
            inlet: "left".to_string(),
            outlet: "up".to_string(),
            rate: 1_000.0,
            strokes: 3,
            dwell_ms: 0,
        }
    }
}

struct Flushed {
    syringe: Arc<Syringe>,
    inlet: u8,
    outlet: u8,
}

/// Full strokes from an inlet port to an outlet port on several syringes
pub struct CleanMode {
    params: CleanParams,
    targets: Vec<Flushed>,
    strokes_done: u32,
}

impl CleanMode {
    pub fn new(params: CleanParams) -> Self {
        CleanMode {
            params,
            targets: Vec::new(),
            strokes_done: 0,
        }
    }

    fn stroke(&mut self) -> Result<()> {
        let rate = Some(self.params.rate);
        let dwell = self.params.dwell_ms;
        let mut pending = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let syringe = &target.syringe;
            let mut program = syringe
                .fill(Some(ValveTarget::Position(target.inlet)), rate, Dispatch::COMPOSE)?
                .into_command();
            if dwell > 0 {
                program.push(Command::Delay(dwell));
            }
            let flush = syringe.drain(Some(ValveTarget::Position(target.outlet)), rate, Dispatch::COMPOSE)?;
            program.append(flush.command());
            if dwell > 0 {
                program.push(Command::Delay(dwell));
            }
            pending.push(syringe.valve().issue(program, Dispatch::RUN)?);
        }
        for issued in pending {
            issued.wait()?;
        }
        self.strokes_done += 1;
        log::info!("Clean: stroke {}/{}", self.strokes_done, self.params.strokes);
        Ok(())
    }

    fn syringes(&self) -> Vec<&Arc<Syringe>> {
        self.targets.iter().map(|t| &t.syringe).collect()
    }
}

impl ModeEngine for CleanMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Clean
    }

    fn phase(&self) -> &'static str {
        if self.targets.is_empty() {
            "idle"
        } else {
            "flushing"
        }
    }

    fn start(&mut self, ctx: &ModeContext) -> Result<()> {
        let p = &self.params;
        if p.syringes.is_empty() || p.strokes == 0 {
            return Err(PumpError::InvalidArgument(
                "clean needs at least one syringe and one stroke".to_string(),
            ));
        }
        let mut targets = Vec::with_capacity(p.syringes.len());
        for id in &p.syringes {
            let syringe = ctx.syringe(*id)?;
            check_rate(&[&syringe], p.rate)?;
            let (inlet, _) = ctx.role_of(*id, &ValveTarget::from(p.inlet.as_str()))?;
            let (outlet, _) = ctx.role_of(*id, &ValveTarget::from(p.outlet.as_str()))?;
            targets.push(Flushed {
                syringe,
                inlet,
                outlet,
            });
        }
        self.targets = targets;
        self.strokes_done = 0;
        self.stroke()
    }

    fn tick(&mut self, ctx: &ModeContext) -> Result<Progress> {
        if self.targets.is_empty() {
            return Ok(Progress::Finished);
        }
        if !ctx.settled(&self.syringes())? {
            return Ok(Progress::Running);
        }
        if self.strokes_done >= self.params.strokes {
            log::info!("Clean: finished");
            self.targets.clear();
            return Ok(Progress::Finished);
        }
        self.stroke()?;
        Ok(Progress::Running)
    }

    fn stop(&mut self, _ctx: &ModeContext) -> Result<()> {
        for target in self.targets.drain(..) {
            target.syringe.stop()?;
        }
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
    fn flushes_each_syringe_per_stroke() {
        let rig = Rig::new(Config::default());
        rig.settle();
        let mut mode = CleanMode::new(CleanParams {
            syringes: vec![1, 3],
            rate: 1_500.0,
            strokes: 2,
            dwell_ms: 100,
            ..CleanParams::default()
        });
        mode.start(&rig.ctx).unwrap();
        assert_eq!(mode.phase(), "flushing");
        rig.run(&mut mode, Duration::from_secs(10)).unwrap();

        for (id, address) in [(1, 0x31), (3, 0x33)] {
            assert_eq!(rig.sim.position(id), Some(0));
            assert_eq!(rig.sim.valve(id), Some(2));
            let strokes = rig
                .sim
                .commands()
                .iter()
                .filter(|(a, c)| *a == address && c.contains("A192000"))
                .count();
            assert_eq!(strokes, 2);
        }
        assert_eq!(rig.sim.position(2), Some(0));
        assert_eq!(mode.phase(), "idle");
    }

    #[test]
    fn unknown_port_is_rejected() {
        let rig = Rig::new(Config::default());
        let mut mode = CleanMode::new(CleanParams {
            outlet: "Drain".to_string(),
            ..CleanParams::default()
        });
        assert!(mode.start(&rig.ctx).is_err());
        assert_eq!(mode.phase(), "idle");
    }
}
