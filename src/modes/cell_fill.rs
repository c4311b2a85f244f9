use super::{check_rate, ModeContext, ModeEngine, ModeKind, Progress};
use crate::devices::Syringe;
use crate::error::{PumpError, Result};
use crate::settings::Role;
use crate::types::{Dispatch, ValveTarget};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CellFillParams {
    pub syringe: u8,
    /// uL flushed to waste first in every cycle
    pub vol_to_waste: f64,
    /// uL delivered to the cell in every cycle
    pub vol_to_cell: f64,
    /// uL/s
    pub waste_rate: f64,
    /// uL/s
    pub cell_rate: f64,
    /// uL/s drawing from the reservoir
    pub fill_rate: f64,
    pub refill_times: u32,
}

impl Default for CellFillParams {
    fn default() -> Self {
        CellFillParams {
            syringe: 1,
            vol_to_waste: 1_000.0,
            vol_to_cell: 5_000.0,
            waste_rate: 1_000.0,
            cell_rate: 250.0,
            fill_rate: 1_500.0,
            refill_times: 1,
        }
    }
}

/// Repeated draw from the reservoir, flush to waste, delivery to the cell
pub struct CellFillMode {
    params: CellFillParams,
    syringe: Option<Arc<Syringe>>,
    cycles_done: u32,
}

impl CellFillMode {
    pub fn new(params: CellFillParams) -> Self {
        CellFillMode {
            params,
            syringe: None,
            cycles_done: 0,
        }
    }

    fn cycle(&mut self, ctx: &ModeContext, syringe: &Syringe) -> Result<()> {
        let p = &self.params;
        let id = syringe.id();
        let reservoir = ValveTarget::Position(ctx.port(id, Role::Reservoir)?);
        let cell = ValveTarget::Position(ctx.port(id, Role::CellInlet)?);
        let total = p.vol_to_waste + p.vol_to_cell;

        let headroom = syringe.headroom().unwrap_or(0.0);
        if total > headroom + syringe.volume_of(1) {
            return Err(PumpError::CapacityExceeded {
                requested: total,
                headroom,
            });
        }

        let mut program = syringe
            .pickup(total, Some(p.fill_rate), Some(reservoir), Dispatch::COMPOSE)?
            .into_command();
        if p.vol_to_waste > 0.0 {
            let waste = ValveTarget::Position(ctx.port(id, Role::Waste)?);
            let flush = syringe.dispense(p.vol_to_waste, Some(p.waste_rate), Some(waste), Dispatch::COMPOSE)?;
            program.append(flush.command());
        }
        let deliver = syringe.dispense(p.vol_to_cell, Some(p.cell_rate), Some(cell), Dispatch::COMPOSE)?;
        program.append(deliver.command());
        syringe.valve().issue(program, Dispatch::RUN)?.wait()?;

        self.cycles_done += 1;
        log::info!(
            "Cell fill: cycle {}/{} on {}",
            self.cycles_done,
            self.params.refill_times,
            syringe.name()
        );
        Ok(())
    }
}

impl ModeEngine for CellFillMode {
    fn kind(&self) -> ModeKind {
        ModeKind::CellFill
    }

    fn phase(&self) -> &'static str {
        if self.syringe.is_some() {
            "filling"
        } else {
            "idle"
        }
    }

    fn start(&mut self, ctx: &ModeContext) -> Result<()> {
        let p = &self.params;
        if !(p.vol_to_cell > 0.0) || p.vol_to_waste < 0.0 || p.refill_times == 0 {
            return Err(PumpError::InvalidArgument(
                "cell fill needs a positive cell volume and at least one cycle".to_string(),
            ));
        }
        let syringe = ctx.syringe(p.syringe)?;
        check_rate(&[&syringe], p.fill_rate)?;
        check_rate(&[&syringe], p.waste_rate)?;
        check_rate(&[&syringe], p.cell_rate)?;

        self.cycles_done = 0;
        self.syringe = Some(Arc::clone(&syringe));
        ctx.route_inlet(syringe.id())?;
        self.cycle(ctx, &syringe)
    }

    fn tick(&mut self, ctx: &ModeContext) -> Result<Progress> {
        let Some(syringe) = self.syringe.clone() else {
            return Ok(Progress::Finished);
        };
        if !ctx.settled(&[&syringe])? {
            return Ok(Progress::Running);
        }
        if self.cycles_done >= self.params.refill_times {
            log::info!("Cell fill: finished");
            self.syringe = None;
            return Ok(Progress::Finished);
        }
        self.cycle(ctx, &syringe)?;
        Ok(Progress::Running)
    }

    fn stop(&mut self, _ctx: &ModeContext) -> Result<()> {
        if let Some(syringe) = self.syringe.take() {
            syringe.stop()?;
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
    fn cycles_through_waste_then_cell() {
        let rig = Rig::new(Config::default());
        rig.settle();
        let mut mode = CellFillMode::new(CellFillParams {
            syringe: 2,
            vol_to_waste: 500.0,
            vol_to_cell: 1_000.0,
            refill_times: 2,
            ..CellFillParams::default()
        });
        mode.start(&rig.ctx).unwrap();
        rig.run(&mut mode, Duration::from_secs(10)).unwrap();

        assert_eq!(rig.sim.position(2), Some(0));
        assert_eq!(rig.sim.valve(2), Some(3));
        assert_eq!(rig.sim.valve(5), Some(2));
        let draws = rig
            .sim
            .commands()
            .iter()
            .filter(|(address, command)| *address == 0x32 && command.contains("P23040"))
            .count();
        assert_eq!(draws, 2);
    }

    #[test]
    fn rejects_cycle_larger_than_syringe() {
        let rig = Rig::new(Config::default());
        rig.settle();
        let mut mode = CellFillMode::new(CellFillParams {
            vol_to_waste: 1_000.0,
            vol_to_cell: 12_000.0,
            ..CellFillParams::default()
        });
        assert!(matches!(
            mode.start(&rig.ctx),
            Err(PumpError::CapacityExceeded { .. })
        ));
        mode.stop(&rig.ctx).unwrap();
        assert_eq!(mode.phase(), "idle");
        assert!(!rig.sim.is_busy(1));
    }
}
