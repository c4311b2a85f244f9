//! Continuous exchange on the canonical four-syringe rig.
//!
//! Two pairs alternate: the active pair (push on a cell-inlet syringe, pull
//! on a cell-outlet syringe) exchanges through the cell while the standby
//! pair refills from the reservoir and empties to waste. At the end of each
//! stroke all four valves flip together, the valve positioner routes the
//! cell inlet to the new push syringe and the pairs trade roles.

use super::{check_rate, move_syringe, Dose, DoseDirection, ModeContext, ModeEngine, ModeKind, Progress};
use crate::codec;
use crate::command::{Command, CommandString};
use crate::constants::*;
use crate::devices::Syringe;
use crate::error::{PumpError, Result};
use crate::exchange::{ExchangePair, PairSettings};
use crate::settings::{PortLabel, Role};
use crate::types::{Direction, Dispatch, ValveTarget};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const FIRST_PUSH: u8 = 2;
const FIRST_PULL: u8 = 4;
const STANDBY_PUSH: u8 = 1;
const STANDBY_PULL: u8 = 3;

/// Wait for devices halted by a dose
const HALT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContinuousParams {
    /// uL/s through the cell
    pub exchange_rate: f64,
    /// uL/s of the standby pair
    pub refill_rate: f64,
    /// uL/s of the initial fill and drain
    pub premotion_rate: f64,
    /// uL pushed through the `up` port after every refill
    pub pre_pressure_volume: f64,
    pub pre_pressure_rate: Option<f64>,
    /// uL kept in the push syringe at the end of a stroke
    pub leftover: f64,
    /// uL
    pub total_exchange_amount: f64,
    /// uL/s of operator doses
    pub dose_rate: f64,
}

impl Default for ContinuousParams {
    fn default() -> Self {
        ContinuousParams {
            exchange_rate: 500.0,
            refill_rate: 1_500.0,
            premotion_rate: 1_000.0,
            pre_pressure_volume: 0.0,
            pre_pressure_rate: None,
            leftover: 0.0,
            total_exchange_amount: 25_000.0,
            dose_rate: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Premotion,
    InitMotion,
    Exchange,
    Switching,
    Dosing,
}

struct Pairs {
    active: Arc<ExchangePair>,
    standby: Arc<ExchangePair>,
}

/// Alternating two-pair exchange with refill in the background
pub struct ContinuousMode {
    params: ContinuousParams,
    phase: Phase,
    pairs: Option<Pairs>,
    exchanged: f64,
    stroke_start: f64,
    /// Consecutive strokes that found nothing to exchange
    empty_strokes: u8,
}

impl ContinuousMode {
    pub fn new(params: ContinuousParams) -> Self {
        ContinuousMode {
            params,
            phase: Phase::Idle,
            pairs: None,
            exchanged: 0.0,
            stroke_start: 0.0,
            empty_strokes: 0,
        }
    }

    /// Active and standby pair
    fn pairs(&self) -> Result<(Arc<ExchangePair>, Arc<ExchangePair>)> {
        self.pairs
            .as_ref()
            .map(|p| (Arc::clone(&p.active), Arc::clone(&p.standby)))
            .ok_or_else(|| PumpError::InvalidArgument("continuous exchange is not running".to_string()))
    }

    fn syringes(&self) -> Result<[Arc<Syringe>; 4]> {
        let (active, standby) = self.pairs()?;
        Ok([active.push(), active.pull(), standby.push(), standby.pull()])
    }

    fn pre_pressure_rate(&self) -> f64 {
        self.params.pre_pressure_rate.unwrap_or(self.params.exchange_rate)
    }

    fn settled(&self, ctx: &ModeContext) -> Result<bool> {
        let syringes = self.syringes()?;
        let refs: Vec<&Arc<Syringe>> = syringes.iter().collect();
        ctx.settled(&refs)
    }

    /// Account the motion of the running stroke, measured on the push side
    fn book_stroke(&mut self) -> Result<()> {
        let push = self.pairs()?.0.push();
        let moved = self.stroke_start - push.volume().unwrap_or(self.stroke_start);
        self.exchanged += moved.max(0.0);
        self.stroke_start = push.volume().unwrap_or(0.0);
        Ok(())
    }

    fn done(&self, push: &Syringe) -> bool {
        self.params.total_exchange_amount - self.exchanged <= push.volume_of(1)
    }

    /// Position each syringe's valve, then start all four together
    fn init_motion(&mut self, ctx: &ModeContext) -> Result<()> {
        let (active, standby) = self.pairs()?;
        let (push, pull) = (active.push(), active.pull());
        let (spare_push, spare_pull) = (standby.push(), standby.pull());

        let inlet = ctx.port(push.id(), Role::CellInlet)?;
        let mut push_program = CommandString::new();
        if self.params.pre_pressure_volume > 0.0 {
            let pressure = push.dispense(
                self.params.pre_pressure_volume,
                Some(self.pre_pressure_rate()),
                Some(ValveTarget::Position(ctx.position(PortLabel::Up))),
                Dispatch::COMPOSE,
            )?;
            push_program.append(pressure.command());
        }
        push_program.push(Command::MoveValve(inlet));

        let programs = vec![
            (spare_push.clone(), valve_program(ctx.port(spare_push.id(), Role::Reservoir)?)),
            (push.clone(), push_program),
            (spare_pull.clone(), valve_program(ctx.port(spare_pull.id(), Role::Waste)?)),
            (pull.clone(), valve_program(ctx.port(pull.id(), Role::CellOutlet)?)),
        ];
        run_together(ctx, programs)?;
        ctx.route_inlet(push.id())?;
        self.phase = Phase::InitMotion;
        log::info!("Continuous: init motion, {} feeds the cell", push.name());
        Ok(())
    }

    /// Exchange stroke on the active pair; refill and pre-pressure on the standby pair
    fn main_motion(&mut self, ctx: &ModeContext) -> Result<Progress> {
        let (active, standby) = self.pairs()?;
        let push = active.push();
        if self.done(&push) {
            return self.finish();
        }
        let remaining = self.params.total_exchange_amount - self.exchanged;
        let stroke = (active.exchangeable_volume() - self.params.leftover).min(remaining);
        if stroke < push.volume_of(1) {
            self.empty_strokes += 1;
            if self.empty_strokes > 1 {
                return Err(PumpError::InsufficientVolume {
                    requested: remaining,
                    available: 0.0,
                });
            }
            log::warn!("Continuous: {} has nothing to exchange; switching", active.name());
            self.switch(ctx)?;
            return Ok(Progress::Running);
        }
        self.empty_strokes = 0;
        self.stroke_start = push.volume().unwrap_or(0.0);
        let synchrony = active.start_exchange(stroke, Some(self.params.exchange_rate))?;

        let spare_push = standby.push();
        let spare_pull = standby.pull();
        let reservoir = ValveTarget::Position(ctx.port(spare_push.id(), Role::Reservoir)?);
        let waste = ValveTarget::Position(ctx.port(spare_pull.id(), Role::Waste)?);
        let rate = Some(self.params.refill_rate);
        let mut refill = spare_push.fill(Some(reservoir), rate, Dispatch::COMPOSE)?.into_command();
        if self.params.pre_pressure_volume > 0.0 {
            let pressure = spare_push.dispense(
                self.params.pre_pressure_volume,
                Some(self.pre_pressure_rate()),
                Some(ValveTarget::Position(ctx.position(PortLabel::Up))),
                Dispatch::COMPOSE,
            )?;
            refill.append(pressure.command());
        }
        let a = spare_push.valve().issue(refill, Dispatch::RUN)?;
        let b = spare_pull.drain(Some(waste), rate, Dispatch::RUN)?;
        a.wait()?;
        b.wait()?;

        log::info!(
            "Continuous: {} exchanges {:.1} uL ({:?}); {:.1} of {:.1} uL done",
            active.name(),
            stroke,
            synchrony,
            self.exchanged,
            self.params.total_exchange_amount
        );
        self.phase = Phase::Exchange;
        Ok(Progress::Running)
    }

    /// Flip all four valves together and trade pair roles
    fn switch(&mut self, ctx: &ModeContext) -> Result<()> {
        let pairs = self.pairs.as_mut().ok_or_else(|| {
            PumpError::InvalidArgument("continuous exchange is not running".to_string())
        })?;
        std::mem::swap(&mut pairs.active, &mut pairs.standby);
        let (push, pull) = (pairs.active.push(), pairs.active.pull());
        let (spare_push, spare_pull) = (pairs.standby.push(), pairs.standby.pull());
        let programs = vec![
            (push.clone(), valve_program(ctx.port(push.id(), Role::CellInlet)?)),
            (pull.clone(), valve_program(ctx.port(pull.id(), Role::CellOutlet)?)),
            (spare_push.clone(), valve_program(ctx.port(spare_push.id(), Role::Reservoir)?)),
            (spare_pull.clone(), valve_program(ctx.port(spare_pull.id(), Role::Waste)?)),
        ];
        run_together(ctx, programs)?;
        ctx.route_inlet(push.id())?;
        log::info!("Continuous: switched, {} feeds the cell", push.name());
        self.phase = Phase::Switching;
        Ok(())
    }

    fn finish(&mut self) -> Result<Progress> {
        log::info!("Continuous: finished after {:.1} uL", self.exchanged);
        self.phase = Phase::Idle;
        Ok(Progress::Finished)
    }
}

fn valve_program(position: u8) -> CommandString {
    CommandString::from(Command::MoveValve(position))
}

/// Buffer one program per syringe and start them with one run on their common address
fn run_together(ctx: &ModeContext, programs: Vec<(Arc<Syringe>, CommandString)>) -> Result<()> {
    let addresses = programs
        .iter()
        .map(|(syringe, _)| codec::quad_address(syringe.id()))
        .collect::<Result<Vec<u8>>>()?;
    let common = addresses
        .first()
        .copied()
        .filter(|first| addresses.iter().all(|a| a == first));
    match common {
        Some(address) => {
            let pending = programs
                .into_iter()
                .map(|(syringe, program)| syringe.valve().issue(program, Dispatch::ENQUEUE))
                .collect::<Result<Vec<_>>>()?;
            for issued in pending {
                issued.wait()?;
            }
            ctx.bus
                .send(address, &CommandString::new().finish(false), PRIORITY_COMMAND)?
                .wait()?;
        }
        None => {
            log::warn!("Continuous: syringes share no broadcast address; starting one by one");
            for (syringe, program) in programs {
                syringe.valve().issue(program, Dispatch::RUN)?.wait()?;
            }
        }
    }
    Ok(())
}

impl ModeEngine for ContinuousMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Continuous
    }

    fn phase(&self) -> &'static str {
        match self.phase {
            Phase::Idle => "idle",
            Phase::Premotion => "premotion",
            Phase::InitMotion => "init_motion",
            Phase::Exchange => "exchange",
            Phase::Switching => "switching",
            Phase::Dosing => "dosing",
        }
    }

    fn start(&mut self, ctx: &ModeContext) -> Result<()> {
        ctx.settings.check_continuous_topology()?;
        let p = &self.params;
        if !(p.total_exchange_amount > 0.0) || p.leftover < 0.0 {
            return Err(PumpError::InvalidArgument(
                "exchange amount must be positive and leftover not negative".to_string(),
            ));
        }
        let syringes = [
            ctx.syringe(STANDBY_PUSH)?,
            ctx.syringe(FIRST_PUSH)?,
            ctx.syringe(STANDBY_PULL)?,
            ctx.syringe(FIRST_PULL)?,
        ];
        let refs: Vec<&Arc<Syringe>> = syringes.iter().collect();
        for rate in [p.exchange_rate, p.refill_rate, p.premotion_rate, p.dose_rate] {
            check_rate(&refs, rate)?;
        }
        if let Some(rate) = p.pre_pressure_rate {
            check_rate(&refs, rate)?;
        }

        let pair = |push: u8, pull: u8| -> Result<ExchangePair> {
            ExchangePair::new(
                format!("S{}-S{}", push, pull),
                ctx.syringe(push)?,
                ctx.syringe(pull)?,
                ctx.side_ports(push, Role::CellInlet)?,
                ctx.side_ports(pull, Role::CellOutlet)?,
                PairSettings::default(),
            )
        };
        self.pairs = Some(Pairs {
            active: Arc::new(pair(FIRST_PUSH, FIRST_PULL)?),
            standby: Arc::new(pair(STANDBY_PUSH, STANDBY_PULL)?),
        });
        self.exchanged = 0.0;
        self.empty_strokes = 0;
        ctx.volumes.lock().reset_exchanged();

        // Set before issuing so a failed start stops whatever already moves
        self.phase = Phase::Premotion;
        let rate = Some(self.params.premotion_rate);
        let mut pending = Vec::new();
        for push in [STANDBY_PUSH, FIRST_PUSH] {
            let reservoir = ValveTarget::Position(ctx.port(push, Role::Reservoir)?);
            pending.push(ctx.syringe(push)?.fill(Some(reservoir), rate, Dispatch::RUN)?);
        }
        for pull in [STANDBY_PULL, FIRST_PULL] {
            let waste = ValveTarget::Position(ctx.port(pull, Role::Waste)?);
            pending.push(ctx.syringe(pull)?.drain(Some(waste), rate, Dispatch::RUN)?);
        }
        for issued in pending {
            issued.wait()?;
        }
        log::info!(
            "Continuous: {:.1} uL at {:.1} uL/s, premotion",
            self.params.total_exchange_amount,
            self.params.exchange_rate
        );
        Ok(())
    }

    fn tick(&mut self, ctx: &ModeContext) -> Result<Progress> {
        if self.phase == Phase::Idle {
            return Ok(Progress::Finished);
        }
        if !self.settled(ctx)? {
            return Ok(Progress::Running);
        }
        match self.phase {
            Phase::Premotion => {
                self.init_motion(ctx)?;
                Ok(Progress::Running)
            }
            Phase::InitMotion | Phase::Switching => self.main_motion(ctx),
            Phase::Exchange => {
                self.book_stroke()?;
                if self.done(&self.pairs()?.0.push()) {
                    return self.finish();
                }
                self.switch(ctx)?;
                Ok(Progress::Running)
            }
            Phase::Dosing => {
                ctx.route_inlet(self.pairs()?.0.push().id())?;
                log::info!("Continuous: dose delivered, resuming exchange");
                self.main_motion(ctx)
            }
            Phase::Idle => Ok(Progress::Finished),
        }
    }

    fn stop(&mut self, _ctx: &ModeContext) -> Result<()> {
        if self.phase == Phase::Idle {
            return Ok(());
        }
        let (active, standby) = self.pairs()?;
        active.stop()?;
        if standby.shared_address() != active.shared_address() {
            standby.stop()?;
        }
        self.phase = Phase::Idle;
        Ok(())
    }

    fn set_rate(&mut self, _ctx: &ModeContext, rate: f64) -> Result<()> {
        if self.phase == Phase::Exchange {
            self.pairs()?.0.set_rate(rate)?;
        } else if let Ok((active, _)) = self.pairs() {
            active.push().check_rate(rate, false)?;
        }
        self.params.exchange_rate = rate;
        Ok(())
    }

    /// Suspend the exchange, dose through the standby pair, then resume
    fn dose(&mut self, ctx: &ModeContext, dose: Dose) -> Result<()> {
        if self.phase != Phase::Exchange {
            log::warn!("Continuous: dose ignored in {}", self.phase());
            return Err(PumpError::InvalidArgument(format!(
                "doses are taken while exchanging, not in {}",
                self.phase()
            )));
        }
        let rate = dose.rate.unwrap_or(self.params.dose_rate);
        let (active, standby) = self.pairs()?;
        let (syringe, role, direction) = match dose.direction {
            DoseDirection::Add => (standby.push(), Role::CellInlet, Direction::Dispense),
            DoseDirection::Remove => (standby.pull(), Role::CellOutlet, Direction::Pickup),
        };
        syringe.check_rate(rate, false)?;
        let port = ctx.port(syringe.id(), role)?;

        // Standby first so its pre-pressure cannot run on after the exchange halts
        standby.push().stop()?;
        standby.pull().stop()?;
        active.stop()?;
        for device in self.syringes()? {
            device.join(Some(HALT_TIMEOUT))?;
        }
        self.book_stroke()?;
        log::info!(
            "Continuous: exchange suspended; {:?} {:.1} uL on {}",
            dose.direction,
            dose.volume,
            syringe.name()
        );

        if direction == Direction::Dispense {
            ctx.route_inlet(syringe.id())?;
        }
        self.phase = Phase::Dosing;
        if let Err(e) = move_syringe(&syringe, direction, dose.volume, rate, ValveTarget::Position(port)) {
            log::error!("Continuous: dose failed: {}", e);
            return Err(e);
        }
        Ok(())
    }
}
