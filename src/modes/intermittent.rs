use super::{check_rate, Dose, DoseDirection, ModeContext, ModeEngine, ModeKind, Progress};
use crate::command::Command;
use crate::devices::Syringe;
use crate::error::{PumpError, Result};
use crate::exchange::ExchangePair;
use crate::settings::{PortLabel, Role};
use crate::types::{Dispatch, ValveTarget};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntermittentParams {
    pub pair: String,
    /// uL/s
    pub exchange_rate: f64,
    /// uL/s, for filling the push side and emptying the pull side
    pub refill_rate: f64,
    /// uL pushed through the `up` port before each exchange stroke
    pub pre_pressure_volume: f64,
    pub pre_pressure_rate: Option<f64>,
    /// uL
    pub total_exchange_amount: f64,
    /// Stop after the first exchange stroke
    pub onetime: bool,
}

impl Default for IntermittentParams {
    fn default() -> Self {
        IntermittentParams {
            pair: "pair13".to_string(),
            exchange_rate: 500.0,
            refill_rate: 1_500.0,
            pre_pressure_volume: 0.0,
            pre_pressure_rate: None,
            total_exchange_amount: 25_000.0,
            onetime: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Premotion,
    PrePressure,
    Exchange,
    Refill,
}

/// Alternating exchange and refill strokes of one pair
pub struct IntermittentMode {
    params: IntermittentParams,
    phase: Phase,
    pair: Option<Arc<ExchangePair>>,
    /// uL exchanged by completed strokes, measured on the push side
    exchanged: f64,
    /// Push content when the running stroke started
    stroke_start: f64,
}

impl IntermittentMode {
    pub fn new(params: IntermittentParams) -> Self {
        IntermittentMode {
            params,
            phase: Phase::Idle,
            pair: None,
            exchanged: 0.0,
            stroke_start: 0.0,
        }
    }

    fn pair(&self) -> Result<Arc<ExchangePair>> {
        self.pair
            .clone()
            .ok_or_else(|| PumpError::InvalidArgument("intermittent exchange is not running".to_string()))
    }

    fn remaining(&self) -> f64 {
        self.params.total_exchange_amount - self.exchanged
    }

    /// Push fills from its reservoir, pull empties to waste
    fn refill(&mut self, ctx: &ModeContext, push: &Syringe, pull: &Syringe) -> Result<()> {
        let rate = Some(self.params.refill_rate);
        let reservoir = ValveTarget::Position(ctx.port(push.id(), Role::Reservoir)?);
        let waste = ValveTarget::Position(ctx.port(pull.id(), Role::Waste)?);
        let a = push.fill(Some(reservoir), rate, Dispatch::RUN)?;
        let b = pull.drain(Some(waste), rate, Dispatch::RUN)?;
        a.wait()?;
        b.wait()?;
        Ok(())
    }

    /// Pre-pressure through the push side's `up` port, then back to where the valve was
    fn pressurise(&mut self, ctx: &ModeContext) -> Result<()> {
        let pair = self.pair()?;
        let push = pair.push();
        let volume = self.params.pre_pressure_volume;
        if volume <= 0.0 {
            return self.start_stroke(ctx);
        }
        let rate = self.params.pre_pressure_rate.unwrap_or(self.params.exchange_rate);
        let up = ctx.position(PortLabel::Up);
        let prior = push.valve().valve_position();
        let mut program = push
            .dispense(volume, Some(rate), Some(ValveTarget::Position(up)), Dispatch::COMPOSE)?
            .into_command();
        if let Some(position) = prior {
            program.push(Command::MoveValve(position));
        }
        push.valve().issue(program, Dispatch::RUN)?.wait()?;
        log::info!("Intermittent: pre-pressure {:.1} uL on {}", volume, push.name());
        self.phase = Phase::PrePressure;
        Ok(())
    }

    fn start_stroke(&mut self, ctx: &ModeContext) -> Result<()> {
        let pair = self.pair()?;
        let push = pair.push();
        let stroke = pair.exchangeable_volume().min(self.remaining());
        if stroke < push.volume_of(1) {
            log::warn!("Intermittent: nothing left to exchange; refilling");
            self.refill(ctx, &push, &pair.pull())?;
            self.phase = Phase::Refill;
            return Ok(());
        }
        self.stroke_start = push.volume().unwrap_or(0.0);
        let synchrony = pair.start_exchange(stroke, Some(self.params.exchange_rate))?;
        log::info!(
            "Intermittent: exchange stroke {:.1} uL ({:?}), {:.1} of {:.1} uL done",
            stroke,
            synchrony,
            self.exchanged,
            self.params.total_exchange_amount
        );
        self.phase = Phase::Exchange;
        Ok(())
    }
}

impl ModeEngine for IntermittentMode {
    fn kind(&self) -> ModeKind {
        ModeKind::Intermittent
    }

    fn phase(&self) -> &'static str {
        match self.phase {
            Phase::Idle => "idle",
            Phase::Premotion => "premotion",
            Phase::PrePressure => "pre_pressure",
            Phase::Exchange => "exchange",
            Phase::Refill => "refill",
        }
    }

    fn start(&mut self, ctx: &ModeContext) -> Result<()> {
        let p = &self.params;
        if p.refill_rate < p.exchange_rate {
            return Err(PumpError::InvalidArgument(format!(
                "refill rate {:.1} uL/s is slower than exchange rate {:.1} uL/s",
                p.refill_rate, p.exchange_rate
            )));
        }
        if !(p.total_exchange_amount > 0.0) {
            return Err(PumpError::InvalidArgument("total exchange amount must be positive".to_string()));
        }
        let pair = ctx.pair(&p.pair)?;
        let (push, pull) = (pair.push(), pair.pull());
        check_rate(&[&push, &pull], p.exchange_rate)?;
        check_rate(&[&push, &pull], p.refill_rate)?;
        if let Some(rate) = p.pre_pressure_rate {
            check_rate(&[&push], rate)?;
        }
        ctx.port(push.id(), Role::Reservoir)?;
        ctx.port(push.id(), Role::CellInlet)?;
        ctx.port(pull.id(), Role::CellOutlet)?;
        ctx.port(pull.id(), Role::Waste)?;

        ctx.volumes.lock().reset_exchanged();
        self.exchanged = 0.0;
        self.pair = Some(Arc::clone(&pair));
        self.phase = Phase::Premotion;
        ctx.route_inlet(push.id())?;
        self.refill(ctx, &push, &pull)?;
        log::info!(
            "Intermittent: {} uL on {} at {:.1} uL/s",
            self.params.total_exchange_amount,
            pair.name(),
            self.params.exchange_rate
        );
        Ok(())
    }

    fn tick(&mut self, ctx: &ModeContext) -> Result<Progress> {
        if self.phase == Phase::Idle {
            return Ok(Progress::Finished);
        }
        let pair = self.pair()?;
        let (push, pull) = (pair.push(), pair.pull());
        if !ctx.settled(&[&push, &pull])? {
            return Ok(Progress::Running);
        }
        match self.phase {
            Phase::Premotion | Phase::Refill => self.pressurise(ctx)?,
            Phase::PrePressure => self.start_stroke(ctx)?,
            Phase::Exchange => {
                let moved = self.stroke_start - push.volume().unwrap_or(self.stroke_start);
                self.exchanged += moved.max(0.0);
                if self.params.onetime || self.remaining() <= push.volume_of(1) {
                    log::info!("Intermittent: finished after {:.1} uL", self.exchanged);
                    self.phase = Phase::Idle;
                    return Ok(Progress::Finished);
                }
                self.refill(ctx, &push, &pull)?;
                self.phase = Phase::Refill;
            }
            Phase::Idle => {}
        }
        Ok(Progress::Running)
    }

    fn stop(&mut self, _ctx: &ModeContext) -> Result<()> {
        if self.phase != Phase::Idle {
            self.pair()?.stop()?;
            self.phase = Phase::Idle;
        }
        Ok(())
    }

    fn set_rate(&mut self, _ctx: &ModeContext, rate: f64) -> Result<()> {
        if rate > self.params.refill_rate {
            return Err(PumpError::InvalidArgument(format!(
                "exchange rate {:.1} uL/s above refill rate {:.1} uL/s",
                rate, self.params.refill_rate
            )));
        }
        if self.phase == Phase::Exchange {
            self.pair()?.set_rate(rate)?;
        }
        self.params.exchange_rate = rate;
        Ok(())
    }

    /// Unbalances the running stroke by `dose.rate` until `dose.volume` has shifted
    fn dose(&mut self, _ctx: &ModeContext, dose: Dose) -> Result<()> {
        if self.phase != Phase::Exchange {
            return Err(PumpError::InvalidArgument(format!(
                "doses are taken during an exchange stroke, not in {}",
                self.phase()
            )));
        }
        let pair = self.pair()?;
        match dose.direction {
            DoseDirection::Add => pair.increase_volume(dose.volume, dose.rate),
            DoseDirection::Remove => pair.decrease_volume(dose.volume, dose.rate),
        }
    }
}
