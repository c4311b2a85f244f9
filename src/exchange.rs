//! Two syringes driven in opposite phase through the cell.
//!
//! Both sides are programmed as buffered command strings and started with one
//! run command on their shared pair or quad address, so the device clocks
//! start together. Without a shared address the start degrades to two
//! sequential dispatches and the caller is told so.

use crate::codec;
use crate::command::{Command, CommandString};
use crate::config::{Config, PairConfig, PortMap};
use crate::constants::*;
use crate::devices::{DeviceSet, Syringe};
use crate::error::{PumpError, Result};
use crate::types::{Dispatch, ValveTarget};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// How the two sides of a pair were started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchrony {
    /// One run command on the shared address
    Simultaneous,
    /// Two dispatches, offset by a serial round trip
    Sequential,
}

/// Optional extras of a pair
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairSettings {
    pub default_rate: Option<f64>,
    pub fill_rate: Option<f64>,
    pub drain_rate: Option<f64>,
    /// uL pushed out before the push side meets the cell
    pub pre_pressure: f64,
    pub pre_pressure_rate: Option<f64>,
    /// uL drawn by the pull side before it meets the cell
    pub under_pressure: f64,
    pub under_pressure_rate: Option<f64>,
    /// Milliseconds the pull side lags the push side
    pub dispense_delay: u32,
    /// uL purged to waste before pressurising
    pub bubble_dispense: f64,
}

impl From<&PairConfig> for PairSettings {
    fn from(config: &PairConfig) -> Self {
        PairSettings {
            default_rate: config.default_rate,
            fill_rate: config.default_fill_rate,
            drain_rate: config.default_drain_rate,
            pre_pressure: config.pre_pressure,
            pre_pressure_rate: config.pre_pressure_rate,
            under_pressure: config.under_pressure,
            under_pressure_rate: config.under_pressure_rate,
            dispense_delay: config.dispense_delay,
            bubble_dispense: config.bubble_dispense,
        }
    }
}

/// Valve targets of one side
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SidePorts {
    pub reservoir: Option<ValveTarget>,
    pub waste: Option<ValveTarget>,
    pub cell: Option<ValveTarget>,
}

impl SidePorts {
    /// Explicit positions win over the syringe's own `Reservoir/Waste/Cell` aliases
    pub fn resolve(map: &PortMap, syringe: &Syringe) -> Self {
        let pick = |position: Option<u8>, alias: &str| match position {
            Some(p) => Some(ValveTarget::Position(p)),
            None if syringe.valve().has_alias(alias) => Some(ValveTarget::Alias(alias.to_string())),
            None => None,
        };
        SidePorts {
            reservoir: pick(map.reservoir, "Reservoir"),
            waste: pick(map.waste, "Waste"),
            cell: pick(map.cell, "Cell"),
        }
    }

    fn cell(&self, side: &str) -> Result<ValveTarget> {
        self.cell
            .clone()
            .ok_or_else(|| PumpError::UnknownAlias(format!("{} side has no Cell port", side)))
    }
}

struct PairState {
    push: Arc<Syringe>,
    pull: Arc<Syringe>,
    push_ports: SidePorts,
    pull_ports: SidePorts,
    /// Nominal exchange rate of the running or next stroke
    rate: Option<f64>,
}

/// Push/pull syringe pair
pub struct ExchangePair {
    name: String,
    settings: PairSettings,
    state: Mutex<PairState>,
}

impl ExchangePair {
    pub fn new(
        name: impl Into<String>,
        push: Arc<Syringe>,
        pull: Arc<Syringe>,
        push_ports: SidePorts,
        pull_ports: SidePorts,
        settings: PairSettings,
    ) -> Result<Self> {
        if push.id() == pull.id() {
            return Err(PumpError::InvalidArgument(
                "exchange pair needs two different syringes".to_string(),
            ));
        }
        let name = name.into();
        if codec::shared_address(push.id(), pull.id()).is_none() {
            log::warn!(
                "Pair {}: syringes {} and {} share no broadcast address; starts will be sequential",
                name,
                push.id(),
                pull.id()
            );
        }
        Ok(ExchangePair {
            name,
            state: Mutex::new(PairState {
                push,
                pull,
                push_ports,
                pull_ports,
                rate: settings.default_rate,
            }),
            settings,
        })
    }

    /// Build a configured pair from the session's proxies
    pub fn from_config(name: &str, pair: &PairConfig, config: &Config, devices: &DeviceSet) -> Result<Self> {
        let [push_ref, pull_ref] = pair.args.as_slice() else {
            return Err(PumpError::InvalidArgument(format!(
                "pair {} needs exactly two syringes",
                name
            )));
        };
        let push = devices.syringe(config.resolve_device(push_ref)?)?;
        let pull = devices.syringe(config.resolve_device(pull_ref)?)?;
        let push_ports = SidePorts::resolve(&pair.push_syr, &push);
        let pull_ports = SidePorts::resolve(&pair.pull_syr, &pull);
        ExchangePair::new(name, push, pull, push_ports, pull_ports, PairSettings::from(pair))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &PairSettings {
        &self.settings
    }

    pub fn push(&self) -> Arc<Syringe> {
        Arc::clone(&self.state.lock().push)
    }

    pub fn pull(&self) -> Arc<Syringe> {
        Arc::clone(&self.state.lock().pull)
    }

    pub fn ports(&self) -> (SidePorts, SidePorts) {
        let state = self.state.lock();
        (state.push_ports.clone(), state.pull_ports.clone())
    }

    /// Broadcast address reaching both syringes
    pub fn shared_address(&self) -> Option<u8> {
        let state = self.state.lock();
        codec::shared_address(state.push.id(), state.pull.id())
    }

    /// Largest stroke both sides can make
    pub fn exchangeable_volume(&self) -> f64 {
        let (push, pull) = (self.push(), self.pull());
        let available = push.volume().unwrap_or(0.0);
        let headroom = pull.headroom().unwrap_or(0.0);
        available.min(headroom).max(0.0)
    }

    pub fn rate(&self) -> Option<f64> {
        self.state.lock().rate
    }

    pub fn is_busy(&self) -> bool {
        let (push, pull) = (self.push(), self.pull());
        push.is_busy() || pull.is_busy()
    }

    /// Both sides in motion, i.e. a stroke is under way
    pub fn is_exchanging(&self) -> bool {
        let (push, pull) = (self.push(), self.pull());
        push.is_busy() && pull.is_busy()
    }

    /// Exchange the push and pull roles
    pub fn swap(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;
        std::mem::swap(&mut state.push, &mut state.pull);
        std::mem::swap(&mut state.push_ports, &mut state.pull_ports);
        log::info!(
            "Pair {}: push is now {}, pull is now {}",
            self.name,
            state.push.name(),
            state.pull.name()
        );
    }

    /// Start two buffered programs together
    pub fn run_both(&self, push_program: CommandString, pull_program: CommandString) -> Result<Synchrony> {
        let (push, pull) = (self.push(), self.pull());
        match self.shared_address() {
            Some(address) => {
                let a = push.valve().issue(push_program, Dispatch::ENQUEUE)?;
                let b = pull.valve().issue(pull_program, Dispatch::ENQUEUE)?;
                a.wait()?;
                b.wait()?;
                let run = CommandString::new().finish(false);
                push.valve()
                    .bus()
                    .send(address, &run, PRIORITY_COMMAND)?
                    .wait()?;
                Ok(Synchrony::Simultaneous)
            }
            None => {
                log::warn!("Pair {}: starting sides sequentially", self.name);
                let a = push.valve().issue(push_program, Dispatch::RUN)?;
                let b = pull.valve().issue(pull_program, Dispatch::RUN)?;
                a.wait()?;
                b.wait()?;
                Ok(Synchrony::Sequential)
            }
        }
    }

    /// Fill push, empty pull, purge bubbles and pressurise both sides at the cell
    pub fn prepare(&self) -> Result<Synchrony> {
        let (push, pull) = (self.push(), self.pull());
        let (push_ports, pull_ports) = self.ports();
        let s = &self.settings;

        let mut push_program = push
            .fill(push_ports.reservoir.clone(), s.fill_rate, Dispatch::COMPOSE)?
            .into_command();
        if s.bubble_dispense > 0.0 {
            let purge = push.dispense(s.bubble_dispense, s.fill_rate, push_ports.waste.clone(), Dispatch::COMPOSE)?;
            push_program.append(purge.command());
        }
        let push_cell = push.valve().resolve(&push_ports.cell("push")?)?;
        push_program.push(Command::MoveValve(push_cell));
        if s.pre_pressure > 0.0 {
            let pressure = push.dispense(s.pre_pressure, s.pre_pressure_rate, None, Dispatch::COMPOSE)?;
            push_program.append(pressure.command());
        }

        let mut pull_program = pull
            .drain(pull_ports.waste.clone(), s.drain_rate, Dispatch::COMPOSE)?
            .into_command();
        let pull_cell = pull.valve().resolve(&pull_ports.cell("pull")?)?;
        pull_program.push(Command::MoveValve(pull_cell));
        if s.under_pressure > 0.0 {
            let suction = pull.pickup(s.under_pressure, s.under_pressure_rate, None, Dispatch::COMPOSE)?;
            pull_program.append(suction.command());
        }

        log::info!("Pair {}: prepare", self.name);
        let synchrony = self.run_both(push_program, pull_program)?;
        self.join(None)?;
        Ok(synchrony)
    }

    /// Program one stroke of `volume` and start it without waiting for completion.
    ///
    /// The stroke only turns both valves to the cell. Pre-pressure and
    /// under-pressure are applied once by [`ExchangePair::prepare`], which is
    /// expected to have run since the last refill.
    pub fn start_exchange(&self, volume: f64, rate: Option<f64>) -> Result<Synchrony> {
        let (push, pull) = (self.push(), self.pull());
        if push.is_busy() || pull.is_busy() {
            return Err(PumpError::InvalidArgument(format!(
                "pair {} is still moving",
                self.name
            )));
        }
        let rate = rate
            .or(self.rate())
            .ok_or_else(|| PumpError::InvalidArgument(format!("pair {} has no exchange rate", self.name)))?;
        push.check_rate(rate, false)?;
        pull.check_rate(rate, false)?;
        let available = self.exchangeable_volume();
        if volume > available + push.volume_of(1) {
            return Err(PumpError::InsufficientVolume {
                requested: volume,
                available,
            });
        }
        let (push_ports, pull_ports) = self.ports();

        let push_program = push
            .dispense(volume, Some(rate), Some(push_ports.cell("push")?), Dispatch::COMPOSE)?
            .into_command();
        let mut pull_program = CommandString::new();
        if self.settings.dispense_delay > 0 {
            pull_program.push(Command::Delay(self.settings.dispense_delay));
        }
        let pickup = pull.pickup(volume, Some(rate), Some(pull_ports.cell("pull")?), Dispatch::COMPOSE)?;
        pull_program.append(pickup.command());

        self.state.lock().rate = Some(rate);
        log::info!("Pair {}: exchange {:.1} uL at {:.1} uL/s", self.name, volume, rate);
        self.run_both(push_program, pull_program)
    }

    /// One stroke of `volume`, waiting for both sides to finish. Expects
    /// `prepare` to have filled and pressurised the pair.
    pub fn exchange(&self, volume: f64, rate: Option<f64>) -> Result<Synchrony> {
        let synchrony = self.start_exchange(volume, rate)?;
        self.join(None)?;
        Ok(synchrony)
    }

    /// Change the exchange rate; applied on the fly while a stroke runs
    pub fn set_rate(&self, rate: f64) -> Result<()> {
        let (push, pull) = (self.push(), self.pull());
        if self.is_exchanging() {
            push.check_rate(rate, true)?;
            pull.check_rate(rate, true)?;
            let a = push.set_rate(rate)?;
            let b = pull.set_rate(rate)?;
            for issued in [a, b].into_iter().flatten() {
                issued.wait()?;
            }
        } else {
            push.check_rate(rate, false)?;
            pull.check_rate(rate, false)?;
        }
        self.state.lock().rate = Some(rate);
        Ok(())
    }

    /// Add `volume` to the cell
    pub fn increase_volume(&self, volume: f64, rate: Option<f64>) -> Result<()> {
        self.adjust_volume(volume, rate, true)
    }

    /// Remove `volume` from the cell
    pub fn decrease_volume(&self, volume: f64, rate: Option<f64>) -> Result<()> {
        self.adjust_volume(volume, rate, false)
    }

    /// During a stroke the two rates are unbalanced for as long as it takes to
    /// shift `volume`; on an idle pair a plain dispense or pickup is made.
    fn adjust_volume(&self, volume: f64, rate: Option<f64>, increase: bool) -> Result<()> {
        if !volume.is_finite() || volume <= 0.0 {
            return Err(PumpError::InvalidArgument(format!("volume {}", volume)));
        }
        let (push, pull) = (self.push(), self.pull());
        let (push_ports, pull_ports) = self.ports();

        if !self.is_exchanging() {
            let issued = if increase {
                push.dispense(volume, rate, Some(push_ports.cell("push")?), Dispatch::RUN)?
            } else {
                pull.pickup(volume, rate, Some(pull_ports.cell("pull")?), Dispatch::RUN)?
            };
            issued.wait()?;
            return self.join(None);
        }

        let nominal = self
            .rate()
            .ok_or_else(|| PumpError::InvalidArgument(format!("pair {} has no exchange rate", self.name)))?;
        let imbalance = rate.unwrap_or(nominal);
        let (faster, slower) = if increase { (&push, &pull) } else { (&pull, &push) };

        let mut slow_rate = nominal - imbalance;
        let mut fast_rate = nominal;
        if slow_rate < slower.min_rate() {
            slow_rate = slower.min_rate();
            fast_rate = slow_rate + imbalance;
        }
        let fast_velocity = faster.check_rate(fast_rate, true)?;
        let slow_velocity = slower.check_rate(slow_rate, true)?;
        faster.check_rate(nominal, true)?;
        slower.check_rate(nominal, true)?;

        let effective = faster.rate_of(fast_velocity as f64) - slower.rate_of(slow_velocity as f64);
        if effective <= 0.0 {
            return Err(PumpError::InvalidArgument(format!(
                "rate imbalance {:.3} uL/s too small",
                imbalance
            )));
        }
        let duration = Duration::from_secs_f64(volume / effective);
        log::info!(
            "Pair {}: {} {:.1} uL over {:.2} s ({:.1} vs {:.1} uL/s)",
            self.name,
            if increase { "add" } else { "remove" },
            volume,
            duration.as_secs_f64(),
            fast_rate,
            slow_rate
        );

        let a = faster.set_rate(fast_rate)?;
        let b = slower.set_rate(slow_rate)?;
        for issued in [a, b].into_iter().flatten() {
            issued.wait()?;
        }
        std::thread::sleep(duration.saturating_sub(SEND_LATENCY));
        let a = faster.set_rate(nominal)?;
        let b = slower.set_rate(nominal)?;
        for issued in [a, b].into_iter().flatten() {
            issued.wait()?;
        }
        Ok(())
    }

    /// Halt both sides, together when they share an address
    pub fn stop(&self) -> Result<()> {
        let (push, pull) = (self.push(), self.pull());
        match self.shared_address() {
            Some(address) => {
                push.valve().bus().stop(address)?.wait()?;
            }
            None => {
                push.stop()?;
                pull.stop()?;
            }
        }
        log::info!("Pair {}: stopped", self.name);
        Ok(())
    }

    pub fn join(&self, timeout: Option<Duration>) -> Result<()> {
        let (push, pull) = (self.push(), self.pull());
        push.join(timeout)?;
        pull.join(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusOptions, BusServer};
    use crate::transport::SimulatedBus;

    struct Rig {
        sim: SimulatedBus,
        _server: BusServer,
        pair: ExchangePair,
    }

    fn rig(push_id: u8, pull_id: u8, settings: PairSettings) -> Rig {
        let sim = SimulatedBus::new()
            .with_syringe(push_id)
            .with_syringe(pull_id)
            .with_time_scale(40.0);
        let options = BusOptions {
            timeout: Duration::from_millis(10),
            scan_ids: vec![push_id, pull_id],
            ..BusOptions::default()
        };
        let server = BusServer::with_transport(Box::new(sim.clone()), options).unwrap();
        let push = Arc::new(Syringe::new(server.handle(), push_id, "push", 12_500.0).unwrap());
        let pull = Arc::new(Syringe::new(server.handle(), pull_id, "pull", 12_500.0).unwrap());
        for (p, a) in [(1, "Reservoir"), (2, "Waste"), (3, "Cell")] {
            push.valve().set_alias(p, a).unwrap();
        }
        for (p, a) in [(1, "Cell"), (2, "Waste")] {
            pull.valve().set_alias(p, a).unwrap();
        }
        let push_ports = SidePorts::resolve(&PortMap::default(), &push);
        let pull_ports = SidePorts::resolve(&PortMap::default(), &pull);
        let pair = ExchangePair::new("test", push, pull, push_ports, pull_ports, settings).unwrap();
        Rig {
            sim,
            _server: server,
            pair,
        }
    }

    #[test]
    fn ports_prefer_explicit_positions() {
        let rig = rig(1, 2, PairSettings::default());
        let map = PortMap {
            cell: Some(4),
            ..PortMap::default()
        };
        let ports = SidePorts::resolve(&map, &rig.pair.push());
        assert_eq!(ports.cell, Some(ValveTarget::Position(4)));
        assert_eq!(ports.waste, Some(ValveTarget::Alias("Waste".to_string())));
        let (_, pull) = rig.pair.ports();
        assert_eq!(pull.reservoir, None);
    }

    #[test]
    fn exchange_conserves_volume() {
        let rig = rig(1, 2, PairSettings::default());
        rig.sim.set_position(1, MAX_MICROSTEPS);
        std::thread::sleep(Duration::from_millis(50));
        let synchrony = rig.pair.exchange(5_000.0, Some(1_000.0)).unwrap();
        assert_eq!(synchrony, Synchrony::Simultaneous);
        let pushed = MAX_MICROSTEPS - rig.sim.position(1).unwrap();
        let pulled = rig.sim.position(2).unwrap();
        assert!((pushed as i64 - pulled as i64).abs() <= 1);
        assert_eq!(pushed, 76_800);
        assert_eq!(rig.sim.valve(1), Some(3));
        assert_eq!(rig.sim.valve(2), Some(1));
        let runs: Vec<_> = rig
            .sim
            .commands()
            .into_iter()
            .filter(|(address, _)| *address == 0x41)
            .collect();
        assert_eq!(runs, vec![(0x41, "R".to_string())]);
    }

    #[test]
    fn unshared_pair_reports_sequential_start() {
        let rig = rig(1, 5, PairSettings::default());
        rig.sim.set_position(1, MAX_MICROSTEPS);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(rig.pair.shared_address(), None);
        let synchrony = rig.pair.exchange(1_000.0, Some(1_000.0)).unwrap();
        assert_eq!(synchrony, Synchrony::Sequential);
    }

    #[test]
    fn exchange_is_bounded_by_contents() {
        let rig = rig(1, 2, PairSettings::default());
        rig.sim.set_position(1, 96_000);
        std::thread::sleep(Duration::from_millis(50));
        assert!(matches!(
            rig.pair.start_exchange(7_000.0, Some(500.0)),
            Err(PumpError::InsufficientVolume { .. })
        ));
        assert!(rig.sim.commands().iter().all(|(address, _)| *address == GLOBAL_ADDRESS));
    }

    #[test]
    fn prepare_fills_pressurises_and_swaps() {
        let settings = PairSettings {
            fill_rate: Some(1_000.0),
            drain_rate: Some(1_000.0),
            pre_pressure: 50.0,
            pre_pressure_rate: Some(100.0),
            under_pressure: 25.0,
            under_pressure_rate: Some(100.0),
            ..PairSettings::default()
        };
        let rig = rig(3, 4, settings);
        rig.sim.set_position(4, 50_000);
        std::thread::sleep(Duration::from_millis(50));
        rig.pair.prepare().unwrap();
        assert_eq!(rig.sim.position(3), Some(MAX_MICROSTEPS - 768));
        assert_eq!(rig.sim.position(4), Some(384));
        assert_eq!(rig.sim.valve(3), Some(3));
        assert_eq!(rig.sim.valve(4), Some(1));

        rig.pair.swap();
        assert_eq!(rig.pair.push().id(), 4);
        assert_eq!(rig.pair.pull().id(), 3);
    }

    #[test]
    fn strokes_after_prepare_are_not_pressurised_again() {
        let settings = PairSettings {
            fill_rate: Some(1_000.0),
            drain_rate: Some(1_000.0),
            pre_pressure: 50.0,
            under_pressure: 25.0,
            ..PairSettings::default()
        };
        let rig = rig(3, 4, settings);
        rig.pair.prepare().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        rig.sim.clear_received();

        rig.pair.exchange(1_000.0, Some(500.0)).unwrap();
        let sent = rig.sim.commands();
        assert!(sent.iter().any(|(a, c)| *a == 0x33 && c.contains("D15360")));
        assert!(sent.iter().all(|(_, c)| !c.contains("D768") && !c.contains("P384")));
        assert_eq!(rig.sim.position(3), Some(MAX_MICROSTEPS - 768 - 15_360));
        assert_eq!(rig.sim.position(4), Some(384 + 15_360));
    }

    #[test]
    fn on_the_fly_rate_respects_envelope() {
        let rig = rig(1, 2, PairSettings::default());
        rig.sim.set_position(1, MAX_MICROSTEPS);
        std::thread::sleep(Duration::from_millis(50));
        rig.pair.start_exchange(10_000.0, Some(100.0)).unwrap();
        assert!(rig.pair.is_exchanging());
        assert!(matches!(
            rig.pair.set_rate(1_000.0),
            Err(PumpError::RateOutOfBounds { .. })
        ));
        rig.pair.set_rate(150.0).unwrap();
        assert_eq!(rig.sim.top_velocity(1), Some(576));
        assert_eq!(rig.sim.top_velocity(2), Some(576));
        rig.pair.stop().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(!rig.sim.is_busy(1));
        assert!(!rig.sim.is_busy(2));
    }
}
