use super::{Device, DeviceConfig, Issued, Valve};
use crate::bus::BusHandle;
use crate::command::{Command, CommandString, Query};
use crate::constants::*;
use crate::error::{PumpError, Result};
use crate::status::SyringeStatus;
use crate::types::{Dispatch, ValveTarget};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Plunger velocity in steps/s of an init speed code
pub fn init_velocity(code: u8) -> Option<f64> {
    match code {
        0 | 1 => Some(FAST_INIT_VELOCITY),
        2..=FAST_INIT_LAST_CODE => Some(FAST_INIT_VELOCITY - FAST_INIT_STEP * (code - 1) as f64),
        c if c <= MAX_INIT_SPEED_CODE => {
            Some(SLOW_INIT_VELOCITY - SLOW_INIT_STEP * (c - FAST_INIT_LAST_CODE - 1) as f64)
        }
        _ => None,
    }
}

#[derive(Debug, Default)]
struct SyringeState {
    /// Rate applied to the next motion, uL/s
    rate: Option<f64>,
    default_fill_rate: Option<f64>,
    default_drain_rate: Option<f64>,
    start_rate: Option<f64>,
    stop_rate: Option<f64>,
    return_volume: Option<f64>,
    backoff_volume: Option<f64>,
    acceleration: Option<u8>,
    encoder_init: bool,
}

/// Proxy of a syringe drive
pub struct Syringe {
    valve: Valve,
    max_volume: f64,
    state: Mutex<SyringeState>,
}

impl Syringe {
    pub fn new(bus: BusHandle, id: u8, name: impl Into<String>, max_volume: f64) -> Result<Self> {
        if !(max_volume.is_finite() && max_volume > 0.0) {
            return Err(PumpError::InvalidArgument(format!(
                "syringe volume {}",
                max_volume
            )));
        }
        Ok(Syringe {
            valve: Valve::new(bus, id, name)?,
            max_volume,
            state: Mutex::new(SyringeState::default()),
        })
    }

    pub fn valve(&self) -> &Valve {
        &self.valve
    }

    pub fn id(&self) -> u8 {
        self.valve.id()
    }

    pub fn name(&self) -> &str {
        self.valve.name()
    }

    pub fn max_volume(&self) -> f64 {
        self.max_volume
    }

    pub fn set_default_rates(&self, fill: Option<f64>, drain: Option<f64>) {
        let mut state = self.state.lock();
        state.default_fill_rate = fill;
        state.default_drain_rate = drain;
    }

    pub fn set_motion_profile(
        &self,
        start_rate: Option<f64>,
        stop_rate: Option<f64>,
        return_volume: Option<f64>,
        backoff_volume: Option<f64>,
        acceleration: Option<u8>,
    ) {
        let mut state = self.state.lock();
        state.start_rate = start_rate;
        state.stop_rate = stop_rate;
        state.return_volume = return_volume;
        state.backoff_volume = backoff_volume;
        state.acceleration = acceleration;
    }

    pub fn allow_encoder_init(&self, allowed: bool) {
        self.state.lock().encoder_init = allowed;
    }

    // Unit conversions

    pub fn microsteps(&self, volume: f64) -> u32 {
        (volume * MAX_MICROSTEPS as f64 / self.max_volume).round().max(0.0) as u32
    }

    pub fn volume_of(&self, microsteps: u32) -> f64 {
        self.max_volume / MAX_MICROSTEPS as f64 * microsteps as f64
    }

    fn steps(&self, volume: f64) -> u32 {
        (volume * MAX_STEPS as f64 / self.max_volume).round().max(0.0) as u32
    }

    pub fn velocity(&self, rate: f64) -> u32 {
        (rate * MAX_STEPS as f64 / self.max_volume).round().max(0.0) as u32
    }

    pub fn rate_of(&self, velocity: f64) -> f64 {
        self.max_volume / MAX_STEPS as f64 * velocity
    }

    pub fn min_rate(&self) -> f64 {
        self.rate_of(MIN_VELOCITY as f64)
    }

    pub fn max_rate(&self) -> f64 {
        self.rate_of(MAX_VELOCITY as f64)
    }

    pub fn max_rate_onfly(&self) -> f64 {
        self.rate_of(MAX_ONFLY_VELOCITY as f64)
    }

    /// Velocity for `rate`, checked against the at-rest or on-the-fly ceiling
    pub fn check_rate(&self, rate: f64, busy: bool) -> Result<u32> {
        let max = if busy {
            self.max_rate_onfly()
        } else {
            self.max_rate()
        };
        let min = self.min_rate();
        if !rate.is_finite() || rate < min || rate > max {
            return Err(PumpError::RateOutOfBounds { rate, min, max });
        }
        Ok(self.velocity(rate).clamp(MIN_VELOCITY, MAX_VELOCITY))
    }

    // Observed state

    pub fn position(&self) -> Option<u32> {
        self.valve.status().and_then(|s| s.syringe_pos)
    }

    /// Volume held, uL
    pub fn volume(&self) -> Option<f64> {
        self.position().map(|p| self.volume_of(p))
    }

    /// Volume that still fits, uL
    pub fn headroom(&self) -> Option<f64> {
        self.volume().map(|v| self.max_volume - v)
    }

    /// Rate applied to the next motion
    pub fn rate(&self) -> Option<f64> {
        self.state.lock().rate
    }

    pub fn is_busy(&self) -> bool {
        self.valve.is_busy()
    }

    /// Wait until ready, then raise whatever fault the drive reports
    pub fn join(&self, timeout: Option<Duration>) -> Result<()> {
        self.valve.join(timeout)?;
        self.check_syringe_error()
    }

    pub fn stop(&self) -> Result<()> {
        self.valve.stop()
    }

    /// Read the syringe status word and raise a syringe fault
    pub fn check_syringe_error(&self) -> Result<()> {
        SyringeStatus(self.valve.status_word(Query::SyringeStatus)?)
            .raise_if_error(self.id(), self.valve.address())
    }

    /// Valve and syringe faults, read fresh from the drive
    pub fn check_faults(&self) -> Result<()> {
        self.valve.check_valve_error()?;
        self.check_syringe_error()
    }

    /// Last status byte error, then valve and syringe faults
    pub fn check_errors(&self) -> Result<()> {
        self.valve.check_status()?;
        self.check_faults()
    }

    /// Set the rate; a busy drive is changed on the fly within the reduced envelope
    pub fn set_rate(&self, rate: f64) -> Result<Option<Issued>> {
        let busy = self.is_busy();
        let velocity = self.check_rate(rate, busy)?;
        self.state.lock().rate = Some(rate);
        if !busy {
            return Ok(None);
        }
        log::debug!("{}: on-the-fly rate {:.2} uL/s (V{})", self.name(), rate, velocity);
        self.valve
            .issue(CommandString::from(Command::TopVelocity(velocity)), Dispatch::RUN)
            .map(Some)
    }

    // Motion

    fn program(&self, valve: Option<ValveTarget>, rate: Option<f64>, motion: Command) -> Result<CommandString> {
        let mut command = CommandString::new();
        if let Some(target) = valve {
            command.push(Command::MoveValve(self.valve.resolve(&target)?));
        }
        if let Some(rate) = rate.or_else(|| self.rate()) {
            command.push(Command::TopVelocity(self.check_rate(rate, false)?));
        }
        command.push(motion);
        Ok(command)
    }

    fn check_volume(&self, volume: f64) -> Result<u32> {
        if !volume.is_finite() || volume <= 0.0 || volume > self.max_volume {
            return Err(PumpError::InvalidArgument(format!(
                "volume {} outside (0, {}]",
                volume, self.max_volume
            )));
        }
        Ok(self.microsteps(volume))
    }

    /// Push `volume` out of the syringe
    pub fn dispense(
        &self,
        volume: f64,
        rate: Option<f64>,
        valve: Option<ValveTarget>,
        dispatch: Dispatch,
    ) -> Result<Issued> {
        let microsteps = self.check_volume(volume)?;
        if !dispatch.enqueue {
            let position = self.position().unwrap_or(0);
            if position < microsteps {
                return Err(PumpError::InsufficientVolume {
                    requested: volume,
                    available: self.volume_of(position),
                });
            }
        }
        let command = self.program(valve, rate, Command::Dispense(microsteps))?;
        self.valve.issue(command, dispatch)
    }

    /// Draw `volume` into the syringe
    pub fn pickup(
        &self,
        volume: f64,
        rate: Option<f64>,
        valve: Option<ValveTarget>,
        dispatch: Dispatch,
    ) -> Result<Issued> {
        let microsteps = self.check_volume(volume)?;
        if !dispatch.enqueue {
            let position = self.position().unwrap_or(0);
            if position + microsteps > MAX_MICROSTEPS {
                return Err(PumpError::CapacityExceeded {
                    requested: volume,
                    headroom: self.volume_of(MAX_MICROSTEPS - position.min(MAX_MICROSTEPS)),
                });
            }
        }
        let command = self.program(valve, rate, Command::Pickup(microsteps))?;
        self.valve.issue(command, dispatch)
    }

    /// Move the plunger to the absolute `volume`
    pub fn set_volume(
        &self,
        volume: f64,
        rate: Option<f64>,
        valve: Option<ValveTarget>,
        dispatch: Dispatch,
    ) -> Result<Issued> {
        if !volume.is_finite() || volume < 0.0 || volume > self.max_volume {
            return Err(PumpError::InvalidArgument(format!(
                "volume {} outside [0, {}]",
                volume, self.max_volume
            )));
        }
        let command = self.program(valve, rate, Command::Absolute(self.microsteps(volume)))?;
        self.valve.issue(command, dispatch)
    }

    /// Fill completely, by default from the `Reservoir` port at the default fill rate
    pub fn fill(&self, valve: Option<ValveTarget>, rate: Option<f64>, dispatch: Dispatch) -> Result<Issued> {
        let valve = valve.or_else(|| self.default_port("Reservoir"));
        let rate = rate.or(self.state.lock().default_fill_rate);
        let command = self.program(valve, rate, Command::Absolute(MAX_MICROSTEPS))?;
        self.valve.issue(command, dispatch)
    }

    /// Empty completely, by default to the `Waste` port at the default drain rate
    pub fn drain(&self, valve: Option<ValveTarget>, rate: Option<f64>, dispatch: Dispatch) -> Result<Issued> {
        let valve = valve.or_else(|| self.default_port("Waste"));
        let rate = rate.or(self.state.lock().default_drain_rate);
        let command = self.program(valve, rate, Command::Absolute(0))?;
        self.valve.issue(command, dispatch)
    }

    fn default_port(&self, alias: &str) -> Option<ValveTarget> {
        if self.valve.has_alias(alias) {
            Some(ValveTarget::Alias(alias.to_string()))
        } else {
            None
        }
    }

    /// Pause inside a buffered sequence
    pub fn delay(&self, milliseconds: u32, dispatch: Dispatch) -> Result<Issued> {
        self.valve
            .issue(CommandString::from(Command::Delay(milliseconds)), dispatch)
    }

    // Initialisation and configuration

    /// Init speed code whose tabled rate is closest to `rate`
    pub fn init_speed_code(&self, rate: f64) -> Result<u8> {
        let min = self.rate_of(init_velocity(MAX_INIT_SPEED_CODE).unwrap_or(MIN_VELOCITY as f64));
        let max = self.rate_of(FAST_INIT_VELOCITY);
        if !rate.is_finite() || rate < min || rate > max {
            return Err(PumpError::InvalidArgument(format!(
                "init rate {:.3} uL/s outside [{:.3}, {:.3}]",
                rate, min, max
            )));
        }
        let mut best = (1u8, f64::INFINITY);
        for code in 1..=MAX_INIT_SPEED_CODE {
            if let Some(velocity) = init_velocity(code) {
                let distance = (self.rate_of(velocity) - rate).abs();
                if distance < best.1 {
                    best = (code, distance);
                }
            }
        }
        Ok(best.0)
    }

    /// Configuration derived from the stored motion profile
    pub fn device_config(&self) -> DeviceConfig {
        let state = self.state.lock();
        DeviceConfig {
            valve_type: self.valve.valve_type(),
            start_velocity: state.start_rate.map(|r| self.velocity(r)),
            top_velocity: None,
            stop_velocity: state.stop_rate.map(|r| self.velocity(r)),
            return_steps: state.return_volume.map(|v| self.steps(v)),
            acceleration: state.acceleration,
        }
    }

    /// Initialise the plunger at `valve`, then push the stored configuration
    pub fn init_syringe(
        &self,
        valve: impl Into<ValveTarget>,
        rate: f64,
        backoff_volume: Option<f64>,
        dispatch: Dispatch,
    ) -> Result<Issued> {
        let code = self.init_speed_code(rate)?;
        let position = self.valve.resolve(&valve.into())?;
        let backoff = backoff_volume.or(self.state.lock().backoff_volume);

        let mut command = CommandString::new();
        if let Some(volume) = backoff {
            if !(0.0..=self.max_volume).contains(&volume) {
                return Err(PumpError::InvalidArgument(format!("backoff volume {}", volume)));
            }
            command.push(Command::Backoff(self.steps(volume)));
        }
        command.push(Command::MoveValve(position));
        command.push(Command::InitSyringe(code));
        for primitive in self.device_config().commands()? {
            command.push(primitive);
        }
        log::info!("{}: init at valve {} with speed code {}", self.name(), position, code);
        self.valve.issue(command, dispatch)
    }

    /// Initialise from the encoder; only for drives configured to allow it
    pub fn init_from_encoder(&self, dispatch: Dispatch) -> Result<Issued> {
        if !self.state.lock().encoder_init {
            return Err(PumpError::InvalidArgument(format!(
                "{}: encoder init is not enabled",
                self.name()
            )));
        }
        self.valve
            .issue(CommandString::from(Command::InitFromEncoder), dispatch)
    }

    /// Push a configuration as one command string
    pub fn reconfigure(&self, config: &DeviceConfig, dispatch: Dispatch) -> Result<Issued> {
        let command: CommandString = config.commands()?.into_iter().collect();
        if config.valve_type.is_some() {
            self.valve.set_valve_type(config.valve_type)?;
        }
        if let Some(code) = config.acceleration {
            self.state.lock().acceleration = Some(code);
        }
        self.valve.issue(command, dispatch)
    }

    /// Convert rates and return volume to a configuration and push it
    pub fn reconfigure_rates(
        &self,
        start_rate: Option<f64>,
        stop_rate: Option<f64>,
        return_volume: Option<f64>,
        dispatch: Dispatch,
    ) -> Result<Issued> {
        for rate in [start_rate, stop_rate].into_iter().flatten() {
            self.check_rate(rate, false)?;
        }
        if let Some(volume) = return_volume {
            if !(0.0..=self.max_volume).contains(&volume) {
                return Err(PumpError::InvalidArgument(format!("return volume {}", volume)));
            }
        }
        {
            let mut state = self.state.lock();
            state.start_rate = start_rate.or(state.start_rate);
            state.stop_rate = stop_rate.or(state.stop_rate);
            state.return_volume = return_volume.or(state.return_volume);
        }
        let config = self.device_config();
        self.reconfigure(&config, dispatch)
    }

    /// Read the configuration back from the drive
    pub fn fetch_config(&self) -> Result<DeviceConfig> {
        let bus = self.valve.bus();
        let id = self.id();
        let read = |query| -> Result<u32> {
            let value = bus.query(id, query)?;
            u32::try_from(value).map_err(|_| PumpError::BusFraming(format!("{:?} = {}", query, value)))
        };
        Ok(DeviceConfig {
            valve_type: Some(self.valve.fetch_valve_type()?),
            start_velocity: Some(read(Query::StartVelocity)?),
            top_velocity: Some(read(Query::TopVelocity)?),
            stop_velocity: Some(read(Query::StopVelocity)?),
            return_steps: Some(read(Query::ReturnSteps)?),
            acceleration: None,
        })
    }
}

impl Device for Syringe {
    fn id(&self) -> u8 {
        self.valve.id()
    }

    fn name(&self) -> &str {
        self.valve.name()
    }

    fn as_valve(&self) -> &Valve {
        &self.valve
    }

    fn into_syringe(self: Arc<Self>) -> Option<Arc<Syringe>> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusOptions, BusServer};
    use crate::transport::SimulatedBus;

    fn rig(sim: &SimulatedBus) -> (BusServer, Syringe) {
        let options = BusOptions {
            timeout: Duration::from_millis(10),
            scan_ids: vec![1],
            ..BusOptions::default()
        };
        let server = BusServer::with_transport(Box::new(sim.clone()), options).unwrap();
        let syringe = Syringe::new(server.handle(), 1, "S1", 12_500.0).unwrap();
        syringe.valve().set_alias(1, "Reservoir").unwrap();
        syringe.valve().set_alias(2, "Waste").unwrap();
        syringe.valve().set_alias(3, "Cell").unwrap();
        (server, syringe)
    }

    #[test]
    fn init_table_endpoints() {
        assert_eq!(init_velocity(0), Some(3400.0));
        assert_eq!(init_velocity(1), Some(3400.0));
        assert_eq!(init_velocity(15), Some(600.0));
        assert_eq!(init_velocity(16), Some(200.0));
        assert_eq!(init_velocity(40), Some(2.0));
        assert_eq!(init_velocity(41), None);
    }

    #[test]
    fn conversions_follow_capacity() {
        let sim = SimulatedBus::new().with_syringe(1);
        let (_server, syringe) = rig(&sim);
        assert_eq!(syringe.microsteps(12_500.0), MAX_MICROSTEPS);
        assert_eq!(syringe.microsteps(6_250.0), 96_000);
        assert_eq!(syringe.velocity(1000.0), 3840);
        assert!((syringe.max_rate() - 12_500.0 / 48_000.0 * 5800.0).abs() < 1e-9);
    }

    #[test]
    fn rate_envelope_depends_on_motion() {
        let sim = SimulatedBus::new().with_syringe(1);
        let (_server, syringe) = rig(&sim);
        assert!(syringe.check_rate(1000.0, false).is_ok());
        assert!(matches!(
            syringe.check_rate(1000.0, true),
            Err(PumpError::RateOutOfBounds { .. })
        ));
        assert!(syringe.check_rate(0.1, false).is_err());
        assert!(syringe.check_rate(f64::NAN, false).is_err());
    }

    #[test]
    fn init_picks_nearest_code() {
        let sim = SimulatedBus::new().with_syringe(1);
        let (_server, syringe) = rig(&sim);
        let fast = syringe.rate_of(3400.0);
        assert_eq!(syringe.init_speed_code(fast).unwrap(), 1);
        let slow = syringe.rate_of(200.0);
        assert_eq!(syringe.init_speed_code(slow).unwrap(), 16);
        assert!(syringe.init_speed_code(fast * 2.0).is_err());

        syringe.set_motion_profile(Some(syringe.rate_of(900.0)), None, None, None, Some(14));
        let issued = syringe
            .init_syringe("Waste", fast, Some(100.0), Dispatch::COMPOSE)
            .unwrap();
        assert_eq!(issued.command().to_string(), "k384h26002h10001v900L14");
    }

    #[test]
    fn dispense_checks_content() {
        let sim = SimulatedBus::new().with_syringe(1);
        let (_server, syringe) = rig(&sim);
        assert!(matches!(
            syringe.dispense(100.0, None, None, Dispatch::RUN),
            Err(PumpError::InsufficientVolume { .. })
        ));
        // Buffered sequences are checked by the device when they run
        assert!(syringe.dispense(100.0, None, None, Dispatch::COMPOSE).is_ok());
        assert!(matches!(
            syringe.pickup(20_000.0, None, None, Dispatch::RUN),
            Err(PumpError::InvalidArgument(_))
        ));
    }

    #[test]
    fn drain_moves_to_waste() {
        let sim = SimulatedBus::new().with_syringe(1).with_time_scale(50.0);
        sim.set_position(1, MAX_MICROSTEPS);
        let (_server, syringe) = rig(&sim);
        let issued = syringe.drain(None, Some(1000.0), Dispatch::RUN).unwrap();
        assert_eq!(issued.command().to_string(), "h26002V3840A0R");
        issued.wait().unwrap();
        syringe.join(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(sim.position(1), Some(0));
        assert_eq!(sim.valve(1), Some(2));
        assert_eq!(syringe.volume(), Some(0.0));
    }

    #[test]
    fn overload_surfaces_when_the_move_settles() {
        let sim = SimulatedBus::new().with_syringe(1).with_time_scale(50.0);
        let (_server, syringe) = rig(&sim);
        syringe
            .pickup(1_000.0, Some(1000.0), Some("Reservoir".into()), Dispatch::RUN)
            .unwrap()
            .wait()
            .unwrap();
        sim.fault_syringe(1, 4);
        assert!(matches!(
            syringe.join(Some(Duration::from_secs(5))),
            Err(PumpError::Syringe { device: 1, .. })
        ));
        assert!(matches!(syringe.check_errors(), Err(PumpError::Syringe { .. })));
        sim.fault_syringe(1, 0);
        syringe.check_errors().unwrap();
    }

    #[test]
    fn on_the_fly_rate_is_sent_while_busy() {
        let sim = SimulatedBus::new().with_syringe(1);
        let (_server, syringe) = rig(&sim);
        assert!(syringe.set_rate(500.0).unwrap().is_none());
        syringe
            .pickup(5_000.0, Some(10.0), Some("Reservoir".into()), Dispatch::RUN)
            .unwrap()
            .wait()
            .unwrap();
        assert!(syringe.is_busy());
        assert!(syringe.set_rate(1000.0).is_err());
        syringe.set_rate(100.0).unwrap().unwrap().wait().unwrap();
        assert_eq!(sim.top_velocity(1), Some(384));
        syringe.stop().unwrap();
    }

    #[test]
    fn encoder_init_is_gated() {
        let sim = SimulatedBus::new().with_syringe(1);
        let (_server, syringe) = rig(&sim);
        assert!(syringe.init_from_encoder(Dispatch::COMPOSE).is_err());
        syringe.allow_encoder_init(true);
        assert_eq!(
            syringe.init_from_encoder(Dispatch::COMPOSE).unwrap().command().to_string(),
            "z"
        );
    }

    #[test]
    fn fetches_configuration() {
        let sim = SimulatedBus::new().with_syringe(1);
        let (_server, syringe) = rig(&sim);
        let config = DeviceConfig {
            valve_type: Some(2),
            start_velocity: Some(500),
            top_velocity: Some(2000),
            stop_velocity: Some(400),
            return_steps: Some(10),
            acceleration: None,
        };
        syringe.reconfigure(&config, Dispatch::RUN).unwrap().wait().unwrap();
        syringe.join(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(syringe.fetch_config().unwrap(), config);
    }
}
