//! In-process simulated device chain.
//!
//! `SimulatedBus` speaks the same framed protocol as the hardware: it checks
//! checksums, answers queries, buffers command strings without `R`, and runs
//! programs with plunger motion integrated over (optionally accelerated) time.
//! It backs demo sessions without hardware and the integration tests.

use super::Transport;
use crate::codec::{self, Scan};
use crate::command::{Command, Query};
use crate::config::Config;
use crate::constants::*;
use crate::error::Result;
use crate::status::{StatusByte, ANSWER_BIT, READY_BIT, STATUS_BUSY};
use crate::types::DeviceType;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Seconds a valve rotation takes
const VALVE_MOVE_SECONDS: f64 = 0.1;

/// Microsteps per velocity step
const MICROSTEPS_PER_STEP: f64 = (MAX_MICROSTEPS / MAX_STEPS) as f64;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Activity {
    Move { target: f64 },
    Wait { until: f64 },
}

#[derive(Debug, Clone)]
struct SimDevice {
    kind: DeviceType,
    firmware: String,
    position: f64,
    valve: u8,
    valve_type: u8,
    start_velocity: u32,
    top_velocity: u32,
    stop_velocity: u32,
    return_steps: u32,
    acceleration: u8,
    backoff: u32,
    initialized: bool,
    error: u8,
    /// Injected valve and syringe status words
    valve_fault: u16,
    syringe_fault: u16,
    buffer: Vec<Command>,
    program: VecDeque<Command>,
    activity: Option<Activity>,
    clock: f64,
}

impl SimDevice {
    fn new(kind: DeviceType) -> Self {
        SimDevice {
            kind,
            firmware: match kind {
                DeviceType::Mvp => "MVP SIM 1.0".to_string(),
                _ => "PSD/4 SIM 1.0".to_string(),
            },
            position: 0.0,
            valve: 1,
            valve_type: 0,
            start_velocity: 900,
            top_velocity: 1400,
            stop_velocity: 900,
            return_steps: 0,
            acceleration: 14,
            backoff: 0,
            initialized: true,
            error: 0,
            valve_fault: 0,
            syringe_fault: 0,
            buffer: Vec::new(),
            program: VecDeque::new(),
            activity: None,
            clock: 0.0,
        }
    }

    fn is_busy(&self) -> bool {
        self.activity.is_some() || !self.program.is_empty()
    }

    /// Status byte of an answer; `rejected` reports an error for this frame only
    fn status(&self, rejected: Option<u8>) -> StatusByte {
        let ready = if self.is_busy() { 0 } else { READY_BIT };
        StatusByte(ANSWER_BIT | ready | (rejected.unwrap_or(self.error) & 0x0F))
    }

    /// Run the program up to simulated time `now`
    fn advance(&mut self, now: f64) {
        loop {
            match self.activity {
                Some(Activity::Move { target }) => {
                    let speed = self.top_velocity.max(1) as f64 * MICROSTEPS_PER_STEP;
                    let remaining = target - self.position;
                    let needed = remaining.abs() / speed;
                    let available = (now - self.clock).max(0.0);
                    if needed <= available {
                        self.position = target;
                        self.clock += needed;
                        self.activity = None;
                    } else {
                        self.position += remaining.signum() * speed * available;
                        self.clock = now;
                        break;
                    }
                }
                Some(Activity::Wait { until }) => {
                    if until <= now {
                        self.clock = self.clock.max(until);
                        self.activity = None;
                    } else {
                        self.clock = now;
                        break;
                    }
                }
                None => match self.program.pop_front() {
                    Some(command) => self.start(command),
                    None => {
                        self.clock = self.clock.max(now);
                        break;
                    }
                },
            }
        }
    }

    fn start(&mut self, command: Command) {
        let max = MAX_MICROSTEPS as f64;
        let target = match command {
            Command::Absolute(n) => Some(n as f64),
            Command::Dispense(n) => Some(self.position - n as f64),
            Command::Pickup(n) => Some(self.position + n as f64),
            Command::InitSyringe(_) | Command::InitFromEncoder => {
                self.initialized = true;
                Some(0.0)
            }
            _ => None,
        };
        if let Some(target) = target {
            if self.kind == DeviceType::Mvp {
                self.fail(2);
            } else if !(0.0..=max).contains(&target) {
                self.fail(3);
            } else {
                self.activity = Some(Activity::Move { target });
            }
            return;
        }
        match command {
            Command::MoveValve(p) => {
                if !VALVE_POSITIONS.contains(&p) {
                    self.fail(3);
                } else {
                    self.valve = p;
                    self.activity = Some(Activity::Wait {
                        until: self.clock + VALVE_MOVE_SECONDS,
                    });
                }
            }
            Command::InitValve => {
                self.valve = 1;
                self.activity = Some(Activity::Wait {
                    until: self.clock + 2.0 * VALVE_MOVE_SECONDS,
                });
            }
            Command::Delay(ms) => {
                self.activity = Some(Activity::Wait {
                    until: self.clock + ms as f64 / 1000.0,
                });
            }
            other => self.apply_setting(other),
        }
    }

    fn fail(&mut self, code: u8) {
        self.error = code;
        self.program.clear();
        self.activity = None;
    }

    fn apply_setting(&mut self, command: Command) {
        match command {
            Command::SetValveType(t) => self.valve_type = t,
            Command::Backoff(n) => self.backoff = n,
            Command::StartVelocity(n) => self.start_velocity = n,
            Command::TopVelocity(n) => self.top_velocity = n,
            Command::StopVelocity(n) => self.stop_velocity = n,
            Command::ReturnSteps(n) => self.return_steps = n,
            Command::Acceleration(n) => self.acceleration = n,
            _ => {}
        }
    }

    fn query(&self, query: Query) -> Option<String> {
        let value = match query {
            Query::Position => {
                if self.kind == DeviceType::Mvp {
                    return None;
                }
                self.position.round() as i64
            }
            Query::StartVelocity => self.start_velocity as i64,
            Query::TopVelocity => self.top_velocity as i64,
            Query::StopVelocity => self.stop_velocity as i64,
            Query::ReturnSteps => self.return_steps as i64,
            Query::ValveType => self.valve_type as i64,
            Query::ValvePosition => self.valve as i64,
            Query::ValveStatus => {
                if self.valve_fault != 0 {
                    self.valve_fault as i64
                } else if matches!(self.activity, Some(Activity::Wait { .. })) {
                    STATUS_BUSY as i64
                } else {
                    0
                }
            }
            Query::SyringeStatus => {
                if self.kind == DeviceType::Mvp {
                    return None;
                }
                if self.syringe_fault != 0 {
                    self.syringe_fault as i64
                } else if !self.initialized {
                    1
                } else if matches!(self.activity, Some(Activity::Move { .. })) {
                    STATUS_BUSY as i64
                } else {
                    0
                }
            }
        };
        Some(value.to_string())
    }

    /// Handle one command string; returns the answer payload and a per-frame rejection
    fn execute(&mut self, commands: Vec<Command>) -> (Vec<u8>, Option<u8>) {
        let mut answer = Vec::new();
        let mut rejected = None;
        let mut staged = Vec::new();
        // Queries report the last error; any other command clears it
        if commands
            .iter()
            .any(|c| !matches!(c, Command::Query(_) | Command::Firmware))
        {
            self.error = 0;
        }
        for command in commands {
            match command {
                Command::Firmware => answer = self.firmware.clone().into_bytes(),
                Command::Query(q) => match self.query(q) {
                    Some(text) => answer = text.into_bytes(),
                    None => rejected = Some(2),
                },
                Command::Terminate => {
                    self.program.clear();
                    self.buffer.clear();
                    self.activity = None;
                }
                Command::PauseBuffer => {
                    let rest: Vec<Command> = self.program.drain(..).collect();
                    self.buffer.splice(0..0, rest);
                }
                Command::EnableExtended => {}
                Command::TopVelocity(v) if self.is_busy() => self.top_velocity = v,
                Command::Run => {
                    if self.is_busy() && staged.iter().any(Command::is_motion) {
                        rejected = Some(15);
                        staged.clear();
                        continue;
                    }
                    let mut run: Vec<Command> = self.buffer.drain(..).collect();
                    run.append(&mut staged);
                    if !self.initialized && !run.iter().any(is_syringe_init) && run.iter().any(is_plunger_move) {
                        rejected = Some(7);
                        continue;
                    }
                    self.program.extend(run);
                }
                other => staged.push(other),
            }
        }
        // Anything left without a run is buffered for a later R
        self.buffer.extend(staged);
        (answer, rejected)
    }
}

fn is_plunger_move(command: &Command) -> bool {
    matches!(
        command,
        Command::Absolute(_) | Command::Dispense(_) | Command::Pickup(_)
    )
}

fn is_syringe_init(command: &Command) -> bool {
    matches!(command, Command::InitSyringe(_) | Command::InitFromEncoder)
}

struct SimState {
    devices: BTreeMap<u8, SimDevice>,
    origin: Instant,
    time_scale: f64,
    latency: Duration,
    pending: VecDeque<u8>,
    received: Vec<(u8, String)>,
    drop_answers: usize,
    corrupt_answers: usize,
}

impl SimState {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * self.time_scale
    }

    fn advance_all(&mut self) {
        let now = self.now();
        for device in self.devices.values_mut() {
            device.advance(now);
        }
    }
}

/// Simulated chain of PSD and MVP devices behind one bus
#[derive(Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBus {
    /// Empty chain running in real time
    pub fn new() -> Self {
        SimulatedBus {
            state: Arc::new(Mutex::new(SimState {
                devices: BTreeMap::new(),
                origin: Instant::now(),
                time_scale: 1.0,
                latency: Duration::ZERO,
                pending: VecDeque::new(),
                received: Vec::new(),
                drop_answers: 0,
                corrupt_answers: 0,
            })),
        }
    }

    /// Add a syringe drive at `id`
    pub fn with_syringe(self, id: u8) -> Self {
        self.state.lock().devices.insert(id, SimDevice::new(DeviceType::Psd));
        self
    }

    /// Add a multi-port valve positioner at `id`
    pub fn with_valve(self, id: u8) -> Self {
        self.state.lock().devices.insert(id, SimDevice::new(DeviceType::Mvp));
        self
    }

    /// Chain matching the configured devices: syringe drives where a syringe volume is given
    pub fn for_config(config: &Config) -> Self {
        config
            .devices
            .iter()
            .fold(SimulatedBus::new(), |sim, (id, entry)| match entry.syringevolume {
                Some(_) => sim.with_syringe(*id),
                None => sim.with_valve(*id),
            })
    }

    /// Run simulated motion `factor` times faster than real time
    pub fn with_time_scale(self, factor: f64) -> Self {
        {
            let mut state = self.state.lock();
            state.advance_all();
            let now = state.now();
            state.time_scale = factor.max(f64::EPSILON);
            // Rebase so simulated time stays continuous
            state.origin = Instant::now() - Duration::from_secs_f64(now / state.time_scale);
        }
        self
    }

    /// Delay every answer by `latency`, modelling the serial round trip
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    /// Start a device uninitialized so motion is refused until init
    pub fn uninitialized(self, id: u8) -> Self {
        if let Some(device) = self.state.lock().devices.get_mut(&id) {
            device.initialized = false;
        }
        self
    }

    /// Report `code` in the valve status word of `id` until set back to 0
    pub fn fault_valve(&self, id: u8, code: u16) {
        if let Some(device) = self.state.lock().devices.get_mut(&id) {
            device.valve_fault = code;
        }
    }

    /// Report `code` in the syringe status word of `id` until set back to 0
    pub fn fault_syringe(&self, id: u8, code: u16) {
        if let Some(device) = self.state.lock().devices.get_mut(&id) {
            device.syringe_fault = code;
        }
    }

    /// Swallow the next `count` answers
    pub fn drop_answers(&self, count: usize) {
        self.state.lock().drop_answers = count;
    }

    /// Corrupt the checksum of the next `count` answers
    pub fn corrupt_answers(&self, count: usize) {
        self.state.lock().corrupt_answers = count;
    }

    /// Plunger position in microsteps
    pub fn position(&self, id: u8) -> Option<u32> {
        let mut state = self.state.lock();
        state.advance_all();
        state.devices.get(&id).map(|d| d.position.round() as u32)
    }

    /// Force a plunger position, e.g. a syringe that starts full
    pub fn set_position(&self, id: u8, microsteps: u32) {
        if let Some(device) = self.state.lock().devices.get_mut(&id) {
            device.position = microsteps.min(MAX_MICROSTEPS) as f64;
        }
    }

    pub fn valve(&self, id: u8) -> Option<u8> {
        let mut state = self.state.lock();
        state.advance_all();
        state.devices.get(&id).map(|d| d.valve)
    }

    pub fn top_velocity(&self, id: u8) -> Option<u32> {
        self.state.lock().devices.get(&id).map(|d| d.top_velocity)
    }

    pub fn is_busy(&self, id: u8) -> bool {
        let mut state = self.state.lock();
        state.advance_all();
        state.devices.get(&id).map(SimDevice::is_busy).unwrap_or(false)
    }

    /// Every accepted frame as `(address, payload)`
    pub fn received(&self) -> Vec<(u8, String)> {
        self.state.lock().received.clone()
    }

    /// Accepted payloads that are not status polls
    pub fn commands(&self) -> Vec<(u8, String)> {
        self.received()
            .into_iter()
            .filter(|(_, payload)| !payload.starts_with('?') && payload != "&")
            .collect()
    }

    pub fn clear_received(&self) {
        self.state.lock().received.clear();
    }

    fn handle_frame(&self, frame: &[u8]) {
        let request = match codec::decode_frame(frame) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("SIM: ignoring frame: {}", e);
                return;
            }
        };
        let payload = String::from_utf8_lossy(&request.payload).to_string();
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let mut state = self.state.lock();
        state.advance_all();
        let targets: Vec<u8> = codec::members(request.address)
            .into_iter()
            .filter(|id| state.devices.contains_key(id))
            .collect();
        if targets.is_empty() {
            return;
        }
        state.received.push((request.address, payload.clone()));

        let broadcast = codec::is_broadcast(request.address);
        let parsed = Command::parse_sequence(&payload);
        let now = state.now();
        let mut answer = None;
        for id in targets {
            if let Some(device) = state.devices.get_mut(&id) {
                device.clock = device.clock.max(now);
                let (body, rejected) = match &parsed {
                    Ok(commands) => device.execute(commands.clone()),
                    Err(_) => (Vec::new(), Some(2)),
                };
                device.advance(now);
                answer = Some((device.status(rejected), body));
            }
        }
        if broadcast {
            return;
        }
        if let Some((status, body)) = answer {
            if state.drop_answers > 0 {
                state.drop_answers -= 1;
                return;
            }
            let mut bytes = codec::encode_response(status, &body);
            if state.corrupt_answers > 0 {
                state.corrupt_answers -= 1;
                if let Some(last) = bytes.last_mut() {
                    *last ^= 0xFF;
                }
            }
            state.pending.extend(bytes);
        }
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimulatedBus {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let available = state.pending.len().min(buffer.len());
        for (slot, byte) in buffer.iter_mut().zip(state.pending.drain(..available)) {
            *slot = byte;
        }
        drop(state);
        if available == 0 {
            // Behave like a port read timing out in small slices
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(available)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            match codec::scan_frame(rest) {
                Scan::Complete { consumed, .. } | Scan::Invalid { consumed, .. } => {
                    self.handle_frame(&rest[..consumed]);
                    rest = &rest[consumed..];
                }
                Scan::Incomplete => break,
            }
        }
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.state.lock().pending.clear();
        Ok(())
    }

    fn name(&self) -> String {
        "simulated".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_request, sequence_byte};

    fn roundtrip(bus: &mut SimulatedBus, address: u8, payload: &str) -> Option<codec::Frame> {
        bus.write(&encode_request(address, sequence_byte(1, false), payload.as_bytes()))
            .unwrap();
        let mut buf = [0u8; 64];
        let n = bus.read(&mut buf).unwrap();
        if n == 0 {
            return None;
        }
        codec::decode_frame(&buf[..n]).ok()
    }

    #[test]
    fn answers_position_query() {
        let mut bus = SimulatedBus::new().with_syringe(1);
        bus.set_position(1, 96_000);
        let answer = roundtrip(&mut bus, 0x31, "?").unwrap();
        assert_eq!(codec::parse_numeric(&answer.payload), Some(96_000));
        assert!(!answer.status().is_busy());
    }

    #[test]
    fn valve_positioner_rejects_position_query() {
        let mut bus = SimulatedBus::new().with_valve(5);
        let answer = roundtrip(&mut bus, 0x35, "?").unwrap();
        assert!(!answer.status().code().is_ok());
        let answer = roundtrip(&mut bus, 0x35, "?24000").unwrap();
        assert_eq!(codec::parse_numeric(&answer.payload), Some(1));
    }

    #[test]
    fn buffered_commands_wait_for_run() {
        let mut bus = SimulatedBus::new().with_syringe(1).with_syringe(2).with_time_scale(1000.0);
        roundtrip(&mut bus, 0x31, "V5800A1000").unwrap();
        roundtrip(&mut bus, 0x32, "V5800A2000").unwrap();
        assert_eq!(bus.position(1), Some(0));
        assert!(roundtrip(&mut bus, 0x41, "R").is_none());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(bus.position(1), Some(1000));
        assert_eq!(bus.position(2), Some(2000));
    }

    #[test]
    fn terminate_halts_motion() {
        let mut bus = SimulatedBus::new().with_syringe(1);
        roundtrip(&mut bus, 0x31, "V2A192000R").unwrap();
        assert!(bus.is_busy(1));
        roundtrip(&mut bus, 0x31, "T").unwrap();
        assert!(!bus.is_busy(1));
    }

    #[test]
    fn out_of_range_move_sets_operand_error() {
        let mut bus = SimulatedBus::new().with_syringe(1);
        let answer = roundtrip(&mut bus, 0x31, "D100R").unwrap();
        assert_eq!(answer.status().code(), crate::status::StatusCode::InvalidOperand);
        let answer = roundtrip(&mut bus, 0x31, "?").unwrap();
        assert_eq!(answer.status().code(), crate::status::StatusCode::InvalidOperand);
        let answer = roundtrip(&mut bus, 0x31, "P100R").unwrap();
        assert_eq!(answer.status().code(), crate::status::StatusCode::Ok);
    }

    #[test]
    fn injected_faults_show_in_status_words() {
        let mut bus = SimulatedBus::new().with_syringe(1);
        bus.fault_syringe(1, 4);
        let answer = roundtrip(&mut bus, 0x31, "?10000").unwrap();
        assert_eq!(codec::parse_numeric(&answer.payload), Some(4));
        assert!(answer.status().code().is_ok());
        bus.fault_valve(1, 16);
        let answer = roundtrip(&mut bus, 0x31, "?20000").unwrap();
        assert_eq!(codec::parse_numeric(&answer.payload), Some(16));
        bus.fault_syringe(1, 0);
        let answer = roundtrip(&mut bus, 0x31, "?10000").unwrap();
        assert_eq!(codec::parse_numeric(&answer.payload), Some(0));
    }
}
