//! Session orchestrator.
//!
//! Owns the bus session, the volume model and the single active mode. A
//! scheduler thread mirrors syringe motion into the volume model and ticks
//! the mode; a faster tripwire thread checks the volume bounds and halts
//! every device when one is crossed. Consumers follow the session through
//! an event stream and serialisable status reports.

use crate::bus::{BusOptions, BusServer};
use crate::config::Config;
use crate::constants::*;
use crate::devices::{DeviceRegistry, Syringe};
use crate::error::{ErrorKind, PumpError, Result};
use crate::exchange::ExchangePair;
use crate::modes::{Dose, ModeContext, ModeEngine, ModeKind, ModeRequest, Progress};
use crate::transport::{SimulatedBus, Transport};
use crate::types::{DeviceSnapshot, Dispatch, ValveTarget};
use crate::volume::{Compartment, VolumeModel, VolumeReport, VolumeTracker};
use chrono::{DateTime, Local};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Error as published to consumers
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Local>,
}

impl ErrorReport {
    pub fn new(error: &PumpError) -> Self {
        ErrorReport {
            kind: error.kind(),
            message: error.to_string(),
            timestamp: Local::now(),
        }
    }
}

/// Session events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Connected { port: String, devices: Vec<u8> },
    Disconnected { port: String },
    ModeStarted { mode: ModeKind },
    Phase { mode: ModeKind, phase: &'static str },
    Finished { mode: ModeKind },
    Stopped { mode: ModeKind },
    Error(ErrorReport),
    BoundsTripped { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModeStatus {
    pub kind: ModeKind,
    pub phase: &'static str,
}

/// Snapshot of the whole session
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub timestamp: DateTime<Local>,
    pub port: Option<String>,
    pub mode: Option<ModeStatus>,
    pub volumes: VolumeReport,
    pub devices: Vec<DeviceSnapshot>,
    pub last_error: Option<ErrorReport>,
}

struct Session {
    server: BusServer,
    ctx: ModeContext,
}

struct Inner {
    config: RwLock<Config>,
    session: RwLock<Option<Session>>,
    tracker: Mutex<VolumeTracker>,
    volumes: Arc<Mutex<VolumeModel>>,
    mode: Mutex<Option<Box<dyn ModeEngine>>>,
    /// Published copy of the active mode, readable while a tick runs
    current: RwLock<Option<ModeStatus>>,
    /// Set by a halt; the scheduler drops the active mode on its next tick
    halt: AtomicBool,
    shutdown: AtomicBool,
    subscribers: Mutex<Vec<Sender<Event>>>,
    last_error: Mutex<Option<ErrorReport>>,
}

impl Inner {
    fn context(&self) -> Result<ModeContext> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.ctx.clone())
            .ok_or(PumpError::NotConnected)
    }

    fn port(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.server.port().to_string())
    }

    fn emit(&self, event: Event) {
        log::debug!("Event: {:?}", event);
        self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn report(&self, error: &PumpError) {
        let report = ErrorReport::new(error);
        *self.last_error.lock() = Some(report.clone());
        self.emit(Event::Error(report));
    }

    fn build_context(&self, bus: crate::bus::BusHandle, config: &Config) -> Result<ModeContext> {
        let devices = Arc::new(DeviceRegistry::default().build_all(&bus, config)?);
        let mut pairs = BTreeMap::new();
        for (name, pair) in &config.pairs {
            match ExchangePair::from_config(name, pair, config, &devices) {
                Ok(pair) => {
                    pairs.insert(name.clone(), Arc::new(pair));
                }
                Err(e) => log::warn!("Pair {} unavailable: {}", name, e),
            }
        }
        Ok(ModeContext {
            bus,
            devices,
            pairs: Arc::new(pairs),
            settings: config.pump_settings.clone(),
            ports: config.port_positions,
            volumes: Arc::clone(&self.volumes),
            mvp: config.mvp,
        })
    }

    /// Mirror syringe motion into the model; a newly crossed bound is returned
    fn sample_volumes(&self) -> Option<String> {
        let ctx = self.context().ok()?;
        let syringes = ctx.devices.syringes();
        let mut tracker = self.tracker.lock();
        let mut model = self.volumes.lock();
        tracker.sample(&syringes, &ctx.settings, &ctx.ports, &mut model);
        model.enforce_bounds()
    }

    fn halt_all(&self) {
        self.stop_devices();
        self.halt.store(true, Ordering::SeqCst);
    }

    /// Cancel queued work and broadcast a stop to every device
    fn stop_devices(&self) {
        if let Ok(ctx) = self.context() {
            ctx.bus.cancel_pending(GLOBAL_ADDRESS);
            if let Err(e) = ctx.bus.stop(GLOBAL_ADDRESS) {
                log::error!("Halt: stop broadcast failed: {}", e);
            }
        }
    }

    fn trip(&self, message: String) {
        log::error!("Tripwire: {}", message);
        self.halt_all();
        self.report(&PumpError::BoundsTripped(message.clone()));
        self.emit(Event::BoundsTripped { message });
    }

    fn publish_phase(&self, kind: ModeKind, phase: &'static str) {
        let mut current = self.current.write();
        if current.map(|c| c.phase) != Some(phase) {
            log::info!("{} mode: {}", kind, phase);
            *current = Some(ModeStatus { kind, phase });
            drop(current);
            self.emit(Event::Phase { mode: kind, phase });
        }
    }

    fn tick_mode(&self) {
        let mut slot = self.mode.lock();
        if self.halt.swap(false, Ordering::SeqCst) {
            if let Some(engine) = slot.take() {
                log::warn!("{} mode halted", engine.kind());
                *self.current.write() = None;
                self.emit(Event::Stopped { mode: engine.kind() });
            }
            return;
        }
        let Some(engine) = slot.as_mut() else {
            return;
        };
        let Ok(ctx) = self.context() else {
            return;
        };
        let kind = engine.kind();
        match engine.tick(&ctx) {
            Ok(Progress::Running) => self.publish_phase(kind, engine.phase()),
            Ok(Progress::Finished) => {
                slot.take();
                *self.current.write() = None;
                log::info!("{} mode finished", kind);
                self.emit(Event::Finished { mode: kind });
            }
            Err(e) => {
                log::error!("{} mode failed: {}", kind, e);
                if let Err(stop) = engine.stop(&ctx) {
                    log::warn!("{} mode: stop after failure: {}", kind, stop);
                }
                self.stop_devices();
                slot.take();
                *self.current.write() = None;
                self.report(&e);
                self.emit(Event::Stopped { mode: kind });
            }
        }
    }
}

fn scheduler_loop(inner: Arc<Inner>) {
    while !inner.shutdown.load(Ordering::SeqCst) {
        if let Some(message) = inner.sample_volumes() {
            inner.trip(message);
        }
        inner.tick_mode();
        thread::sleep(TICK_INTERVAL);
    }
}

fn tripwire_loop(inner: Arc<Inner>) {
    while !inner.shutdown.load(Ordering::SeqCst) {
        if let Some(message) = inner.sample_volumes() {
            inner.trip(message);
        }
        thread::sleep(TRIPWIRE_INTERVAL);
    }
}

/// Operator-facing entry point of the engine
pub struct Orchestrator {
    inner: Arc<Inner>,
    threads: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Start the scheduler and tripwire threads; no bus is connected yet
    pub fn new(config: Config) -> Result<Self> {
        let volumes = VolumeModel::from_config(&config);
        let inner = Arc::new(Inner {
            config: RwLock::new(config),
            session: RwLock::new(None),
            tracker: Mutex::new(VolumeTracker::new()),
            volumes: Arc::new(Mutex::new(volumes)),
            mode: Mutex::new(None),
            current: RwLock::new(None),
            halt: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
        });
        let scheduler = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("mode-scheduler".to_string())
                .spawn(move || scheduler_loop(inner))?
        };
        let tripwire = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("tripwire".to_string())
                .spawn(move || tripwire_loop(inner))?
        };
        Ok(Orchestrator {
            inner,
            threads: vec![scheduler, tripwire],
        })
    }

    pub fn config(&self) -> Config {
        self.inner.config.read().clone()
    }

    pub fn port(&self) -> Option<String> {
        self.inner.port()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.read().is_some()
    }

    /// Context handed to modes; also useful for direct device access
    pub fn context(&self) -> Result<ModeContext> {
        self.inner.context()
    }

    pub fn syringe(&self, id: u8) -> Result<Arc<Syringe>> {
        self.inner.context()?.syringe(id)
    }

    pub fn pair(&self, name: &str) -> Result<Arc<ExchangePair>> {
        self.inner.context()?.pair(name)
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    // Session

    /// Open a serial port; connecting again to the same port does nothing
    pub fn connect(&self, port: &str) -> Result<()> {
        if self.already_on(port)? {
            return Ok(());
        }
        let server = {
            let config = self.inner.config.read();
            BusServer::connect(port, &config.server)?
        };
        self.attach(server)
    }

    /// Serve an arbitrary transport
    pub fn connect_transport(&self, transport: Box<dyn Transport>, options: BusOptions) -> Result<()> {
        if self.already_on(&transport.name())? {
            return Ok(());
        }
        let server = BusServer::with_transport(transport, options)?;
        self.attach(server)
    }

    /// Demo session on a simulated chain mirroring the configured devices
    pub fn connect_simulated(&self, time_scale: f64) -> Result<SimulatedBus> {
        let config = self.config();
        let sim = SimulatedBus::for_config(&config).with_time_scale(time_scale);
        let options = BusOptions {
            scan_ids: config.devices.keys().copied().collect(),
            ..BusOptions::from(&config.server)
        };
        self.connect_transport(Box::new(sim.clone()), options)?;
        Ok(sim)
    }

    fn already_on(&self, port: &str) -> Result<bool> {
        match self.inner.port() {
            Some(current) if current == port => {
                log::debug!("Already connected to {}", port);
                Ok(true)
            }
            Some(current) => Err(PumpError::InvalidArgument(format!(
                "connected to {}; disconnect first",
                current
            ))),
            None => Ok(false),
        }
    }

    fn attach(&self, server: BusServer) -> Result<()> {
        let config = self.config();
        let ctx = self.inner.build_context(server.handle(), &config)?;
        let port = server.port().to_string();
        let devices = ctx.devices.ids();
        self.inner.tracker.lock().rebase();
        *self.inner.session.write() = Some(Session { server, ctx });
        log::info!("Connected to {} with devices {:?}", port, devices);
        self.inner.emit(Event::Connected { port, devices });
        Ok(())
    }

    /// Stop any mode and close the bus; a no-op when not connected
    pub fn disconnect(&self) -> Result<()> {
        if let Err(e) = self.stop() {
            log::warn!("Stopping before disconnect: {}", e);
        }
        let session = self.inner.session.write().take();
        if let Some(session) = session {
            let port = session.server.port().to_string();
            session.server.disconnect();
            self.inner.emit(Event::Disconnected { port });
        }
        Ok(())
    }

    /// Serial ports on which device 1 answers
    pub fn scan(&self) -> Result<Vec<String>> {
        if let Some(port) = self.inner.port() {
            return Err(PumpError::InvalidArgument(format!(
                "connected to {}; disconnect before scanning",
                port
            )));
        }
        let config = self.config();
        BusServer::scan_ports(1, &config.server)
    }

    // Configuration

    pub fn load_config<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.set_config(Config::from_file(path)?)
    }

    pub fn save_config<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.inner.config.read().to_file(path)
    }

    /// Replace the configuration; a connected session gets fresh proxies and tallies
    pub fn set_config(&self, config: Config) -> Result<()> {
        self.ensure_idle()?;
        config.validate()?;
        {
            let mut session = self.inner.session.write();
            if let Some(session) = session.as_mut() {
                session.ctx = self.inner.build_context(session.server.handle(), &config)?;
            }
        }
        *self.inner.volumes.lock() = VolumeModel::from_config(&config);
        self.inner.tracker.lock().rebase();
        *self.inner.config.write() = config;
        Ok(())
    }

    fn ensure_idle(&self) -> Result<()> {
        match *self.inner.current.read() {
            Some(status) => Err(PumpError::ModeBusy(status.kind.to_string())),
            None => Ok(()),
        }
    }

    // Modes

    /// Start `name` with `key=value` arguments
    pub fn start(&self, name: &str, args: &[String]) -> Result<()> {
        self.start_mode(ModeRequest::parse(name, args)?)
    }

    pub fn start_mode(&self, request: ModeRequest) -> Result<()> {
        let ctx = self.inner.context()?;
        let mut slot = self.inner.mode.lock();
        if let Some(active) = slot.as_ref() {
            return Err(PumpError::ModeBusy(active.kind().to_string()));
        }
        self.inner.volumes.lock().check_armed()?;
        self.inner.halt.store(false, Ordering::SeqCst);

        let kind = request.kind();
        let mut engine = request.into_engine();
        if let Err(e) = engine.start(&ctx) {
            log::error!("{} mode did not start: {}", kind, e);
            if let Err(stop) = engine.stop(&ctx) {
                log::warn!("{} mode: stop after failed start: {}", kind, stop);
            }
            self.inner.report(&e);
            return Err(e);
        }
        *self.inner.current.write() = Some(ModeStatus {
            kind,
            phase: engine.phase(),
        });
        *slot = Some(engine);
        log::info!("{} mode started", kind);
        self.inner.emit(Event::ModeStarted { mode: kind });
        Ok(())
    }

    /// Stop the active mode; a no-op when none runs
    pub fn stop(&self) -> Result<()> {
        let mut slot = self.inner.mode.lock();
        let Some(mut engine) = slot.take() else {
            return Ok(());
        };
        *self.inner.current.write() = None;
        let kind = engine.kind();
        let result = match self.inner.context() {
            Ok(ctx) => engine.stop(&ctx),
            Err(_) => Ok(()),
        };
        drop(slot);
        log::info!("{} mode stopped", kind);
        self.inner.emit(Event::Stopped { mode: kind });
        result
    }

    fn with_mode<T>(&self, f: impl FnOnce(&mut dyn ModeEngine, &ModeContext) -> Result<T>) -> Result<T> {
        let ctx = self.inner.context()?;
        let mut slot = self.inner.mode.lock();
        let engine = slot
            .as_mut()
            .ok_or_else(|| PumpError::InvalidArgument("no mode is running".to_string()))?;
        f(engine.as_mut(), &ctx)
    }

    /// Change the running mode's rate
    pub fn set_rate(&self, rate: f64) -> Result<()> {
        self.with_mode(|engine, ctx| engine.set_rate(ctx, rate))
    }

    /// Extra volume into or out of the cell; refusals are logged and returned
    pub fn dose(&self, dose: Dose) -> Result<()> {
        self.with_mode(|engine, ctx| {
            engine.dose(ctx, dose)?;
            // Published under the mode lock so a tick cannot reorder it
            self.inner.publish_phase(engine.kind(), engine.phase());
            Ok(())
        })
        .map_err(|e| {
            log::warn!("Dose {:?} {:.1} uL not taken: {}", dose.direction, dose.volume, e);
            e
        })
    }

    /// Wait until no mode is active
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        while self.inner.current.read().is_some() {
            if started.elapsed() >= timeout {
                return false;
            }
            thread::sleep(TRIPWIRE_INTERVAL);
        }
        true
    }

    // Safety

    /// Cancel queued work, stop every device and drop the active mode
    pub fn halt_all(&self) {
        log::warn!("Halting all devices");
        self.inner.halt_all();
    }

    /// Clear a latched tripwire; true when one was latched
    pub fn acknowledge(&self) -> bool {
        let cleared = self.inner.volumes.lock().acknowledge();
        if cleared {
            log::info!("Tripwire acknowledged");
        }
        cleared
    }

    pub fn reset_volumes(&self, compartment: Compartment, volume: f64) -> Result<()> {
        self.inner.volumes.lock().reset(compartment, volume)
    }

    pub fn volumes(&self) -> VolumeReport {
        self.inner.volumes.lock().report()
    }

    // Manual overrides

    /// Turn the valve of `device`; refused while a mode runs
    pub fn move_valve(&self, device: u8, target: ValveTarget) -> Result<()> {
        self.ensure_idle()?;
        let ctx = self.inner.context()?;
        ctx.devices.valve(device)?.move_valve(target, Dispatch::RUN)?.wait()?;
        Ok(())
    }

    /// Name valve `position` of `device`, in the session and the configuration
    pub fn set_port_alias(&self, device: u8, position: u8, alias: &str) -> Result<()> {
        if let Ok(ctx) = self.inner.context() {
            ctx.devices.valve(device)?.set_alias(position, alias)?;
        }
        let mut config = self.inner.config.write();
        let entry = config
            .devices
            .get_mut(&device)
            .ok_or(PumpError::UnknownDevice(device))?;
        entry.valve_alias.insert(position, alias.to_string());
        Ok(())
    }

    /// Reverse the push and pull roles of a configured pair
    pub fn swap_pair(&self, name: &str) -> Result<()> {
        self.ensure_idle()?;
        if let Ok(ctx) = self.inner.context() {
            ctx.pair(name)?.swap();
        }
        let mut config = self.inner.config.write();
        let pair = config
            .pairs
            .get_mut(name)
            .ok_or_else(|| PumpError::InvalidArgument(format!("unknown pair {}", name)))?;
        pair.args.reverse();
        std::mem::swap(&mut pair.push_syr, &mut pair.pull_syr);
        log::info!("Pair {}: push is now {}", name, pair.args[0]);
        Ok(())
    }

    pub fn status(&self) -> StatusReport {
        let devices = self
            .inner
            .context()
            .map(|ctx| ctx.bus.snapshot().devices().copied().collect())
            .unwrap_or_default();
        StatusReport {
            timestamp: Local::now(),
            port: self.inner.port(),
            mode: *self.inner.current.read(),
            volumes: self.volumes(),
            devices,
            last_error: self.inner.last_error.lock().clone(),
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                log::error!("Orchestrator thread panicked");
            }
        }
        if let Err(e) = self.disconnect() {
            log::warn!("Disconnect on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modes::{NormalParams, ModeRequest};
    use crate::types::Direction;

    fn demo() -> (Orchestrator, SimulatedBus) {
        let orchestrator = Orchestrator::new(Config::default()).unwrap();
        let sim = orchestrator.connect_simulated(100.0).unwrap();
        thread::sleep(Duration::from_millis(100));
        (orchestrator, sim)
    }

    #[test]
    fn connecting_twice_to_the_same_chain_is_a_no_op() {
        let (orchestrator, sim) = demo();
        let events = orchestrator.subscribe();
        orchestrator
            .connect_transport(Box::new(sim.clone()), BusOptions::default())
            .unwrap();
        assert!(events.try_recv().is_err());
        let enables = sim
            .received()
            .iter()
            .filter(|(address, payload)| *address == GLOBAL_ADDRESS && payload == "h30001")
            .count();
        assert_eq!(enables, 1);
        assert_eq!(orchestrator.port().as_deref(), Some("simulated"));
        assert_eq!(orchestrator.status().devices.len(), 5);
    }

    #[test]
    fn one_mode_at_a_time() {
        let (orchestrator, sim) = demo();
        let slow = ModeRequest::Normal(NormalParams {
            syringe: 1,
            rate: 50.0,
            ..NormalParams::default()
        });
        orchestrator.start_mode(slow.clone()).unwrap();
        let before = sim.commands().len();
        assert!(matches!(
            orchestrator.start_mode(slow),
            Err(PumpError::ModeBusy(_))
        ));
        assert_eq!(sim.commands().len(), before);
        assert!(orchestrator.move_valve(2, ValveTarget::Position(2)).is_err());

        orchestrator.stop().unwrap();
        assert!(orchestrator.status().mode.is_none());
        orchestrator.stop().unwrap();
        assert!(orchestrator.wait_idle(Duration::from_millis(10)));
    }

    #[test]
    fn finished_mode_is_reported() {
        let (orchestrator, sim) = demo();
        let events = orchestrator.subscribe();
        orchestrator
            .start(
                "normal",
                &["syringe=2".to_string(), "volume=500".to_string(), "rate=1000".to_string()],
            )
            .unwrap();
        assert!(orchestrator.wait_idle(Duration::from_secs(5)));
        assert_eq!(sim.position(2), Some(7_680));
        let events: Vec<Event> = events.try_iter().collect();
        assert!(matches!(events.first(), Some(Event::ModeStarted { mode: ModeKind::Normal })));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Finished { mode: ModeKind::Normal })));
        // S2 drew from its reservoir
        thread::sleep(Duration::from_millis(50));
        let report = orchestrator.volumes();
        assert!((report.reservoirs[&2].tally.volume - 99_500.0).abs() < 0.5);
        assert!((report.syringes[&2].volume - 500.0).abs() < 0.5);
    }

    #[test]
    fn overrides_update_the_configuration() {
        let (orchestrator, sim) = demo();
        orchestrator.move_valve(4, ValveTarget::Position(2)).unwrap();
        assert_eq!(sim.valve(4), Some(2));

        orchestrator.set_port_alias(3, 3, "Rinse").unwrap();
        assert_eq!(orchestrator.config().devices[&3].valve_alias[&3], "Rinse");
        orchestrator.move_valve(3, ValveTarget::from("Rinse")).unwrap();
        assert_eq!(sim.valve(3), Some(3));

        orchestrator.swap_pair("pair13").unwrap();
        assert_eq!(orchestrator.pair("pair13").unwrap().push().id(), 3);
        assert_eq!(orchestrator.config().pairs["pair13"].args[0], "Syringe3");
        assert!(orchestrator.swap_pair("pair99").is_err());
    }

    #[test]
    fn status_serialises_to_json() {
        let (orchestrator, _sim) = demo();
        orchestrator.reset_volumes(Compartment::Cell, 12_000.0).unwrap();
        let json = serde_json::to_value(orchestrator.status()).unwrap();
        assert_eq!(json["port"], "simulated");
        assert_eq!(json["volumes"]["cell"]["volume"], 12_000.0);
        assert!(json["mode"].is_null());
        let direction = serde_json::to_value(Direction::Dispense).unwrap();
        assert!(direction.is_string());
    }
}
