//! Bus server: owns the port, dispatches prioritised tasks and polls devices.
//!
//! A single dispatcher thread performs every read and write on the bus.
//! Producers enqueue tasks from any thread through a [`BusHandle`] and get a
//! [`CommandFuture`] back. When no task is pending, or after each task, the
//! dispatcher polls one known device and publishes the result in the shared
//! snapshot.

mod link;
mod task;

pub use task::{wait_all, CommandFuture, Reply};

use crate::codec;
use crate::command::{Command, CommandString, Query};
use crate::config::ServerConfig;
use crate::constants::*;
use crate::error::{PumpError, Result};
use crate::status::{StatusByte, SyringeStatus, ValveStatus, STATUS_UNAVAILABLE};
use crate::transport::{SerialTransport, Transport};
use crate::types::{DeviceSnapshot, DeviceType};
use link::BusLink;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use task::{Task, TaskQueue};

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Per-attempt read timeout
    pub timeout: Duration,
    /// Repeats after the first attempt
    pub retries: u8,
    /// Ids probed at discovery
    pub scan_ids: Vec<u8>,
    /// Pause between background polls while the queue is idle
    pub poll_interval: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        BusOptions {
            timeout: READ_TIMEOUT,
            retries: 1,
            scan_ids: (1..=MAX_DEVICES).collect(),
            poll_interval: Duration::from_millis(5),
        }
    }
}

impl From<&ServerConfig> for BusOptions {
    fn from(config: &ServerConfig) -> Self {
        BusOptions {
            timeout: Duration::from_millis(config.timeout_ms),
            retries: config.retries,
            ..BusOptions::default()
        }
    }
}

/// Published per-device state
#[derive(Debug, Clone)]
pub struct BusSnapshot {
    devices: Vec<DeviceSnapshot>,
    known: Vec<u8>,
}

impl BusSnapshot {
    fn new() -> Self {
        BusSnapshot {
            devices: (0..=MAX_DEVICES).map(DeviceSnapshot::empty).collect(),
            known: Vec::new(),
        }
    }

    pub fn device(&self, id: u8) -> Option<&DeviceSnapshot> {
        if self.known.contains(&id) {
            self.devices.get(id as usize)
        } else {
            None
        }
    }

    /// Ids found at discovery, ascending
    pub fn known(&self) -> &[u8] {
        &self.known
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceSnapshot> {
        self.known.iter().filter_map(|id| self.devices.get(*id as usize))
    }

    pub fn any_busy(&self) -> bool {
        self.devices().any(|d| d.busy)
    }

    fn slot(&mut self, id: u8) -> &mut DeviceSnapshot {
        &mut self.devices[id as usize]
    }

    fn set_status(&mut self, id: u8, status: StatusByte) {
        let slot = self.slot(id);
        slot.status_byte = status;
        slot.busy = status.is_busy();
    }
}

struct Shared {
    queue: Mutex<TaskQueue>,
    wake: Condvar,
    snapshot: RwLock<BusSnapshot>,
}

/// Cloneable producer side of the bus server
#[derive(Clone)]
pub struct BusHandle {
    shared: Arc<Shared>,
}

impl BusHandle {
    /// Queue a raw command string
    pub fn send_command(
        &self,
        address: u8,
        payload: &[u8],
        is_move: bool,
        priority: u8,
    ) -> Result<CommandFuture> {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(PumpError::NotConnected);
        }
        let future = queue.push(priority, address, payload.to_vec(), is_move);
        drop(queue);
        self.shared.wake.notify_one();
        Ok(future)
    }

    /// Queue a structured command string; the move flag follows the terminal run
    pub fn send(&self, address: u8, command: &CommandString, priority: u8) -> Result<CommandFuture> {
        log::debug!("BUS: queue {:#04x} <- {}", address, command);
        self.send_command(address, &command.to_bytes(), command.is_move(), priority)
    }

    /// Queue a query and wait for its numeric answer
    pub fn query(&self, id: u8, query: Query) -> Result<i64> {
        let address = codec::individual_address(id)?;
        let reply = self
            .send(address, &CommandString::from(Command::Query(query)), PRIORITY_QUERY)?
            .wait()?;
        reply.status.raise_if_error(id, address)?;
        reply.numeric().ok_or_else(|| {
            PumpError::BusFraming(format!("non-numeric answer to {:?}: {:?}", query, reply.text()))
        })
    }

    /// Cancel queued tasks for the devices behind `address`, then broadcast `T` first
    pub fn stop(&self, address: u8) -> Result<CommandFuture> {
        self.cancel_pending(address);
        self.send(address, &CommandString::from(Command::Terminate), PRIORITY_STOP)
    }

    /// Pause buffered execution on the devices behind `address`
    pub fn pause_buffer(&self, address: u8) -> Result<CommandFuture> {
        self.send(address, &CommandString::from(Command::PauseBuffer), PRIORITY_STOP)
    }

    /// Resolve every queued task for the devices behind `address` with `CancelledByStop`
    pub fn cancel_pending(&self, address: u8) -> usize {
        let ids = codec::members(address);
        let drained = self.shared.queue.lock().drain_matching(&ids);
        let count = drained.len();
        for task in drained {
            task.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
            task.complete(Err(PumpError::CancelledByStop));
        }
        if count > 0 {
            log::debug!("BUS: cancelled {} queued task(s) for {:#04x}", count, address);
        }
        count
    }

    pub fn snapshot(&self) -> BusSnapshot {
        self.shared.snapshot.read().clone()
    }

    pub fn device(&self, id: u8) -> Option<DeviceSnapshot> {
        self.shared.snapshot.read().device(id).copied()
    }

    pub fn known_devices(&self) -> Vec<u8> {
        self.shared.snapshot.read().known.clone()
    }

    pub fn is_busy(&self, id: u8) -> bool {
        self.device(id).map(|d| d.busy).unwrap_or(false)
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

/// Owner of the dispatcher thread
pub struct BusServer {
    handle: BusHandle,
    port: String,
    thread: Option<JoinHandle<()>>,
}

impl BusServer {
    /// Open a serial port and start serving
    pub fn connect(port: &str, config: &ServerConfig) -> Result<Self> {
        let transport = SerialTransport::open(port, config)?;
        Self::with_transport(Box::new(transport), BusOptions::from(config))
    }

    /// Discover devices on `transport` and start the dispatcher
    pub fn with_transport(transport: Box<dyn Transport>, options: BusOptions) -> Result<Self> {
        let mut link = BusLink::new(transport, options.timeout, options.retries);
        let port = link.name();
        let mut snapshot = BusSnapshot::new();

        link.transact(GLOBAL_ADDRESS, &CommandString::from(Command::EnableExtended).to_bytes())?;
        discover(&mut link, &mut snapshot, &options.scan_ids);
        log::info!(
            "BUS: {} device(s) on {}: {:?}",
            snapshot.known.len(),
            port,
            snapshot.known
        );

        let shared = Arc::new(Shared {
            queue: Mutex::new(TaskQueue::default()),
            wake: Condvar::new(),
            snapshot: RwLock::new(snapshot),
        });
        let worker = Arc::clone(&shared);
        let poll_interval = options.poll_interval;
        let thread = thread::Builder::new()
            .name("pump-bus".to_string())
            .spawn(move || dispatch_loop(worker, link, poll_interval))?;

        Ok(BusServer {
            handle: BusHandle { shared },
            port,
            thread: Some(thread),
        })
    }

    /// Probe every available serial port for `device_id`
    pub fn scan_ports(device_id: u8, config: &ServerConfig) -> Result<Vec<String>> {
        let address = codec::individual_address(device_id)?;
        let mut found = Vec::new();
        for port in SerialTransport::list_ports()? {
            let transport = match SerialTransport::open(&port, config) {
                Ok(t) => t,
                Err(e) => {
                    log::debug!("BUS: skipping {}: {}", port, e);
                    continue;
                }
            };
            let options = BusOptions::from(config);
            let mut link = BusLink::new(Box::new(transport), options.timeout, options.retries);
            if let Ok(Some(_)) = link.transact(address, b"&") {
                log::info!("BUS: device {} answers on {}", device_id, port);
                found.push(port);
            }
        }
        Ok(found)
    }

    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Stop the dispatcher and close the port
    pub fn disconnect(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        {
            let mut queue = self.handle.shared.queue.lock();
            queue.shutdown = true;
        }
        self.handle.shared.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("BUS: dispatcher thread panicked");
            }
            log::info!("BUS: disconnected from {}", self.port);
        }
    }
}

impl Drop for BusServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn discover(link: &mut BusLink, snapshot: &mut BusSnapshot, ids: &[u8]) {
    for &id in ids {
        let Ok(address) = codec::individual_address(id) else {
            continue;
        };
        let firmware = match link.transact(address, b"&") {
            Ok(Some(reply)) => reply.text(),
            _ => continue,
        };
        let device_type = match link.transact(address, b"?") {
            Ok(Some(reply)) if reply.status.code().is_ok() && reply.numeric().is_some() => {
                DeviceType::Psd
            }
            Ok(Some(_)) => DeviceType::Mvp,
            _ => DeviceType::Unknown,
        };
        log::info!("BUS: found device {} ({:?}, firmware {:?})", id, device_type, firmware);
        snapshot.slot(id).device_type = device_type;
        snapshot.known.push(id);
        poll_device(link, snapshot.slot(id), false);
    }
}

fn dispatch_loop(shared: Arc<Shared>, mut link: BusLink, poll_interval: Duration) {
    log::info!("BUS: dispatcher started on {}", link.name());
    let mut cursor = 0usize;
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            if queue.shutdown {
                break;
            }
            queue.pop()
        };

        if let Some(task) = task {
            execute(&shared, &mut link, task);
        }

        // One poll after each task, or continuously while idle
        let polled = poll_next(&shared, &mut link, &mut cursor);

        let mut queue = shared.queue.lock();
        if queue.shutdown {
            break;
        }
        if queue.is_empty() {
            let wait = if polled { poll_interval } else { IDLE_WAIT };
            if !wait.is_zero() {
                shared.wake.wait_for(&mut queue, wait);
            }
        }
    }
    // Queued tasks resolve as disconnected when their senders drop
    let remaining = std::mem::take(&mut *shared.queue.lock());
    drop(remaining);
    log::info!("BUS: dispatcher stopped");
}

fn execute(shared: &Shared, link: &mut BusLink, task: Task) {
    if task.is_cancelled() {
        task.complete(Err(PumpError::CancelledByStop));
        return;
    }
    log::debug!(
        "BUS: dispatch {:#04x} <- {} (priority {})",
        task.address,
        String::from_utf8_lossy(&task.payload),
        task.priority
    );
    let result = link.transact(task.address, &task.payload);
    let mut snapshot = shared.snapshot.write();
    let result = match result {
        Ok(Some(reply)) => {
            if let Some(id) = codec::device_id(task.address) {
                snapshot.set_status(id, reply.status);
            }
            Ok(reply)
        }
        Ok(None) => Ok(Reply::broadcast()),
        Err(e) => {
            if let Some(id) = codec::device_id(task.address) {
                snapshot.set_status(id, StatusByte::NO_ANSWER);
            }
            Err(e)
        }
    };
    if task.is_move && result.is_ok() {
        // Observers must see the motion before the next poll confirms it
        for id in codec::members(task.address) {
            if snapshot.known.contains(&id) {
                snapshot.set_status(id, StatusByte::BUSY);
            }
        }
    }
    drop(snapshot);
    task.complete(result);
}

/// Poll one device. Busy devices get a shallow update and are favoured.
fn poll_next(shared: &Shared, link: &mut BusLink, cursor: &mut usize) -> bool {
    let (id, busy) = {
        let snapshot = shared.snapshot.read();
        let known = &snapshot.known;
        if known.is_empty() {
            return false;
        }
        let any_busy = snapshot.any_busy();
        let mut choice = None;
        for _ in 0..known.len() {
            *cursor = (*cursor + 1) % known.len();
            let id = known[*cursor];
            let busy = snapshot.devices[id as usize].busy;
            if any_busy && !busy {
                continue;
            }
            choice = Some((id, busy));
            break;
        }
        match choice {
            Some(choice) => choice,
            None => return false,
        }
    };

    let mut slot = match shared.snapshot.read().device(id) {
        Some(slot) => *slot,
        None => return false,
    };
    poll_device(link, &mut slot, busy);
    *shared.snapshot.write().slot(id) = slot;
    true
}

fn poll_device(link: &mut BusLink, slot: &mut DeviceSnapshot, shallow: bool) {
    let Ok(address) = codec::individual_address(slot.id) else {
        return;
    };
    let queries: &[Query] = match (slot.device_type, shallow) {
        (DeviceType::Mvp, true) => &[Query::ValvePosition],
        (DeviceType::Mvp, false) => &[Query::ValvePosition, Query::ValveStatus],
        // Valve position rides along so moved volume is attributed to the right port
        (_, true) => &[Query::ValvePosition, Query::Position],
        (_, false) => &[
            Query::ValvePosition,
            Query::ValveStatus,
            Query::SyringeStatus,
            Query::Position,
        ],
    };
    // Ready only when every answer of this round said so, so a ready device
    // is never published with a position read while it was still moving
    let mut busy = false;
    for query in queries {
        let payload = Command::Query(*query).to_string();
        match link.transact(address, payload.as_bytes()) {
            Ok(Some(reply)) => {
                slot.status_byte = reply.status;
                busy |= reply.status.is_busy();
                slot.busy = busy;
                let value = reply.numeric();
                let word = value
                    .and_then(|v| u16::try_from(v).ok())
                    .unwrap_or(STATUS_UNAVAILABLE);
                match query {
                    Query::Position => slot.syringe_pos = value.and_then(|v| u32::try_from(v).ok()),
                    Query::ValvePosition => slot.valve_pos = value.and_then(|v| u8::try_from(v).ok()),
                    Query::ValveStatus => slot.valve_status = ValveStatus(word),
                    Query::SyringeStatus => slot.syringe_status = SyringeStatus(word),
                    _ => {}
                }
                log::trace!("BUS: poll {} {:?} -> {:?}", slot.id, query, value);
            }
            Ok(None) => {}
            Err(e) => {
                log::debug!("BUS: poll of device {} failed: {}", slot.id, e);
                slot.status_byte = StatusByte::NO_ANSWER;
                slot.busy = false;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimulatedBus;

    fn options(ids: &[u8]) -> BusOptions {
        BusOptions {
            timeout: Duration::from_millis(10),
            scan_ids: ids.to_vec(),
            ..BusOptions::default()
        }
    }

    #[test]
    fn discovery_classifies_devices() {
        let sim = SimulatedBus::new().with_syringe(1).with_valve(3);
        let server = BusServer::with_transport(Box::new(sim), options(&[1, 2, 3])).unwrap();
        let snapshot = server.handle().snapshot();
        assert_eq!(snapshot.known(), &[1, 3]);
        assert_eq!(snapshot.device(1).unwrap().device_type, DeviceType::Psd);
        assert_eq!(snapshot.device(3).unwrap().device_type, DeviceType::Mvp);
        assert!(snapshot.device(2).is_none());
        server.disconnect();
    }

    #[test]
    fn command_future_returns_answer() {
        let sim = SimulatedBus::new().with_syringe(1);
        sim.set_position(1, 4800);
        let server = BusServer::with_transport(Box::new(sim), options(&[1])).unwrap();
        let handle = server.handle();
        assert_eq!(handle.query(1, Query::Position).unwrap(), 4800);
        let reply = handle.send_command(0x31, b"&", false, PRIORITY_QUERY).unwrap().wait().unwrap();
        assert!(reply.text().starts_with("PSD"));
    }

    #[test]
    fn move_forces_busy_until_polled() {
        let sim = SimulatedBus::new().with_syringe(1);
        let server = BusServer::with_transport(Box::new(sim.clone()), options(&[1])).unwrap();
        let handle = server.handle();
        handle
            .send_command(0x31, b"V2A192000R", true, PRIORITY_COMMAND)
            .unwrap()
            .wait()
            .unwrap();
        assert!(handle.is_busy(1));
        handle.stop(0x31).unwrap().wait().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(!handle.is_busy(1));
    }

    #[test]
    fn broadcast_reports_no_answer() {
        let sim = SimulatedBus::new().with_syringe(1).with_syringe(2);
        let server = BusServer::with_transport(Box::new(sim), options(&[1, 2])).unwrap();
        let reply = server
            .handle()
            .send_command(0x41, b"T", false, PRIORITY_STOP)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(reply.status, StatusByte::NO_ANSWER);
    }

    #[test]
    fn unknown_device_times_out() {
        let sim = SimulatedBus::new().with_syringe(1);
        let server = BusServer::with_transport(Box::new(sim), options(&[1])).unwrap();
        let result = server
            .handle()
            .send_command(0x39, b"?", false, PRIORITY_QUERY)
            .unwrap()
            .wait();
        assert!(matches!(result, Err(PumpError::BusTimeout { address: 0x39 })));
    }

    #[test]
    fn handle_after_disconnect_is_rejected() {
        let sim = SimulatedBus::new().with_syringe(1);
        let server = BusServer::with_transport(Box::new(sim), options(&[1])).unwrap();
        let handle = server.handle();
        server.disconnect();
        assert!(matches!(
            handle.send_command(0x31, b"?", false, PRIORITY_QUERY),
            Err(PumpError::NotConnected)
        ));
    }
}
