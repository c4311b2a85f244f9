//! End-to-end sessions on a simulated four-syringe rig.

use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant};
use syringe_exchange::settings::Role;
use syringe_exchange::{
    BusOptions, Config, Dispatch, Dose, ErrorKind, Event, ModeKind, Orchestrator, PumpError,
    SimulatedBus, ValveTarget,
};

const FULL: u32 = 192_000;

/// Orchestrator on a simulated chain; `prepare` seeds plunger positions before discovery
fn session(config: Config, time_scale: f64, prepare: impl FnOnce(&SimulatedBus)) -> (Orchestrator, SimulatedBus) {
    let sim = SimulatedBus::for_config(&config).with_time_scale(time_scale);
    prepare(&sim);
    (connect(config, &sim), sim)
}

fn connect(config: Config, sim: &SimulatedBus) -> Orchestrator {
    let options = BusOptions {
        timeout: Duration::from_millis(20),
        scan_ids: config.devices.keys().copied().collect(),
        ..BusOptions::default()
    };
    let orchestrator = Orchestrator::new(config).unwrap();
    orchestrator
        .connect_transport(Box::new(sim.clone()), options)
        .unwrap();
    // First samples become the volume baseline
    thread::sleep(Duration::from_millis(150));
    orchestrator
}

fn pumps_moving(sim: &SimulatedBus) -> Vec<u8> {
    (1..=4).filter(|id| sim.is_busy(*id)).collect()
}

fn wait_for(events: &Receiver<Event>, limit: Duration, pred: impl Fn(&Event) -> bool) -> Option<Event> {
    let deadline = Instant::now() + limit;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}

fn close(actual: f64, expected: f64, tolerance: f64) -> bool {
    (actual - expected).abs() <= tolerance
}

#[test]
fn full_syringe_drains_to_waste() {
    let (orchestrator, sim) = session(Config::default(), 100.0, |sim| sim.set_position(1, FULL));
    let before = orchestrator.volumes();
    assert!(close(before.syringes[&1].volume, 12_500.0, 0.1));

    let s1 = orchestrator.syringe(1).unwrap();
    s1.drain(None, Some(1_000.0), Dispatch::RUN).unwrap().wait().unwrap();
    s1.join(Some(Duration::from_secs(5))).unwrap();
    thread::sleep(Duration::from_millis(100));

    assert_eq!(sim.position(1), Some(0));
    assert_eq!(sim.valve(1), Some(2));
    let after = orchestrator.volumes();
    assert!(close(after.syringes[&1].volume, 0.0, 0.1));
    assert!(close(after.waste.volume, 12_500.0, 0.5));
    assert!(close(after.reservoirs[&1].tally.volume, 100_000.0, 0.1));
    assert!(after.tripped.is_none());
}

#[test]
fn intermittent_exchange_conserves_the_cell() {
    let (orchestrator, _sim) = session(Config::default(), 100.0, |_| {});
    let total = |report: &syringe_exchange::VolumeReport| {
        report.reservoirs.values().map(|r| r.tally.volume).sum::<f64>()
            + report.waste.volume
            + report.cell.volume
            + report.syringes.values().map(|t| t.volume).sum::<f64>()
    };
    let before = orchestrator.volumes();

    orchestrator
        .start(
            "intermittent",
            &[
                "pair=pair13".to_string(),
                "exchange_rate=500".to_string(),
                "refill_rate=1500".to_string(),
                "pre_pressure_volume=50".to_string(),
                "total_exchange_amount=25000".to_string(),
            ],
        )
        .unwrap();
    assert!(orchestrator.wait_idle(Duration::from_secs(60)));
    thread::sleep(Duration::from_millis(100));

    let after = orchestrator.volumes();
    assert!(close(after.cell.volume, 10_000.0, 1.0), "cell {}", after.cell.volume);
    assert!(after.exchanged >= 25_000.0 - 1.0, "exchanged {}", after.exchanged);
    // Waste took the pulled electrolyte of the drained strokes and the pre-pressure
    assert!(after.waste.volume > 20_000.0 && after.waste.volume < 25_500.0);
    assert!(after.reservoirs[&1].tally.volume < before.reservoirs[&1].tally.volume - 25_000.0);
    assert!(close(total(&after), total(&before), 2.0));
    assert!(orchestrator.status().last_error.is_none());
}

#[test]
fn continuous_start_with_wrong_plumbing_sends_nothing() {
    let mut config = Config::default();
    let mut s1 = config.pump_settings.get(1).cloned().unwrap();
    s1.right = Role::Waste;
    config.pump_settings.insert(1, s1);
    let (orchestrator, sim) = session(config, 100.0, |_| {});
    let before = orchestrator.volumes();

    let result = orchestrator.start("continuous", &[]);
    assert!(matches!(result, Err(PumpError::TopologyMismatch(_))));
    thread::sleep(Duration::from_millis(50));

    assert!(sim.commands().iter().all(|(address, _)| *address == 0x5F));
    let status = orchestrator.status();
    assert!(status.mode.is_none());
    assert_eq!(status.volumes, before);
}

#[test]
fn failed_continuous_start_halts_the_pumps_it_started() {
    let config = Config::default();
    // S4 refuses plunger moves, after S1 to S3 already took theirs
    let sim = SimulatedBus::for_config(&config)
        .uninitialized(4)
        .with_time_scale(20.0);
    let orchestrator = connect(config, &sim);

    let result = orchestrator.start("continuous", &["premotion_rate=100".to_string()]);
    assert!(matches!(result, Err(PumpError::Device { device: 4, .. })), "{:?}", result);
    thread::sleep(Duration::from_millis(100));

    assert!(pumps_moving(&sim).is_empty(), "still moving: {:?}", pumps_moving(&sim));
    assert!(sim.commands().contains(&(0x51, "T".to_string())));
    let status = orchestrator.status();
    assert!(status.mode.is_none());
    assert_eq!(status.last_error.map(|e| e.kind), Some(ErrorKind::DeviceError));
}

#[test]
fn syringe_fault_mid_exchange_halts_every_pump() {
    let (orchestrator, sim) = session(Config::default(), 20.0, |_| {});
    let events = orchestrator.subscribe();
    orchestrator
        .start(
            "intermittent",
            &[
                "pair=pair13".to_string(),
                "exchange_rate=500".to_string(),
                "refill_rate=1500".to_string(),
                "total_exchange_amount=25000".to_string(),
            ],
        )
        .unwrap();
    assert!(wait_for(&events, Duration::from_secs(10), |e| matches!(
        e,
        Event::Phase { mode: ModeKind::Intermittent, phase: "exchange" }
    ))
    .is_some());

    // The pull side overloads during the stroke
    sim.fault_syringe(3, 4);
    assert!(wait_for(&events, Duration::from_secs(10), |e| matches!(
        e,
        Event::Stopped { mode: ModeKind::Intermittent }
    ))
    .is_some());
    thread::sleep(Duration::from_millis(100));

    let status = orchestrator.status();
    assert!(status.mode.is_none());
    assert_eq!(status.last_error.map(|e| e.kind), Some(ErrorKind::SyringeError));
    assert!(sim.commands().contains(&(0x5F, "T".to_string())));
    assert!(pumps_moving(&sim).is_empty(), "still moving: {:?}", pumps_moving(&sim));

    // A new mode is refused while the drive still reports the fault
    let normal = [
        "syringe=3".to_string(),
        "direction=dispense".to_string(),
        "port=up".to_string(),
        "volume=100".to_string(),
        "rate=1000".to_string(),
    ];
    assert!(matches!(
        orchestrator.start("normal", &normal),
        Err(PumpError::Syringe { device: 3, .. })
    ));
    sim.fault_syringe(3, 0);
    orchestrator.start("normal", &normal).unwrap();
    assert!(orchestrator.wait_idle(Duration::from_secs(5)));
}

#[test]
fn dose_during_continuous_exchange_reaches_the_cell() {
    let (orchestrator, sim) = session(Config::default(), 20.0, |_| {});
    let events = orchestrator.subscribe();
    orchestrator
        .start(
            "continuous",
            &[
                "exchange_rate=500".to_string(),
                "refill_rate=1500".to_string(),
                "premotion_rate=1500".to_string(),
                "total_exchange_amount=25000".to_string(),
            ],
        )
        .unwrap();

    // Dose once the first stroke runs and the standby pair is ready
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let phase = orchestrator.status().mode.map(|m| m.phase);
        if phase == Some("exchange") && !sim.is_busy(1) && !sim.is_busy(3) {
            break;
        }
        assert!(Instant::now() < deadline, "no exchange stroke, phase {:?}", phase);
        thread::sleep(Duration::from_millis(10));
    }
    orchestrator.dose(Dose::add(10.0)).unwrap();
    assert!(wait_for(&events, Duration::from_secs(10), |e| matches!(
        e,
        Event::Phase { mode: ModeKind::Continuous, phase: "dosing" }
    ))
    .is_some());
    assert!(wait_for(&events, Duration::from_secs(10), |e| matches!(
        e,
        Event::Phase { mode: ModeKind::Continuous, phase: "exchange" }
    ))
    .is_some());

    assert!(orchestrator.wait_idle(Duration::from_secs(60)));
    thread::sleep(Duration::from_millis(100));
    assert!(sim
        .commands()
        .iter()
        .any(|(address, payload)| *address == 0x31 && payload.contains("D154")));
    let report = orchestrator.volumes();
    assert!(close(report.cell.volume, 10_010.0, 2.0), "cell {}", report.cell.volume);
    assert!(report.tripped.is_none());
}

#[test]
fn waste_overflow_trips_and_blocks_modes() {
    let mut config = Config::default();
    config.volumes.waste_volume = 90.0;
    config.volumes.waste_volume_total = 100.0;
    let (orchestrator, _sim) = session(config, 100.0, |sim| sim.set_position(1, 15_360));
    let events = orchestrator.subscribe();

    let s1 = orchestrator.syringe(1).unwrap();
    s1.dispense(50.0, Some(100.0), Some(ValveTarget::from("Waste")), Dispatch::RUN)
        .unwrap()
        .wait()
        .unwrap();

    let tripped = wait_for(&events, Duration::from_secs(2), |e| {
        matches!(e, Event::BoundsTripped { .. })
    });
    assert!(tripped.is_some());
    let report = orchestrator.volumes();
    assert_eq!(report.waste.volume, 100.0);
    assert!(report.tripped.as_deref().unwrap_or("").contains("waste"));

    let normal = ["syringe=2".to_string(), "volume=100".to_string(), "rate=1000".to_string()];
    assert!(matches!(
        orchestrator.start("normal", &normal),
        Err(PumpError::BoundsTripped(_))
    ));

    orchestrator
        .reset_volumes(syringe_exchange::Compartment::Waste, 0.0)
        .unwrap();
    assert!(orchestrator.acknowledge());
    assert!(!orchestrator.acknowledge());
    orchestrator.start("normal", &normal).unwrap();
    assert!(orchestrator.wait_idle(Duration::from_secs(5)));
}

#[test]
fn configuration_survives_save_and_load() {
    let (orchestrator, _sim) = session(Config::default(), 100.0, |_| {});
    orchestrator.set_port_alias(5, 4, "Rinse").unwrap();
    orchestrator.swap_pair("pair24").unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rig.yaml");
    orchestrator.save_config(&path).unwrap();

    let reloaded = Orchestrator::new(Config::default()).unwrap();
    reloaded.load_config(&path).unwrap();
    let config = reloaded.config();
    assert_eq!(config, orchestrator.config());
    assert_eq!(config.devices[&5].valve_alias[&4], "Rinse");
    assert_eq!(config.pairs["pair24"].args, vec!["Syringe4", "Syringe2"]);
}
