use std::thread;
use std::time::Duration;
use syringe_exchange::constants::PRIORITY_COMMAND;
use syringe_exchange::{BusOptions, BusServer, Command, CommandString, PumpError, SimulatedBus};

fn absolute(microsteps: u32) -> CommandString {
    [Command::Absolute(microsteps), Command::Run].into_iter().collect()
}

#[test]
fn stop_cancels_queued_moves() {
    // Every round trip takes 30 ms so the queue is still full when stop arrives
    let sim = SimulatedBus::new()
        .with_syringe(1)
        .with_latency(Duration::from_millis(30));
    let options = BusOptions {
        timeout: Duration::from_millis(200),
        scan_ids: vec![1],
        ..BusOptions::default()
    };
    let server = BusServer::with_transport(Box::new(sim.clone()), options).unwrap();
    let bus = server.handle();

    let moves: Vec<_> = [40_000, 80_000, 120_000]
        .into_iter()
        .map(|n| bus.send(0x31, &absolute(n), PRIORITY_COMMAND).unwrap())
        .collect();
    let terminate = bus.stop(0x31).unwrap();

    let results: Vec<_> = moves.into_iter().map(|f| f.wait()).collect();
    let cancelled = results
        .iter()
        .filter(|r| matches!(r, Err(PumpError::CancelledByStop)))
        .count();
    assert!(cancelled >= 2, "{:?}", results);
    terminate.wait().unwrap();

    let delivered = sim
        .commands()
        .iter()
        .filter(|(address, payload)| *address == 0x31 && payload.starts_with('A'))
        .count();
    assert!(delivered <= 1);
    assert_eq!(bus.pending(), 0);

    thread::sleep(Duration::from_millis(500));
    assert!(!sim.is_busy(1));
    assert!(!bus.is_busy(1));
    server.disconnect();
}

#[test]
fn cancelled_future_is_never_sent() {
    let sim = SimulatedBus::new()
        .with_syringe(1)
        .with_latency(Duration::from_millis(30));
    let options = BusOptions {
        timeout: Duration::from_millis(200),
        scan_ids: vec![1],
        ..BusOptions::default()
    };
    let server = BusServer::with_transport(Box::new(sim.clone()), options).unwrap();
    let bus = server.handle();

    // The dispatcher is held up by the first transmission
    let first = bus.send(0x31, &CommandString::from(Command::Delay(10)), PRIORITY_COMMAND).unwrap();
    let second = bus.send(0x31, &absolute(96_000), PRIORITY_COMMAND).unwrap();
    second.cancel();
    first.wait().unwrap();
    assert!(matches!(second.wait(), Err(PumpError::CancelledByStop)));
    assert!(sim
        .commands()
        .iter()
        .all(|(_, payload)| !payload.contains("A96000")));
    server.disconnect();
}
