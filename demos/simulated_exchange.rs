//! Simulated Exchange Example
//!
//! Runs the canonical four-syringe rig on a simulated device chain: one
//! intermittent exchange on pair13, then a continuous exchange that takes a
//! 10 uL dose halfway through. Events are printed as JSON lines and the
//! final status report at the end.
//!
//! Usage:
//!   cargo run --example simulated_exchange
//!   cargo run --example simulated_exchange -- 200   # time scale
//!
//! Set RUST_LOG environment variable to control logging:
//!   RUST_LOG=debug cargo run --example simulated_exchange

use log::info;
use std::thread;
use std::time::Duration;
use syringe_exchange::{Config, Dose, Orchestrator, Result};

fn main() -> Result<()> {
    // Initialize logger with default info level if RUST_LOG is not set
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let time_scale = std::env::args()
        .nth(1)
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(50.0);

    let orchestrator = Orchestrator::new(Config::default())?;
    let events = orchestrator.subscribe();
    thread::spawn(move || {
        for event in events {
            if let Ok(json) = serde_json::to_string(&event) {
                println!("event {}", json);
            }
        }
    });

    orchestrator.connect_simulated(time_scale)?;

    info!("=== Intermittent Exchange ===");
    orchestrator.start(
        "intermittent",
        &[
            "pair=pair13".to_string(),
            "exchange_rate=1000".to_string(),
            "refill_rate=1500".to_string(),
            "total_exchange_amount=15000".to_string(),
        ],
    )?;
    if !orchestrator.wait_idle(Duration::from_secs(120)) {
        orchestrator.stop()?;
    }
    info!("Volumes: {:?}", orchestrator.volumes());

    info!("=== Continuous Exchange ===");
    orchestrator.start(
        "continuous",
        &[
            "exchange_rate=150".to_string(),
            "total_exchange_amount=20000".to_string(),
        ],
    )?;

    // Wait for the first exchange stroke before dosing
    thread::sleep(Duration::from_secs_f64(60.0 / time_scale));
    match orchestrator.dose(Dose::add(10.0)) {
        Ok(()) => info!("Dosed 10 uL into the cell"),
        Err(e) => info!("Dose not taken: {}", e),
    }

    if !orchestrator.wait_idle(Duration::from_secs(300)) {
        orchestrator.stop()?;
    }

    info!("=== Final Status ===");
    if let Ok(json) = serde_json::to_string_pretty(&orchestrator.status()) {
        println!("{}", json);
    }

    orchestrator.disconnect()?;
    info!("=== Simulated Exchange Complete ===");
    Ok(())
}
