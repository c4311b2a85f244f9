//! Bus Status Example
//!
//! Connects to a pump bus, lists the devices found at discovery and prints
//! each one's status, valve and plunger position, firmware and motion
//! settings as JSON.
//!
//! Usage:
//!   cargo run --example bus_status                  # Interactive port selection
//!   cargo run --example bus_status -- /dev/ttyUSB0  # Specify port
//!   cargo run --example bus_status -- simulated     # Canonical rig, simulated
//!
//! Set RUST_LOG environment variable to control logging:
//!   RUST_LOG=debug cargo run --example bus_status

use inquire::Select;
use log::{info, warn};
use std::time::Duration;
use syringe_exchange::config::ServerConfig;
use syringe_exchange::{
    BusOptions, BusServer, Config, DeviceType, Result, SerialTransport, SimulatedBus, Syringe, Valve,
};

/// Interactive serial port selection using inquire
fn select_port() -> Result<String> {
    let ports = SerialTransport::list_ports()?;

    if ports.is_empty() {
        eprintln!("No serial ports found!");
        std::process::exit(1);
    }

    let selection = Select::new("Select a serial port:", ports).prompt().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Selection cancelled: {}", e),
        )
    })?;
    Ok(selection)
}

fn main() -> Result<()> {
    // Initialize logger with default info level if RUST_LOG is not set
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let port_name = std::env::args()
        .nth(1)
        .map(Ok)
        .unwrap_or_else(select_port)?;

    let server = if port_name == "simulated" {
        let sim = SimulatedBus::for_config(&Config::default());
        let options = BusOptions {
            scan_ids: (1..=5).collect(),
            ..BusOptions::default()
        };
        BusServer::with_transport(Box::new(sim), options)?
    } else {
        info!("Connecting to pump bus on {}...", port_name);
        BusServer::connect(&port_name, &ServerConfig::default())?
    };
    let bus = server.handle();

    // Give the poller one round over every device
    std::thread::sleep(Duration::from_millis(300));

    let snapshot = bus.snapshot();
    info!("=== {} device(s) on {} ===", snapshot.known().len(), server.port());
    for device in snapshot.devices() {
        let valve = Valve::new(bus.clone(), device.id, format!("Device{}", device.id))?;
        let firmware = valve.firmware().unwrap_or_else(|e| format!("unavailable ({})", e));
        info!("Device {} ({:?}) firmware {}", device.id, device.device_type, firmware);
        match serde_json::to_string_pretty(device) {
            Ok(json) => println!("{}", json),
            Err(e) => warn!("Snapshot of {} not serialisable: {}", device.id, e),
        }

        if device.device_type == DeviceType::Psd {
            // Capacity does not matter for reading motion settings
            let syringe = Syringe::new(bus.clone(), device.id, format!("Syringe{}", device.id), 12_500.0)?;
            match syringe.fetch_config() {
                Ok(config) => println!("{}", serde_json::to_string_pretty(&config).unwrap_or_default()),
                Err(e) => warn!("Device {}: settings not readable: {}", device.id, e),
            }
        }
    }

    server.disconnect();
    info!("=== Bus Status Complete ===");
    Ok(())
}
