//! # Syringe Exchange
//!
//! Orchestration engine for Hamilton-style syringe pumps and multi-port
//! valves chained on one RS-485 bus, driving electrolyte exchange through a
//! flow cell.
//!
//! ## Features
//!
//! - Framed wire protocol with checksums, sequence numbering and broadcasts
//! - Bus server thread multiplexing prioritised commands with status polling
//! - Syringe and valve proxies working in uL and uL/s with bounds checks
//! - Exchange pairs moving two syringes in opposite phase, started together
//! - Operation modes: init, normal, intermittent and continuous exchange,
//!   cell fill and clean
//! - Volume model of reservoirs, waste and cell with a halting tripwire
//! - Simulated device chain for demo sessions and tests
//!
//! ## Example
//!
//! ```no_run
//! use syringe_exchange::{Config, Orchestrator};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Orchestrator::new(Config::from_file("pumps.yaml")?)?;
//!     orchestrator.connect("/dev/ttyUSB0")?;
//!     orchestrator.start("intermittent", &["total_exchange_amount=25000".to_string()])?;
//!     orchestrator.wait_idle(std::time::Duration::from_secs(600));
//!     println!("{}", serde_json::to_string_pretty(&orchestrator.status())?);
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod codec;
pub mod command;
pub mod config;
pub mod constants;
pub mod devices;
pub mod error;
pub mod exchange;
pub mod modes;
pub mod orchestrator;
pub mod settings;
pub mod status;
pub mod transport;
pub mod types;
pub mod volume;

pub use bus::{BusHandle, BusOptions, BusServer, CommandFuture, Reply};
pub use command::{Command, CommandString, Query};
pub use config::Config;
pub use devices::{DeviceSet, Issued, Syringe, Valve};
pub use error::{ErrorKind, PumpError, Result};
pub use exchange::{ExchangePair, Synchrony};
pub use modes::{Dose, DoseDirection, ModeKind, ModeRequest};
pub use orchestrator::{Event, Orchestrator, StatusReport};
pub use settings::{PortLabel, Role};
pub use transport::{SerialTransport, SimulatedBus, Transport};
pub use types::*;
pub use volume::{Compartment, VolumeModel, VolumeReport};
