//! YAML session configuration.
//!
//! The file describes the serial line, the devices on the bus, named exchange
//! pairs, the per-syringe pump settings (port roles), logical volume tallies
//! and the numeric valve positions of the labelled ports.

use crate::constants::*;
use crate::error::{PumpError, Result};
use crate::settings::{PortPositions, PumpSetting, PumpSettings, Role};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Serial flow control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowSetting {
    #[default]
    None,
    Software,
    Hardware,
}

/// Serial line parameters of the bus server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port opened by `connect` when none is given
    pub port: Option<String>,
    pub baudrate: u32,
    pub bytesize: u8,
    /// `N`, `E` or `O`
    pub parity: String,
    pub stopbits: u8,
    pub flowcontrol: FlowSetting,
    /// Repeats after the first attempt
    pub retries: u8,
    /// Per-attempt read timeout
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
    #[serde(rename = "write timeout")]
    pub write_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: None,
            baudrate: BAUD_RATE,
            bytesize: 8,
            parity: "N".to_string(),
            stopbits: 1,
            flowcontrol: FlowSetting::None,
            retries: 1,
            timeout_ms: READ_TIMEOUT.as_millis() as u64,
            write_timeout_ms: WRITE_TIMEOUT.as_millis() as u64,
        }
    }
}

/// One device on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Hardware family, e.g. `PSD4` or `MVP`
    #[serde(rename = "type")]
    pub device_type: String,
    /// Proxy class tag resolved through the device registry
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Syringe capacity in uL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syringevolume: Option<f64>,
    #[serde(rename = "valve alias", default)]
    pub valve_alias: BTreeMap<u8, String>,
    #[serde(rename = "start rate", default, skip_serializing_if = "Option::is_none")]
    pub start_rate: Option<f64>,
    #[serde(rename = "stop rate", default, skip_serializing_if = "Option::is_none")]
    pub stop_rate: Option<f64>,
    #[serde(rename = "return volume", default, skip_serializing_if = "Option::is_none")]
    pub return_volume: Option<f64>,
    #[serde(rename = "backoff volume", default, skip_serializing_if = "Option::is_none")]
    pub backoff_volume: Option<f64>,
    #[serde(rename = "valve type", default, skip_serializing_if = "Option::is_none")]
    pub valve_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceleration: Option<u8>,
    #[serde(rename = "defaultFillRate", default, skip_serializing_if = "Option::is_none")]
    pub default_fill_rate: Option<f64>,
    #[serde(rename = "defaultDrainRate", default, skip_serializing_if = "Option::is_none")]
    pub default_drain_rate: Option<f64>,
    /// Allow `z` initialisation; unreliable on some drive families
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub encoder_init: bool,
}

impl DeviceEntry {
    fn syringe(name: &str, volume: f64, aliases: &[(u8, &str)]) -> Self {
        DeviceEntry {
            device_type: "PSD4".to_string(),
            class: "Syringe".to_string(),
            name: Some(name.to_string()),
            syringevolume: Some(volume),
            valve_alias: aliases.iter().map(|(p, a)| (*p, a.to_string())).collect(),
            start_rate: None,
            stop_rate: None,
            return_volume: None,
            backoff_volume: None,
            valve_type: Some(0),
            acceleration: None,
            default_fill_rate: Some(1000.0),
            default_drain_rate: Some(1000.0),
            encoder_init: false,
        }
    }

    fn valve(name: &str) -> Self {
        DeviceEntry {
            device_type: "MVP".to_string(),
            class: "Valve".to_string(),
            name: Some(name.to_string()),
            syringevolume: None,
            valve_alias: BTreeMap::new(),
            start_rate: None,
            stop_rate: None,
            return_volume: None,
            backoff_volume: None,
            valve_type: None,
            acceleration: None,
            default_fill_rate: None,
            default_drain_rate: None,
            encoder_init: false,
        }
    }
}

/// Per-side port overrides of an exchange pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMap {
    #[serde(rename = "Cell", default, skip_serializing_if = "Option::is_none")]
    pub cell: Option<u8>,
    #[serde(rename = "Waste", default, skip_serializing_if = "Option::is_none")]
    pub waste: Option<u8>,
    #[serde(rename = "Reservoir", default, skip_serializing_if = "Option::is_none")]
    pub reservoir: Option<u8>,
}

/// Named exchange pair: `args` lists the push syringe first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairConfig {
    pub args: Vec<String>,
    #[serde(rename = "defaultRate", default, skip_serializing_if = "Option::is_none")]
    pub default_rate: Option<f64>,
    #[serde(rename = "defaultFillRate", default, skip_serializing_if = "Option::is_none")]
    pub default_fill_rate: Option<f64>,
    #[serde(rename = "defaultDrainRate", default, skip_serializing_if = "Option::is_none")]
    pub default_drain_rate: Option<f64>,
    #[serde(rename = "prePressure", default)]
    pub pre_pressure: f64,
    #[serde(rename = "prePressureRate", default, skip_serializing_if = "Option::is_none")]
    pub pre_pressure_rate: Option<f64>,
    #[serde(rename = "underPressure", default)]
    pub under_pressure: f64,
    #[serde(rename = "underPressureRate", default, skip_serializing_if = "Option::is_none")]
    pub under_pressure_rate: Option<f64>,
    /// Milliseconds the pull side waits after the push side starts
    #[serde(rename = "dispenseDelay", default)]
    pub dispense_delay: u32,
    #[serde(rename = "bubbleDispense", default)]
    pub bubble_dispense: f64,
    #[serde(rename = "pullSyr", default)]
    pub pull_syr: PortMap,
    #[serde(rename = "pushSyr", default)]
    pub push_syr: PortMap,
}

impl PairConfig {
    fn new(push: &str, pull: &str) -> Self {
        PairConfig {
            args: vec![push.to_string(), pull.to_string()],
            default_rate: Some(500.0),
            default_fill_rate: Some(1500.0),
            default_drain_rate: Some(1500.0),
            pre_pressure: 0.0,
            pre_pressure_rate: None,
            under_pressure: 0.0,
            under_pressure_rate: None,
            dispense_delay: 0,
            bubble_dispense: 0.0,
            pull_syr: PortMap::default(),
            push_syr: PortMap::default(),
        }
    }
}

/// Logical tallies outside the syringes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumesConfig {
    pub waste_volume: f64,
    pub waste_volume_total: f64,
    pub cell_volume: f64,
    pub cell_volume_in_total: f64,
}

impl Default for VolumesConfig {
    fn default() -> Self {
        VolumesConfig {
            waste_volume: 0.0,
            waste_volume_total: 250_000.0,
            cell_volume: 10_000.0,
            cell_volume_in_total: 50_000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

/// Complete session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub devices: BTreeMap<u8, DeviceEntry>,
    #[serde(default)]
    pub pairs: BTreeMap<String, PairConfig>,
    #[serde(rename = "pump settings", default)]
    pub pump_settings: PumpSettings,
    #[serde(default)]
    pub volumes: VolumesConfig,
    #[serde(rename = "port positions", default)]
    pub port_positions: PortPositions,
    /// Device id of the multi-port valve feeding the cell inlet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mvp: Option<u8>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_str(&contents)?;
        log::info!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Parse and validate YAML text
    pub fn from_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_yaml()?)?;
        log::info!("Saved configuration to {}", path.as_ref().display());
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        for (id, entry) in &self.devices {
            if *id == 0 || *id > MAX_DEVICES {
                return Err(PumpError::InvalidArgument(format!("device id {} out of range", id)));
            }
            if let Some(volume) = entry.syringevolume {
                if volume <= 0.0 {
                    return Err(PumpError::InvalidArgument(format!(
                        "device {} syringe volume {}",
                        id, volume
                    )));
                }
            }
            if entry.valve_alias.keys().any(|p| !VALVE_POSITIONS.contains(p)) {
                return Err(PumpError::InvalidArgument(format!(
                    "device {} alias outside valve positions",
                    id
                )));
            }
        }
        for (name, pair) in &self.pairs {
            if pair.args.len() != 2 {
                return Err(PumpError::InvalidArgument(format!(
                    "pair {} needs exactly two syringes",
                    name
                )));
            }
            for arg in &pair.args {
                self.resolve_device(arg)?;
            }
        }
        self.pump_settings.validate()?;
        self.port_positions.validate()?;
        Ok(())
    }

    /// Resolve a pair argument such as `Syringe3` or a device name to an id
    pub fn resolve_device(&self, reference: &str) -> Result<u8> {
        if let Some((id, _)) = self
            .devices
            .iter()
            .find(|(_, e)| e.name.as_deref() == Some(reference))
        {
            return Ok(*id);
        }
        let digits: String = reference
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        digits
            .parse::<u8>()
            .ok()
            .filter(|id| self.devices.contains_key(id))
            .ok_or_else(|| PumpError::InvalidArgument(format!("unknown pair member {}", reference)))
    }
}

impl Default for Config {
    /// Canonical four-syringe exchange rig with the cell-inlet valve at id 5
    fn default() -> Self {
        let push_alias = [(1, "Reservoir"), (2, "Waste"), (3, "Cell")];
        let pull_alias = [(1, "Cell"), (2, "Waste")];
        let mut devices = BTreeMap::new();
        devices.insert(1, DeviceEntry::syringe("Syringe1", 12_500.0, &push_alias));
        devices.insert(2, DeviceEntry::syringe("Syringe2", 12_500.0, &push_alias));
        devices.insert(3, DeviceEntry::syringe("Syringe3", 12_500.0, &pull_alias));
        devices.insert(4, DeviceEntry::syringe("Syringe4", 12_500.0, &pull_alias));
        devices.insert(5, DeviceEntry::valve("Inlet"));

        let mut pairs = BTreeMap::new();
        pairs.insert("pair13".to_string(), PairConfig::new("Syringe1", "Syringe3"));
        pairs.insert("pair24".to_string(), PairConfig::new("Syringe2", "Syringe4"));

        let mut pump_settings = PumpSettings::default();
        for id in [1, 2] {
            pump_settings.insert(
                id,
                PumpSetting {
                    left: Role::Reservoir,
                    up: Role::Waste,
                    right: Role::CellInlet,
                    mvp: Some(id),
                    solution: "electrolyte".to_string(),
                    capacity: 250_000.0,
                    volume: 100_000.0,
                },
            );
        }
        for id in [3, 4] {
            pump_settings.insert(
                id,
                PumpSetting {
                    left: Role::CellOutlet,
                    up: Role::Waste,
                    right: Role::NotUsed,
                    mvp: None,
                    solution: String::new(),
                    capacity: 0.0,
                    volume: 0.0,
                },
            );
        }

        Config {
            server: ServerConfig::default(),
            devices,
            pairs,
            pump_settings,
            volumes: VolumesConfig::default(),
            port_positions: PortPositions::default(),
            mvp: Some(5),
            logging: LoggingConfig::default(),
        }
    }
}
