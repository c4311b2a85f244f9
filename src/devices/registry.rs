//! Class-tag registry turning configuration entries into proxies.

use super::{Device, Syringe, Valve};
use crate::bus::BusHandle;
use crate::config::{Config, DeviceEntry};
use crate::error::{PumpError, Result};
use crate::types::DeviceType;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Builds a proxy for device `id` from its configuration entry
pub type Constructor = fn(BusHandle, u8, &DeviceEntry) -> Result<Arc<dyn Device>>;

fn build_valve(bus: BusHandle, id: u8, entry: &DeviceEntry) -> Result<Arc<dyn Device>> {
    let name = entry.name.clone().unwrap_or_else(|| format!("Valve{}", id));
    let valve = Valve::new(bus, id, name)?;
    valve.set_valve_type(entry.valve_type)?;
    for (position, alias) in &entry.valve_alias {
        valve.set_alias(*position, alias)?;
    }
    Ok(Arc::new(valve))
}

fn build_syringe(bus: BusHandle, id: u8, entry: &DeviceEntry) -> Result<Arc<dyn Device>> {
    let name = entry.name.clone().unwrap_or_else(|| format!("Syringe{}", id));
    let volume = entry.syringevolume.ok_or_else(|| {
        PumpError::InvalidArgument(format!("device {} needs a syringevolume", id))
    })?;
    let syringe = Syringe::new(bus, id, name, volume)?;
    syringe.valve().set_valve_type(entry.valve_type)?;
    for (position, alias) in &entry.valve_alias {
        syringe.valve().set_alias(*position, alias)?;
    }
    syringe.set_default_rates(entry.default_fill_rate, entry.default_drain_rate);
    syringe.set_motion_profile(
        entry.start_rate,
        entry.stop_rate,
        entry.return_volume,
        entry.backoff_volume,
        entry.acceleration,
    );
    syringe.allow_encoder_init(entry.encoder_init);
    Ok(Arc::new(syringe))
}

/// Named constructors keyed by lower-case class tag
pub struct DeviceRegistry {
    constructors: HashMap<String, Constructor>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        let mut registry = DeviceRegistry {
            constructors: HashMap::new(),
        };
        registry.register("valve", build_valve);
        registry.register("mvp", build_valve);
        registry.register("syringe", build_syringe);
        registry.register("psd", build_syringe);
        registry.register("psd4", build_syringe);
        registry.register("psd6", build_syringe);
        registry
    }
}

impl DeviceRegistry {
    pub fn register(&mut self, class: &str, constructor: Constructor) {
        self.constructors.insert(class.to_ascii_lowercase(), constructor);
    }

    pub fn build(&self, bus: &BusHandle, id: u8, entry: &DeviceEntry) -> Result<Arc<dyn Device>> {
        let constructor = self
            .constructors
            .get(&entry.class.to_ascii_lowercase())
            .ok_or_else(|| PumpError::InvalidArgument(format!("unknown device class {}", entry.class)))?;
        constructor(bus.clone(), id, entry)
    }

    /// Proxies for every configured device that answered discovery
    pub fn build_all(&self, bus: &BusHandle, config: &Config) -> Result<DeviceSet> {
        let known = bus.known_devices();
        let mut devices: BTreeMap<u8, Arc<dyn Device>> = BTreeMap::new();
        for (id, entry) in &config.devices {
            if !known.contains(id) {
                log::warn!("Configured device {} did not answer discovery", id);
                continue;
            }
            devices.insert(*id, self.build(bus, *id, entry)?);
        }
        for id in known {
            if devices.contains_key(&id) {
                continue;
            }
            match bus.device(id).map(|d| d.device_type) {
                Some(DeviceType::Mvp) => {
                    log::info!("Device {} is an unconfigured valve positioner", id);
                    devices.insert(id, Arc::new(Valve::new(bus.clone(), id, format!("Valve{}", id))?));
                }
                _ => log::warn!("Device {} has no configuration entry; skipped", id),
            }
        }
        Ok(DeviceSet { devices })
    }
}

/// Proxies of the current session, keyed by device id
#[derive(Clone, Default)]
pub struct DeviceSet {
    devices: BTreeMap<u8, Arc<dyn Device>>,
}

impl DeviceSet {
    pub fn insert(&mut self, device: Arc<dyn Device>) {
        self.devices.insert(device.id(), device);
    }

    pub fn get(&self, id: u8) -> Result<&Arc<dyn Device>> {
        self.devices.get(&id).ok_or(PumpError::UnknownDevice(id))
    }

    pub fn valve(&self, id: u8) -> Result<&Valve> {
        Ok(self.get(id)?.as_valve())
    }

    pub fn syringe(&self, id: u8) -> Result<Arc<Syringe>> {
        Arc::clone(self.get(id)?)
            .into_syringe()
            .ok_or_else(|| PumpError::InvalidArgument(format!("device {} is not a syringe", id)))
    }

    pub fn syringes(&self) -> Vec<Arc<Syringe>> {
        self.devices
            .values()
            .filter_map(|d| Arc::clone(d).into_syringe())
            .collect()
    }

    pub fn ids(&self) -> Vec<u8> {
        self.devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusOptions, BusServer};
    use crate::transport::SimulatedBus;
    use std::time::Duration;

    #[test]
    fn builds_configured_and_discovered_devices() {
        let sim = SimulatedBus::new()
            .with_syringe(1)
            .with_syringe(3)
            .with_valve(5)
            .with_valve(6);
        let options = BusOptions {
            timeout: Duration::from_millis(10),
            scan_ids: (1..=6).collect(),
            ..BusOptions::default()
        };
        let server = BusServer::with_transport(Box::new(sim), options).unwrap();
        let config = Config::default();
        let set = DeviceRegistry::default().build_all(&server.handle(), &config).unwrap();

        assert_eq!(set.ids(), vec![1, 3, 5, 6]);
        let s1 = set.syringe(1).unwrap();
        assert_eq!(s1.max_volume(), 12_500.0);
        assert_eq!(s1.valve().resolve(&"Cell".into()).unwrap(), 3);
        assert!(set.syringe(5).is_err());
        assert_eq!(set.valve(6).unwrap().name(), "Valve6");
        assert!(matches!(set.get(2), Err(PumpError::UnknownDevice(2))));
    }

    #[test]
    fn unknown_class_is_rejected() {
        let sim = SimulatedBus::new().with_syringe(1);
        let options = BusOptions {
            timeout: Duration::from_millis(10),
            scan_ids: vec![1],
            ..BusOptions::default()
        };
        let server = BusServer::with_transport(Box::new(sim), options).unwrap();
        let mut entry = Config::default().devices[&1].clone();
        entry.class = "Centrifuge".to_string();
        assert!(DeviceRegistry::default().build(&server.handle(), 1, &entry).is_err());
    }
}
