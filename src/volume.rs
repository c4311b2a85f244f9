//! Logical volume bookkeeping.
//!
//! Reservoirs, waste and cell are tallies with hard bounds. Syringe motion is
//! mirrored into them from the positions the bus server reports, so the model
//! never drifts from the hardware. A bound violation clamps the tally back and
//! latches a trip until the operator acknowledges it.

use crate::config::Config;
use crate::devices::Syringe;
use crate::error::{PumpError, Result};
use crate::settings::{PortPositions, PumpSettings, Role};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Tolerance on bounds checks, uL
const EPS: f64 = 1e-6;

/// One bounded compartment
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Tally {
    pub volume: f64,
    pub capacity: f64,
}

impl Tally {
    pub fn new(volume: f64, capacity: f64) -> Self {
        Tally { volume, capacity }
    }

    pub fn headroom(&self) -> f64 {
        self.capacity - self.volume
    }

    fn in_bounds(&self) -> bool {
        self.volume >= -EPS && self.volume <= self.capacity + EPS
    }

    fn clamp(&mut self) {
        self.volume = self.volume.clamp(0.0, self.capacity.max(0.0));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reservoir {
    pub solution: String,
    #[serde(flatten)]
    pub tally: Tally,
}

/// Tally addressed by operator resets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compartment {
    /// One reservoir, or all of them
    Reservoir(Option<u8>),
    Waste,
    Cell,
    /// The session's exchanged amount
    Exchanged,
}

impl Compartment {
    /// Parse `reservoir`, `reservoir3`, `waste`, `cell` or `exchanged`
    pub fn parse(text: &str) -> Result<Self> {
        let lower = text.to_ascii_lowercase();
        match lower.as_str() {
            "waste" => Ok(Compartment::Waste),
            "cell" => Ok(Compartment::Cell),
            "exchanged" => Ok(Compartment::Exchanged),
            "reservoir" => Ok(Compartment::Reservoir(None)),
            other => other
                .strip_prefix("reservoir")
                .and_then(|id| id.trim_start_matches(&['_', 's', 'S'][..]).parse::<u8>().ok())
                .map(|id| Compartment::Reservoir(Some(id)))
                .ok_or_else(|| PumpError::InvalidArgument(format!("unknown compartment {}", text))),
        }
    }
}

impl fmt::Display for Compartment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compartment::Reservoir(Some(id)) => write!(f, "reservoir S{}", id),
            Compartment::Reservoir(None) => f.write_str("reservoirs"),
            Compartment::Waste => f.write_str("waste"),
            Compartment::Cell => f.write_str("cell"),
            Compartment::Exchanged => f.write_str("exchanged"),
        }
    }
}

/// Serialisable copy of every tally
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeReport {
    pub reservoirs: BTreeMap<u8, Reservoir>,
    pub waste: Tally,
    pub cell: Tally,
    pub syringes: BTreeMap<u8, Tally>,
    pub exchanged: f64,
    pub tripped: Option<String>,
}

/// Tallies of one session
#[derive(Debug, Clone)]
pub struct VolumeModel {
    reservoirs: BTreeMap<u8, Reservoir>,
    waste: Tally,
    cell: Tally,
    syringes: BTreeMap<u8, Tally>,
    exchanged: f64,
    tripped: Option<String>,
}

impl VolumeModel {
    /// Initial tallies: reservoirs from pump settings, syringes empty
    pub fn from_config(config: &Config) -> Self {
        let reservoirs = config
            .pump_settings
            .iter()
            .filter(|(_, s)| s.has_reservoir())
            .map(|(id, s)| {
                (
                    id,
                    Reservoir {
                        solution: s.solution.clone(),
                        tally: Tally::new(s.volume, s.capacity),
                    },
                )
            })
            .collect();
        let syringes = config
            .devices
            .iter()
            .filter_map(|(id, d)| d.syringevolume.map(|v| (*id, Tally::new(0.0, v))))
            .collect();
        let volumes = &config.volumes;
        VolumeModel {
            reservoirs,
            waste: Tally::new(volumes.waste_volume, volumes.waste_volume_total),
            cell: Tally::new(volumes.cell_volume, volumes.cell_volume_in_total),
            syringes,
            exchanged: 0.0,
            tripped: None,
        }
    }

    pub fn waste(&self) -> Tally {
        self.waste
    }

    pub fn cell(&self) -> Tally {
        self.cell
    }

    pub fn reservoir(&self, id: u8) -> Option<&Reservoir> {
        self.reservoirs.get(&id)
    }

    pub fn syringe(&self, id: u8) -> Option<Tally> {
        self.syringes.get(&id).copied()
    }

    /// Volume pushed into the cell inlet since the last reset
    pub fn exchanged(&self) -> f64 {
        self.exchanged
    }

    pub fn reset_exchanged(&mut self) {
        self.exchanged = 0.0;
    }

    /// Record the content of syringe `id`, adding it when first seen
    pub fn set_syringe(&mut self, id: u8, volume: f64, capacity: f64) {
        let tally = self
            .syringes
            .entry(id)
            .or_insert_with(|| Tally::new(0.0, capacity));
        tally.capacity = capacity;
        tally.volume = volume;
    }

    /// Book a plunger displacement of syringe `id` through a port with `role`.
    ///
    /// `delta` is the change of syringe content: negative while dispensing,
    /// positive while picking up.
    pub fn apply(&mut self, id: u8, role: Role, delta: f64) {
        if delta == 0.0 {
            return;
        }
        // Liquid moving out of the syringe enters the compartment
        let inflow = -delta;
        match role {
            Role::Waste => self.waste.volume += inflow,
            Role::Reservoir => match self.reservoirs.get_mut(&id) {
                Some(reservoir) => reservoir.tally.volume += inflow,
                None => log::warn!("S{}: reservoir port without a reservoir tally", id),
            },
            Role::CellInlet => {
                self.cell.volume += inflow;
                if inflow > 0.0 {
                    self.exchanged += inflow;
                }
            }
            Role::CellOutlet => self.cell.volume += inflow,
            Role::NotUsed => {}
        }
        log::trace!("S{}: {:+.3} uL via {}", id, inflow, role);
    }

    /// Clamp every tally back into its bounds; latch and describe a new violation
    pub fn enforce_bounds(&mut self) -> Option<String> {
        let mut violations = Vec::new();
        for (id, reservoir) in self.reservoirs.iter_mut() {
            if !reservoir.tally.in_bounds() {
                violations.push(describe(&format!("reservoir S{}", id), &reservoir.tally));
                reservoir.tally.clamp();
            }
        }
        for (name, tally) in [("waste", &mut self.waste), ("cell", &mut self.cell)] {
            if !tally.in_bounds() {
                violations.push(describe(name, tally));
                tally.clamp();
            }
        }
        for (id, tally) in self.syringes.iter_mut() {
            if !tally.in_bounds() {
                violations.push(describe(&format!("syringe S{}", id), tally));
                tally.clamp();
            }
        }
        if violations.is_empty() {
            return None;
        }
        let message = violations.join("; ");
        if self.tripped.is_none() {
            self.tripped = Some(message.clone());
            Some(message)
        } else {
            None
        }
    }

    pub fn tripped(&self) -> Option<&str> {
        self.tripped.as_deref()
    }

    /// Fail while a trip is latched
    pub fn check_armed(&self) -> Result<()> {
        match &self.tripped {
            Some(message) => Err(PumpError::BoundsTripped(message.clone())),
            None => Ok(()),
        }
    }

    /// Clear the latched trip
    pub fn acknowledge(&mut self) -> bool {
        self.tripped.take().is_some()
    }

    /// Overwrite a tally; reservoirs and waste are refilled or emptied by hand
    pub fn reset(&mut self, compartment: Compartment, volume: f64) -> Result<()> {
        if !volume.is_finite() || volume < 0.0 {
            return Err(PumpError::InvalidArgument(format!("volume {}", volume)));
        }
        let check = |tally: &Tally| {
            if volume > tally.capacity + EPS {
                Err(PumpError::InvalidArgument(format!(
                    "{:.1} uL exceeds capacity {:.1} uL",
                    volume, tally.capacity
                )))
            } else {
                Ok(())
            }
        };
        match compartment {
            Compartment::Reservoir(Some(id)) => {
                let reservoir = self.reservoirs.get_mut(&id).ok_or_else(|| {
                    PumpError::InvalidArgument(format!("syringe {} has no reservoir", id))
                })?;
                check(&reservoir.tally)?;
                reservoir.tally.volume = volume;
            }
            Compartment::Reservoir(None) => {
                for reservoir in self.reservoirs.values() {
                    check(&reservoir.tally)?;
                }
                for reservoir in self.reservoirs.values_mut() {
                    reservoir.tally.volume = volume;
                }
            }
            Compartment::Waste => {
                check(&self.waste)?;
                self.waste.volume = volume;
            }
            Compartment::Cell => {
                check(&self.cell)?;
                self.cell.volume = volume;
            }
            Compartment::Exchanged => self.exchanged = volume,
        }
        log::info!("Volume of {} reset to {:.1} uL", compartment, volume);
        Ok(())
    }

    pub fn report(&self) -> VolumeReport {
        VolumeReport {
            reservoirs: self.reservoirs.clone(),
            waste: self.waste,
            cell: self.cell,
            syringes: self.syringes.clone(),
            exchanged: self.exchanged,
            tripped: self.tripped.clone(),
        }
    }
}

fn describe(name: &str, tally: &Tally) -> String {
    format!(
        "{} at {:.1} uL outside [0, {:.1}]",
        name, tally.volume, tally.capacity
    )
}

/// Mirrors reported syringe contents into a `VolumeModel`
#[derive(Debug, Default)]
pub struct VolumeTracker {
    last: BTreeMap<u8, f64>,
}

impl VolumeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget previous samples; the next sample becomes the baseline
    pub fn rebase(&mut self) {
        self.last.clear();
    }

    /// Book every syringe's change since the previous sample
    pub fn sample(
        &mut self,
        syringes: &[Arc<Syringe>],
        settings: &PumpSettings,
        ports: &PortPositions,
        model: &mut VolumeModel,
    ) {
        for syringe in syringes {
            let id = syringe.id();
            let Some(volume) = syringe.volume() else {
                continue;
            };
            model.set_syringe(id, volume, syringe.max_volume());
            if let Some(previous) = self.last.insert(id, volume) {
                let delta = volume - previous;
                if delta.abs() > EPS {
                    let role = syringe
                        .valve()
                        .valve_position()
                        .and_then(|p| ports.label(p))
                        .and_then(|label| settings.role(id, label))
                        .unwrap_or(Role::NotUsed);
                    model.apply(id, role, delta);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn model() -> VolumeModel {
        VolumeModel::from_config(&Config::default())
    }

    #[test]
    fn initial_tallies_follow_configuration() {
        let model = model();
        assert_eq!(model.reservoir(1).unwrap().tally, Tally::new(100_000.0, 250_000.0));
        assert!(model.reservoir(3).is_none());
        assert_eq!(model.waste(), Tally::new(0.0, 250_000.0));
        assert_eq!(model.cell(), Tally::new(10_000.0, 50_000.0));
        assert_eq!(model.syringe(4), Some(Tally::new(0.0, 12_500.0)));
    }

    #[test]
    fn bookkeeping_by_role() {
        let mut model = model();
        // S1 picks up from its reservoir, then pushes into the cell
        model.apply(1, Role::Reservoir, 5_000.0);
        model.apply(1, Role::CellInlet, -2_000.0);
        // S3 pulls from the cell, then drains to waste
        model.apply(3, Role::CellOutlet, 2_000.0);
        model.apply(3, Role::Waste, -2_000.0);
        model.apply(3, Role::NotUsed, -100.0);

        assert_eq!(model.reservoir(1).unwrap().tally.volume, 95_000.0);
        assert_eq!(model.cell().volume, 10_000.0);
        assert_eq!(model.waste().volume, 2_000.0);
        assert_eq!(model.exchanged(), 2_000.0);
        assert!(model.enforce_bounds().is_none());
    }

    #[test]
    fn trip_clamps_and_latches() {
        let mut model = model();
        model.reset(Compartment::Waste, 240_000.0).unwrap();
        model.apply(3, Role::Waste, -12_500.0);
        let message = model.enforce_bounds().unwrap();
        assert!(message.contains("waste"));
        assert_eq!(model.waste().volume, 250_000.0);
        assert!(matches!(model.check_armed(), Err(PumpError::BoundsTripped(_))));

        // Latched: a second violation does not re-trip
        model.apply(3, Role::Waste, -1.0);
        assert!(model.enforce_bounds().is_none());
        assert!(model.acknowledge());
        assert!(model.check_armed().is_ok());
        assert!(!model.acknowledge());
    }

    #[test]
    fn resets_respect_capacity() {
        let mut model = model();
        assert!(model.reset(Compartment::Reservoir(Some(1)), 300_000.0).is_err());
        assert!(model.reset(Compartment::Reservoir(Some(3)), 10.0).is_err());
        model.reset(Compartment::Reservoir(None), 200_000.0).unwrap();
        assert_eq!(model.reservoir(2).unwrap().tally.volume, 200_000.0);
        assert!(model.reset(Compartment::Cell, -1.0).is_err());
    }

    #[test]
    fn compartments_parse() {
        assert_eq!(Compartment::parse("Waste").unwrap(), Compartment::Waste);
        assert_eq!(Compartment::parse("reservoir").unwrap(), Compartment::Reservoir(None));
        assert_eq!(Compartment::parse("reservoir2").unwrap(), Compartment::Reservoir(Some(2)));
        assert_eq!(Compartment::parse("reservoir_S1").unwrap(), Compartment::Reservoir(Some(1)));
        assert!(Compartment::parse("bucket").is_err());
    }

    #[test]
    fn random_motion_never_leaves_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let roles = [
            Role::Reservoir,
            Role::Waste,
            Role::CellInlet,
            Role::CellOutlet,
            Role::NotUsed,
        ];
        let mut model = model();
        let mut trips = 0;
        for _ in 0..5_000 {
            let id = rng.gen_range(1..=4u8);
            let role = roles[rng.gen_range(0..roles.len())];
            let delta = rng.gen_range(-20_000.0..20_000.0);
            let before = model.report();
            model.apply(id, role, delta);
            let would_violate = {
                let after = model.report();
                after.waste.volume < -EPS
                    || after.waste.volume > after.waste.capacity + EPS
                    || after.cell.volume < -EPS
                    || after.cell.volume > after.cell.capacity + EPS
                    || after
                        .reservoirs
                        .values()
                        .any(|r| r.tally.volume < -EPS || r.tally.volume > r.tally.capacity + EPS)
            };
            let fired = model.enforce_bounds().is_some();
            assert_eq!(fired, would_violate && before.tripped.is_none());
            if fired {
                trips += 1;
                model.acknowledge();
            }
            let report = model.report();
            assert!((0.0..=report.waste.capacity).contains(&report.waste.volume));
            assert!((0.0..=report.cell.capacity).contains(&report.cell.volume));
            for reservoir in report.reservoirs.values() {
                assert!((0.0..=reservoir.tally.capacity).contains(&reservoir.tally.volume));
            }
        }
        assert!(trips > 0);
    }
}
