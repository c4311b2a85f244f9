//! Pump settings: what each labelled valve port of each syringe is plumbed to.

use crate::error::{PumpError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Labelled valve port of a syringe drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortLabel {
    Left,
    Up,
    Right,
}

impl PortLabel {
    pub const ALL: [PortLabel; 3] = [PortLabel::Left, PortLabel::Up, PortLabel::Right];

    pub fn parse(text: &str) -> Result<Self> {
        match text.to_ascii_lowercase().as_str() {
            "left" => Ok(PortLabel::Left),
            "up" => Ok(PortLabel::Up),
            "right" => Ok(PortLabel::Right),
            other => Err(PumpError::InvalidArgument(format!("unknown port {}", other))),
        }
    }
}

impl fmt::Display for PortLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PortLabel::Left => "left",
            PortLabel::Up => "up",
            PortLabel::Right => "right",
        })
    }
}

/// What a port is connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Reservoir,
    Waste,
    CellInlet,
    CellOutlet,
    NotUsed,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Reservoir => "reservoir",
            Role::Waste => "waste",
            Role::CellInlet => "cell_inlet",
            Role::CellOutlet => "cell_outlet",
            Role::NotUsed => "not_used",
        })
    }
}

/// Settings of one syringe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpSetting {
    pub left: Role,
    pub up: Role,
    pub right: Role,
    /// Multi-port valve channel that connects this syringe to the cell inlet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mvp: Option<u8>,
    /// Solution held by the reservoir behind the `reservoir` port
    #[serde(default)]
    pub solution: String,
    /// Reservoir capacity in uL
    #[serde(default)]
    pub capacity: f64,
    /// Reservoir content at session start in uL
    #[serde(default)]
    pub volume: f64,
}

impl PumpSetting {
    pub fn role(&self, label: PortLabel) -> Role {
        match label {
            PortLabel::Left => self.left,
            PortLabel::Up => self.up,
            PortLabel::Right => self.right,
        }
    }

    /// First port carrying `role`
    pub fn port_for(&self, role: Role) -> Option<PortLabel> {
        PortLabel::ALL.into_iter().find(|label| self.role(*label) == role)
    }

    pub fn has_reservoir(&self) -> bool {
        self.port_for(Role::Reservoir).is_some()
    }
}

/// Settings of every syringe, keyed by device id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PumpSettings(BTreeMap<u8, PumpSetting>);

/// Canonical plumbing of the continuous exchange rig
const CONTINUOUS_TOPOLOGY: [(u8, [Role; 3]); 4] = [
    (1, [Role::Reservoir, Role::Waste, Role::CellInlet]),
    (2, [Role::Reservoir, Role::Waste, Role::CellInlet]),
    (3, [Role::CellOutlet, Role::Waste, Role::NotUsed]),
    (4, [Role::CellOutlet, Role::Waste, Role::NotUsed]),
];

impl PumpSettings {
    pub fn insert(&mut self, id: u8, setting: PumpSetting) {
        self.0.insert(id, setting);
    }

    pub fn get(&self, id: u8) -> Option<&PumpSetting> {
        self.0.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &PumpSetting)> {
        self.0.iter().map(|(id, s)| (*id, s))
    }

    pub fn role(&self, id: u8, label: PortLabel) -> Option<Role> {
        self.get(id).map(|s| s.role(label))
    }

    /// Port of syringe `id` carrying `role`, or a topology error naming both
    pub fn require_port(&self, id: u8, role: Role) -> Result<PortLabel> {
        self.get(id)
            .and_then(|s| s.port_for(role))
            .ok_or_else(|| PumpError::TopologyMismatch(format!("syringe {} has no {} port", id, role)))
    }

    pub fn mvp_channel(&self, id: u8) -> Option<u8> {
        self.get(id).and_then(|s| s.mvp)
    }

    pub fn validate(&self) -> Result<()> {
        for (id, setting) in self.iter() {
            if setting.capacity < 0.0 || setting.volume < 0.0 {
                return Err(PumpError::InvalidArgument(format!(
                    "syringe {} reservoir volumes must be positive",
                    id
                )));
            }
            if setting.has_reservoir() && setting.volume > setting.capacity {
                return Err(PumpError::InvalidArgument(format!(
                    "syringe {} reservoir holds more than its capacity",
                    id
                )));
            }
        }
        Ok(())
    }

    /// Accept only the exact plumbing the continuous exchange expects
    pub fn check_continuous_topology(&self) -> Result<()> {
        for (id, roles) in CONTINUOUS_TOPOLOGY {
            let setting = self
                .get(id)
                .ok_or_else(|| PumpError::TopologyMismatch(format!("syringe {} has no settings", id)))?;
            for (label, expected) in PortLabel::ALL.into_iter().zip(roles) {
                let actual = setting.role(label);
                if actual != expected {
                    return Err(PumpError::TopologyMismatch(format!(
                        "S{}_{} is {}, expected {}",
                        id, label, actual, expected
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Numeric valve positions of the labelled ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortPositions {
    pub left: u8,
    pub up: u8,
    pub right: u8,
}

impl Default for PortPositions {
    fn default() -> Self {
        PortPositions {
            left: 1,
            up: 2,
            right: 3,
        }
    }
}

impl PortPositions {
    pub fn position(&self, label: PortLabel) -> u8 {
        match label {
            PortLabel::Left => self.left,
            PortLabel::Up => self.up,
            PortLabel::Right => self.right,
        }
    }

    pub fn label(&self, position: u8) -> Option<PortLabel> {
        PortLabel::ALL
            .into_iter()
            .find(|label| self.position(*label) == position)
    }

    pub fn validate(&self) -> Result<()> {
        let positions = [self.left, self.up, self.right];
        if positions.iter().any(|p| !crate::constants::VALVE_POSITIONS.contains(p)) {
            return Err(PumpError::InvalidPosition(
                positions.into_iter().max().unwrap_or(0) as u16,
            ));
        }
        if self.left == self.up || self.up == self.right || self.left == self.right {
            return Err(PumpError::InvalidArgument(
                "port positions must be distinct".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn canonical() -> PumpSettings {
        Config::default().pump_settings
    }

    #[test]
    fn finds_ports_by_role() {
        let settings = canonical();
        assert_eq!(settings.require_port(1, Role::CellInlet).unwrap(), PortLabel::Right);
        assert_eq!(settings.require_port(3, Role::CellOutlet).unwrap(), PortLabel::Left);
        assert!(matches!(
            settings.require_port(3, Role::Reservoir),
            Err(PumpError::TopologyMismatch(_))
        ));
        assert_eq!(settings.mvp_channel(2), Some(2));
    }

    #[test]
    fn every_single_port_deviation_is_rejected() {
        let roles = [
            Role::Reservoir,
            Role::Waste,
            Role::CellInlet,
            Role::CellOutlet,
            Role::NotUsed,
        ];
        for (id, _) in CONTINUOUS_TOPOLOGY {
            for label in PortLabel::ALL {
                for role in roles {
                    let mut settings = canonical();
                    let mut setting = settings.get(id).cloned().unwrap();
                    if setting.role(label) == role {
                        continue;
                    }
                    match label {
                        PortLabel::Left => setting.left = role,
                        PortLabel::Up => setting.up = role,
                        PortLabel::Right => setting.right = role,
                    }
                    settings.insert(id, setting);
                    assert!(
                        matches!(
                            settings.check_continuous_topology(),
                            Err(PumpError::TopologyMismatch(_))
                        ),
                        "S{}_{} = {} accepted",
                        id,
                        label,
                        role
                    );
                }
            }
        }
    }

    #[test]
    fn maps_positions_to_labels() {
        let ports = PortPositions::default();
        assert_eq!(ports.label(2), Some(PortLabel::Up));
        assert_eq!(ports.label(6), None);
        assert_eq!(ports.position(PortLabel::Right), 3);
        let clash = PortPositions { left: 1, up: 1, right: 3 };
        assert!(clash.validate().is_err());
    }
}
