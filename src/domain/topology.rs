use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use super::types::{
    BusId, BusType, DerType, ElementKind, GeneratorId, LineId, LoadId, StorageId, TransformerId,
};
use crate::error::TopologyError;

fn default_true() -> bool {
    true
}

fn default_vm_setpoint() -> f64 {
    1.0
}

fn default_base_mva() -> f64 {
    1.0
}

fn default_frequency() -> f64 {
    50.0
}

fn default_soc() -> f64 {
    50.0
}

fn default_efficiency() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusInfo {
    pub id: BusId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bus_type: BusType,
    pub voltage_nominal_kv: f64,
    /// Voltage magnitude held at slack buses
    #[serde(default = "default_vm_setpoint")]
    pub vm_setpoint_pu: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_stix_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineInfo {
    pub id: LineId,
    #[serde(default)]
    pub name: String,
    pub from_bus: BusId,
    pub to_bus: BusId,
    pub r_ohm: f64,
    pub x_ohm: f64,
    /// Thermal rating used for loading percentage
    pub max_current_ka: f64,
    /// Initial breaker position
    #[serde(default = "default_true")]
    pub closed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_stix_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformerInfo {
    pub id: TransformerId,
    #[serde(default)]
    pub name: String,
    pub hv_bus: BusId,
    pub lv_bus: BusId,
    pub sn_mva: f64,
    pub vn_hv_kv: f64,
    pub vn_lv_kv: f64,
    pub vk_percent: f64,
    #[serde(default)]
    pub vkr_percent: f64,
    #[serde(default)]
    pub tap_neutral: i32,
    #[serde(default)]
    pub tap_min: i32,
    #[serde(default)]
    pub tap_max: i32,
    #[serde(default)]
    pub tap_step_percent: f64,
    #[serde(default)]
    pub tap_position: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_stix_id: Option<String>,
}

impl TransformerInfo {
    /// Off-nominal turns ratio on the HV side for a tap position
    pub fn ratio_at(&self, tap_position: i32) -> f64 {
        1.0 + f64::from(tap_position - self.tap_neutral) * self.tap_step_percent / 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratorInfo {
    pub id: GeneratorId,
    #[serde(default)]
    pub name: String,
    pub bus: BusId,
    #[serde(default)]
    pub der_type: DerType,
    /// Initial active power setpoint
    #[serde(default)]
    pub p_mw: f64,
    #[serde(default)]
    pub q_mvar: f64,
    #[serde(default)]
    pub p_min_mw: f64,
    pub p_max_mw: f64,
    #[serde(default)]
    pub q_min_mvar: f64,
    #[serde(default)]
    pub q_max_mvar: f64,
    #[serde(default = "default_true")]
    pub in_service: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_stix_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadInfo {
    pub id: LoadId,
    #[serde(default)]
    pub name: String,
    pub bus: BusId,
    pub p_mw: f64,
    #[serde(default)]
    pub q_mvar: f64,
    /// Largest demand a command may set, in either direction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p_max_mw: Option<f64>,
    #[serde(default = "default_true")]
    pub in_service: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_stix_id: Option<String>,
}

/// Battery energy storage. Positive power discharges into the grid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageInfo {
    pub id: StorageId,
    #[serde(default)]
    pub name: String,
    pub bus: BusId,
    /// Initial active power setpoint
    #[serde(default)]
    pub p_mw: f64,
    /// Charge and discharge limit
    pub p_max_mw: f64,
    pub max_e_mwh: f64,
    /// Initial state of charge
    #[serde(default = "default_soc")]
    pub soc_percent: f64,
    #[serde(default = "default_efficiency")]
    pub efficiency_charge: f64,
    #[serde(default = "default_efficiency")]
    pub efficiency_discharge: f64,
    #[serde(default = "default_true")]
    pub in_service: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_stix_id: Option<String>,
}

impl StorageInfo {
    /// Share of `p_mw` the unit can deliver at `soc_percent`.
    ///
    /// An empty unit cannot discharge and a full one cannot charge.
    pub fn available_p(&self, soc_percent: f64, p_mw: f64) -> f64 {
        if (p_mw > 0.0 && soc_percent <= 0.0) || (p_mw < 0.0 && soc_percent >= 100.0) {
            0.0
        } else {
            p_mw
        }
    }

    /// State of charge after exchanging `p_mw` for `elapsed`, clamped to 0..=100
    pub fn soc_after(&self, soc_percent: f64, p_mw: f64, elapsed: Duration) -> f64 {
        let hours = elapsed.as_secs_f64() / 3600.0;
        let stored_mwh = if p_mw < 0.0 {
            -p_mw * hours * self.efficiency_charge
        } else {
            -p_mw * hours / self.efficiency_discharge
        };
        (soc_percent + stored_mwh / self.max_e_mwh * 100.0).clamp(0.0, 100.0)
    }
}

/// Structure of the simulated network.
///
/// Element order is declaration order and drives protocol addressing, so a
/// topology is never edited in place: reloading replaces it wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkTopology {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_base_mva")]
    pub base_mva: f64,
    #[serde(default = "default_frequency")]
    pub frequency_hz: f64,
    #[serde(default)]
    pub buses: Vec<BusInfo>,
    #[serde(default)]
    pub lines: Vec<LineInfo>,
    #[serde(default)]
    pub transformers: Vec<TransformerInfo>,
    #[serde(default)]
    pub generators: Vec<GeneratorInfo>,
    #[serde(default)]
    pub loads: Vec<LoadInfo>,
    #[serde(default)]
    pub storage: Vec<StorageInfo>,
}

impl Default for NetworkTopology {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_mva: default_base_mva(),
            frequency_hz: default_frequency(),
            buses: Vec::new(),
            lines: Vec::new(),
            transformers: Vec::new(),
            generators: Vec::new(),
            loads: Vec::new(),
            storage: Vec::new(),
        }
    }
}

impl NetworkTopology {
    /// Read a topology from a `.toml` or `.json` file and validate it
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TopologyError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| TopologyError::Io {
            path: display.clone(),
            source,
        })?;

        let topology: NetworkTopology = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&raw).map_err(|e| TopologyError::Parse {
                path: display.clone(),
                reason: e.to_string(),
            })?,
            Some("json") => serde_json::from_str(&raw).map_err(|e| TopologyError::Parse {
                path: display.clone(),
                reason: e.to_string(),
            })?,
            other => {
                return Err(TopologyError::UnsupportedFormat(
                    other.unwrap_or_default().to_string(),
                ))
            }
        };

        topology.validate()?;
        Ok(topology)
    }

    pub fn bus(&self, id: BusId) -> Option<&BusInfo> {
        self.buses.iter().find(|b| b.id == id)
    }

    pub fn line(&self, id: LineId) -> Option<&LineInfo> {
        self.lines.iter().find(|l| l.id == id)
    }

    pub fn transformer(&self, id: TransformerId) -> Option<&TransformerInfo> {
        self.transformers.iter().find(|t| t.id == id)
    }

    pub fn generator(&self, id: GeneratorId) -> Option<&GeneratorInfo> {
        self.generators.iter().find(|g| g.id == id)
    }

    pub fn load(&self, id: LoadId) -> Option<&LoadInfo> {
        self.loads.iter().find(|l| l.id == id)
    }

    pub fn storage_unit(&self, id: StorageId) -> Option<&StorageInfo> {
        self.storage.iter().find(|s| s.id == id)
    }

    /// Position of a bus in declaration order
    pub fn bus_index(&self, id: BusId) -> Option<usize> {
        self.buses.iter().position(|b| b.id == id)
    }

    pub fn slack_buses(&self) -> impl Iterator<Item = &BusInfo> {
        self.buses.iter().filter(|b| b.bus_type == BusType::Slack)
    }

    /// Check ids, references, ratings and limits
    pub fn validate(&self) -> Result<(), TopologyError> {
        if !(self.base_mva.is_finite() && self.base_mva > 0.0) {
            return Err(TopologyError::InvalidNetwork(format!(
                "base_mva must be positive, got {}",
                self.base_mva
            )));
        }

        check_unique(ElementKind::Bus, self.buses.iter().map(|b| b.id))?;
        check_unique(ElementKind::Line, self.lines.iter().map(|l| l.id))?;
        check_unique(ElementKind::Transformer, self.transformers.iter().map(|t| t.id))?;
        check_unique(ElementKind::Generator, self.generators.iter().map(|g| g.id))?;
        check_unique(ElementKind::Load, self.loads.iter().map(|l| l.id))?;
        check_unique(ElementKind::Storage, self.storage.iter().map(|s| s.id))?;

        let bus_ids: HashSet<BusId> = self.buses.iter().map(|b| b.id).collect();
        let known = |kind: ElementKind, id: u32, bus: BusId| {
            if bus_ids.contains(&bus) {
                Ok(())
            } else {
                Err(TopologyError::UnknownBus { kind, id, bus })
            }
        };

        for bus in &self.buses {
            if !(bus.voltage_nominal_kv.is_finite() && bus.voltage_nominal_kv > 0.0) {
                return Err(invalid(ElementKind::Bus, bus.id, "voltage_nominal_kv must be positive"));
            }
            if !(bus.vm_setpoint_pu.is_finite() && bus.vm_setpoint_pu > 0.0) {
                return Err(invalid(ElementKind::Bus, bus.id, "vm_setpoint_pu must be positive"));
            }
        }

        for line in &self.lines {
            known(ElementKind::Line, line.id, line.from_bus)?;
            known(ElementKind::Line, line.id, line.to_bus)?;
            if line.from_bus == line.to_bus {
                return Err(invalid(ElementKind::Line, line.id, "from_bus and to_bus must differ"));
            }
            if line.r_ohm < 0.0 || line.x_ohm < 0.0 || !line.r_ohm.is_finite() || !line.x_ohm.is_finite() {
                return Err(invalid(ElementKind::Line, line.id, "impedance must be non-negative"));
            }
            if !(line.max_current_ka.is_finite() && line.max_current_ka > 0.0) {
                return Err(invalid(ElementKind::Line, line.id, "max_current_ka must be positive"));
            }
        }

        for trafo in &self.transformers {
            known(ElementKind::Transformer, trafo.id, trafo.hv_bus)?;
            known(ElementKind::Transformer, trafo.id, trafo.lv_bus)?;
            if !(trafo.sn_mva.is_finite() && trafo.sn_mva > 0.0) {
                return Err(invalid(ElementKind::Transformer, trafo.id, "sn_mva must be positive"));
            }
            if !(trafo.vk_percent > 0.0 && trafo.vkr_percent >= 0.0 && trafo.vkr_percent <= trafo.vk_percent) {
                return Err(invalid(
                    ElementKind::Transformer,
                    trafo.id,
                    "vk_percent must be positive and not below vkr_percent",
                ));
            }
            if trafo.tap_min > trafo.tap_max {
                return Err(invalid(ElementKind::Transformer, trafo.id, "tap_min exceeds tap_max"));
            }
            if trafo.tap_position < trafo.tap_min || trafo.tap_position > trafo.tap_max {
                return Err(invalid(ElementKind::Transformer, trafo.id, "tap_position outside tap range"));
            }
            if trafo.ratio_at(trafo.tap_min) <= 0.0 {
                return Err(invalid(ElementKind::Transformer, trafo.id, "tap range yields a non-positive ratio"));
            }
        }

        for gen in &self.generators {
            known(ElementKind::Generator, gen.id, gen.bus)?;
            if gen.p_min_mw > gen.p_max_mw || gen.q_min_mvar > gen.q_max_mvar {
                return Err(invalid(ElementKind::Generator, gen.id, "minimum limit exceeds maximum"));
            }
            if gen.p_mw < gen.p_min_mw || gen.p_mw > gen.p_max_mw {
                return Err(invalid(ElementKind::Generator, gen.id, "initial p_mw outside limits"));
            }
        }

        for load in &self.loads {
            known(ElementKind::Load, load.id, load.bus)?;
            if !load.p_mw.is_finite() || !load.q_mvar.is_finite() {
                return Err(invalid(ElementKind::Load, load.id, "demand must be finite"));
            }
            if let Some(max) = load.p_max_mw {
                if !(max >= 0.0) || load.p_mw.abs() > max {
                    return Err(invalid(ElementKind::Load, load.id, "initial p_mw exceeds p_max_mw"));
                }
            }
        }

        for unit in &self.storage {
            known(ElementKind::Storage, unit.id, unit.bus)?;
            if !(unit.max_e_mwh.is_finite() && unit.max_e_mwh > 0.0) {
                return Err(invalid(ElementKind::Storage, unit.id, "max_e_mwh must be positive"));
            }
            if !(unit.p_max_mw.is_finite() && unit.p_max_mw >= 0.0) {
                return Err(invalid(ElementKind::Storage, unit.id, "p_max_mw must be non-negative"));
            }
            if !unit.p_mw.is_finite() || unit.p_mw.abs() > unit.p_max_mw {
                return Err(invalid(ElementKind::Storage, unit.id, "initial p_mw exceeds p_max_mw"));
            }
            if !(0.0..=100.0).contains(&unit.soc_percent) {
                return Err(invalid(ElementKind::Storage, unit.id, "soc_percent outside 0..=100"));
            }
            let efficiencies = [unit.efficiency_charge, unit.efficiency_discharge];
            if efficiencies.iter().any(|e| !(*e > 0.0 && *e <= 1.0)) {
                return Err(invalid(ElementKind::Storage, unit.id, "efficiency must be in (0, 1]"));
            }
        }

        Ok(())
    }
}

fn check_unique(kind: ElementKind, ids: impl Iterator<Item = u32>) -> Result<(), TopologyError> {
    match ids.duplicates().next() {
        Some(id) => Err(TopologyError::DuplicateId { kind, id }),
        None => Ok(()),
    }
}

fn invalid(kind: ElementKind, id: u32, reason: &str) -> TopologyError {
    TopologyError::InvalidParameter {
        kind,
        id,
        reason: reason.to_string(),
    }
}
