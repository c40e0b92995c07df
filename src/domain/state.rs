use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::topology::NetworkTopology;
use super::types::{BusId, GeneratorId, LineId, LoadId, StorageId, TransformerId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusState {
    pub bus_id: BusId,
    pub voltage_pu: f64,
    pub angle_deg: f64,
    pub energized: bool,
}

/// Branch flows; `p_mw`/`q_mvar` are measured at the from-end
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineState {
    pub line_id: LineId,
    pub closed: bool,
    pub p_mw: f64,
    pub q_mvar: f64,
    pub p_to_mw: f64,
    pub q_to_mvar: f64,
    pub current_ka: f64,
    pub loading_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformerState {
    pub transformer_id: TransformerId,
    pub tap_position: i32,
    pub p_hv_mw: f64,
    pub q_hv_mvar: f64,
    pub loading_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratorState {
    pub generator_id: GeneratorId,
    pub p_mw: f64,
    pub q_mvar: f64,
    pub in_service: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadState {
    pub load_id: LoadId,
    pub p_mw: f64,
    pub q_mvar: f64,
    pub in_service: bool,
}

/// Battery output and charge; negative `p_mw` is charging
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageState {
    pub storage_id: StorageId,
    pub p_mw: f64,
    pub soc_percent: f64,
    pub in_service: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SolveSummary {
    pub converged: bool,
    pub iterations: u32,
    pub max_mismatch: f64,
    pub duration_ms: f64,
}

/// Network state produced by one solve.
///
/// Element vectors follow topology declaration order. `epoch` and `step` are
/// stamped by the scan scheduler when the state is committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GridState {
    pub epoch: u64,
    pub step: u64,
    pub timestamp: DateTime<Utc>,
    pub buses: Vec<BusState>,
    pub lines: Vec<LineState>,
    pub transformers: Vec<TransformerState>,
    pub generators: Vec<GeneratorState>,
    pub loads: Vec<LoadState>,
    #[serde(default)]
    pub storage: Vec<StorageState>,
    pub total_generation_mw: f64,
    pub total_load_mw: f64,
    pub total_losses_mw: f64,
    pub slack_p_mw: f64,
    pub solve: SolveSummary,
}

impl GridState {
    /// Unsolved state: flat voltages, configured setpoints, no flows
    pub fn initial(topology: &NetworkTopology) -> Self {
        let generators: Vec<GeneratorState> = topology
            .generators
            .iter()
            .map(|g| GeneratorState {
                generator_id: g.id,
                p_mw: if g.in_service { g.p_mw } else { 0.0 },
                q_mvar: if g.in_service { g.q_mvar } else { 0.0 },
                in_service: g.in_service,
            })
            .collect();
        let loads: Vec<LoadState> = topology
            .loads
            .iter()
            .map(|l| LoadState {
                load_id: l.id,
                p_mw: if l.in_service { l.p_mw } else { 0.0 },
                q_mvar: if l.in_service { l.q_mvar } else { 0.0 },
                in_service: l.in_service,
            })
            .collect();

        GridState {
            epoch: 0,
            step: 0,
            timestamp: Utc::now(),
            buses: topology
                .buses
                .iter()
                .map(|b| BusState {
                    bus_id: b.id,
                    voltage_pu: 1.0,
                    angle_deg: 0.0,
                    energized: false,
                })
                .collect(),
            lines: topology
                .lines
                .iter()
                .map(|l| LineState {
                    line_id: l.id,
                    closed: l.closed,
                    p_mw: 0.0,
                    q_mvar: 0.0,
                    p_to_mw: 0.0,
                    q_to_mvar: 0.0,
                    current_ka: 0.0,
                    loading_percent: 0.0,
                })
                .collect(),
            transformers: topology
                .transformers
                .iter()
                .map(|t| TransformerState {
                    transformer_id: t.id,
                    tap_position: t.tap_position,
                    p_hv_mw: 0.0,
                    q_hv_mvar: 0.0,
                    loading_percent: 0.0,
                })
                .collect(),
            total_generation_mw: generators.iter().map(|g| g.p_mw).sum(),
            total_load_mw: loads.iter().map(|l| l.p_mw).sum(),
            total_losses_mw: 0.0,
            slack_p_mw: 0.0,
            generators,
            loads,
            storage: topology
                .storage
                .iter()
                .map(|s| StorageState {
                    storage_id: s.id,
                    p_mw: if s.in_service { s.p_mw } else { 0.0 },
                    soc_percent: s.soc_percent,
                    in_service: s.in_service,
                })
                .collect(),
            solve: SolveSummary::default(),
        }
    }

    pub fn line(&self, id: LineId) -> Option<&LineState> {
        self.lines.iter().find(|l| l.line_id == id)
    }

    pub fn bus(&self, id: BusId) -> Option<&BusState> {
        self.buses.iter().find(|b| b.bus_id == id)
    }

    pub fn generator(&self, id: GeneratorId) -> Option<&GeneratorState> {
        self.generators.iter().find(|g| g.generator_id == id)
    }

    pub fn load(&self, id: LoadId) -> Option<&LoadState> {
        self.loads.iter().find(|l| l.load_id == id)
    }

    pub fn transformer(&self, id: TransformerId) -> Option<&TransformerState> {
        self.transformers.iter().find(|t| t.transformer_id == id)
    }

    pub fn storage_unit(&self, id: StorageId) -> Option<&StorageState> {
        self.storage.iter().find(|s| s.storage_id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::topology::fixtures::{three_bus, with_storage};

    #[test]
    fn test_initial_state_follows_declaration_order() {
        let topo = three_bus();
        let state = GridState::initial(&topo);

        assert_eq!(state.buses.len(), 3);
        assert_eq!(state.buses[2].bus_id, 2);
        assert_eq!(state.lines[0].closed, topo.lines[0].closed);
        assert_eq!(state.transformers[0].tap_position, 0);
        assert!(!state.solve.converged);
        assert!((state.total_generation_mw - 0.5).abs() < 1e-12);
        assert!((state.total_load_mw - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_initial_storage_carries_configured_charge() {
        let topo = with_storage();
        let state = GridState::initial(&topo);
        let unit = state.storage_unit(0).unwrap();
        assert_eq!(unit.soc_percent, 50.0);
        assert_eq!(unit.p_mw, 0.0);
        assert!(GridState::initial(&three_bus()).storage.is_empty());
    }
}
