use serde::Serialize;

use super::{PointField, PointMap};
use crate::domain::GridState;

/// Engineering values of every mapped point for one committed state.
///
/// Values are aligned with [`PointMap::entries`]; binary points hold 1.0 for
/// closed and 0.0 for open.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct PointImage {
    values: Vec<f64>,
}

impl PointImage {
    pub fn from_state(map: &PointMap, state: &GridState) -> Self {
        let values = map
            .entries()
            .iter()
            .map(|entry| {
                let i = entry.element_index;
                let value = match entry.field {
                    PointField::BusVoltage => state.buses.get(i).map(|b| b.voltage_pu),
                    PointField::BusAngle => state.buses.get(i).map(|b| b.angle_deg),
                    PointField::LineP => state.lines.get(i).map(|l| l.p_mw),
                    PointField::LineQ => state.lines.get(i).map(|l| l.q_mvar),
                    PointField::LineLoading => state.lines.get(i).map(|l| l.loading_percent),
                    PointField::BreakerStatus => state
                        .lines
                        .get(i)
                        .map(|l| if l.closed { 1.0 } else { 0.0 }),
                    PointField::GeneratorP => state.generators.get(i).map(|g| g.p_mw),
                    PointField::LoadP => state.loads.get(i).map(|l| l.p_mw),
                    PointField::TransformerTap => {
                        state.transformers.get(i).map(|t| f64::from(t.tap_position))
                    }
                    PointField::StorageP => state.storage.get(i).map(|s| s.p_mw),
                    PointField::StorageSoc => state.storage.get(i).map(|s| s.soc_percent),
                };
                value.unwrap_or(0.0)
            })
            .collect();

        Self { values }
    }

    pub fn value(&self, entry: usize) -> Option<f64> {
        self.values.get(entry).copied()
    }

    pub fn binary(&self, entry: usize) -> Option<bool> {
        self.value(entry).map(|v| v != 0.0)
    }

    /// Scaled, saturating 16-bit register content of an entry
    pub fn register(&self, map: &PointMap, entry: usize) -> Option<u16> {
        let scale = map.entry(entry)?.scale;
        self.value(entry).map(|v| to_register(v, scale))
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// Scale to signed 16-bit two's complement, saturating at the i16 bounds
pub fn to_register(value: f64, scale: f64) -> u16 {
    let scaled = (value * scale).round();
    if scaled.is_nan() {
        return 0;
    }
    let clamped = scaled.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
    clamped as u16
}

/// Inverse of [`to_register`]
pub fn from_register(raw: u16, scale: f64) -> f64 {
    f64::from(raw as i16) / scale
}
