use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub type BusId = u32;
pub type LineId = u32;
pub type TransformerId = u32;
pub type GeneratorId = u32;
pub type LoadId = u32;
pub type StorageId = u32;

/// Power-flow role of a bus
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BusType {
    /// Fixed P and Q injection
    Pq,
    /// Fixed P and voltage magnitude
    Pv,
    /// Reference bus, absorbs the power imbalance
    Slack,
}

impl Default for BusType {
    fn default() -> Self {
        BusType::Pq
    }
}

/// Distributed energy resource technology
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DerType {
    SolarPv,
    Wind,
    BatteryStorage,
    Synchronous,
    Other,
}

impl Default for DerType {
    fn default() -> Self {
        DerType::Other
    }
}

/// Kind of topology element a point or command refers to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ElementKind {
    Bus,
    Line,
    Transformer,
    Generator,
    Load,
    Storage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_bus_type_round_trips_through_strings() {
        assert_eq!(BusType::Slack.to_string(), "slack");
        assert_eq!(BusType::from_str("pv").unwrap(), BusType::Pv);
        assert!(BusType::from_str("swing").is_err());
    }

    #[test]
    fn test_der_type_serde_names() {
        let json = serde_json::to_string(&DerType::SolarPv).unwrap();
        assert_eq!(json, "\"solar_pv\"");
    }
}
