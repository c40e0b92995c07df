//! Protocol address assignment.
//!
//! A [`PointMap`] is derived deterministically from a topology: fields are laid
//! out block by block and elements in declaration order inside each block, so
//! the same topology always yields the same addresses.

mod image;

pub use image::{from_register, to_register, PointImage};

use serde::Serialize;
use std::collections::HashMap;
use strum::{Display, EnumIter, IntoEnumIterator};

use crate::domain::{Command, ElementKind, NetworkTopology};
use crate::error::{CommandError, PointMapError};

/// Slots reserved per Modbus block
pub const BLOCK_SIZE: usize = 1000;

/// Holding and input registers span ten blocks
pub const REGISTER_TABLE_SIZE: usize = 10 * BLOCK_SIZE;

/// Coils and discrete inputs span the breaker block
pub const COIL_TABLE_SIZE: usize = BLOCK_SIZE;

/// Published quantity, in block order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PointField {
    BusVoltage,
    BusAngle,
    LineP,
    LineQ,
    LineLoading,
    BreakerStatus,
    GeneratorP,
    LoadP,
    TransformerTap,
    StorageP,
    StorageSoc,
}

impl PointField {
    pub fn element_kind(self) -> ElementKind {
        match self {
            PointField::BusVoltage | PointField::BusAngle => ElementKind::Bus,
            PointField::LineP
            | PointField::LineQ
            | PointField::LineLoading
            | PointField::BreakerStatus => ElementKind::Line,
            PointField::GeneratorP => ElementKind::Generator,
            PointField::LoadP => ElementKind::Load,
            PointField::TransformerTap => ElementKind::Transformer,
            PointField::StorageP | PointField::StorageSoc => ElementKind::Storage,
        }
    }

    pub fn is_binary(self) -> bool {
        self == PointField::BreakerStatus
    }

    pub fn writable(self) -> bool {
        matches!(
            self,
            PointField::BreakerStatus
                | PointField::GeneratorP
                | PointField::LoadP
                | PointField::TransformerTap
                | PointField::StorageP
        )
    }

    /// First Modbus address of the field's block (register or coil table)
    pub fn modbus_base(self) -> u16 {
        match self {
            PointField::BusVoltage => 0,
            PointField::LineP => 1000,
            PointField::LineQ => 2000,
            PointField::LineLoading => 3000,
            PointField::GeneratorP => 4000,
            PointField::LoadP => 5000,
            PointField::TransformerTap => 6000,
            PointField::BusAngle => 7000,
            PointField::StorageP => 8000,
            PointField::StorageSoc => 9000,
            PointField::BreakerStatus => 0,
        }
    }

    /// Engineering value to register count factor
    pub fn scale(self) -> f64 {
        match self {
            PointField::BusVoltage | PointField::LineP | PointField::LineQ => 1000.0,
            PointField::GeneratorP | PointField::LoadP | PointField::StorageP => 1000.0,
            PointField::LineLoading | PointField::StorageSoc => 10.0,
            PointField::BusAngle => 100.0,
            PointField::TransformerTap | PointField::BreakerStatus => 1.0,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            PointField::BusVoltage => "pu",
            PointField::BusAngle => "deg",
            PointField::LineP | PointField::GeneratorP | PointField::LoadP | PointField::StorageP => {
                "MW"
            }
            PointField::LineQ => "Mvar",
            PointField::LineLoading | PointField::StorageSoc => "%",
            PointField::TransformerTap => "step",
            PointField::BreakerStatus => "closed",
        }
    }

    fn element_count(self, topology: &NetworkTopology) -> usize {
        match self.element_kind() {
            ElementKind::Bus => topology.buses.len(),
            ElementKind::Line => topology.lines.len(),
            ElementKind::Transformer => topology.transformers.len(),
            ElementKind::Generator => topology.generators.len(),
            ElementKind::Load => topology.loads.len(),
            ElementKind::Storage => topology.storage.len(),
        }
    }

    fn element_id(self, topology: &NetworkTopology, index: usize) -> u32 {
        match self.element_kind() {
            ElementKind::Bus => topology.buses[index].id,
            ElementKind::Line => topology.lines[index].id,
            ElementKind::Transformer => topology.transformers[index].id,
            ElementKind::Generator => topology.generators[index].id,
            ElementKind::Load => topology.loads[index].id,
            ElementKind::Storage => topology.storage[index].id,
        }
    }
}

/// DNP3 point types the outstation serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Dnp3PointType {
    BinaryInput,
    AnalogInput,
    BinaryOutput,
    AnalogOutput,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointMapEntry {
    pub field: PointField,
    pub kind: ElementKind,
    pub element_id: u32,
    /// Position of the element in topology declaration order
    pub element_index: usize,
    /// Binary or analog input index
    pub dnp3_input: Option<u16>,
    /// Binary or analog output index, writable points only
    pub dnp3_output: Option<u16>,
    /// Register address, or coil/discrete input address for breakers
    pub modbus: Option<u16>,
    pub scale: f64,
    pub unit: &'static str,
    pub writable: bool,
}

impl PointMapEntry {
    /// Translate an analog write into a command against this point's element
    pub fn analog_command(&self, value: f64) -> Result<Command, CommandError> {
        let id = self.element_id;
        match self.field {
            PointField::GeneratorP => Ok(Command::Generator {
                generator_id: id,
                p_mw: value,
                q_mvar: None,
            }),
            PointField::LoadP => Ok(Command::Load {
                load_id: id,
                p_mw: value,
                q_mvar: None,
            }),
            PointField::StorageP => Ok(Command::Storage {
                storage_id: id,
                p_mw: value,
            }),
            PointField::TransformerTap => {
                if !value.is_finite() {
                    return Err(CommandError::NotFinite {
                        field: "tap_position",
                    });
                }
                let rounded = value.round();
                if rounded < f64::from(i32::MIN) || rounded > f64::from(i32::MAX) {
                    return Err(CommandError::OutOfRange {
                        field: "tap_position",
                        value,
                        min: f64::from(i32::MIN),
                        max: f64::from(i32::MAX),
                    });
                }
                Ok(Command::TransformerTap {
                    transformer_id: id,
                    tap_position: rounded as i32,
                })
            }
            _ => Err(CommandError::UnknownTarget {
                kind: self.kind,
                id,
            }),
        }
    }

    pub fn binary_command(&self, closed: bool) -> Result<Command, CommandError> {
        match self.field {
            PointField::BreakerStatus => Ok(Command::Breaker {
                line_id: self.element_id,
                closed,
            }),
            _ => Err(CommandError::UnknownTarget {
                kind: self.kind,
                id: self.element_id,
            }),
        }
    }
}

/// Addresses for one topology epoch
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PointMap {
    entries: Vec<PointMapEntry>,
    registers: HashMap<u16, usize>,
    coils: HashMap<u16, usize>,
    binary_inputs: Vec<usize>,
    analog_inputs: Vec<usize>,
    binary_outputs: Vec<usize>,
    analog_outputs: Vec<usize>,
}

impl PointMap {
    pub fn build(topology: &NetworkTopology) -> Result<Self, PointMapError> {
        let mut map = PointMap::default();

        for field in PointField::iter() {
            let count = field.element_count(topology);
            if count > BLOCK_SIZE {
                return Err(PointMapError::CapacityExceeded {
                    field,
                    count,
                    capacity: BLOCK_SIZE,
                });
            }

            for index in 0..count {
                let entry_index = map.entries.len();
                // count <= BLOCK_SIZE so offsets always fit
                let address = field.modbus_base() + index as u16;

                let (inputs, outputs) = if field.is_binary() {
                    map.coils.insert(address, entry_index);
                    (&mut map.binary_inputs, &mut map.binary_outputs)
                } else {
                    map.registers.insert(address, entry_index);
                    (&mut map.analog_inputs, &mut map.analog_outputs)
                };
                let dnp3_input = Some(inputs.len() as u16);
                inputs.push(entry_index);
                let dnp3_output = if field.writable() {
                    outputs.push(entry_index);
                    Some((outputs.len() - 1) as u16)
                } else {
                    None
                };

                map.entries.push(PointMapEntry {
                    field,
                    kind: field.element_kind(),
                    element_id: field.element_id(topology, index),
                    element_index: index,
                    dnp3_input,
                    dnp3_output,
                    modbus: Some(address),
                    scale: field.scale(),
                    unit: field.unit(),
                    writable: field.writable(),
                });
            }
        }

        Ok(map)
    }

    pub fn entries(&self) -> &[PointMapEntry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Option<&PointMapEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry index behind a holding/input register address
    pub fn register(&self, address: u16) -> Option<usize> {
        self.registers.get(&address).copied()
    }

    /// Entry index behind a coil/discrete input address
    pub fn coil(&self, address: u16) -> Option<usize> {
        self.coils.get(&address).copied()
    }

    /// Entry indices of a DNP3 point type, ordered by DNP3 index
    pub fn dnp3_points(&self, point_type: Dnp3PointType) -> &[usize] {
        match point_type {
            Dnp3PointType::BinaryInput => &self.binary_inputs,
            Dnp3PointType::AnalogInput => &self.analog_inputs,
            Dnp3PointType::BinaryOutput => &self.binary_outputs,
            Dnp3PointType::AnalogOutput => &self.analog_outputs,
        }
    }

    pub fn dnp3_point(&self, point_type: Dnp3PointType, index: u16) -> Option<usize> {
        self.dnp3_points(point_type).get(usize::from(index)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::topology::fixtures::{three_bus, with_storage};
    use crate::domain::LineInfo;

    #[test]
    fn test_modbus_layout() {
        let map = PointMap::build(&three_bus()).unwrap();

        let at = |addr| map.entry(map.register(addr).unwrap()).unwrap();
        assert_eq!(at(0).field, PointField::BusVoltage);
        assert_eq!(at(2).element_id, 2);
        assert_eq!(at(1000).field, PointField::LineP);
        assert_eq!(at(2000).field, PointField::LineQ);
        assert_eq!(at(3000).field, PointField::LineLoading);
        assert_eq!(at(4000).field, PointField::GeneratorP);
        assert_eq!(at(5000).field, PointField::LoadP);
        assert_eq!(at(6000).field, PointField::TransformerTap);
        assert_eq!(at(7001).field, PointField::BusAngle);
        assert!(map.register(3).is_none());

        let breaker = map.entry(map.coil(0).unwrap()).unwrap();
        assert_eq!(breaker.field, PointField::BreakerStatus);
        assert!(breaker.writable);
    }

    #[test]
    fn test_dnp3_indices_are_contiguous_in_block_order() {
        let map = PointMap::build(&three_bus()).unwrap();

        let fields: Vec<PointField> = map
            .dnp3_points(Dnp3PointType::AnalogInput)
            .iter()
            .map(|&i| map.entries()[i].field)
            .collect();
        assert_eq!(
            fields,
            vec![
                PointField::BusVoltage,
                PointField::BusVoltage,
                PointField::BusVoltage,
                PointField::BusAngle,
                PointField::BusAngle,
                PointField::BusAngle,
                PointField::LineP,
                PointField::LineQ,
                PointField::LineLoading,
                PointField::GeneratorP,
                PointField::LoadP,
                PointField::TransformerTap,
            ]
        );

        let outputs: Vec<PointField> = map
            .dnp3_points(Dnp3PointType::AnalogOutput)
            .iter()
            .map(|&i| map.entries()[i].field)
            .collect();
        assert_eq!(
            outputs,
            vec![PointField::GeneratorP, PointField::LoadP, PointField::TransformerTap]
        );
        assert_eq!(map.dnp3_points(Dnp3PointType::BinaryInput).len(), 1);
        assert_eq!(map.dnp3_points(Dnp3PointType::BinaryOutput).len(), 1);
    }

    #[test]
    fn test_block_overflow_is_rejected() {
        let mut topo = three_bus();
        let template = topo.lines[0].clone();
        topo.lines = (0..=BLOCK_SIZE as u32)
            .map(|id| LineInfo {
                id,
                ..template.clone()
            })
            .collect();

        assert_eq!(
            PointMap::build(&topo).unwrap_err(),
            PointMapError::CapacityExceeded {
                field: PointField::LineP,
                count: BLOCK_SIZE + 1,
                capacity: BLOCK_SIZE,
            }
        );
    }

    #[test]
    fn test_tap_write_rounds_to_step() {
        let map = PointMap::build(&three_bus()).unwrap();
        let tap = map.entry(map.register(6000).unwrap()).unwrap();
        assert_eq!(
            tap.analog_command(1.6).unwrap(),
            Command::TransformerTap {
                transformer_id: 0,
                tap_position: 2
            }
        );
        assert!(tap.analog_command(f64::NAN).is_err());

        let voltage = map.entry(map.register(0).unwrap()).unwrap();
        assert!(voltage.analog_command(1.0).is_err());
    }

    #[test]
    fn test_storage_points_follow_existing_blocks() {
        let plain = PointMap::build(&three_bus()).unwrap();
        let map = PointMap::build(&with_storage()).unwrap();

        let power = map.entry(map.register(8000).unwrap()).unwrap();
        assert_eq!(power.kind, ElementKind::Storage);
        assert!(power.writable);
        assert_eq!(
            power.analog_command(-0.01).unwrap(),
            Command::Storage {
                storage_id: 0,
                p_mw: -0.01
            }
        );

        let soc = map.entry(map.register(9000).unwrap()).unwrap();
        assert_eq!(soc.field, PointField::StorageSoc);
        assert!(!soc.writable);
        assert_eq!(soc.dnp3_output, None);

        // appended after every existing point, so earlier indices do not move
        let analog = map.dnp3_points(Dnp3PointType::AnalogInput);
        let before = plain.dnp3_points(Dnp3PointType::AnalogInput).len();
        assert_eq!(analog.len(), before + 2);
        assert_eq!(power.dnp3_input, Some(before as u16));
        assert_eq!(power.dnp3_output, Some(3));
    }
}
