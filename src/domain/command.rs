use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::Display;
use uuid::Uuid;

use super::topology::NetworkTopology;
use super::types::{ElementKind, GeneratorId, LineId, LoadId, StorageId, TransformerId};
use crate::error::CommandError;

/// Control action against one element of the network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    Load {
        load_id: LoadId,
        p_mw: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        q_mvar: Option<f64>,
    },
    Generator {
        generator_id: GeneratorId,
        p_mw: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        q_mvar: Option<f64>,
    },
    Breaker {
        line_id: LineId,
        closed: bool,
    },
    TransformerTap {
        transformer_id: TransformerId,
        tap_position: i32,
    },
    /// Battery power setpoint; negative charges
    Storage {
        storage_id: StorageId,
        p_mw: f64,
    },
}

/// Element a command addresses; at most one command per target is in flight
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CommandTarget {
    pub kind: ElementKind,
    pub id: u32,
}

impl fmt::Display for CommandTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// Which surface a command came in through
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CommandOrigin {
    Dnp3,
    Modbus,
    Api,
    Internal,
}

/// Acknowledgement handed back as soon as a command is queued
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandReceipt {
    pub id: Uuid,
    pub target: CommandTarget,
    pub origin: CommandOrigin,
    pub accepted_at: DateTime<Utc>,
}

impl Command {
    pub fn target(&self) -> CommandTarget {
        match *self {
            Command::Load { load_id, .. } => CommandTarget {
                kind: ElementKind::Load,
                id: load_id,
            },
            Command::Generator { generator_id, .. } => CommandTarget {
                kind: ElementKind::Generator,
                id: generator_id,
            },
            Command::Breaker { line_id, .. } => CommandTarget {
                kind: ElementKind::Line,
                id: line_id,
            },
            Command::TransformerTap { transformer_id, .. } => CommandTarget {
                kind: ElementKind::Transformer,
                id: transformer_id,
            },
            Command::Storage { storage_id, .. } => CommandTarget {
                kind: ElementKind::Storage,
                id: storage_id,
            },
        }
    }

    /// Check the command against the element it targets.
    ///
    /// The target must exist and the requested value must be finite and
    /// inside the element's limits. Engines and the router share this check.
    pub fn validate(&self, topology: &NetworkTopology) -> Result<(), CommandError> {
        let target = self.target();
        let unknown = || CommandError::UnknownTarget {
            kind: target.kind,
            id: target.id,
        };

        match *self {
            Command::Load { load_id, p_mw, q_mvar } => {
                let load = topology.load(load_id).ok_or_else(unknown)?;
                finite("p_mw", p_mw)?;
                if let Some(q) = q_mvar {
                    finite("q_mvar", q)?;
                }
                if let Some(max) = load.p_max_mw {
                    within("p_mw", p_mw, -max, max)?;
                }
            }
            Command::Generator {
                generator_id,
                p_mw,
                q_mvar,
            } => {
                let gen = topology.generator(generator_id).ok_or_else(unknown)?;
                finite("p_mw", p_mw)?;
                within("p_mw", p_mw, gen.p_min_mw, gen.p_max_mw)?;
                if let Some(q) = q_mvar {
                    finite("q_mvar", q)?;
                    within("q_mvar", q, gen.q_min_mvar, gen.q_max_mvar)?;
                }
            }
            Command::Breaker { line_id, .. } => {
                topology.line(line_id).ok_or_else(unknown)?;
            }
            Command::TransformerTap {
                transformer_id,
                tap_position,
            } => {
                let trafo = topology.transformer(transformer_id).ok_or_else(unknown)?;
                within(
                    "tap_position",
                    f64::from(tap_position),
                    f64::from(trafo.tap_min),
                    f64::from(trafo.tap_max),
                )?;
            }
            Command::Storage { storage_id, p_mw } => {
                let unit = topology.storage_unit(storage_id).ok_or_else(unknown)?;
                finite("p_mw", p_mw)?;
                within("p_mw", p_mw, -unit.p_max_mw, unit.p_max_mw)?;
            }
        }
        Ok(())
    }
}

fn finite(field: &'static str, value: f64) -> Result<(), CommandError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(CommandError::NotFinite { field })
    }
}

fn within(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), CommandError> {
    if value < min || value > max {
        return Err(CommandError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::topology::fixtures::{three_bus, with_storage};
    use rstest::rstest;

    #[test]
    fn test_command_json_is_tagged_by_kind() {
        let cmd: Command =
            serde_json::from_str(r#"{"kind":"breaker","line_id":0,"closed":false}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Breaker {
                line_id: 0,
                closed: false
            }
        );
        assert_eq!(cmd.target().kind, ElementKind::Line);
    }

    #[rstest]
    #[case(Command::Generator { generator_id: 0, p_mw: 2.0, q_mvar: None })]
    #[case(Command::Generator { generator_id: 0, p_mw: 0.0, q_mvar: Some(-1.0) })]
    #[case(Command::Load { load_id: 0, p_mw: -0.6, q_mvar: None })]
    #[case(Command::Breaker { line_id: 0, closed: false })]
    #[case(Command::TransformerTap { transformer_id: 0, tap_position: -2 })]
    fn test_valid_commands(#[case] cmd: Command) {
        assert!(cmd.validate(&three_bus()).is_ok());
    }

    #[rstest]
    #[case(Command::Generator { generator_id: 0, p_mw: 3.5, q_mvar: None })]
    #[case(Command::Generator { generator_id: 0, p_mw: 1.0, q_mvar: Some(4.0) })]
    #[case(Command::Load { load_id: 0, p_mw: 0.7, q_mvar: None })]
    #[case(Command::TransformerTap { transformer_id: 0, tap_position: 3 })]
    fn test_out_of_range_commands(#[case] cmd: Command) {
        assert!(matches!(
            cmd.validate(&three_bus()),
            Err(CommandError::OutOfRange { .. })
        ));
    }

    #[rstest]
    #[case(Command::Generator { generator_id: 9, p_mw: 1.0, q_mvar: None })]
    #[case(Command::Load { load_id: 9, p_mw: 0.1, q_mvar: None })]
    #[case(Command::Breaker { line_id: 9, closed: true })]
    #[case(Command::TransformerTap { transformer_id: 9, tap_position: 0 })]
    fn test_unknown_targets(#[case] cmd: Command) {
        assert!(matches!(
            cmd.validate(&three_bus()),
            Err(CommandError::UnknownTarget { id: 9, .. })
        ));
    }

    #[test]
    fn test_nan_setpoint_rejected() {
        let cmd = Command::Generator {
            generator_id: 0,
            p_mw: f64::NAN,
            q_mvar: None,
        };
        assert!(matches!(
            cmd.validate(&three_bus()),
            Err(CommandError::NotFinite { field: "p_mw" })
        ));
    }

    #[rstest]
    #[case(-0.05, true)]
    #[case(0.02, true)]
    #[case(0.06, false)]
    #[case(-0.051, false)]
    fn test_storage_setpoint_limits(#[case] p_mw: f64, #[case] accepted: bool) {
        let cmd = Command::Storage { storage_id: 0, p_mw };
        assert_eq!(cmd.validate(&with_storage()).is_ok(), accepted);
        assert_eq!(cmd.target().kind, ElementKind::Storage);
    }

    #[test]
    fn test_storage_command_json() {
        let cmd: Command =
            serde_json::from_str(r#"{"kind":"storage","storage_id":0,"p_mw":-0.01}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Storage {
                storage_id: 0,
                p_mw: -0.01
            }
        );
        assert!(matches!(
            cmd.validate(&three_bus()),
            Err(CommandError::UnknownTarget {
                kind: ElementKind::Storage,
                id: 0
            })
        ));
    }
}
