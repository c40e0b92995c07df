use std::time::Duration;
use thiserror::Error;

use crate::domain::{CommandTarget, ElementKind};
use crate::points::PointField;

/// Problems with a network topology document
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("duplicate {kind} id {id}")]
    DuplicateId { kind: ElementKind, id: u32 },

    #[error("{kind} {id} references unknown bus {bus}")]
    UnknownBus { kind: ElementKind, id: u32, bus: u32 },

    #[error("{kind} {id}: {reason}")]
    InvalidParameter {
        kind: ElementKind,
        id: u32,
        reason: String,
    },

    #[error("invalid network: {0}")]
    InvalidNetwork(String),

    #[error("failed to read topology file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse topology file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("unsupported topology file extension '{0}' (expected toml or json)")]
    UnsupportedFormat(String),
}

/// Fatal: the engine cannot be built or cannot accept a topology
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid topology: {0}")]
    InvalidTopology(#[from] TopologyError),

    #[error("unknown engine '{0}'")]
    UnknownEngine(String),

    #[error("engine {engine} cannot model this network: {reason}")]
    Unsupported { engine: &'static str, reason: String },

    #[error("engine {engine} failed to initialize: {reason}")]
    Initialization { engine: String, reason: String },
}

/// Recoverable: this step failed, the previous snapshot stays published
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SolveError {
    #[error("power flow did not converge after {iterations} iterations (mismatch {mismatch:.3e})")]
    NonConvergence { iterations: u32, mismatch: f64 },

    #[error("solve exceeded the {0:?} deadline")]
    Timeout(Duration),

    #[error("engine is still busy with a previous step")]
    EngineBusy,

    #[error("no topology loaded")]
    NotLoaded,

    #[error("solver failure: {0}")]
    Solver(String),
}

/// A command was refused; the network is unchanged
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("unknown {kind} {id}")]
    UnknownTarget { kind: ElementKind, id: u32 },

    #[error("{field} = {value} outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{field} is not a finite number")]
    NotFinite { field: &'static str },

    #[error("{0} already has a command in flight")]
    TargetBusy(CommandTarget),

    #[error("command queue full ({0} pending)")]
    QueueFull(usize),

    #[error("topology changed before the command was applied")]
    TopologyChanged,

    #[error("engine rejected command: {0}")]
    Engine(String),
}

impl CommandError {
    /// Stable reason code carried on rejection events
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::UnknownTarget { .. } => "unknown_target",
            CommandError::OutOfRange { .. } => "out_of_range",
            CommandError::NotFinite { .. } => "not_finite",
            CommandError::TargetBusy(_) => "target_busy",
            CommandError::QueueFull(_) => "queue_full",
            CommandError::TopologyChanged => "topology_changed",
            CommandError::Engine(_) => "engine",
        }
    }
}

/// Wire data that cannot be decoded
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolDecodeError {
    #[error("frame truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("bad start octets")]
    BadStart,

    #[error("CRC mismatch")]
    Crc,

    #[error("invalid length field {0}")]
    InvalidLength(usize),

    #[error("unsupported protocol identifier {0}")]
    ProtocolId(u16),

    #[error("unsupported qualifier 0x{0:02x}")]
    Qualifier(u8),

    #[error("unknown object g{group}v{variation}")]
    UnknownObject { group: u8, variation: u8 },

    #[error("malformed request: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PointMapError {
    #[error("{field} block holds {count} points, capacity is {capacity}")]
    CapacityExceeded {
        field: PointField,
        count: usize,
        capacity: usize,
    },
}

/// Startup and reload failures of the gateway runtime
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    PointMap(#[from] PointMapError),

    #[error("failed to bind {what} listener on {addr}: {source}")]
    Bind {
        what: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_codes() {
        let busy = CommandError::TargetBusy(CommandTarget {
            kind: ElementKind::Generator,
            id: 3,
        });
        assert_eq!(busy.code(), "target_busy");
        assert_eq!(busy.to_string(), "generator 3 already has a command in flight");
        assert_eq!(CommandError::QueueFull(8).code(), "queue_full");
    }

    #[test]
    fn test_topology_error_display() {
        let err = TopologyError::UnknownBus {
            kind: ElementKind::Load,
            id: 1,
            bus: 7,
        };
        assert_eq!(err.to_string(), "load 1 references unknown bus 7");
    }
}
