//! DNP3 outstation over TCP.
//!
//! Link, transport and application functions are layered the usual way: FT3
//! frames carry transport segments, which reassemble into application
//! fragments. Each master connection gets its own [`Session`] with its own
//! event buffer; all sessions serve the same published snapshot.

pub mod app;
pub mod crc;
pub mod events;
pub mod link;
mod outstation;
pub mod transport;

pub use outstation::{Dnp3Outstation, Session, SessionState};

use crate::error::CommandError;

/// Status octet echoed for each control object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlStatus {
    Success = 0,
    Timeout = 1,
    NoSelect = 2,
    FormatError = 3,
    NotSupported = 4,
    AlreadyActive = 5,
    HardwareError = 6,
    ProcessingLimited = 11,
    OutOfRange = 12,
}

impl From<&CommandError> for ControlStatus {
    fn from(err: &CommandError) -> Self {
        match err {
            CommandError::UnknownTarget { .. } => ControlStatus::NotSupported,
            CommandError::OutOfRange { .. } | CommandError::NotFinite { .. } => {
                ControlStatus::OutOfRange
            }
            CommandError::TargetBusy(_) => ControlStatus::AlreadyActive,
            CommandError::QueueFull(_) | CommandError::TopologyChanged => {
                ControlStatus::ProcessingLimited
            }
            CommandError::Engine(_) => ControlStatus::HardwareError,
        }
    }
}
