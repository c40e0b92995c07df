//! Grid simulator exposed to SCADA masters over DNP3 and Modbus TCP.
//!
//! A pluggable power-flow [`engine::Engine`] is stepped by the
//! [`scan::ScanScheduler`]; every step publishes an immutable
//! [`scan::Snapshot`] that protocol sessions serve reads from. Writes travel
//! the other way through the [`router::CommandRouter`].

#[cfg(feature = "api")]
pub mod api;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod points;
pub mod protocols;
pub mod router;
pub mod scan;
pub mod telemetry;
