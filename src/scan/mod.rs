//! Scan loop: the single writer of published grid snapshots.

mod scheduler;
mod snapshot;

pub use scheduler::{ScanScheduler, ScanStats};
pub use snapshot::{Snapshot, SnapshotStore};
