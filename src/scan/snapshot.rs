use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::domain::{GridState, NetworkTopology};
use crate::points::{PointImage, PointMap};

/// Everything a protocol session needs to answer a poll.
///
/// The state, point map and image always come from the same epoch and step.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub epoch: u64,
    pub step: u64,
    pub committed_at: DateTime<Utc>,
    pub topology: Arc<NetworkTopology>,
    pub map: Arc<PointMap>,
    pub state: GridState,
    pub image: PointImage,
}

impl Snapshot {
    /// Stamp `state` with its epoch and step and derive the point image
    pub fn commit(
        epoch: u64,
        step: u64,
        topology: Arc<NetworkTopology>,
        map: Arc<PointMap>,
        mut state: GridState,
    ) -> Self {
        state.epoch = epoch;
        state.step = step;
        let image = PointImage::from_state(&map, &state);
        Self {
            epoch,
            step,
            committed_at: Utc::now(),
            topology,
            map,
            state,
            image,
        }
    }
}

/// Latest committed snapshot, swapped atomically as a whole
#[derive(Clone)]
pub struct SnapshotStore {
    tx: Arc<watch::Sender<Arc<Snapshot>>>,
    stalled: Arc<AtomicBool>,
}

impl SnapshotStore {
    pub fn new(initial: Snapshot) -> Self {
        let (tx, _) = watch::channel(Arc::new(initial));
        Self {
            tx: Arc::new(tx),
            stalled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }

    pub fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        self.tx.send_replace(Arc::clone(&snapshot));
        snapshot
    }

    /// Whether the most recent scan failed
    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::topology::fixtures::three_bus;

    fn snapshot(step: u64) -> Snapshot {
        let topology = Arc::new(three_bus());
        let map = Arc::new(PointMap::build(&topology).unwrap());
        let state = GridState::initial(&topology);
        Snapshot::commit(1, step, topology, map, state)
    }

    #[test]
    fn test_commit_stamps_state() {
        let snap = snapshot(7);
        assert_eq!(snap.state.step, 7);
        assert_eq!(snap.state.epoch, 1);
        assert_eq!(snap.image.values().len(), snap.map.len());
    }

    #[tokio::test]
    async fn test_publish_notifies_subscribers() {
        let store = SnapshotStore::new(snapshot(0));
        let mut rx = store.subscribe();
        let held = store.current();

        store.publish(snapshot(1));
        rx.changed().await.unwrap();

        assert_eq!(rx.borrow().step, 1);
        assert_eq!(store.current().step, 1);
        // readers holding the old snapshot keep a consistent copy
        assert_eq!(held.step, 0);
    }
}
