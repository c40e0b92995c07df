use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::Display;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::domain::{Command, CommandOrigin, CommandTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionProtocol {
    Dnp3,
    Modbus,
}

/// Notification for downstream consumers such as a Grid-STIX publisher
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    CommandAccepted {
        id: Uuid,
        target: CommandTarget,
        origin: CommandOrigin,
        command: Command,
        at: DateTime<Utc>,
    },
    CommandRejected {
        target: CommandTarget,
        origin: CommandOrigin,
        command: Command,
        code: &'static str,
        reason: String,
        at: DateTime<Utc>,
    },
    CommandApplied {
        id: Uuid,
        target: CommandTarget,
        epoch: u64,
        at: DateTime<Utc>,
    },
    CommandFailed {
        id: Uuid,
        target: CommandTarget,
        code: &'static str,
        reason: String,
        at: DateTime<Utc>,
    },
    StateCommitted {
        epoch: u64,
        step: u64,
        iterations: u32,
        duration_ms: f64,
        at: DateTime<Utc>,
    },
    SolveFailed {
        epoch: u64,
        consecutive_failures: u64,
        reason: String,
        at: DateTime<Utc>,
    },
    TopologyReloaded {
        epoch: u64,
        name: String,
        points: usize,
        at: DateTime<Utc>,
    },
    SessionOpened {
        protocol: SessionProtocol,
        peer: String,
        epoch: u64,
        at: DateTime<Utc>,
    },
    SessionClosed {
        protocol: SessionProtocol,
        peer: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

/// Fan-out of gateway events; slow subscribers lag rather than block producers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: GatewayEvent) {
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            trace!(?event, "no event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ElementKind;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(GatewayEvent::TopologyReloaded {
            epoch: 2,
            name: "feeder".to_string(),
            points: 12,
            at: Utc::now(),
        });

        match rx.recv().await.unwrap() {
            GatewayEvent::TopologyReloaded { epoch, points, .. } => {
                assert_eq!(epoch, 2);
                assert_eq!(points, 12);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        EventBus::new(1).publish(GatewayEvent::SolveFailed {
            epoch: 1,
            consecutive_failures: 1,
            reason: "diverged".to_string(),
            at: Utc::now(),
        });
    }

    #[test]
    fn test_event_json_shape() {
        let event = GatewayEvent::CommandApplied {
            id: Uuid::nil(),
            target: CommandTarget {
                kind: ElementKind::Line,
                id: 0,
            },
            epoch: 1,
            at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "command_applied");
        assert_eq!(json["target"]["kind"], "line");
    }
}
