use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{Command, CommandOrigin, CommandReceipt, CommandTarget, NetworkTopology};
use crate::error::CommandError;
use crate::events::{EventBus, GatewayEvent};

/// Command accepted by the router and waiting for the next scan
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    pub id: Uuid,
    pub command: Command,
    pub origin: CommandOrigin,
    pub epoch: u64,
}

struct RouterState {
    topology: Arc<NetworkTopology>,
    epoch: u64,
    queue: VecDeque<QueuedCommand>,
    /// Targets with an accepted command that has not been applied yet
    in_flight: HashMap<CommandTarget, Uuid>,
}

/// Validates protocol writes and hands them to the scan scheduler.
///
/// Submission never waits for a solve. The receipt only means the command was
/// queued; its outcome arrives on the event stream after the next scan.
pub struct CommandRouter {
    state: Mutex<RouterState>,
    capacity: usize,
    events: EventBus,
}

impl CommandRouter {
    pub fn new(topology: Arc<NetworkTopology>, epoch: u64, capacity: usize, events: EventBus) -> Self {
        Self {
            state: Mutex::new(RouterState {
                topology,
                epoch,
                queue: VecDeque::with_capacity(capacity),
                in_flight: HashMap::new(),
            }),
            capacity: capacity.max(1),
            events,
        }
    }

    /// Check a command against the current epoch without queueing it
    pub fn validate(&self, command: &Command) -> Result<(), CommandError> {
        let topology = Arc::clone(&self.state.lock().topology);
        command.validate(&topology)
    }

    pub fn submit(&self, command: Command, origin: CommandOrigin) -> Result<CommandReceipt, CommandError> {
        let mut receipts = self.submit_batch(vec![command], origin)?;
        receipts
            .pop()
            .ok_or(CommandError::Engine("empty command batch".to_string()))
    }

    /// Queue every command or none of them.
    ///
    /// Validation, busy targets and queue capacity are all checked under one
    /// lock, so a refused batch leaves the queue untouched. Two commands for
    /// the same target in one batch count as busy.
    pub fn submit_batch(
        &self,
        commands: Vec<Command>,
        origin: CommandOrigin,
    ) -> Result<Vec<CommandReceipt>, CommandError> {
        let mut state = self.state.lock();

        let mut targets = HashSet::with_capacity(commands.len());
        for command in &commands {
            let target = command.target();
            let admitted = command.validate(&state.topology).and_then(|_| {
                if state.in_flight.contains_key(&target) || !targets.insert(target) {
                    Err(CommandError::TargetBusy(target))
                } else if state.queue.len() + targets.len() > self.capacity {
                    Err(CommandError::QueueFull(state.queue.len()))
                } else {
                    Ok(())
                }
            });

            if let Err(err) = admitted {
                drop(state);
                debug!(%target, %origin, batch = commands.len(), error = %err, "command rejected");
                self.events.publish(GatewayEvent::CommandRejected {
                    target,
                    origin,
                    command: command.clone(),
                    code: err.code(),
                    reason: err.to_string(),
                    at: Utc::now(),
                });
                return Err(err);
            }
        }

        let epoch = state.epoch;
        let mut accepted = Vec::with_capacity(commands.len());
        for command in commands {
            let receipt = CommandReceipt {
                id: Uuid::new_v4(),
                target: command.target(),
                origin,
                accepted_at: Utc::now(),
            };
            state.in_flight.insert(receipt.target, receipt.id);
            state.queue.push_back(QueuedCommand {
                id: receipt.id,
                command: command.clone(),
                origin,
                epoch,
            });
            accepted.push((receipt, command));
        }
        drop(state);

        let mut receipts = Vec::with_capacity(accepted.len());
        for (receipt, command) in accepted {
            info!(id = %receipt.id, target = %receipt.target, %origin, "command accepted");
            self.events.publish(GatewayEvent::CommandAccepted {
                id: receipt.id,
                target: receipt.target,
                origin,
                command,
                at: receipt.accepted_at,
            });
            receipts.push(receipt);
        }
        Ok(receipts)
    }

    /// Take every queued command. Targets stay in flight until [`complete`](Self::complete).
    pub fn drain(&self) -> Vec<QueuedCommand> {
        self.state.lock().queue.drain(..).collect()
    }

    /// Release a drained command's target and report its outcome
    pub fn complete(&self, queued: &QueuedCommand, outcome: Result<(), CommandError>) {
        let target = queued.command.target();
        let epoch = {
            let mut state = self.state.lock();
            if state.in_flight.get(&target) == Some(&queued.id) {
                state.in_flight.remove(&target);
            }
            state.epoch
        };

        match outcome {
            Ok(()) => {
                debug!(id = %queued.id, %target, "command applied");
                self.events.publish(GatewayEvent::CommandApplied {
                    id: queued.id,
                    target,
                    epoch,
                    at: Utc::now(),
                });
            }
            Err(err) => {
                warn!(id = %queued.id, %target, error = %err, "command failed");
                self.events.publish(GatewayEvent::CommandFailed {
                    id: queued.id,
                    target,
                    code: err.code(),
                    reason: err.to_string(),
                    at: Utc::now(),
                });
            }
        }
    }

    /// Switch to a new topology epoch, failing everything still queued
    pub fn reset(&self, topology: Arc<NetworkTopology>, epoch: u64) {
        let stale: Vec<QueuedCommand> = {
            let mut state = self.state.lock();
            state.topology = topology;
            state.epoch = epoch;
            state.in_flight.clear();
            state.queue.drain(..).collect()
        };

        if !stale.is_empty() {
            warn!(epoch, dropped = stale.len(), "queued commands dropped by topology reload");
        }
        for queued in stale {
            let err = CommandError::TopologyChanged;
            self.events.publish(GatewayEvent::CommandFailed {
                id: queued.id,
                target: queued.command.target(),
                code: err.code(),
                reason: err.to_string(),
                at: Utc::now(),
            });
        }
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::topology::fixtures::three_bus;

    fn router(capacity: usize) -> (CommandRouter, EventBus) {
        let events = EventBus::new(64);
        (
            CommandRouter::new(Arc::new(three_bus()), 1, capacity, events.clone()),
            events,
        )
    }

    fn gen(p_mw: f64) -> Command {
        Command::Generator {
            generator_id: 0,
            p_mw,
            q_mvar: None,
        }
    }

    #[test]
    fn test_second_command_to_busy_target_rejected() {
        let (router, _events) = router(8);
        router.submit(gen(1.0), CommandOrigin::Modbus).unwrap();

        let err = router.submit(gen(2.0), CommandOrigin::Dnp3).unwrap_err();
        assert!(matches!(err, CommandError::TargetBusy(_)));

        let queued = router.drain();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].command, gen(1.0));
    }

    #[test]
    fn test_target_stays_busy_until_completed() {
        let (router, _events) = router(8);
        router.submit(gen(1.0), CommandOrigin::Api).unwrap();
        let queued = router.drain();

        assert!(router.submit(gen(2.0), CommandOrigin::Api).is_err());
        router.complete(&queued[0], Ok(()));
        assert!(router.submit(gen(2.0), CommandOrigin::Api).is_ok());
    }

    #[test]
    fn test_queue_capacity() {
        let (router, _events) = router(1);
        router.submit(gen(1.0), CommandOrigin::Api).unwrap();
        let err = router
            .submit(
                Command::Breaker {
                    line_id: 0,
                    closed: false,
                },
                CommandOrigin::Api,
            )
            .unwrap_err();
        assert_eq!(err, CommandError::QueueFull(1));
    }

    #[test]
    fn test_invalid_command_never_queued() {
        let (router, events) = router(8);
        let mut rx = events.subscribe();

        let err = router
            .submit(
                Command::Load {
                    load_id: 77,
                    p_mw: 0.1,
                    q_mvar: None,
                },
                CommandOrigin::Modbus,
            )
            .unwrap_err();
        assert!(matches!(err, CommandError::UnknownTarget { id: 77, .. }));
        assert_eq!(router.pending(), 0);
        assert!(matches!(
            rx.try_recv().unwrap(),
            GatewayEvent::CommandRejected { code: "unknown_target", .. }
        ));
    }

    #[test]
    fn test_batch_with_busy_target_queues_nothing() {
        let (router, _events) = router(8);
        router
            .submit(
                Command::Breaker {
                    line_id: 0,
                    closed: false,
                },
                CommandOrigin::Modbus,
            )
            .unwrap();

        let batch = vec![
            gen(1.0),
            Command::Breaker {
                line_id: 0,
                closed: true,
            },
        ];
        let err = router.submit_batch(batch, CommandOrigin::Modbus).unwrap_err();
        assert!(matches!(err, CommandError::TargetBusy(_)));
        assert_eq!(router.pending(), 1);
        assert_eq!(router.in_flight(), 1);

        // the generator is still free
        assert!(router.submit(gen(1.0), CommandOrigin::Modbus).is_ok());
    }

    #[test]
    fn test_batch_respects_remaining_capacity() {
        let (router, _events) = router(2);
        router.submit(gen(1.0), CommandOrigin::Api).unwrap();

        let batch = vec![
            Command::Breaker {
                line_id: 0,
                closed: false,
            },
            Command::Load {
                load_id: 0,
                p_mw: 0.1,
                q_mvar: None,
            },
        ];
        assert_eq!(
            router.submit_batch(batch, CommandOrigin::Modbus),
            Err(CommandError::QueueFull(1))
        );
        assert_eq!(router.pending(), 1);
    }

    #[test]
    fn test_batch_accepted_whole() {
        let (router, _events) = router(8);
        let receipts = router
            .submit_batch(
                vec![
                    gen(1.0),
                    Command::Breaker {
                        line_id: 0,
                        closed: false,
                    },
                ],
                CommandOrigin::Modbus,
            )
            .unwrap();
        assert_eq!(receipts.len(), 2);
        assert_eq!(router.pending(), 2);

        let load = |p_mw| Command::Load {
            load_id: 0,
            p_mw,
            q_mvar: None,
        };
        assert!(matches!(
            router.submit_batch(vec![load(0.1), load(0.2)], CommandOrigin::Api),
            Err(CommandError::TargetBusy(_))
        ));
        assert_eq!(router.pending(), 2);
    }

    #[test]
    fn test_reset_fails_queued_commands() {
        let (router, events) = router(8);
        router.submit(gen(1.0), CommandOrigin::Api).unwrap();
        let mut rx = events.subscribe();

        router.reset(Arc::new(three_bus()), 2);
        assert_eq!(router.pending(), 0);
        assert_eq!(router.in_flight(), 0);
        assert_eq!(router.epoch(), 2);
        assert!(matches!(
            rx.try_recv().unwrap(),
            GatewayEvent::CommandFailed { code: "topology_changed", .. }
        ));
    }
}
