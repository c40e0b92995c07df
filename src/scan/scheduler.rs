use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Snapshot, SnapshotStore};
use crate::config::ScanConfig;
use crate::engine::SharedEngine;
use crate::error::{CommandError, SolveError};
use crate::events::{EventBus, GatewayEvent};
use crate::router::CommandRouter;

/// Counters for the scan loop
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanStats {
    pub total_steps: u64,
    pub failed_steps: u64,
    pub consecutive_failures: u64,
    pub commands_applied: u64,
    pub commands_failed: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_duration_ms: f64,
}

struct TickOutcome {
    applied: u64,
    failed: u64,
    result: Result<Arc<Snapshot>, SolveError>,
}

/// Advances simulated time at a fixed period, independent of protocol polls
pub struct ScanScheduler {
    engine: SharedEngine,
    router: Arc<CommandRouter>,
    store: SnapshotStore,
    events: EventBus,
    period: Duration,
    solve_timeout: Duration,
    stats: RwLock<ScanStats>,
    running: AtomicBool,
}

impl ScanScheduler {
    pub fn new(
        engine: SharedEngine,
        router: Arc<CommandRouter>,
        store: SnapshotStore,
        events: EventBus,
        config: &ScanConfig,
    ) -> Self {
        Self {
            engine,
            router,
            store,
            events,
            period: Duration::from_millis(config.period_ms.max(1)),
            solve_timeout: Duration::from_millis(config.solve_timeout_ms.max(1)),
            stats: RwLock::new(ScanStats::default()),
            running: AtomicBool::new(false),
        }
    }

    pub fn stats(&self) -> ScanStats {
        self.stats.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one scan: apply queued commands, solve, publish.
    ///
    /// Returns the committed snapshot. On error the previously published
    /// snapshot stays current and the store is flagged as stalled.
    pub async fn tick(&self) -> Result<Arc<Snapshot>, SolveError> {
        let started = Instant::now();
        self.stats.write().last_run = Some(Utc::now());

        let engine = Arc::clone(&self.engine);
        let router = Arc::clone(&self.router);
        let store = self.store.clone();
        let timeout = self.solve_timeout;
        let period = self.period;

        let job = tokio::task::spawn_blocking(move || {
            scan_once(&engine, &router, &store, period, started + timeout, timeout)
        });

        let outcome = match tokio::time::timeout(self.solve_timeout, job).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => TickOutcome {
                applied: 0,
                failed: 0,
                result: Err(SolveError::Solver(format!("scan task aborted: {join}"))),
            },
            Err(_) => TickOutcome {
                applied: 0,
                failed: 0,
                result: Err(SolveError::Timeout(self.solve_timeout)),
            },
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut stats = self.stats.write();
        stats.total_steps += 1;
        stats.commands_applied += outcome.applied;
        stats.commands_failed += outcome.failed;
        stats.last_duration_ms = elapsed_ms;

        match &outcome.result {
            Ok(snapshot) => {
                stats.last_success = Some(snapshot.committed_at);
                stats.last_error = None;
                stats.consecutive_failures = 0;
                drop(stats);

                self.store.set_stalled(false);
                debug!(
                    epoch = snapshot.epoch,
                    step = snapshot.step,
                    iterations = snapshot.state.solve.iterations,
                    elapsed_ms,
                    "scan committed"
                );
                self.events.publish(GatewayEvent::StateCommitted {
                    epoch: snapshot.epoch,
                    step: snapshot.step,
                    iterations: snapshot.state.solve.iterations,
                    duration_ms: snapshot.state.solve.duration_ms,
                    at: snapshot.committed_at,
                });
            }
            Err(err) => {
                stats.failed_steps += 1;
                stats.consecutive_failures += 1;
                stats.last_error = Some(err.to_string());
                let consecutive = stats.consecutive_failures;
                drop(stats);

                self.store.set_stalled(true);
                let epoch = self.store.current().epoch;
                warn!(error = %err, epoch, consecutive, "scan failed, keeping previous snapshot");
                self.events.publish(GatewayEvent::SolveFailed {
                    epoch,
                    consecutive_failures: consecutive,
                    reason: err.to_string(),
                    at: Utc::now(),
                });
            }
        }

        outcome.result
    }

    /// Tick at the configured period until cancelled. A second concurrent call returns at once.
    pub async fn run(&self, cancel: CancellationToken) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("scan scheduler already running");
            return;
        }
        info!(period_ms = self.period.as_millis() as u64, "scan scheduler started");

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // failures are recorded in stats and on the event bus
                    let _ = self.tick().await;
                }
            }
        }

        self.running.store(false, Ordering::Release);
        info!("scan scheduler stopped");
    }
}

/// Runs on the blocking pool with the engine lock held for the whole scan
fn scan_once(
    engine: &SharedEngine,
    router: &CommandRouter,
    store: &SnapshotStore,
    period: Duration,
    deadline: Instant,
    timeout: Duration,
) -> TickOutcome {
    let Some(mut engine) = engine.try_lock() else {
        return TickOutcome {
            applied: 0,
            failed: 0,
            result: Err(SolveError::EngineBusy),
        };
    };

    // read under the lock so a concurrent reload cannot mix epochs
    let base = store.current();

    let mut applied = 0;
    let mut failed = 0;
    for queued in router.drain() {
        let outcome = if queued.epoch == base.epoch {
            engine.apply(&queued.command)
        } else {
            Err(CommandError::TopologyChanged)
        };
        if outcome.is_ok() {
            applied += 1;
        } else {
            failed += 1;
        }
        router.complete(&queued, outcome);
    }

    // each scan advances simulated time by one period
    let result = engine.solve(period).and_then(|state| {
        if Instant::now() > deadline {
            return Err(SolveError::Timeout(timeout));
        }
        Ok(store.publish(Snapshot::commit(
            base.epoch,
            base.step + 1,
            Arc::clone(&base.topology),
            Arc::clone(&base.map),
            state,
        )))
    });

    TickOutcome {
        applied,
        failed,
        result,
    }
}
