//! Wires the engine, scan loop, router and protocol listeners together.

use chrono::Utc;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::{GridState, NetworkTopology};
use crate::engine::{Engine, EngineRegistry, SharedEngine};
use crate::error::GatewayError;
use crate::events::{EventBus, GatewayEvent};
use crate::points::PointMap;
use crate::protocols::dnp3::Dnp3Outstation;
use crate::protocols::modbus::ModbusServer;
use crate::router::CommandRouter;
use crate::scan::{ScanScheduler, Snapshot, SnapshotStore};

const FIRST_EPOCH: u64 = 1;

/// Solve once, falling back to the unsolved state. The flag reports a failure.
///
/// No simulated time passes, so storage keeps its configured charge.
fn first_solve(engine: &mut dyn Engine) -> (GridState, bool) {
    match engine.solve(Duration::ZERO) {
        Ok(state) => (state, false),
        Err(e) => {
            warn!(error = %e, "initial solve failed, serving unsolved state");
            (engine.current_state(), true)
        }
    }
}

/// The assembled simulator. Cheap to share behind an `Arc`.
pub struct Gateway {
    config: Config,
    engine: SharedEngine,
    store: SnapshotStore,
    router: Arc<CommandRouter>,
    scheduler: Arc<ScanScheduler>,
    events: EventBus,
}

impl Gateway {
    /// Load the configured topology file and build the runtime
    pub fn build(config: Config, registry: &EngineRegistry) -> Result<Self, GatewayError> {
        let topology = NetworkTopology::from_path(&config.engine.topology_path)?;
        Self::with_topology(config, registry, topology)
    }

    pub fn with_topology(
        config: Config,
        registry: &EngineRegistry,
        topology: NetworkTopology,
    ) -> Result<Self, GatewayError> {
        topology.validate()?;
        let map = Arc::new(PointMap::build(&topology)?);

        let mut engine = registry.create(&config.engine)?;
        engine.load(&topology)?;
        let (state, stalled) = first_solve(&mut *engine);

        let topology = Arc::new(topology);
        let events = EventBus::new(config.events.capacity);
        let store = SnapshotStore::new(Snapshot::commit(
            FIRST_EPOCH,
            0,
            Arc::clone(&topology),
            Arc::clone(&map),
            state,
        ));
        store.set_stalled(stalled);

        let router = Arc::new(CommandRouter::new(
            Arc::clone(&topology),
            FIRST_EPOCH,
            config.router.queue_capacity,
            events.clone(),
        ));
        let engine: SharedEngine = Arc::new(Mutex::new(engine));
        let scheduler = Arc::new(ScanScheduler::new(
            Arc::clone(&engine),
            Arc::clone(&router),
            store.clone(),
            events.clone(),
            &config.scan,
        ));

        info!(
            network = %topology.name,
            buses = topology.buses.len(),
            points = map.len(),
            stalled,
            "gateway built"
        );

        Ok(Self {
            config,
            engine,
            store,
            router,
            scheduler,
            events,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    pub fn scheduler(&self) -> &Arc<ScanScheduler> {
        &self.scheduler
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Swap in a new network under a new epoch.
    ///
    /// Holds the engine lock throughout, so no scan interleaves with the swap.
    /// Queued commands of the old epoch fail and open sessions close.
    pub fn reload_topology(&self, topology: NetworkTopology) -> Result<Arc<Snapshot>, GatewayError> {
        topology.validate()?;
        let map = Arc::new(PointMap::build(&topology)?);

        let mut engine = self.engine.lock();
        engine.load(&topology)?;
        let (state, stalled) = first_solve(&mut **engine);

        let current = self.store.current();
        let epoch = current.epoch + 1;
        let topology = Arc::new(topology);
        self.router.reset(Arc::clone(&topology), epoch);
        let snapshot = self.store.publish(Snapshot::commit(
            epoch,
            current.step + 1,
            Arc::clone(&topology),
            map,
            state,
        ));
        self.store.set_stalled(stalled);
        drop(engine);

        info!(epoch, network = %topology.name, points = snapshot.map.len(), "topology reloaded");
        self.events.publish(GatewayEvent::TopologyReloaded {
            epoch,
            name: topology.name.clone(),
            points: snapshot.map.len(),
            at: Utc::now(),
        });
        Ok(snapshot)
    }

    pub fn reload_from_path(&self, path: impl AsRef<Path>) -> Result<Arc<Snapshot>, GatewayError> {
        let topology = NetworkTopology::from_path(path)?;
        self.reload_topology(topology)
    }

    /// Bind the enabled listeners and spawn the scan loop and servers
    pub async fn start(self: Arc<Self>) -> Result<GatewayHandle, GatewayError> {
        let cancel = CancellationToken::new();
        let mut handle = GatewayHandle {
            cancel: cancel.clone(),
            tasks: Vec::new(),
            dnp3_addr: None,
            modbus_addr: None,
            api_addr: None,
        };

        // bind everything before spawning so a bad address aborts cleanly
        let dnp3 = if self.config.dnp3.enabled {
            Some(bind("dnp3", &self.config.dnp3.bind).await?)
        } else {
            None
        };
        let modbus = if self.config.modbus.enabled {
            Some(bind("modbus", &self.config.modbus.bind).await?)
        } else {
            None
        };
        #[cfg(feature = "api")]
        let api = if self.config.api.enabled {
            Some(bind("api", &self.config.api.bind).await?)
        } else {
            None
        };

        let scheduler = Arc::clone(&self.scheduler);
        let token = cancel.clone();
        handle
            .tasks
            .push(tokio::spawn(async move { scheduler.run(token).await }));

        if let Some(listener) = dnp3 {
            handle.dnp3_addr = listener.local_addr().ok();
            let outstation = Arc::new(Dnp3Outstation::new(
                self.config.dnp3.clone(),
                self.store.clone(),
                Arc::clone(&self.router),
                self.events.clone(),
            ));
            let token = cancel.clone();
            handle
                .tasks
                .push(tokio::spawn(async move { outstation.serve(listener, token).await }));
        }

        if let Some(listener) = modbus {
            handle.modbus_addr = listener.local_addr().ok();
            let server = Arc::new(ModbusServer::new(
                self.store.clone(),
                Arc::clone(&self.router),
                self.events.clone(),
            ));
            let token = cancel.clone();
            handle
                .tasks
                .push(tokio::spawn(async move { server.serve(listener, token).await }));
        }

        #[cfg(feature = "api")]
        if let Some(listener) = api {
            handle.api_addr = listener.local_addr().ok();
            let app = crate::api::router(Arc::clone(&self), &self.config.api);
            let token = cancel.clone();
            handle.tasks.push(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await
                {
                    warn!(error = %e, "api server failed");
                }
            }));
        }

        info!(
            dnp3 = ?handle.dnp3_addr,
            modbus = ?handle.modbus_addr,
            api = ?handle.api_addr,
            "gateway started"
        );
        Ok(handle)
    }
}

async fn bind(what: &'static str, addr: &str) -> Result<TcpListener, GatewayError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| GatewayError::Bind {
            what,
            addr: addr.to_string(),
            source,
        })
}

/// Running tasks of a started gateway
pub struct GatewayHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    dnp3_addr: Option<SocketAddr>,
    modbus_addr: Option<SocketAddr>,
    api_addr: Option<SocketAddr>,
}

impl GatewayHandle {
    pub fn dnp3_addr(&self) -> Option<SocketAddr> {
        self.dnp3_addr
    }

    pub fn modbus_addr(&self) -> Option<SocketAddr> {
        self.modbus_addr
    }

    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api_addr
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every task and wait for them to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "gateway task ended abnormally");
            }
        }
        info!("gateway stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::topology::fixtures::three_bus;
    use crate::domain::{Command, CommandOrigin};
    use crate::error::{CommandError, TopologyError};

    fn gateway() -> Gateway {
        Gateway::with_topology(Config::default(), &EngineRegistry::new(), three_bus()).unwrap()
    }

    #[test]
    fn test_build_publishes_solved_epoch_one() {
        let gw = gateway();
        let snapshot = gw.store().current();
        assert_eq!(snapshot.epoch, 1);
        assert_eq!(snapshot.step, 0);
        assert!(snapshot.state.solve.converged);
        assert!(!gw.store().is_stalled());
    }

    #[test]
    fn test_invalid_topology_is_fatal() {
        let mut topo = three_bus();
        topo.loads[0].bus = 42;
        let err = Gateway::with_topology(Config::default(), &EngineRegistry::new(), topo)
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::Topology(TopologyError::UnknownBus { .. })));
    }

    #[test]
    fn test_reload_bumps_epoch_and_fails_queued_commands() {
        let gw = gateway();
        let mut events = gw.events().subscribe();
        gw.router()
            .submit(
                Command::Breaker {
                    line_id: 0,
                    closed: false,
                },
                CommandOrigin::Api,
            )
            .unwrap();

        let mut smaller = three_bus();
        smaller.name = "trimmed".to_string();
        smaller.generators.clear();
        let snapshot = gw.reload_topology(smaller).unwrap();

        assert_eq!(snapshot.epoch, 2);
        assert_eq!(gw.router().epoch(), 2);
        assert_eq!(gw.router().pending(), 0);
        assert_eq!(
            gw.router().validate(&Command::Generator {
                generator_id: 0,
                p_mw: 1.0,
                q_mvar: None
            }),
            Err(CommandError::UnknownTarget {
                kind: crate::domain::ElementKind::Generator,
                id: 0
            })
        );

        let mut saw_reload = false;
        while let Ok(event) = events.try_recv() {
            if let GatewayEvent::TopologyReloaded { epoch, name, .. } = event {
                assert_eq!(epoch, 2);
                assert_eq!(name, "trimmed");
                saw_reload = true;
            }
        }
        assert!(saw_reload);
    }

    #[test]
    fn test_rejected_reload_keeps_current_epoch() {
        let gw = gateway();
        let mut broken = three_bus();
        broken.lines[0].to_bus = 99;
        assert!(gw.reload_topology(broken).is_err());
        assert_eq!(gw.store().current().epoch, 1);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut config = Config::default();
        config.dnp3.bind = "127.0.0.1:0".to_string();
        config.modbus.bind = "127.0.0.1:0".to_string();
        config.api.bind = "127.0.0.1:0".to_string();
        config.scan.period_ms = 10;
        let gw = Arc::new(
            Gateway::with_topology(config, &EngineRegistry::new(), three_bus()).unwrap(),
        );

        let handle = Arc::clone(&gw).start().await.unwrap();
        assert!(handle.dnp3_addr().is_some());
        assert!(handle.modbus_addr().is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;
        assert!(!gw.scheduler().is_running());
        assert!(gw.store().current().step >= 1);
    }
}
