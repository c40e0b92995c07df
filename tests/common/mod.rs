#![allow(dead_code)]
use grid_scada_gateway::config::Config;
use grid_scada_gateway::domain::NetworkTopology;
use grid_scada_gateway::engine::EngineRegistry;
use grid_scada_gateway::gateway::Gateway;
use std::path::PathBuf;
use std::sync::Arc;

pub fn topology_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/topology.toml")
}

pub fn feeder() -> NetworkTopology {
    NetworkTopology::from_path(topology_path()).expect("bundled topology loads")
}

/// Listeners on ephemeral loopback ports; the scan loop is driven by hand
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.engine.topology_path = topology_path();
    config.dnp3.bind = "127.0.0.1:0".to_string();
    config.modbus.bind = "127.0.0.1:0".to_string();
    config.api.bind = "127.0.0.1:0".to_string();
    config
}

pub fn gateway() -> Arc<Gateway> {
    Arc::new(
        Gateway::with_topology(test_config(), &EngineRegistry::new(), feeder())
            .expect("gateway builds"),
    )
}
