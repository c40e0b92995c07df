use anyhow::{Context, Result};
use grid_scada_gateway::{config::Config, engine::EngineRegistry, gateway::Gateway, telemetry};
use std::sync::Arc;
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load().context("failed to load configuration")?;

    if cfg.modbus.enabled && !cfg.modbus.bind.starts_with("127.") {
        warn!(
            bind = %cfg.modbus.bind,
            "Modbus TCP has no authentication; expose it only on a trusted network"
        );
    }

    info!(
        engine = %cfg.engine.kind,
        topology = %cfg.engine.topology_path.display(),
        "starting grid SCADA gateway"
    );

    let gateway = Gateway::build(cfg, &EngineRegistry::new())
        .context("failed to build gateway")?;
    let handle = Arc::new(gateway)
        .start()
        .await
        .context("failed to start listeners")?;

    telemetry::shutdown_signal().await;
    handle.shutdown().await;

    info!("shutdown complete");
    Ok(())
}
