//! Drives the Modbus TCP server with a real client.

mod common;

use grid_scada_gateway::protocols::modbus::ModbusServer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::*;
use tokio_util::sync::CancellationToken;

use grid_scada_gateway::gateway::Gateway;

async fn serve(gw: &Arc<Gateway>) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(ModbusServer::new(
        gw.store().clone(),
        Arc::clone(gw.router()),
        gw.events().clone(),
    ));
    let cancel = CancellationToken::new();
    tokio::spawn(server.serve(listener, cancel.clone()));
    (addr, cancel)
}

async fn connect(addr: SocketAddr) -> Context {
    tcp::connect(addr).await.unwrap()
}

#[tokio::test]
async fn test_generator_setpoint_visible_after_one_tick() {
    let gw = common::gateway();
    let (addr, cancel) = serve(&gw).await;
    let mut ctx = connect(addr).await;

    let before = ctx.read_holding_registers(4000, 1).await.unwrap();
    assert_eq!(before, vec![800]);

    ctx.write_single_register(4000, 2000).await.unwrap();
    // queued, not applied
    assert_eq!(ctx.read_holding_registers(4000, 1).await.unwrap(), vec![800]);

    gw.scheduler().tick().await.unwrap();
    assert_eq!(ctx.read_holding_registers(4000, 1).await.unwrap(), vec![2000]);
    assert_eq!(ctx.read_input_registers(4000, 1).await.unwrap(), vec![2000]);

    cancel.cancel();
}

#[tokio::test]
async fn test_breaker_coil_opens_line() {
    let gw = common::gateway();
    let (addr, cancel) = serve(&gw).await;
    let mut ctx = connect(addr).await;

    assert_eq!(ctx.read_coils(0, 2).await.unwrap(), vec![true, true]);

    ctx.write_single_coil(0, false).await.unwrap();
    gw.scheduler().tick().await.unwrap();

    assert_eq!(ctx.read_discrete_inputs(0, 1).await.unwrap(), vec![false]);
    // line 0 active power register
    assert_eq!(ctx.read_holding_registers(1000, 1).await.unwrap(), vec![0]);

    let state = gw.store().current();
    assert!(!state.state.lines[0].closed);
    assert_eq!(state.state.lines[0].p_mw, 0.0);

    cancel.cancel();
}

#[tokio::test]
async fn test_exceptions_keep_connection_open() {
    let gw = common::gateway();
    let (addr, cancel) = serve(&gw).await;
    let mut ctx = connect(addr).await;

    // past the end of the register table
    assert!(ctx.read_holding_registers(7990, 20).await.is_err());
    // bus voltage is read-only
    assert!(ctx.write_single_register(0, 1000).await.is_err());
    // unknown generator slot
    assert!(ctx.write_single_register(4999, 10).await.is_err());

    assert_eq!(ctx.read_holding_registers(4000, 1).await.unwrap(), vec![800]);
    assert_eq!(gw.router().pending(), 0);

    cancel.cancel();
}

#[tokio::test]
async fn test_second_write_to_busy_target_is_refused() {
    let gw = common::gateway();
    let (addr, cancel) = serve(&gw).await;
    let mut first = connect(addr).await;
    let mut second = connect(addr).await;

    first.write_single_register(4000, 1500).await.unwrap();
    assert!(second.write_single_register(4000, 2500).await.is_err());

    gw.scheduler().tick().await.unwrap();
    assert_eq!(second.read_holding_registers(4000, 1).await.unwrap(), vec![1500]);

    // the target is free again once the command has been applied
    second.write_single_register(4000, 2500).await.unwrap();

    cancel.cancel();
}

#[tokio::test]
async fn test_refused_multi_coil_write_changes_nothing() {
    let gw = common::gateway();
    let (addr, cancel) = serve(&gw).await;
    let mut ctx = connect(addr).await;

    ctx.write_single_coil(1, false).await.unwrap();
    // coil 1 is in flight, so the whole write is refused
    assert!(ctx.write_multiple_coils(0, &[false, false]).await.is_err());
    assert_eq!(gw.router().pending(), 1);

    gw.scheduler().tick().await.unwrap();
    assert_eq!(ctx.read_coils(0, 2).await.unwrap(), vec![true, false]);

    cancel.cancel();
}
