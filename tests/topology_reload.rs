//! Open protocol sessions are dropped when the network is swapped.

mod common;

use grid_scada_gateway::events::{GatewayEvent, SessionProtocol};
use grid_scada_gateway::protocols::dnp3::link::{self, function, LinkFrame, LinkParse};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;

const MASTER: u16 = 1;
const OUTSTATION: u16 = 10;

async fn next_event(
    rx: &mut broadcast::Receiver<GatewayEvent>,
    mut wanted: impl FnMut(&GatewayEvent) -> bool,
) -> GatewayEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event bus closed: {e}"),
            }
        }
    })
    .await
    .expect("event arrived in time")
}

async fn reset_link(stream: &mut TcpStream) {
    let reset = LinkFrame::new(
        link::DIR | link::PRM | function::RESET_LINK_STATES,
        OUTSTATION,
        MASTER,
        Vec::new(),
    );
    stream.write_all(&reset.encode()).await.unwrap();

    let mut buffer = Vec::new();
    let mut chunk = [0u8; 64];
    loop {
        if let LinkParse::Frame(frame, _) = link::parse_frame(&buffer) {
            assert_eq!(frame.function(), function::ACK);
            return;
        }
        let n = timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("ack in time")
            .unwrap();
        assert!(n > 0);
        buffer.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn test_reload_closes_every_protocol_session() {
    let gw = common::gateway();
    let mut rx = gw.events().subscribe();
    let handle = Arc::clone(&gw).start().await.unwrap();

    let mut modbus = tcp::connect(handle.modbus_addr().unwrap()).await.unwrap();
    let mut dnp3 = TcpStream::connect(handle.dnp3_addr().unwrap()).await.unwrap();
    reset_link(&mut dnp3).await;
    assert_eq!(modbus.read_coils(0, 2).await.unwrap(), vec![true, true]);

    for protocol in [SessionProtocol::Modbus, SessionProtocol::Dnp3] {
        next_event(&mut rx, |e| {
            matches!(e, GatewayEvent::SessionOpened { protocol: p, epoch: 1, .. } if *p == protocol)
        })
        .await;
    }

    let mut topology = common::feeder();
    topology.name = "feeder, rebuilt".to_string();
    let reloaded = gw.reload_topology(topology).unwrap();
    assert_eq!(reloaded.epoch, 2);

    let mut closed = Vec::new();
    for _ in 0..2 {
        let event = next_event(&mut rx, |e| matches!(e, GatewayEvent::SessionClosed { .. })).await;
        let GatewayEvent::SessionClosed {
            protocol, reason, ..
        } = event
        else {
            unreachable!();
        };
        assert_eq!(reason, "topology reloaded");
        closed.push(protocol);
    }
    assert!(closed.contains(&SessionProtocol::Modbus));
    assert!(closed.contains(&SessionProtocol::Dnp3));

    // both sockets are gone from the server side
    let mut chunk = [0u8; 16];
    let read = timeout(Duration::from_secs(5), dnp3.read(&mut chunk))
        .await
        .expect("dnp3 socket settled");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(modbus.read_coils(0, 2).await.is_err());

    handle.shutdown().await;
}
