//! A minimal DNP3 master talking to the outstation over a socket.

mod common;

use grid_scada_gateway::protocols::dnp3::app::{iin1, FunctionCode};
use grid_scada_gateway::protocols::dnp3::link::{self, function, LinkFrame, LinkParse};
use grid_scada_gateway::protocols::dnp3::transport::{self, Reassembler};
use grid_scada_gateway::protocols::dnp3::Dnp3Outstation;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const MASTER: u16 = 1;
const OUTSTATION: u16 = 10;

struct Master {
    stream: TcpStream,
    buffer: Vec<u8>,
    reassembler: Reassembler,
    transport_seq: u8,
}

impl Master {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buffer: Vec::new(),
            reassembler: Reassembler::default(),
            transport_seq: 0,
        }
    }

    async fn send(&mut self, frame: LinkFrame) {
        self.stream.write_all(&frame.encode()).await.unwrap();
    }

    async fn next_frame(&mut self) -> LinkFrame {
        loop {
            match link::parse_frame(&self.buffer) {
                LinkParse::Frame(frame, used) => {
                    self.buffer.drain(..used);
                    return frame;
                }
                LinkParse::Skip(n, err) => panic!("outstation sent garbage ({err}), skip {n}"),
                LinkParse::Incomplete => {}
            }
            let mut chunk = [0u8; 512];
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
                .await
                .expect("outstation answered in time")
                .unwrap();
            assert!(n > 0, "outstation closed the connection");
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    async fn reset_link(&mut self) {
        self.send(LinkFrame::new(
            link::DIR | link::PRM | function::RESET_LINK_STATES,
            OUTSTATION,
            MASTER,
            Vec::new(),
        ))
        .await;
        let ack = self.next_frame().await;
        assert!(!ack.is_primary());
        assert_eq!(ack.function(), function::ACK);
        assert_eq!(ack.source, OUTSTATION);
        assert_eq!(ack.destination, MASTER);
    }

    /// Send one application request and wait for its response fragment
    async fn request(&mut self, app_seq: u8, function_code: u8, body: &[u8]) -> Vec<u8> {
        let mut data = vec![
            transport::FIR | transport::FIN | self.transport_seq,
            0xC0 | app_seq,
            function_code,
        ];
        data.extend_from_slice(body);
        self.transport_seq = (self.transport_seq + 1) & 0x3F;
        self.send(LinkFrame::new(
            link::DIR | link::PRM | function::UNCONFIRMED_USER_DATA,
            OUTSTATION,
            MASTER,
            data,
        ))
        .await;

        loop {
            let frame = self.next_frame().await;
            if let Some(fragment) = self.reassembler.push(&frame.data) {
                return fragment;
            }
        }
    }
}

async fn start(gw: &Arc<grid_scada_gateway::gateway::Gateway>) -> (std::net::SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let outstation = Arc::new(Dnp3Outstation::new(
        gw.config().dnp3.clone(),
        gw.store().clone(),
        Arc::clone(gw.router()),
        gw.events().clone(),
    ));
    let cancel = CancellationToken::new();
    tokio::spawn(outstation.serve(listener, cancel.clone()));
    (addr, cancel)
}

#[tokio::test]
async fn test_integrity_poll() {
    let gw = common::gateway();
    let (addr, cancel) = start(&gw).await;
    let mut master = Master::connect(addr).await;
    master.reset_link().await;

    let response = master.request(0, FunctionCode::Read as u8, &[60, 1, 0x06]).await;
    assert_eq!(response[0] & 0x0F, 0);
    assert_eq!(response[1], FunctionCode::Response as u8);
    assert_ne!(response[2] & iin1::DEVICE_RESTART, 0);
    // both feeder breakers closed
    assert_eq!(&response[4..13], &[1, 2, 0x01, 0, 0, 1, 0, 0x81, 0x81]);

    // clear the restart bit with a g80v1 write
    let cleared = master
        .request(1, FunctionCode::Write as u8, &[80, 1, 0x00, 7, 7, 0])
        .await;
    assert_eq!(cleared[2] & iin1::DEVICE_RESTART, 0);
    assert_eq!(cleared[3], 0);

    cancel.cancel();
}

#[tokio::test]
async fn test_direct_operate_trips_breaker() {
    let gw = common::gateway();
    let (addr, cancel) = start(&gw).await;
    let mut master = Master::connect(addr).await;
    master.reset_link().await;

    // g12v1 index 0: TRIP + PULSE_ON, count 1
    let crob = [12, 1, 0x28, 1, 0, 0, 0, 0x81, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    let response = master
        .request(2, FunctionCode::DirectOperate as u8, &crob)
        .await;
    assert_eq!(response[1], FunctionCode::Response as u8);
    // echo carries status 0
    assert_eq!(&response[4..], &crob);

    gw.scheduler().tick().await.unwrap();
    let snapshot = gw.store().current();
    assert!(!snapshot.state.lines[0].closed);
    assert!(snapshot.state.lines[1].closed);

    let poll = master.request(3, FunctionCode::Read as u8, &[1, 2, 0x06]).await;
    assert_eq!(&poll[4..13], &[1, 2, 0x01, 0, 0, 1, 0, 0x01, 0x81]);

    cancel.cancel();
}

#[tokio::test]
async fn test_busy_breaker_reports_already_active() {
    let gw = common::gateway();
    let (addr, cancel) = start(&gw).await;
    let mut master = Master::connect(addr).await;
    master.reset_link().await;

    let crob = [12, 1, 0x28, 1, 0, 0, 0, 0x41, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    let first = master.request(0, FunctionCode::DirectOperate as u8, &crob).await;
    assert_eq!(first[first.len() - 1], 0);

    let second = master.request(1, FunctionCode::DirectOperate as u8, &crob).await;
    // ALREADY_ACTIVE
    assert_eq!(second[second.len() - 1], 5);

    cancel.cancel();
}
