use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{coil_word, decode_request, encode_response, split_frame, Request, Response};
use super::{ExceptionCode, MBAP_HEADER_LEN};
use crate::domain::{Command, CommandOrigin};
use crate::events::{EventBus, GatewayEvent, SessionProtocol};
use crate::points::{from_register, PointMapEntry, COIL_TABLE_SIZE, REGISTER_TABLE_SIZE};
use crate::router::CommandRouter;
use crate::scan::{Snapshot, SnapshotStore};

const READ_CHUNK: usize = 512;

/// Modbus TCP server over the published snapshot
pub struct ModbusServer {
    store: SnapshotStore,
    router: Arc<CommandRouter>,
    events: EventBus,
}

impl ModbusServer {
    pub fn new(store: SnapshotStore, router: Arc<CommandRouter>, events: EventBus) -> Self {
        Self {
            store,
            router,
            events,
        }
    }

    /// Accept connections until cancelled, one task per connection
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "modbus server listening");
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        let cancel = cancel.child_token();
                        tokio::spawn(async move { server.session(stream, peer, cancel).await });
                    }
                    Err(e) => warn!(error = %e, "modbus accept failed"),
                },
            }
        }
        info!("modbus server stopped");
    }

    async fn session(&self, mut stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        let mut updates = self.store.subscribe();
        let epoch = updates.borrow_and_update().epoch;
        let _ = stream.set_nodelay(true);

        debug!(%peer, epoch, "modbus session opened");
        self.events.publish(GatewayEvent::SessionOpened {
            protocol: SessionProtocol::Modbus,
            peer: peer.to_string(),
            epoch,
            at: Utc::now(),
        });

        let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];

        let reason = 'session: loop {
            tokio::select! {
                _ = cancel.cancelled() => break 'session "shutdown",
                changed = updates.changed() => {
                    if changed.is_err() {
                        break 'session "shutdown";
                    }
                    if updates.borrow_and_update().epoch != epoch {
                        break 'session "topology reloaded";
                    }
                }
                read = stream.read(&mut chunk) => {
                    let n = match read {
                        Ok(0) => break 'session "peer closed",
                        Ok(n) => n,
                        Err(e) => {
                            debug!(%peer, error = %e, "modbus read failed");
                            break 'session "io error";
                        }
                    };
                    buf.extend_from_slice(&chunk[..n]);

                    loop {
                        let (header, len) = match split_frame(&buf) {
                            Ok(Some(frame)) => frame,
                            Ok(None) => break,
                            Err(e) => {
                                warn!(%peer, error = %e, "unframeable modbus request");
                                break 'session "unframeable request";
                            }
                        };
                        let pdu = &buf[MBAP_HEADER_LEN..len];
                        let function = pdu.first().copied().unwrap_or_default();
                        let response = match decode_request(pdu) {
                            Ok(request) => self.handle(&self.store.current(), request),
                            Err(code) => Response::Exception { function, code },
                        };
                        let reply = encode_response(&header, &response);
                        buf.drain(..len);

                        if let Err(e) = stream.write_all(&reply).await {
                            debug!(%peer, error = %e, "modbus write failed");
                            break 'session "io error";
                        }
                    }
                }
            }
        };

        debug!(%peer, reason, "modbus session closed");
        self.events.publish(GatewayEvent::SessionClosed {
            protocol: SessionProtocol::Modbus,
            peer: peer.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
    }

    /// Answer one decoded request from `snapshot`
    pub fn handle(&self, snapshot: &Snapshot, request: Request) -> Response {
        let function = request.function();
        match self.dispatch(snapshot, request) {
            Ok(response) => response,
            Err(code) => Response::Exception {
                function: function as u8,
                code,
            },
        }
    }

    fn dispatch(&self, snapshot: &Snapshot, request: Request) -> Result<Response, ExceptionCode> {
        let map = &snapshot.map;
        let image = &snapshot.image;
        let function = request.function();

        match request {
            Request::ReadCoils { address, quantity }
            | Request::ReadDiscreteInputs { address, quantity } => {
                let range = table_range(address, quantity, COIL_TABLE_SIZE)?;
                let values = range
                    .map(|addr| map.coil(addr).and_then(|e| image.binary(e)).unwrap_or(false))
                    .collect();
                Ok(Response::Bits { function, values })
            }
            Request::ReadHoldingRegisters { address, quantity }
            | Request::ReadInputRegisters { address, quantity } => {
                let range = table_range(address, quantity, REGISTER_TABLE_SIZE)?;
                let values = range
                    .map(|addr| {
                        map.register(addr)
                            .and_then(|e| image.register(map, e))
                            .unwrap_or(0)
                    })
                    .collect();
                Ok(Response::Registers { function, values })
            }
            Request::WriteSingleCoil { address, value } => {
                let entry = writable(address, map.coil(address).and_then(|e| map.entry(e)))?;
                let command = entry.binary_command(value).map_err(|e| ExceptionCode::from(&e))?;
                self.submit(command)?;
                Ok(Response::WriteSingle {
                    function,
                    address,
                    value: coil_word(value),
                })
            }
            Request::WriteSingleRegister { address, value } => {
                let entry = writable(address, map.register(address).and_then(|e| map.entry(e)))?;
                let command = entry
                    .analog_command(from_register(value, entry.scale))
                    .map_err(|e| ExceptionCode::from(&e))?;
                self.submit(command)?;
                Ok(Response::WriteSingle {
                    function,
                    address,
                    value,
                })
            }
            Request::WriteMultipleCoils { address, values } => {
                let quantity = values.len() as u16;
                table_range(address, quantity, COIL_TABLE_SIZE)?;
                let mut commands = Vec::with_capacity(values.len());
                for (offset, value) in values.into_iter().enumerate() {
                    let addr = address + offset as u16;
                    let entry = writable(addr, map.coil(addr).and_then(|e| map.entry(e)))?;
                    commands.push(entry.binary_command(value).map_err(|e| ExceptionCode::from(&e))?);
                }
                self.submit_all(commands)?;
                Ok(Response::WriteMultiple {
                    function,
                    address,
                    quantity,
                })
            }
            Request::WriteMultipleRegisters { address, values } => {
                let quantity = values.len() as u16;
                table_range(address, quantity, REGISTER_TABLE_SIZE)?;
                let mut commands = Vec::with_capacity(values.len());
                for (offset, raw) in values.into_iter().enumerate() {
                    let addr = address + offset as u16;
                    let entry = writable(addr, map.register(addr).and_then(|e| map.entry(e)))?;
                    commands.push(
                        entry
                            .analog_command(from_register(raw, entry.scale))
                            .map_err(|e| ExceptionCode::from(&e))?,
                    );
                }
                self.submit_all(commands)?;
                Ok(Response::WriteMultiple {
                    function,
                    address,
                    quantity,
                })
            }
        }
    }

    fn submit(&self, command: Command) -> Result<(), ExceptionCode> {
        self.router
            .submit(command, CommandOrigin::Modbus)
            .map(|_| ())
            .map_err(|e| ExceptionCode::from(&e))
    }

    /// Queue the whole write or none of it
    fn submit_all(&self, commands: Vec<Command>) -> Result<(), ExceptionCode> {
        self.router
            .submit_batch(commands, CommandOrigin::Modbus)
            .map(|_| ())
            .map_err(|e| ExceptionCode::from(&e))
    }
}

/// Addresses of a request, or IllegalDataAddress when it runs past the table
fn table_range(
    address: u16,
    quantity: u16,
    table_size: usize,
) -> Result<std::ops::Range<u16>, ExceptionCode> {
    let end = usize::from(address) + usize::from(quantity);
    if end > table_size {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(address..address + quantity)
}

fn writable(address: u16, entry: Option<&PointMapEntry>) -> Result<&PointMapEntry, ExceptionCode> {
    match entry {
        Some(entry) if entry.writable => Ok(entry),
        _ => {
            debug!(address, "write to unmapped or read-only modbus address");
            Err(ExceptionCode::IllegalDataAddress)
        }
    }
}
