//! Modbus TCP gateway
//!
//! Re-exposes the meter's input registers to any number of TCP clients. Each
//! requested register becomes one serialized downstream read of two words, and
//! the first word read is what the client receives.

use anyhow::Result;
use futures_util::future::BoxFuture;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_modbus::prelude::{ExceptionCode, Request, Response, SlaveRequest};
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};
use tracing::{debug, error, info};

pub mod session;

pub use session::{GatewayError, GatewayHandle, GatewaySession, RetryPolicy};

use crate::modbus::{ReadError, Transport};

/// Largest register count a single read request may ask for
pub const MAX_READ_REGISTERS: u16 = 125;

/// Per-connection Modbus service forwarding to the shared session
pub struct GatewayService {
    handle: GatewayHandle,
}

impl GatewayService {
    pub fn new(handle: GatewayHandle) -> Self {
        Self { handle }
    }
}

impl tokio_modbus::server::Service for GatewayService {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let handle = self.handle.clone();
        let unit_id = req.slave;

        Box::pin(async move {
            match req.request {
                Request::ReadInputRegisters(address, count) => {
                    debug!(unit_id, address, count, "Read input registers request");
                    read_input_registers(&handle, unit_id, address, count)
                        .await
                        .map(Response::ReadInputRegisters)
                }
                other => {
                    debug!("Unsupported function in request: {:?}", other);
                    Err(ExceptionCode::IllegalFunction)
                }
            }
        })
    }
}

/// Answer a read of `count` registers starting at `address`, one downstream
/// read per register.
pub async fn read_input_registers(
    handle: &GatewayHandle,
    unit_id: u8,
    address: u16,
    count: u16,
) -> Result<Vec<u16>, ExceptionCode> {
    if count == 0 || count > MAX_READ_REGISTERS {
        return Err(ExceptionCode::IllegalDataValue);
    }
    if address.checked_add(count - 1).is_none() {
        return Err(ExceptionCode::IllegalDataAddress);
    }

    let mut words = Vec::with_capacity(count as usize);
    for offset in 0..count {
        let word = handle
            .read_input(unit_id, address + offset)
            .await
            .map_err(|e| exception_for(&e))?;
        words.push(word);
    }

    Ok(words)
}

/// Modbus exception reported to the client for a failed gateway read
pub fn exception_for(error: &GatewayError) -> ExceptionCode {
    match error {
        GatewayError::SessionClosed => ExceptionCode::GatewayPathUnavailable,
        GatewayError::Exhausted { source, .. } => match source {
            ReadError::Exception(code) => *code,
            ReadError::Timeout(_) => ExceptionCode::GatewayTargetDevice,
            ReadError::Reconnect(_) => ExceptionCode::GatewayPathUnavailable,
            ReadError::Transport(_) | ReadError::ShortResponse { .. } => {
                ExceptionCode::ServerDeviceFailure
            }
        },
    }
}

/// Run `session` and serve its clients on `listener`.
///
/// Returns when either the listener or the session worker stops; a stopped
/// worker would otherwise leave clients answered with path-unavailable
/// exceptions forever.
pub async fn run<T: Transport + 'static>(
    listener: TcpListener,
    session: GatewaySession<T>,
    queue_depth: usize,
) -> Result<()> {
    let (handle, worker) = session.spawn(queue_depth);

    tokio::select! {
        result = serve(listener, handle) => result,
        joined = worker => {
            let err = match joined {
                Ok(_) => anyhow::anyhow!("gateway session stopped"),
                Err(e) => anyhow::Error::new(e).context("gateway session failed"),
            };
            error!("{:#}", err);
            Err(err)
        }
    }
}

/// Accept gateway clients on `listener` until the listener fails
pub async fn serve(listener: TcpListener, handle: GatewayHandle) -> Result<()> {
    let server = Server::new(listener);

    let on_connected = move |stream: TcpStream, socket_addr: SocketAddr| {
        let handle = handle.clone();
        async move {
            accept_tcp_connection(stream, socket_addr, move |peer: SocketAddr| {
                debug!(%peer, "Gateway client connected");
                Ok(Some(GatewayService::new(handle.clone())))
            })
        }
    };
    let on_process_error = |err: std::io::Error| {
        error!("Gateway connection error: {}", err);
    };

    server.serve(&on_connected, on_process_error).await?;
    info!("Gateway listener stopped");
    Ok(())
}
