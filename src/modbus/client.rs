//! Downstream connection setup

use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_modbus::client::{rtu, tcp};
use tokio_modbus::slave::Slave;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt};
use tracing::info;

use super::ConnectError;
use crate::config::{ConnectionTarget, TcpFraming};

pub use tokio_modbus::client::Context;

/// Open the single downstream connection described by `target`
pub async fn connect(
    target: &ConnectionTarget,
    slave: Slave,
    framing: TcpFraming,
) -> Result<Context, ConnectError> {
    match target {
        ConnectionTarget::Tcp { host, port } => {
            let addr = resolve(host, *port).await?;

            info!(
                "Connecting to Modbus TCP: {} ({:?} framing, unit {})",
                addr, framing, slave.0
            );

            let stream = TcpStream::connect(addr)
                .await
                .map_err(|source| ConnectError::Connect {
                    target: addr.to_string(),
                    source,
                })?;

            Ok(match framing {
                TcpFraming::Rtu => rtu::attach_slave(stream, slave),
                TcpFraming::Tcp => tcp::attach_slave(stream, slave),
            })
        }
        ConnectionTarget::Serial { device, baud_rate } => {
            info!(
                "Opening Modbus RTU: {} @ {} baud (unit {})",
                device, baud_rate, slave.0
            );

            let serial_error = |source| ConnectError::Serial {
                device: device.clone(),
                source,
            };
            let port = tokio_serial::new(device.as_str(), *baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .stop_bits(tokio_serial::StopBits::One)
                .parity(tokio_serial::Parity::None)
                .open_native_async()
                .map_err(serial_error)?;
            // replies to reads abandoned on a previous handle
            port.clear(ClearBuffer::Input).map_err(serial_error)?;

            Ok(rtu::attach_slave(port, slave))
        }
    }
}

/// Resolve a host name to the first address returned
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConnectError> {
    let lookup_error = |source| ConnectError::Lookup {
        host: host.to_string(),
        source,
    };

    tokio::net::lookup_host((host, port))
        .await
        .map_err(lookup_error)?
        .next()
        .ok_or_else(|| lookup_error(io::Error::new(io::ErrorKind::NotFound, "no address found")))
}
