//! Downstream Modbus link
//!
//! Supports both TCP and RTU connections. Exactly one physical connection is
//! open per process; everything above this module talks to it through the
//! [`Transport`] trait.

use async_trait::async_trait;
use std::time::Duration;
use tokio_modbus::client::Reader;
use tokio_modbus::slave::{Slave, SlaveContext};
use tokio_modbus::ExceptionCode;
use tracing::{debug, info};

use crate::config::{ConnectionTarget, TransportConfig};
use crate::metrics::ReadMetrics;
use crate::registers::RegisterClass;

pub mod client;
pub mod decode;
pub mod reader;

pub use decode::{decode, DecodedValue, RawRegisterValue};

/// Failure to establish the downstream connection
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("lookup error {host}: {source}")]
    Lookup {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect error {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serial error {device}: {source}")]
    Serial {
        device: String,
        #[source]
        source: tokio_serial::Error,
    },
}

impl ConnectError {
    /// Which startup phase failed
    pub fn phase(&self) -> &'static str {
        match self {
            ConnectError::Lookup { .. } => "lookup",
            ConnectError::Connect { .. } | ConnectError::Serial { .. } => "connect",
        }
    }
}

/// A single failed register transaction
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("Modbus exception: {0:?}")]
    Exception(ExceptionCode),
    #[error("Transport error: {0}")]
    Transport(#[from] tokio_modbus::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("short response: expected {expected} words, received {received}")]
    ShortResponse { expected: usize, received: usize },
    #[error("unable to reopen link: {0}")]
    Reconnect(#[from] ConnectError),
}

/// Operations the rest of the crate needs from the downstream link
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send {
    /// Address subsequent reads to another unit on the same link
    fn set_unit_id(&mut self, unit_id: u8);

    async fn read_holding(
        &mut self,
        address: u16,
        words: u16,
    ) -> Result<RawRegisterValue, ReadError>;

    async fn read_input(&mut self, address: u16, words: u16)
        -> Result<RawRegisterValue, ReadError>;
}

/// Modbus client over the single downstream connection.
///
/// A read that times out or fails at the transport level drops the
/// connection: RTU frames carry no transaction id, so a late reply would
/// otherwise be taken as the answer to the next request. The link is reopened
/// before the following read.
pub struct ModbusClient {
    context: Option<client::Context>,
    target: ConnectionTarget,
    unit_id: u8,
    config: TransportConfig,
    timeout: Duration,
}

impl ModbusClient {
    /// Connect to the target and address `unit_id`
    pub async fn connect(
        target: &ConnectionTarget,
        unit_id: u8,
        config: &TransportConfig,
    ) -> Result<Self, ConnectError> {
        let context = client::connect(target, Slave(unit_id), config.framing).await?;
        let timeout = match target {
            ConnectionTarget::Tcp { .. } => Duration::from_millis(config.tcp_timeout_ms),
            ConnectionTarget::Serial { .. } => Duration::from_millis(config.serial_timeout_ms),
        };

        Ok(Self {
            context: Some(context),
            target: target.clone(),
            unit_id,
            config: config.clone(),
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the link was dropped after a timeout and awaits reopening
    pub fn is_disconnected(&self) -> bool {
        self.context.is_none()
    }

    async fn context(&mut self) -> Result<&mut client::Context, ReadError> {
        match self.context {
            Some(ref mut context) => Ok(context),
            None => {
                info!("Reopening {} after timeout", self.target);
                let context =
                    client::connect(&self.target, Slave(self.unit_id), self.config.framing)
                        .await?;
                Ok(self.context.insert(context))
            }
        }
    }

    async fn read(
        &mut self,
        class: RegisterClass,
        address: u16,
        words: u16,
    ) -> Result<RawRegisterValue, ReadError> {
        debug!("Reading {} {} registers from address {}", words, class, address);

        let metrics = ReadMetrics::start(class);
        let timeout = self.timeout;
        let outcome = match self.context().await {
            Ok(context) => {
                let result = tokio::time::timeout(timeout, async {
                    match class {
                        RegisterClass::Holding => {
                            context.read_holding_registers(address, words).await
                        }
                        RegisterClass::Input => context.read_input_registers(address, words).await,
                    }
                })
                .await;

                match result {
                    Err(_) => Err(ReadError::Timeout(timeout)),
                    Ok(Err(e)) => Err(ReadError::Transport(e)),
                    Ok(Ok(Err(code))) => Err(ReadError::Exception(code)),
                    Ok(Ok(Ok(data))) if data.len() < words as usize => {
                        Err(ReadError::ShortResponse {
                            expected: words as usize,
                            received: data.len(),
                        })
                    }
                    Ok(Ok(Ok(data))) => Ok(RawRegisterValue::from_words(&data)),
                }
            }
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(_) => metrics.success(),
            Err(e) => {
                debug!("{} read at {} failed: {}", class, address, e);
                if matches!(e, ReadError::Timeout(_) | ReadError::Transport(_)) {
                    self.context = None;
                }
                metrics.failure(e);
            }
        }

        outcome
    }
}

#[async_trait]
impl Transport for ModbusClient {
    fn set_unit_id(&mut self, unit_id: u8) {
        self.unit_id = unit_id;
        if let Some(context) = self.context.as_mut() {
            context.set_slave(Slave(unit_id));
        }
    }

    async fn read_holding(
        &mut self,
        address: u16,
        words: u16,
    ) -> Result<RawRegisterValue, ReadError> {
        self.read(RegisterClass::Holding, address, words).await
    }

    async fn read_input(
        &mut self,
        address: u16,
        words: u16,
    ) -> Result<RawRegisterValue, ReadError> {
        self.read(RegisterClass::Input, address, words).await
    }
}
