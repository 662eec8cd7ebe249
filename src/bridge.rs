//! Main bridge orchestration

use anyhow::{Context, Result};
use std::io::Write;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::{Config, GatewayConfig};
use crate::gateway::{self, GatewaySession, RetryPolicy};
use crate::metrics;
use crate::modbus::reader::{self, SnapshotPlan};
use crate::modbus::{ConnectError, ModbusClient};
use crate::registers::{self, RegisterClass};

/// What the process does once the meter is connected
#[derive(Debug, Clone)]
pub enum Mode {
    /// Print the planned registers once and return
    OneShot(SnapshotPlan),
    /// Serve input registers to Modbus TCP clients until killed
    Gateway(GatewayConfig),
}

impl Mode {
    /// Pick the mode described by the configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        if let Some(gateway) = &config.gateway {
            return Ok(Mode::Gateway(gateway.clone()));
        }

        let input = registers::catalog(RegisterClass::Input);
        let subset = if config.registers.is_empty() {
            None
        } else {
            Some(registers::resolve_registers(input, &config.registers)?)
        };

        Ok(Mode::OneShot(SnapshotPlan::new(
            registers::catalog(RegisterClass::Holding),
            input,
            config.with_holding,
            subset,
        )))
    }
}

/// Main bridge that ties the meter connection to the selected mode
pub struct Bridge {
    config: Config,
    mode: Mode,
}

impl Bridge {
    /// Create a new bridge instance
    pub fn new(config: Config) -> Result<Self> {
        let mode = Mode::from_config(&config)?;
        Ok(Self { config, mode })
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Run the bridge
    pub async fn run(self) -> Result<()> {
        if self.config.metrics.enabled {
            metrics::init_metrics(&self.config.metrics)?;
        }

        let client = ModbusClient::connect(
            &self.config.destination,
            self.config.device_id,
            &self.config.transport,
        )
        .await
        .map_err(connect_failure)?;

        match self.mode {
            Mode::OneShot(plan) => {
                let mut client = client;
                let mut out = std::io::stdout();
                let count = reader::read_snapshot(&mut client, &plan, &mut out).await?;
                out.flush()?;
                info!("Read {} registers from {}", count, self.config.destination);
                Ok(())
            }
            Mode::Gateway(gateway) => {
                let addr = gateway.bind_addr().await?;
                let session = GatewaySession::new(
                    client,
                    self.config.device_id,
                    RetryPolicy::from(&self.config.retry),
                );

                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Failed to bind gateway on {}", addr))?;

                info!("server on {} for {}", addr, self.config.destination);
                gateway::run(listener, session, gateway.queue_depth).await
            }
        }
    }
}

fn connect_failure(err: ConnectError) -> anyhow::Error {
    let phase = err.phase();
    anyhow::Error::new(err).context(format!("unable to {}", phase))
}
