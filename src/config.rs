//! Configuration management for MeterBridge

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "METERBRIDGE_CONFIG";
/// Config file looked up in the working directory when nothing else is given
pub const DEFAULT_CONFIG_FILE: &str = "meterbridge.yaml";

pub const DEFAULT_TCP_PORT: u16 = 502;
pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const MAX_BAUD_RATE: u32 = 115_200;

/// Invalid user-supplied settings
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid destination '{0}'")]
    InvalidDestination(String),
    #[error("invalid server address '{0}', expected [addr:]port")]
    InvalidBind(String),
    #[error("unknown input register '{0}'")]
    UnknownRegister(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Downstream meter connection
    pub destination: ConnectionTarget,
    /// Modbus unit id of the meter
    pub device_id: u8,
    /// Also read the holding registers in one-shot mode
    pub with_holding: bool,
    /// Input register filter (ids or names); empty reads the full catalog
    pub registers: Vec<String>,
    /// Run as a Modbus TCP gateway instead of reading once
    pub gateway: Option<GatewayConfig>,
    /// Downstream link tuning
    pub transport: TransportConfig,
    /// Gateway read retry policy
    pub retry: RetryConfig,
    /// Prometheus exporter
    pub metrics: MetricsConfig,
}

/// Where the meter is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConnectionTarget {
    Tcp { host: String, port: u16 },
    Serial { device: String, baud_rate: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listen address
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Pending requests allowed before clients are back-pressured
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

/// Framing used on a TCP downstream link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TcpFraming {
    /// RTU frames tunnelled over the TCP socket
    Rtu,
    /// Standard Modbus TCP (MBAP header)
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Response timeout for TCP targets
    pub tcp_timeout_ms: u64,
    /// Response timeout for serial targets
    pub serial_timeout_ms: u64,
    /// Framing for TCP targets
    pub framing: TcpFraming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per gateway read, including the first
    pub attempts: u32,
    /// Pause between attempts
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Start the Prometheus HTTP exporter
    pub enabled: bool,
    /// Exporter listen address
    pub listen: String,
}

fn default_queue_depth() -> usize {
    32
}

impl Default for Config {
    fn default() -> Self {
        Self {
            destination: ConnectionTarget::default(),
            device_id: 1,
            with_holding: false,
            registers: vec![],
            gateway: None,
            transport: TransportConfig::default(),
            retry: RetryConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ConnectionTarget {
    fn default() -> Self {
        ConnectionTarget::Tcp {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_TCP_PORT,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp_timeout_ms: 5000,
            serial_timeout_ms: 3000,
            framing: TcpFraming::Rtu,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 0,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "0.0.0.0:9100".to_string(),
        }
    }
}

impl FromStr for ConnectionTarget {
    type Err = ConfigError;

    /// `host[:port]` or `device[:baud]`; devices start with `/` or `COM`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidDestination(s.to_string());
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() > 2 || parts[0].is_empty() {
            return Err(invalid());
        }
        let suffix = parts.get(1);

        if s.starts_with('/') || s.starts_with("COM") {
            let baud_rate = match suffix {
                Some(b) => b
                    .parse::<u32>()
                    .ok()
                    .filter(|b| (1..=MAX_BAUD_RATE).contains(b))
                    .ok_or_else(invalid)?,
                None => DEFAULT_BAUD_RATE,
            };
            Ok(ConnectionTarget::Serial {
                device: parts[0].to_string(),
                baud_rate,
            })
        } else {
            let port = match suffix {
                Some(p) => p
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p > 0)
                    .ok_or_else(invalid)?,
                None => DEFAULT_TCP_PORT,
            };
            Ok(ConnectionTarget::Tcp {
                host: parts[0].to_string(),
                port,
            })
        }
    }
}

impl TryFrom<String> for ConnectionTarget {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConnectionTarget> for String {
    fn from(value: ConnectionTarget) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionTarget::Tcp { host, port } => write!(f, "{}:{}", host, port),
            ConnectionTarget::Serial { device, baud_rate } => write!(f, "{}:{}", device, baud_rate),
        }
    }
}

impl FromStr for GatewayConfig {
    type Err = ConfigError;

    /// `port` or `addr:port`; an empty addr listens on all interfaces
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidBind(s.to_string());
        let (host, port) = match s.split(':').collect::<Vec<_>>().as_slice() {
            [port] => ("0.0.0.0", *port),
            [host, port] => (if host.is_empty() { "0.0.0.0" } else { *host }, *port),
            _ => return Err(invalid()),
        };
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(invalid)?;

        Ok(GatewayConfig {
            host: host.to_string(),
            port,
            queue_depth: default_queue_depth(),
        })
    }
}

impl GatewayConfig {
    /// Socket address to bind; the host may be a name or an IP literal
    pub async fn bind_addr(&self) -> Result<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("Invalid gateway address {}:{}", self.host, self.port))?
            .next()
            .with_context(|| format!("No address found for gateway host {}", self.host))
    }
}

/// Resolve which config file to read: explicit path, then environment, then
/// the default file name. The flag is true when the path was asked for.
pub fn config_path(explicit: Option<&Path>) -> (PathBuf, bool) {
    if let Some(path) = explicit {
        return (path.to_path_buf(), true);
    }
    match std::env::var(CONFIG_ENV) {
        Ok(path) => (PathBuf::from(path), true),
        Err(_) => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    }
}

/// Load configuration from file or use defaults
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let (path, required) = config_path(explicit);

    if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        load_config_from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    } else if required {
        anyhow::bail!("Config file not found: {}", path.display())
    } else {
        tracing::debug!("Config file not found, using defaults");
        Ok(Config::default())
    }
}

/// Load configuration from a YAML string
pub fn load_config_from_str(yaml: &str) -> Result<Config> {
    serde_yaml::from_str(yaml).with_context(|| "Failed to parse config")
}
