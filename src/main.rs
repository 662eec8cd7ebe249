//! MeterBridge - SDM72D meter reader and Modbus TCP gateway
//!
//! Prints the meter's registers once, or bridges Modbus TCP clients onto the
//! meter's single serial/TCP link.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use meterbridge::bridge::Bridge;
use meterbridge::config::{self, Config, ConnectionTarget, GatewayConfig, TcpFraming};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Read from the device with this unit id [default: 1]
    #[arg(short = 'i', long = "device-id", value_name = "DEVICEID")]
    device_id: Option<u8>,

    /// Read the given input register (id or name) instead of all; repeatable
    #[arg(short = 'r', long = "register", value_name = "REGISTER")]
    registers: Vec<String>,

    /// Read all holding registers as well
    #[arg(short = 'a', long = "all")]
    with_holding: bool,

    /// Start a Modbus TCP gateway on [addr:]port
    #[arg(short = 's', long = "serve", value_name = "[ADDR:]PORT")]
    serve: Option<GatewayConfig>,

    /// YAML config file; command line flags take precedence
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Framing used when the destination is a TCP host
    #[arg(long, value_enum)]
    framing: Option<TcpFraming>,

    /// Serve Prometheus metrics on this address
    #[arg(long, value_name = "ADDR:PORT")]
    metrics: Option<SocketAddr>,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,

    /// Serial device with optional baud (/dev/ttyUSB1:19200) or host with
    /// optional port (modbusserver:1502) [default: 127.0.0.1]
    destination: Option<ConnectionTarget>,
}

impl Cli {
    /// Layer the command line over the file configuration
    fn apply(self, mut config: Config) -> Config {
        if let Some(destination) = self.destination {
            config.destination = destination;
        }
        if let Some(device_id) = self.device_id {
            config.device_id = device_id;
        }
        if !self.registers.is_empty() {
            config.registers = self.registers;
        }
        if self.with_holding {
            config.with_holding = true;
        }
        if let Some(serve) = self.serve {
            config.gateway = Some(serve);
        }
        if let Some(framing) = self.framing {
            config.transport.framing = framing;
        }
        if let Some(addr) = self.metrics {
            config.metrics.enabled = true;
            config.metrics.listen = addr.to_string();
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let file_config = config::load_config(cli.config.as_deref())?;
    let config = cli.apply(file_config);
    debug!("Effective configuration: {:?}", config);

    info!("Starting MeterBridge v{}", env!("CARGO_PKG_VERSION"));

    let bridge = Bridge::new(config)?;
    bridge.run().await
}

/// Level used when `RUST_LOG` is not set
fn default_level(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(verbose)));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(verbose)
        .with_line_number(verbose)
        .init();
}
