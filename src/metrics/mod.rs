//! Prometheus metrics for MeterBridge
//!
//! Exposed through the exporter's own HTTP listener when enabled:
//! - Downstream read counts and latency per register class
//! - Gateway request outcomes
//! - Gateway retries

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::info;

use crate::config::MetricsConfig;
use crate::modbus::ReadError;
use crate::registers::RegisterClass;

/// Install the Prometheus recorder and start its HTTP listener.
///
/// Without this call every recording below is a no-op.
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("Invalid metrics address {}", config.listen))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| "Failed to install Prometheus exporter")?;

    info!("Prometheus metrics available at http://{}/metrics", addr);
    Ok(())
}

/// Metrics for one downstream register transaction
pub struct ReadMetrics {
    start: Instant,
    class: RegisterClass,
}

impl ReadMetrics {
    /// Start timing a register read
    pub fn start(class: RegisterClass) -> Self {
        Self {
            start: Instant::now(),
            class,
        }
    }

    /// Record successful read
    pub fn success(self) {
        self.finish("success");
    }

    /// Record failed read
    pub fn failure(self, error: &ReadError) {
        counter!(
            "meterbridge_downstream_errors_total",
            "class" => self.class.to_string(),
            "type" => error_type(error)
        )
        .increment(1);

        self.finish("error");
    }

    fn finish(self, status: &'static str) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            "meterbridge_downstream_reads_total",
            "class" => self.class.to_string(),
            "status" => status
        )
        .increment(1);

        histogram!(
            "meterbridge_downstream_read_duration_seconds",
            "class" => self.class.to_string()
        )
        .record(duration);
    }
}

fn error_type(error: &ReadError) -> &'static str {
    match error {
        ReadError::Exception(_) => "exception",
        ReadError::Transport(_) => "transport",
        ReadError::Timeout(_) => "timeout",
        ReadError::ShortResponse { .. } => "short_response",
        ReadError::Reconnect(_) => "reconnect",
    }
}

/// Record the final outcome of one gateway register request
pub fn record_gateway_request(success: bool) {
    counter!(
        "meterbridge_gateway_requests_total",
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}

/// Record a gateway read attempt that will be retried
pub fn record_gateway_retry() {
    counter!("meterbridge_gateway_retries_total").increment(1);
}
