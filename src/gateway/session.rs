//! Serialized access to the downstream link
//!
//! A single worker task owns the [`Transport`]. Gateway connections never touch
//! it directly: they queue `(unit id, address)` requests on a bounded channel
//! and wait for the answer on a oneshot. Only one downstream read can therefore
//! be in flight at any time, whatever the number of TCP clients.
//!
//! Requests are served in queue order, but nothing is promised about the order
//! in which separate clients see their responses.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::RetryConfig;
use crate::metrics;
use crate::modbus::{ReadError, Transport};

/// Words read downstream per gateway request, whatever the register's width
pub const GATEWAY_READ_WORDS: u16 = 2;

/// How often a failed downstream read is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first, at least 1
    pub attempts: u32,
    /// Pause between attempts; the link stays reserved meanwhile
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::ZERO,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            delay: Duration::from_millis(config.delay_ms),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway session closed")]
    SessionClosed,
    #[error("read failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: ReadError,
    },
}

struct ReadRequest {
    unit_id: u8,
    address: u16,
    reply: oneshot::Sender<Result<u16, GatewayError>>,
}

/// Cloneable entry point used by every gateway connection
#[derive(Clone)]
pub struct GatewayHandle {
    tx: mpsc::Sender<ReadRequest>,
}

impl GatewayHandle {
    /// Queue one input register read and wait for its first data word
    pub async fn read_input(&self, unit_id: u8, address: u16) -> Result<u16, GatewayError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(ReadRequest {
                unit_id,
                address,
                reply,
            })
            .await
            .map_err(|_| GatewayError::SessionClosed)?;

        response.await.map_err(|_| GatewayError::SessionClosed)?
    }
}

/// Owner of the downstream link in gateway mode
pub struct GatewaySession<T> {
    transport: T,
    unit_id: u8,
    policy: RetryPolicy,
}

impl<T: Transport + 'static> GatewaySession<T> {
    /// `unit_id` is the unit the transport currently addresses
    pub fn new(transport: T, unit_id: u8, policy: RetryPolicy) -> Self {
        Self {
            transport,
            unit_id,
            policy,
        }
    }

    /// Start the worker loop.
    ///
    /// The loop ends once every handle is dropped, giving the transport back.
    pub fn spawn(self, queue_depth: usize) -> (GatewayHandle, JoinHandle<T>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let worker = tokio::spawn(self.run(rx));
        (GatewayHandle { tx }, worker)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ReadRequest>) -> T {
        while let Some(request) = rx.recv().await {
            if request.reply.is_closed() {
                debug!(
                    unit_id = request.unit_id,
                    address = request.address,
                    "Client went away, skipping read"
                );
                continue;
            }

            let result = self.read_with_retry(request.unit_id, request.address).await;
            let _ = request.reply.send(result);
        }

        debug!("Gateway session stopped");
        self.transport
    }

    /// Read one register for `unit_id`, retrying up to the policy's limit
    /// without giving the link up between attempts.
    pub async fn read_with_retry(&mut self, unit_id: u8, address: u16) -> Result<u16, GatewayError> {
        if unit_id != self.unit_id {
            debug!(from = self.unit_id, to = unit_id, "Switching unit id");
            self.transport.set_unit_id(unit_id);
            self.unit_id = unit_id;
        }

        let attempts = self.policy.attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = self
                .transport
                .read_input(address, GATEWAY_READ_WORDS)
                .await
                .and_then(|raw| {
                    raw.first_word().ok_or(ReadError::ShortResponse {
                        expected: GATEWAY_READ_WORDS as usize,
                        received: 0,
                    })
                });

            match result {
                Ok(word) => {
                    metrics::record_gateway_request(true);
                    return Ok(word);
                }
                Err(e) if attempt < attempts => {
                    warn!(unit_id, address, attempt, "Read failed, retrying: {}", e);
                    metrics::record_gateway_retry();
                    if !self.policy.delay.is_zero() {
                        tokio::time::sleep(self.policy.delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    error!(unit_id, address, attempts, "Read failed: {}", e);
                    metrics::record_gateway_request(false);
                    return Err(GatewayError::Exhausted {
                        attempts,
                        source: e,
                    });
                }
            }
        }
    }
}
