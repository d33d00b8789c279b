//! Printer dispatcher: the single gate between client sessions and the device.
//!
//! Two modes:
//! - **Exclusive**: one long-lived transport (serial line, simulator) owned by a
//!   dedicated worker thread. Sessions queue jobs over a channel, so frames
//!   from different sessions never interleave on the wire.
//! - **Per-call**: a fresh transport per exchange (TCP), run on the blocking
//!   pool and capped by a semaphore so the device is not flooded.
//!
//! A job whose caller has given up is skipped rather than sent.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info, warn};

use super::frame::{self, ChecksumStatus};
use super::simulator::SimulatedPrinter;
use super::transport::{DispatchError, NetworkTransport, PrinterTransport, SerialTransport};
use crate::config::{GatewayConfig, PrinterEndpoint};

/// Builds a transport for one exchange.
pub type TransportFactory = Arc<dyn Fn() -> Box<dyn PrinterTransport> + Send + Sync>;

type Reply = Result<Vec<u8>, DispatchError>;

struct Job {
    frame: Vec<u8>,
    reply: oneshot::Sender<Reply>,
}

#[derive(Clone)]
enum Gate {
    Exclusive(mpsc::Sender<Job>),
    PerCall {
        factory: TransportFactory,
        permits: Arc<Semaphore>,
    },
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Reject replies that fail decoding or checksum verification.
    pub strict_checksum: bool,
    /// Upper bound for one exchange; callers wait at most twice this.
    pub response_timeout: Duration,
    /// Queued jobs in exclusive mode.
    pub queue_depth: usize,
    /// Concurrent exchanges in per-call mode.
    pub max_in_flight: usize,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            strict_checksum: true,
            response_timeout: Duration::from_secs(30),
            queue_depth: 32,
            max_in_flight: 4,
        }
    }
}

/// Cloneable handle shared by every session.
#[derive(Clone)]
pub struct PrinterDispatcher {
    gate: Gate,
    options: DispatcherOptions,
    description: Arc<str>,
}

impl PrinterDispatcher {
    /// Serialize all exchanges through one owned transport on a worker thread.
    pub fn exclusive(
        mut transport: Box<dyn PrinterTransport>,
        options: DispatcherOptions,
    ) -> Result<Self, DispatchError> {
        let description: Arc<str> = transport.description().into();
        let (tx, mut rx) = mpsc::channel::<Job>(options.queue_depth.max(1));

        let name = description.clone();
        std::thread::Builder::new()
            .name("printer-gate".into())
            .spawn(move || {
                info!(printer = %name, "Printer gate started");
                while let Some(job) = rx.blocking_recv() {
                    if job.reply.is_closed() {
                        debug!("Skipping printer job abandoned by its session");
                        continue;
                    }
                    let result = transport.exchange(&job.frame);
                    let _ = job.reply.send(result);
                }
                transport.close();
                info!(printer = %name, "Printer gate stopped");
            })
            .map_err(|e| DispatchError::Io(format!("spawn printer gate: {e}")))?;

        Ok(Self {
            gate: Gate::Exclusive(tx),
            options,
            description,
        })
    }

    /// Run each exchange on its own transport, at most `max_in_flight` at once.
    pub fn per_call(factory: TransportFactory, options: DispatcherOptions) -> Self {
        let description: Arc<str> = factory().description().into();
        let permits = Arc::new(Semaphore::new(options.max_in_flight.max(1)));
        Self {
            gate: Gate::PerCall { factory, permits },
            options,
            description,
        }
    }

    /// Build the dispatcher for the configured printer endpoint. A serial
    /// printer is opened immediately so a missing port fails at startup.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, DispatchError> {
        let t = &config.timeouts;
        let options = DispatcherOptions {
            strict_checksum: config.protocol.strict_checksum,
            response_timeout: t.response(),
            queue_depth: config.limits.dispatch_queue,
            max_in_flight: config.limits.max_device_connections,
        };

        match &config.printer {
            PrinterEndpoint::Tcp { host, port } => {
                let (host, port) = (host.clone(), *port);
                let (connect, response) = (t.connect(), t.response());
                let factory: TransportFactory = Arc::new(move || {
                    Box::new(NetworkTransport::new(&host, port, connect, response))
                        as Box<dyn PrinterTransport>
                });
                Ok(Self::per_call(factory, options))
            }
            PrinterEndpoint::Serial { port_name } => {
                let mut serial = SerialTransport::new(port_name, t.inter_byte(), t.response());
                serial.open()?;
                Self::exclusive(Box::new(serial), options)
            }
            PrinterEndpoint::Simulated => {
                Self::exclusive(Box::new(SimulatedPrinter::new()), options)
            }
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Exchange one frame with the printer and return the raw reply.
    pub async fn send(&self, frame: Vec<u8>) -> Result<Vec<u8>, DispatchError> {
        let expected = frame::decode(&frame).ok().map(|f| f.client_id);
        let reply = match &self.gate {
            Gate::Exclusive(tx) => self.send_exclusive(tx, frame).await?,
            Gate::PerCall { factory, permits } => {
                let permit = permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| DispatchError::Closed)?;
                let factory = factory.clone();
                tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    factory().exchange(&frame)
                })
                .await
                .map_err(|e| DispatchError::Io(format!("printer task: {e}")))??
            }
        };

        if self.options.strict_checksum {
            validate_reply(&reply)?;
        }
        // The device echoes the requester's id; anything else answers someone else.
        if let (Some(expected), Ok(decoded)) = (expected, frame::decode(&reply)) {
            if decoded.client_id != expected {
                warn!(
                    printer = %self.description,
                    expected = expected.as_str(),
                    received = decoded.client_id.as_str(),
                    "Discarding reply addressed to another client"
                );
                return Err(DispatchError::ForeignReply {
                    expected: expected.as_str().to_string(),
                    received: decoded.client_id.as_str().to_string(),
                });
            }
        }
        Ok(reply)
    }

    async fn send_exclusive(
        &self,
        tx: &mpsc::Sender<Job>,
        frame: Vec<u8>,
    ) -> Result<Vec<u8>, DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Job {
            frame,
            reply: reply_tx,
        })
        .await
        .map_err(|_| DispatchError::Closed)?;

        let wait = self.options.response_timeout * 2;
        match tokio::time::timeout(wait, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DispatchError::Closed),
            Err(_) => {
                warn!(printer = %self.description, ?wait, "Gave up waiting for printer gate");
                Err(DispatchError::Timeout(wait))
            }
        }
    }
}

/// Structural and checksum check applied in strict mode.
pub fn validate_reply(reply: &[u8]) -> Result<(), DispatchError> {
    let decoded = frame::decode(reply)?;
    match decoded.verify_checksum() {
        ChecksumStatus::Valid => Ok(()),
        ChecksumStatus::Invalid { expected, received } => Err(DispatchError::ChecksumMismatch {
            expected,
            received: String::from_utf8_lossy(&received).into_owned(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
