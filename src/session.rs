//! Per-connection command session.
//!
//! Reads newline-terminated commands from a client stream, frames each one
//! for the printer, dispatches it and writes the reply back. The same loop
//! serves TCP clients and the serial client (bridged into an async stream).
//!
//! Local commands handled without touching the printer:
//! - `FEED`: pulse the paper-feed relay.
//! - `RESET`: clear the consecutive error count.
//!
//! After `max_consecutive_errors` gateway-side failures in a row the session
//! is blocked: every command except `RESET` is answered with `0003`.

use chrono::{DateTime, Utc};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::printer::frame::{self, hex_dump, ClientId, ACK, NAK};
use crate::printer::status::{self, CoreError, StatusPayload};
use crate::printer::PrinterDispatcher;
use crate::relay::Relay;

pub const FEED_COMMAND: &[u8] = b"FEED";
pub const RESET_COMMAND: &[u8] = b"RESET";

/// Plain-text answer to FEED when no relay board is usable.
pub const RELAY_UNAVAILABLE: &[u8] = b"ERRORE: Modulo rele non abilitato o non disponibile.\r\n";

const RESET_DONE: &str = "Reset completato";
const FEED_DONE: &str = "Avanzamento carta eseguito";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("client read failed: {0}")]
    Read(#[source] io::Error),

    #[error("client write failed: {0}")]
    Write(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Reading,
    Dispatching,
    Responding,
    Closed,
}

/// Ephemeral state of one client connection.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub client_id: ClientId,
    /// Log correlation only.
    pub session_id: Uuid,
    pub consecutive_errors: u32,
    pub last_command_at: Option<DateTime<Utc>>,
    pub state: SessionState,
}

impl ClientSession {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            session_id: Uuid::new_v4(),
            consecutive_errors: 0,
            last_command_at: None,
            state: SessionState::Reading,
        }
    }
}

#[derive(Debug)]
pub enum CloseReason {
    PeerClosed,
    Shutdown,
    Failed(SessionError),
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub session: ClientSession,
    pub reason: CloseReason,
}

/// Everything a session needs besides its stream. Shared by all sessions.
pub struct SessionContext {
    pub dispatcher: PrinterDispatcher,
    pub relay: Arc<dyn Relay>,
    pub pulse: Duration,
    pub buffer_size: usize,
    pub max_consecutive_errors: u32,
    pub sequence: u8,
}

impl SessionContext {
    pub fn new(config: &GatewayConfig, dispatcher: PrinterDispatcher, relay: Arc<dyn Relay>) -> Self {
        Self {
            dispatcher,
            relay,
            pulse: config
                .relay
                .as_ref()
                .map(|r| r.pulse())
                .unwrap_or(Duration::from_millis(200)),
            buffer_size: config.limits.session_buffer,
            max_consecutive_errors: config.limits.max_consecutive_errors,
            sequence: config.sequence_byte(),
        }
    }
}

// ---------------------------------------------------------------------------
// Command extraction
// ---------------------------------------------------------------------------

fn is_padding(b: u8) -> bool {
    matches!(b, b'\r' | b'\n' | b' ') || b == ACK || b == NAK
}

/// Strip CR, LF, ACK, NAK and spaces from both ends.
pub fn trim_command(raw: &[u8]) -> &[u8] {
    let start = raw.iter().position(|&b| !is_padding(b)).unwrap_or(raw.len());
    let end = raw.iter().rposition(|&b| !is_padding(b)).map_or(start, |i| i + 1);
    &raw[start..end]
}

/// Accumulates client bytes and splits them into commands on `\n`.
///
/// Bounded: a line that grows past `capacity` without a terminator is
/// dropped, along with the rest of it up to the next `\n`.
#[derive(Debug)]
pub struct CommandBuffer {
    buf: Vec<u8>,
    capacity: usize,
    discarding: bool,
}

impl CommandBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            discarding: false,
        }
    }

    /// Feed bytes in; returns the trimmed commands completed by them, in order.
    pub fn push(&mut self, mut data: &[u8]) -> Vec<Vec<u8>> {
        let mut commands = Vec::new();

        while !data.is_empty() {
            if self.discarding {
                match data.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        self.discarding = false;
                        data = &data[pos + 1..];
                        continue;
                    }
                    None => break,
                }
            }

            match data.iter().position(|&b| b == b'\n') {
                Some(pos) if self.buf.len() + pos <= self.capacity => {
                    self.buf.extend_from_slice(&data[..pos]);
                    commands.push(trim_command(&self.buf).to_vec());
                    self.buf.clear();
                    data = &data[pos + 1..];
                }
                Some(_) => self.overflow(),
                None if self.buf.len() + data.len() < self.capacity => {
                    self.buf.extend_from_slice(data);
                    break;
                }
                None => {
                    self.overflow();
                    break;
                }
            }
        }
        commands
    }

    fn overflow(&mut self) {
        warn!(
            capacity = self.capacity,
            "Command exceeds buffer without newline, discarding"
        );
        self.buf.clear();
        self.discarding = true;
    }
}

// ---------------------------------------------------------------------------
// Session loop
// ---------------------------------------------------------------------------

/// Serve one client until it disconnects, fails, or shutdown is signalled.
pub async fn run_session<S>(
    mut stream: S,
    client_id: ClientId,
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = ClientSession::new(client_id);
    info!(client_id = %client_id, session_id = %session.session_id, "Session opened");

    let mut commands = CommandBuffer::new(ctx.buffer_size);
    let mut chunk = vec![0u8; ctx.buffer_size.max(1)];

    let reason = 'session: loop {
        session.state = SessionState::Reading;
        let n = tokio::select! {
            _ = shutdown.cancelled() => break CloseReason::Shutdown,
            read = stream.read(&mut chunk) => match read {
                Ok(0) => break CloseReason::PeerClosed,
                Ok(n) => n,
                Err(e) => break CloseReason::Failed(SessionError::Read(e)),
            },
        };
        debug!(client_id = %client_id, bytes = n, "Client RX");

        for command in commands.push(&chunk[..n]) {
            if shutdown.is_cancelled() {
                break 'session CloseReason::Shutdown;
            }
            let reply = process_command(&mut session, &ctx, &command).await;
            if reply.is_empty() {
                continue;
            }

            session.state = SessionState::Responding;
            let written = match stream.write_all(&reply).await {
                Ok(()) => stream.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                break 'session CloseReason::Failed(SessionError::Write(e));
            }
            debug!(client_id = %client_id, bytes = reply.len(), "Client TX");
        }
    };

    session.state = SessionState::Closed;
    let _ = stream.shutdown().await;
    match &reason {
        CloseReason::Failed(e) => {
            warn!(client_id = %client_id, session_id = %session.session_id, error = %e, "Session closed on error")
        }
        other => {
            info!(client_id = %client_id, session_id = %session.session_id, reason = ?other, "Session closed")
        }
    }
    SessionOutcome { session, reason }
}

/// Handle one trimmed command and return the bytes to send back.
pub async fn process_command(
    session: &mut ClientSession,
    ctx: &SessionContext,
    command: &[u8],
) -> Vec<u8> {
    let id = session.client_id;
    session.last_command_at = Some(Utc::now());
    debug!(
        client_id = %id,
        command = %String::from_utf8_lossy(command),
        "Command received"
    );

    if command == RESET_COMMAND {
        if session.consecutive_errors > 0 {
            info!(client_id = %id, errors = session.consecutive_errors, "Session error count reset");
        }
        session.consecutive_errors = 0;
        return success_frame(id, RESET_DONE);
    }

    if session.consecutive_errors >= ctx.max_consecutive_errors {
        warn!(client_id = %id, errors = session.consecutive_errors, "Session blocked, command refused");
        return core_error_frame(id, CoreError::TooManyErrors);
    }

    if command == FEED_COMMAND {
        return feed(ctx, id).await;
    }

    if command.is_empty() {
        session.consecutive_errors += 1;
        return core_error_frame(id, CoreError::EmptyCommand);
    }

    let request = match frame::encode_with_sequence(id, command, ctx.sequence) {
        Ok(request) => request,
        Err(e) => {
            warn!(client_id = %id, error = %e, "Cannot frame command");
            session.consecutive_errors += 1;
            return core_error_frame(id, CoreError::FrameConstruction);
        }
    };

    session.state = SessionState::Dispatching;
    debug!(client_id = %id, data = %hex_dump(&request), "Printer request");
    match ctx.dispatcher.send(request).await {
        Ok(reply) => {
            session.consecutive_errors = 0;
            reply
        }
        Err(e) => {
            session.consecutive_errors += 1;
            warn!(
                client_id = %id,
                error = %e,
                errors = session.consecutive_errors,
                "Printer exchange failed"
            );
            core_error_frame(id, CoreError::DeviceCommunication)
        }
    }
}

async fn feed(ctx: &SessionContext, id: ClientId) -> Vec<u8> {
    if !ctx.relay.is_ready() {
        warn!(client_id = %id, "FEED requested but relay is not available");
        return RELAY_UNAVAILABLE.to_vec();
    }

    info!(client_id = %id, "FEED: pulsing paper-feed relay");
    let relay = ctx.relay.clone();
    let pulse = ctx.pulse;
    match tokio::task::spawn_blocking(move || relay.pulse(pulse)).await {
        Ok(Ok(())) => success_frame(id, FEED_DONE),
        Ok(Err(e)) => {
            warn!(client_id = %id, error = %e, "Relay pulse failed");
            RELAY_UNAVAILABLE.to_vec()
        }
        Err(e) => {
            error!(client_id = %id, error = %e, "Relay pulse task failed");
            RELAY_UNAVAILABLE.to_vec()
        }
    }
}

fn success_frame(id: ClientId, message: &str) -> Vec<u8> {
    StatusPayload::success(message)
        .and_then(|ok| status::encode_status(id, &ok))
        .unwrap_or_else(|e| {
            error!(client_id = %id, error = %e, "Cannot build status frame");
            Vec::new()
        })
}

fn core_error_frame(id: ClientId, err: CoreError) -> Vec<u8> {
    err.frame(id).unwrap_or_else(|e| {
        error!(client_id = %id, error = %e, "Cannot build error frame");
        Vec::new()
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
