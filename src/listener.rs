//! Client-facing acceptors.
//!
//! - TCP: one session task per connection, capped at `max_sessions`;
//!   connections over the cap are refused.
//! - Serial: exactly one client on a serial line. The blocking port is bridged
//!   into an async stream so it runs through the same session loop. When the
//!   link drops the port is reopened after a short backoff.

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::printer::frame::ClientId;
use crate::session::{run_session, CloseReason, SessionContext};

/// Wait before reopening a serial client line.
const SERIAL_REOPEN_BACKOFF: Duration = Duration::from_secs(1);

/// Pause after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

const BRIDGE_BUFFER: usize = 4096;

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// Number of distinct two-digit client ids.
const CLIENT_ID_SPACE: u32 = 100;

/// Hands out client ids from a wrapping counter, skipping ids still held by
/// live sessions.
#[derive(Clone, Default)]
struct IdPool {
    state: Arc<Mutex<IdPoolState>>,
}

#[derive(Default)]
struct IdPoolState {
    next: u32,
    live: HashSet<ClientId>,
}

/// A client id reserved until the session drops it.
struct IdLease {
    id: ClientId,
    pool: IdPool,
}

impl IdPool {
    fn acquire(&self) -> Option<IdLease> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..CLIENT_ID_SPACE {
            state.next = state.next.wrapping_add(1);
            let id = ClientId::from_counter(state.next);
            if state.live.insert(id) {
                return Some(IdLease {
                    id,
                    pool: self.clone(),
                });
            }
        }
        None
    }
}

impl Drop for IdLease {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock().unwrap_or_else(|e| e.into_inner());
        state.live.remove(&self.id);
    }
}

/// Accept clients until `shutdown` fires, then wait for running sessions.
pub async fn serve_tcp(
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    max_sessions: usize,
    shutdown: CancellationToken,
) {
    let sessions = TaskTracker::new();
    let slots = Arc::new(Semaphore::new(max_sessions.max(1)));
    let ids = IdPool::default();

    if let Ok(addr) = listener.local_addr() {
        info!(%addr, max_sessions, "Listening for TCP clients");
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(e) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        let Ok(slot) = slots.clone().try_acquire_owned() else {
            warn!(%peer, max_sessions, "Session limit reached, refusing client");
            drop(stream);
            continue;
        };

        let Some(lease) = ids.acquire() else {
            warn!(%peer, "Every client id is in use, refusing client");
            drop(stream);
            continue;
        };
        let client_id = lease.id;
        let _ = stream.set_nodelay(true);
        info!(%peer, client_id = %client_id, "Client connected");

        let ctx = ctx.clone();
        let token = shutdown.clone();
        sessions.spawn(async move {
            let _slot = slot;
            let _lease = lease;
            run_session(stream, client_id, ctx, token).await
        });
    }

    sessions.close();
    if !sessions.is_empty() {
        info!(active = sessions.len(), "Waiting for client sessions to finish");
    }
    sessions.wait().await;
    info!("TCP listener stopped");
}

// ---------------------------------------------------------------------------
// Serial
// ---------------------------------------------------------------------------

/// Serve the single client on `port_name`, reopening the line whenever the
/// session ends, until `shutdown` fires.
pub async fn serve_serial(
    port_name: String,
    client_id: ClientId,
    ctx: Arc<SessionContext>,
    read_timeout: Duration,
    shutdown: CancellationToken,
) {
    info!(port = %port_name, client_id = %client_id, "Serving serial client");

    while !shutdown.is_cancelled() {
        let name = port_name.clone();
        let opened = tokio::task::spawn_blocking(move || {
            let port = crate::serial::open_port(&name, read_timeout)?;
            let reader = port.try_clone()?;
            Ok::<_, serialport::Error>((reader, port))
        })
        .await;

        match opened {
            Ok(Ok((reader, writer))) => {
                let link = SerialBridge::start(Box::new(reader), Box::new(writer));
                let outcome =
                    run_session(link.stream, client_id, ctx.clone(), shutdown.clone()).await;
                link.stop.cancel();
                join_bridge(link.threads).await;

                match outcome.reason {
                    CloseReason::Shutdown => break,
                    CloseReason::Failed(e) => {
                        warn!(port = %port_name, error = %e, "Serial session failed")
                    }
                    CloseReason::PeerClosed => info!(port = %port_name, "Serial link closed"),
                }
            }
            Ok(Err(e)) => warn!(port = %port_name, error = %e, "Cannot open serial client port"),
            Err(e) => warn!(port = %port_name, error = %e, "Serial open task failed"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(SERIAL_REOPEN_BACKOFF) => {}
        }
    }
    info!(port = %port_name, "Serial listener stopped");
}

async fn join_bridge(threads: Vec<JoinHandle<()>>) {
    let _ = tokio::task::spawn_blocking(move || {
        for t in threads {
            let _ = t.join();
        }
    })
    .await;
}

/// Two threads pumping bytes between a blocking serial handle and an
/// in-memory async stream.
pub struct SerialBridge {
    /// Session side of the link.
    pub stream: DuplexStream,
    /// Cancelled by either pump when the device side fails, or by the owner
    /// to stop both pumps.
    pub stop: CancellationToken,
    pub threads: Vec<JoinHandle<()>>,
}

impl SerialBridge {
    /// Must be called from within a tokio runtime.
    pub fn start(mut reader: Box<dyn Read + Send>, mut writer: Box<dyn Write + Send>) -> Self {
        let (session_side, bridge_side) = tokio::io::duplex(BRIDGE_BUFFER);
        let (mut from_session, mut to_session) = tokio::io::split(bridge_side);
        let stop = CancellationToken::new();
        let handle = Handle::current();
        let mut threads = Vec::with_capacity(2);

        let (rx_stop, rx_handle) = (stop.clone(), handle.clone());
        let rx = std::thread::Builder::new()
            .name("serial-rx".into())
            .spawn(move || {
                let mut buf = [0u8; 256];
                while !rx_stop.is_cancelled() {
                    match reader.read(&mut buf) {
                        Ok(0) => std::thread::sleep(Duration::from_millis(5)),
                        Ok(n) => {
                            debug!(bytes = n, "Serial client RX");
                            if rx_handle.block_on(to_session.write_all(&buf[..n])).is_err() {
                                break;
                            }
                        }
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::TimedOut
                                    | io::ErrorKind::WouldBlock
                                    | io::ErrorKind::Interrupted
                            ) => {}
                        Err(e) => {
                            warn!(error = %e, "Serial client read failed");
                            break;
                        }
                    }
                }
                rx_stop.cancel();
                let _ = rx_handle.block_on(to_session.shutdown());
            });

        let (tx_stop, tx_handle) = (stop.clone(), handle);
        let tx = std::thread::Builder::new()
            .name("serial-tx".into())
            .spawn(move || {
                let mut buf = [0u8; 256];
                loop {
                    let n = tx_handle.block_on(async {
                        tokio::select! {
                            _ = tx_stop.cancelled() => 0,
                            read = from_session.read(&mut buf) => read.unwrap_or(0),
                        }
                    });
                    if n == 0 {
                        break;
                    }
                    if let Err(e) = writer.write_all(&buf[..n]).and_then(|_| writer.flush()) {
                        warn!(error = %e, "Serial client write failed");
                        break;
                    }
                }
                tx_stop.cancel();
            });

        for spawned in [rx, tx] {
            match spawned {
                Ok(t) => threads.push(t),
                Err(e) => {
                    warn!(error = %e, "Cannot spawn serial bridge thread");
                    stop.cancel();
                }
            }
        }

        Self {
            stream: session_side,
            stop,
            threads,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
