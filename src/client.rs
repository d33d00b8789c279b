//! Command-issuing client for the gateway.
//!
//! Handshake per command:
//! 1. send the command line;
//! 2. read one unit: a lone ACK means the frame follows, a lone NAK means the
//!    command was rejected, an STX means the frame is already here;
//! 3. check the frame and answer with a single ACK (accepted) or NAK.
//!
//! Reads are retried every `retry_delay` up to `max_retries` times before the
//! command is reported as unanswered.

use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::printer::frame::{
    self, hex_dump, ChecksumStatus, FrameError, ACK, ETX, FRAME_OVERHEAD, MAX_PAYLOAD_LEN, NAK,
    STX,
};
use crate::printer::status::StatusPayload;

/// Largest frame the gateway can legally send.
const MAX_FRAME_LEN: usize = FRAME_OVERHEAD + MAX_PAYLOAD_LEN;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot connect to gateway {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("gateway I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("command rejected by gateway (NAK)")]
    Rejected,

    #[error("no reply from gateway after {attempts} attempts")]
    NoReply { attempts: u32 },

    #[error("gateway closed the connection")]
    Closed,

    #[error("malformed frame: {0}")]
    Malformed(#[from] FrameError),

    #[error("frame checksum mismatch (expected {expected:02X})")]
    ChecksumMismatch { expected: u8 },

    #[error("no ETX within {0} bytes")]
    FrameTooLong(usize),

    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    /// Whether the connection is still usable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. }
                | ClientError::Io(_)
                | ClientError::Closed
                | ClientError::Cancelled
        )
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub retry_delay: Duration,
    pub max_retries: u32,
    /// Verify structure and checksum before acknowledging a frame.
    pub strict_checksum: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(250),
            max_retries: 180,
            strict_checksum: true,
        }
    }
}

/// What the gateway answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientReply {
    /// An acknowledged frame.
    Frame {
        bytes: Vec<u8>,
        payload: String,
        /// `None` when the payload is raw text.
        status: Option<StatusPayload>,
    },
    /// Unframed text, e.g. the FEED refusal.
    Text(String),
}

/// Outcome of [`GatewayClient::send_batch`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub sent: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct GatewayClient<S = TcpStream> {
    stream: S,
    options: ClientOptions,
    shutdown: CancellationToken,
    /// Bytes read past the end of the last frame.
    pending: Vec<u8>,
}

impl GatewayClient<TcpStream> {
    pub async fn connect(
        host: &str,
        port: u16,
        options: ClientOptions,
        shutdown: CancellationToken,
    ) -> Result<Self, ClientError> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        info!(%addr, "Connected to gateway");
        Ok(Self::new(stream, options, shutdown))
    }
}

impl<S> GatewayClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, options: ClientOptions, shutdown: CancellationToken) -> Self {
        Self {
            stream,
            options,
            shutdown,
            pending: Vec::new(),
        }
    }

    /// Send one command and run the ACK/NAK handshake for its reply.
    pub async fn send_command(&mut self, command: &str) -> Result<ClientReply, ClientError> {
        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\n');
        self.stream.write_all(&line).await?;
        self.stream.flush().await?;
        debug!(command, "Command sent");

        let mut unit = self.read_unit().await?;
        if unit.as_slice() == [ACK] {
            debug!("Gateway acknowledged, waiting for frame");
            unit = self.read_unit().await?;
        } else if unit.as_slice() == [NAK] {
            warn!(command, "Gateway rejected command");
            return Err(ClientError::Rejected);
        }
        if unit.len() > 1 && unit[0] == ACK && unit[1] == STX {
            unit.remove(0);
        }

        if unit.first() != Some(&STX) {
            return Ok(ClientReply::Text(String::from_utf8_lossy(&unit).into_owned()));
        }

        while !unit.contains(&ETX) {
            if unit.len() >= MAX_FRAME_LEN {
                warn!(bytes = unit.len(), "Frame exceeds maximum length, sending NAK");
                self.write_control(NAK).await?;
                return Err(ClientError::FrameTooLong(unit.len()));
            }
            let more = self.read_unit().await?;
            unit.extend_from_slice(&more);
        }
        if let Some(end) = unit.iter().position(|&b| b == ETX) {
            self.pending = unit.split_off(end + 1);
        }
        self.accept_frame(unit).await
    }

    /// Send each command in turn. Stops early only when the link is lost.
    pub async fn send_batch<C: AsRef<str>>(&mut self, commands: &[C]) -> BatchReport {
        let mut report = BatchReport::default();
        for (i, command) in commands.iter().enumerate() {
            report.sent += 1;
            match self.send_command(command.as_ref()).await {
                Ok(reply) => {
                    let failed = matches!(
                        &reply,
                        ClientReply::Frame { status: Some(s), .. } if s.is_error()
                    ) || matches!(reply, ClientReply::Text(_));
                    if failed {
                        report.failed += 1;
                    } else {
                        report.succeeded += 1;
                    }
                    info!(batch = i + 1, ?reply, "Batch command answered");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(batch = i + 1, error = %e, "Batch command failed");
                    if e.is_fatal() {
                        break;
                    }
                }
            }
        }
        report
    }

    async fn accept_frame(&mut self, bytes: Vec<u8>) -> Result<ClientReply, ClientError> {
        debug!(data = %hex_dump(&bytes), "Frame received");
        let checked = if self.options.strict_checksum {
            frame::decode(&bytes)
                .map_err(ClientError::from)
                .and_then(|f| match f.verify_checksum() {
                    ChecksumStatus::Valid => Ok(f.payload),
                    ChecksumStatus::Invalid { expected, .. } => {
                        Err(ClientError::ChecksumMismatch { expected })
                    }
                })
        } else {
            frame::extract_payload(&bytes)
                .map(<[u8]>::to_vec)
                .map_err(ClientError::from)
        };

        match checked {
            Ok(payload) => {
                self.write_control(ACK).await?;
                let payload = String::from_utf8_lossy(&payload).into_owned();
                let status = StatusPayload::parse(&payload);
                Ok(ClientReply::Frame {
                    bytes,
                    payload,
                    status,
                })
            }
            Err(e) => {
                warn!(error = %e, "Frame refused, sending NAK");
                self.write_control(NAK).await?;
                Err(e)
            }
        }
    }

    async fn write_control(&mut self, byte: u8) -> Result<(), ClientError> {
        self.stream.write_all(&[byte]).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// One read, retried on silence or would-block up to `max_retries` times.
    async fn read_unit(&mut self) -> Result<Vec<u8>, ClientError> {
        if !self.pending.is_empty() {
            return Ok(std::mem::take(&mut self.pending));
        }

        let mut buf = vec![0u8; 2048];
        let mut attempts = 0u32;
        loop {
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(ClientError::Cancelled),
                read = tokio::time::timeout(self.options.retry_delay, self.stream.read(&mut buf)) => read,
            };
            match read {
                Ok(Ok(0)) => return Err(ClientError::Closed),
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(self.options.retry_delay).await;
                }
                Ok(Err(e)) => return Err(ClientError::Io(e)),
                Err(_elapsed) => {}
            }
            attempts += 1;
            if attempts >= self.options.max_retries {
                return Err(ClientError::NoReply { attempts });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::printer::frame::ClientId;
    use tokio::io::{duplex, DuplexStream};

    fn quick() -> ClientOptions {
        ClientOptions {
            retry_delay: Duration::from_millis(10),
            max_retries: 5,
            strict_checksum: true,
        }
    }

    fn ok_frame() -> Vec<u8> {
        frame::encode(ClientId::new("01").unwrap(), b"O|N|0000|Reset completato").unwrap()
    }

    fn pair(options: ClientOptions) -> (GatewayClient<DuplexStream>, DuplexStream, CancellationToken) {
        let (a, b) = duplex(4096);
        let token = CancellationToken::new();
        (GatewayClient::new(a, options, token.clone()), b, token)
    }

    async fn expect_line(gw: &mut DuplexStream, line: &[u8]) {
        let mut buf = vec![0u8; line.len()];
        gw.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, line);
    }

    async fn read_byte(gw: &mut DuplexStream) -> u8 {
        let mut b = [0u8; 1];
        gw.read_exact(&mut b).await.unwrap();
        b[0]
    }

    #[tokio::test]
    async fn test_frame_without_ack_is_accepted() {
        let (mut client, mut gw, _t) = pair(quick());
        let gateway = tokio::spawn(async move {
            expect_line(&mut gw, b"=K\n").await;
            gw.write_all(&ok_frame()).await.unwrap();
            read_byte(&mut gw).await
        });

        let reply = client.send_command("=K").await.unwrap();
        match reply {
            ClientReply::Frame { payload, status, .. } => {
                assert_eq!(payload, "O|N|0000|Reset completato");
                assert!(!status.unwrap().is_error());
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(gateway.await.unwrap(), ACK);
    }

    #[tokio::test]
    async fn test_ack_then_frame() {
        let (mut client, mut gw, _t) = pair(quick());
        let gateway = tokio::spawn(async move {
            expect_line(&mut gw, b"=K\n").await;
            gw.write_all(&[ACK]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            let f = ok_frame();
            let (a, b) = f.split_at(4);
            gw.write_all(a).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            gw.write_all(b).await.unwrap();
            read_byte(&mut gw).await
        });

        let reply = client.send_command("=K").await.unwrap();
        assert!(matches!(reply, ClientReply::Frame { .. }));
        assert_eq!(gateway.await.unwrap(), ACK);
    }

    #[tokio::test]
    async fn test_nak_rejects_command() {
        let (mut client, mut gw, _t) = pair(quick());
        tokio::spawn(async move {
            expect_line(&mut gw, b"X\n").await;
            gw.write_all(&[NAK]).await.unwrap();
            gw
        });
        assert!(matches!(
            client.send_command("X").await,
            Err(ClientError::Rejected)
        ));
    }

    #[tokio::test]
    async fn test_bad_checksum_is_answered_with_nak() {
        let (mut client, mut gw, _t) = pair(quick());
        let gateway = tokio::spawn(async move {
            expect_line(&mut gw, b"=K\n").await;
            let mut f = ok_frame();
            let n = f.len();
            f[n - 2] = if f[n - 2] == b'0' { b'1' } else { b'0' };
            gw.write_all(&f).await.unwrap();
            read_byte(&mut gw).await
        });

        assert!(matches!(
            client.send_command("=K").await,
            Err(ClientError::ChecksumMismatch { .. })
        ));
        assert_eq!(gateway.await.unwrap(), NAK);
    }

    #[tokio::test]
    async fn test_lenient_mode_accepts_bad_checksum() {
        let mut options = quick();
        options.strict_checksum = false;
        let (mut client, mut gw, _t) = pair(options);
        let gateway = tokio::spawn(async move {
            expect_line(&mut gw, b"=K\n").await;
            let mut f = ok_frame();
            let n = f.len();
            f[n - 2] = if f[n - 2] == b'0' { b'1' } else { b'0' };
            gw.write_all(&f).await.unwrap();
            read_byte(&mut gw).await
        });

        let reply = client.send_command("=K").await.unwrap();
        assert!(matches!(reply, ClientReply::Frame { ref payload, .. } if payload == "O|N|0000|Reset completato"));
        assert_eq!(gateway.await.unwrap(), ACK);
    }

    #[tokio::test]
    async fn test_plain_text_reply() {
        let (mut client, mut gw, _t) = pair(quick());
        tokio::spawn(async move {
            expect_line(&mut gw, b"FEED\n").await;
            gw.write_all(b"ERRORE: Modulo rele non abilitato o non disponibile.\r\n")
                .await
                .unwrap();
            gw
        });
        let reply = client.send_command("FEED").await.unwrap();
        assert!(matches!(reply, ClientReply::Text(t) if t.starts_with("ERRORE")));
    }

    #[tokio::test]
    async fn test_silence_gives_no_reply() {
        let (mut client, _gw, _t) = pair(quick());
        assert!(matches!(
            client.send_command("=K").await,
            Err(ClientError::NoReply { attempts: 5 })
        ));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let (mut client, _gw, token) = pair(ClientOptions {
            max_retries: 1000,
            ..quick()
        });
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        assert!(matches!(
            client.send_command("=K").await,
            Err(ClientError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_closed_gateway() {
        let (mut client, gw, _t) = pair(quick());
        drop(gw);
        let err = client.send_command("=K").await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_batch_counts_outcomes() {
        let (mut client, mut gw, _t) = pair(quick());
        tokio::spawn(async move {
            expect_line(&mut gw, b"=K\n").await;
            gw.write_all(&ok_frame()).await.unwrap();
            read_byte(&mut gw).await;
            expect_line(&mut gw, b"ZZ\n").await;
            let err = frame::encode(ClientId::new("01").unwrap(), b"E|G|0002|Comando non riconosciuto")
                .unwrap();
            gw.write_all(&err).await.unwrap();
            read_byte(&mut gw).await;
            gw
        });

        let report = client.send_batch(&["=K", "ZZ"]).await;
        assert_eq!(
            report,
            BatchReport {
                sent: 2,
                succeeded: 1,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_unterminated_frame_is_refused() {
        let (mut client, mut gw, _t) = pair(quick());
        let gateway = tokio::spawn(async move {
            expect_line(&mut gw, b"=K\n").await;
            let mut junk = vec![STX];
            junk.extend_from_slice(&[b'A'; 1100]);
            gw.write_all(&junk).await.unwrap();
            read_byte(&mut gw).await
        });

        let err = client.send_command("=K").await.unwrap_err();
        assert!(matches!(err, ClientError::FrameTooLong(n) if n >= MAX_FRAME_LEN));
        assert!(!err.is_fatal());
        assert_eq!(gateway.await.unwrap(), NAK);
    }
}
