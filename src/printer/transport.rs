//! Byte-level transports to the fiscal printer.
//!
//! Each transport performs one complete exchange: write a frame, then collect
//! the reply up to and including the first ETX. Transports are blocking and
//! are driven from the dispatcher's worker thread or blocking pool.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use serialport::{ClearBuffer, SerialPort};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::frame::{hex_dump, FrameError, ETX};

/// Read chunk size while collecting a reply.
const READ_CHUNK: usize = 256;

/// Socket read timeout while polling a TCP reply.
const TCP_POLL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("printer at {target} unreachable: {reason}")]
    Unreachable { target: String, reason: String },

    #[error("printer device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("printer I/O error: {0}")]
    Io(String),

    #[error("no reply from printer within {0:?}")]
    Timeout(Duration),

    #[error("printer closed the connection without replying")]
    NoReply,

    #[error("partial reply of {} bytes without ETX", .0.len())]
    PartialReply(Vec<u8>),

    #[error("malformed reply: {0}")]
    MalformedReply(#[from] FrameError),

    #[error("reply checksum mismatch (expected {expected:02X}, received {received})")]
    ChecksumMismatch { expected: u8, received: String },

    #[error("reply addressed to client {received}, expected {expected}")]
    ForeignReply { expected: String, received: String },

    #[error("printer dispatcher is shut down")]
    Closed,
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// One send-and-collect cycle against the printer.
pub trait PrinterTransport: Send {
    /// Write `frame` and return the reply bytes up to and including ETX.
    fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>, DispatchError>;

    /// Human-readable description of the connection target.
    fn description(&self) -> String;

    /// Release the underlying handle, if any.
    fn close(&mut self) {}
}

/// Device handle behind a [`SerialTransport`].
pub trait DeviceIo: Read + Write + Send {
    /// Drop whatever the device sent that nobody has read yet.
    fn discard_input(&mut self) -> io::Result<()>;
}

impl DeviceIo for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Opens (or reopens) the device handle behind a [`SerialTransport`].
pub type DeviceOpener = Box<dyn FnMut() -> Result<Box<dyn DeviceIo>, String> + Send>;

// ---------------------------------------------------------------------------
// Reply collection
// ---------------------------------------------------------------------------

/// Read from `reader` until an ETX arrives or `timeout` elapses.
///
/// Read timeouts and would-block results count as "no data yet". With
/// `eof_is_final` a zero-length read ends the exchange (sockets); otherwise it
/// is treated like a timeout (serial lines).
pub(crate) fn collect_reply<R: Read + ?Sized>(
    reader: &mut R,
    timeout: Duration,
    eof_is_final: bool,
) -> Result<Vec<u8>, DispatchError> {
    let deadline = Instant::now() + timeout;
    let mut reply = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        if let Some(end) = reply.iter().position(|&b| b == ETX) {
            reply.truncate(end + 1);
            return Ok(reply);
        }
        if Instant::now() >= deadline {
            break;
        }
        match reader.read(&mut chunk) {
            Ok(0) if eof_is_final => {
                return if reply.is_empty() {
                    Err(DispatchError::NoReply)
                } else {
                    warn!(bytes = reply.len(), "Printer closed mid-reply");
                    Err(DispatchError::PartialReply(reply))
                };
            }
            Ok(0) => std::thread::sleep(Duration::from_millis(5)),
            Ok(n) => reply.extend_from_slice(&chunk[..n]),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(DispatchError::Io(e.to_string())),
        }
    }

    if reply.is_empty() {
        Err(DispatchError::Timeout(timeout))
    } else {
        warn!(
            bytes = reply.len(),
            data = %hex_dump(&reply),
            "Printer reply timed out before ETX"
        );
        Err(DispatchError::PartialReply(reply))
    }
}

// ---------------------------------------------------------------------------
// Serial transport
// ---------------------------------------------------------------------------

/// Long-lived serial handle to the printer (9600-8N1).
pub struct SerialTransport {
    port_name: String,
    opener: DeviceOpener,
    port: Option<Box<dyn DeviceIo>>,
    response_timeout: Duration,
}

impl SerialTransport {
    /// Serial transport backed by a real port.
    pub fn new(port_name: &str, inter_byte: Duration, response_timeout: Duration) -> Self {
        let name = port_name.to_string();
        let opener: DeviceOpener = Box::new(move || {
            crate::serial::open_port(&name, inter_byte)
                .map(|port| Box::new(port) as Box<dyn DeviceIo>)
                .map_err(|e| e.to_string())
        });
        Self::with_opener(port_name, opener, response_timeout)
    }

    /// Serial transport with a custom handle factory.
    pub fn with_opener(port_name: &str, opener: DeviceOpener, response_timeout: Duration) -> Self {
        Self {
            port_name: port_name.to_string(),
            opener,
            port: None,
            response_timeout,
        }
    }

    /// Open the handle now instead of on first use.
    pub fn open(&mut self) -> Result<(), DispatchError> {
        info!(port = %self.port_name, "Opening printer serial port");
        match (self.opener)() {
            Ok(port) => {
                self.port = Some(port);
                info!(port = %self.port_name, "Printer serial port open");
                Ok(())
            }
            Err(e) => Err(DispatchError::DeviceUnavailable(format!(
                "{}: {e}",
                self.port_name
            ))),
        }
    }

    fn fail(&mut self, err: DispatchError) -> DispatchError {
        warn!(port = %self.port_name, error = %err, "Dropping printer serial handle");
        self.port = None;
        err
    }
}

impl PrinterTransport for SerialTransport {
    fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>, DispatchError> {
        if self.port.is_none() {
            warn!(port = %self.port_name, "Printer serial handle invalid, reopening");
            self.open()?;
        }
        let Some(port) = self.port.as_mut() else {
            return Err(DispatchError::DeviceUnavailable(self.port_name.clone()));
        };

        // A reply that arrived after an earlier exchange gave up belongs to
        // that exchange, not this one.
        if let Err(e) = port.discard_input() {
            return Err(self.fail(DispatchError::Io(format!("serial purge: {e}"))));
        }

        debug!(port = %self.port_name, bytes = frame.len(), data = %hex_dump(frame), "Serial TX");
        let written = port.write_all(frame).and_then(|_| port.flush());
        if let Err(e) = written {
            return Err(self.fail(DispatchError::Io(format!("serial write: {e}"))));
        }

        match collect_reply(&mut **port, self.response_timeout, false) {
            Ok(reply) => {
                debug!(port = %self.port_name, bytes = reply.len(), data = %hex_dump(&reply), "Serial RX");
                Ok(reply)
            }
            Err(e @ DispatchError::Io(_)) => Err(self.fail(e)),
            Err(e) => Err(e),
        }
    }

    fn description(&self) -> String {
        format!("Serial({}@9600)", self.port_name)
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!(port = %self.port_name, "Printer serial port closed");
        }
    }
}

// ---------------------------------------------------------------------------
// Network (TCP) transport
// ---------------------------------------------------------------------------

/// TCP transport opening a fresh connection for every exchange.
pub struct NetworkTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl NetworkTransport {
    pub fn new(host: &str, port: u16, connect_timeout: Duration, response_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            connect_timeout,
            response_timeout,
        }
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn unreachable(&self, reason: impl ToString) -> DispatchError {
        DispatchError::Unreachable {
            target: self.target(),
            reason: reason.to_string(),
        }
    }

    fn connect(&self) -> Result<TcpStream, DispatchError> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| self.unreachable(format!("resolve: {e}")))?
            .collect();

        let mut last_err = String::from("no addresses resolved");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let _ = stream.set_write_timeout(Some(self.connect_timeout));
                    return Ok(stream);
                }
                Err(e) => last_err = e.to_string(),
            }
        }
        Err(self.unreachable(last_err))
    }
}

impl PrinterTransport for NetworkTransport {
    fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>, DispatchError> {
        let mut stream = self.connect()?;
        debug!(target = %self.target(), bytes = frame.len(), data = %hex_dump(frame), "TCP TX");

        if let Err(e) = stream.write_all(frame).and_then(|_| stream.flush()) {
            return Err(self.unreachable(format!("write: {e}")));
        }
        if let Err(e) = stream.set_read_timeout(Some(TCP_POLL)) {
            return Err(self.unreachable(format!("set read timeout: {e}")));
        }

        let result = collect_reply(&mut stream, self.response_timeout, true);
        let _ = stream.shutdown(std::net::Shutdown::Both);

        if let Ok(reply) = &result {
            debug!(target = %self.target(), bytes = reply.len(), data = %hex_dump(reply), "TCP RX");
        }
        result
    }

    fn description(&self) -> String {
        format!("TCP({})", self.target())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
