//! Gateway configuration.
//!
//! Built once at startup (JSON file and/or command-line flags), validated,
//! then shared read-only behind an `Arc`.
//!
//! ```json
//! {
//!   "listen":  { "tcp": { "bind": "0.0.0.0", "port": 9999 } },
//!   "printer": { "tcp": { "host": "10.0.70.11", "port": 3000 } },
//!   "relay":   { "port_name": "COM9", "pulse_ms": 200 },
//!   "timeouts": { "response_ms": 30000 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::printer::frame::ClientId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// Where client commands arrive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenEndpoint {
    Tcp {
        #[serde(default = "default_bind")]
        bind: String,
        #[serde(default = "default_listen_port")]
        port: u16,
    },
    /// A single client on a serial line.
    Serial {
        port_name: String,
        #[serde(default = "default_serial_client_id")]
        client_id: String,
    },
}

impl Default for ListenEndpoint {
    fn default() -> Self {
        ListenEndpoint::Tcp {
            bind: default_bind(),
            port: default_listen_port(),
        }
    }
}

/// The fiscal printer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrinterEndpoint {
    Tcp {
        host: String,
        #[serde(default = "default_printer_port")]
        port: u16,
    },
    /// Fixed 9600-8N1.
    Serial { port_name: String },
    Simulated,
}

impl Default for PrinterEndpoint {
    fn default() -> Self {
        PrinterEndpoint::Tcp {
            host: "10.0.70.11".into(),
            port: default_printer_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub port_name: String,
    #[serde(default = "default_pulse_ms")]
    pub pulse_ms: u64,
}

impl RelayConfig {
    pub fn pulse(&self) -> Duration {
        Duration::from_millis(self.pulse_ms)
    }
}

// ---------------------------------------------------------------------------
// Tunables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub connect_ms: u64,
    pub response_ms: u64,
    pub inter_byte_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            response_ms: 30_000,
            inter_byte_ms: 50,
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn response(&self) -> Duration {
        Duration::from_millis(self.response_ms)
    }

    pub fn inter_byte(&self) -> Duration {
        Duration::from_millis(self.inter_byte_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Concurrent TCP client sessions; extra connections are refused.
    pub max_sessions: usize,
    /// Concurrent exchanges with a TCP printer.
    pub max_device_connections: usize,
    /// Jobs queued for a serial printer.
    pub dispatch_queue: usize,
    /// Bytes a session buffers while waiting for a newline.
    pub session_buffer: usize,
    /// Errors in a row before a session is blocked until RESET.
    pub max_consecutive_errors: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            max_device_connections: 4,
            dispatch_queue: 32,
            session_buffer: 2048,
            max_consecutive_errors: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolOptions {
    /// Reject printer replies with a bad structure or checksum.
    pub strict_checksum: bool,
    /// Sequence digit put in every outgoing frame.
    pub sequence: char,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            strict_checksum: true,
            sequence: '1',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for the rolling daily log file. Console only when unset.
    pub log_dir: Option<PathBuf>,
    pub format: LogFormat,
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: ListenEndpoint,
    pub printer: PrinterEndpoint,
    pub relay: Option<RelayConfig>,
    pub timeouts: Timeouts,
    pub limits: Limits,
    pub protocol: ProtocolOptions,
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        match &self.listen {
            ListenEndpoint::Tcp { port: 0, .. } => return invalid("listen port must be non-zero".into()),
            ListenEndpoint::Serial { port_name, .. } if port_name.is_empty() => {
                return invalid("listen serial port name is empty".into())
            }
            ListenEndpoint::Serial { client_id, .. } => {
                if ClientId::new(client_id).is_err() {
                    return invalid(format!("serial client id {client_id:?} must be two characters"));
                }
            }
            ListenEndpoint::Tcp { .. } => {}
        }

        match &self.printer {
            PrinterEndpoint::Tcp { host, .. } if host.is_empty() => {
                return invalid("printer host is empty".into())
            }
            PrinterEndpoint::Tcp { port: 0, .. } => {
                return invalid("printer port must be non-zero".into())
            }
            PrinterEndpoint::Serial { port_name } if port_name.is_empty() => {
                return invalid("printer serial port name is empty".into())
            }
            _ => {}
        }

        if let Some(relay) = &self.relay {
            if relay.port_name.is_empty() {
                return invalid("relay port name is empty".into());
            }
            if relay.pulse_ms == 0 {
                return invalid("relay pulse_ms must be non-zero".into());
            }
        }

        let t = &self.timeouts;
        if t.connect_ms == 0 || t.response_ms == 0 || t.inter_byte_ms == 0 {
            return invalid("timeouts must be non-zero".into());
        }

        let l = &self.limits;
        if l.max_sessions == 0 || l.max_device_connections == 0 || l.dispatch_queue == 0 {
            return invalid("session and device limits must be non-zero".into());
        }
        if l.session_buffer < 16 {
            return invalid(format!("session_buffer {} is too small", l.session_buffer));
        }
        if l.max_consecutive_errors == 0 {
            return invalid("max_consecutive_errors must be at least 1".into());
        }

        if !self.protocol.sequence.is_ascii_digit() {
            return invalid(format!(
                "sequence {:?} must be a digit 0-9",
                self.protocol.sequence
            ));
        }
        Ok(())
    }

    /// Sequence digit as the byte placed on the wire.
    pub fn sequence_byte(&self) -> u8 {
        // validate() restricts the sequence to ASCII digits.
        u8::try_from(self.protocol.sequence).unwrap_or(b'1')
    }
}

fn default_bind() -> String {
    "0.0.0.0".into()
}

fn default_listen_port() -> u16 {
    9999
}

fn default_printer_port() -> u16 {
    3000
}

fn default_serial_client_id() -> String {
    "S1".into()
}

fn default_pulse_ms() -> u64 {
    200
}
