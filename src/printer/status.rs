//! Status sub-protocol carried in the frame payload.
//!
//! Normal exchanges carry four pipe-separated fields: `TYPE|FAMILY|CODE|MESSAGE`.
//! Payloads that do not parse as a status are treated as opaque text.
//! There is no escaping for `|`, so messages must not contain one.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::frame::{self, ClientId, FrameError};

// ---------------------------------------------------------------------------
// Field types
// ---------------------------------------------------------------------------

/// `TYPE` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// 'O'
    Success,
    /// 'E'
    Error,
}

impl StatusKind {
    pub fn as_char(self) -> char {
        match self {
            StatusKind::Success => 'O',
            StatusKind::Error => 'E',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'O' => Some(StatusKind::Success),
            'E' => Some(StatusKind::Error),
            _ => None,
        }
    }
}

/// `FAMILY` field: error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    /// 'G'
    Generic,
    /// 'S' - the client must recover before continuing.
    Blocking,
    /// 'P' - paper/consumable exhausted.
    Paper,
    /// 'N' - used on success.
    None,
}

impl Family {
    pub fn as_char(self) -> char {
        match self {
            Family::Generic => 'G',
            Family::Blocking => 'S',
            Family::Paper => 'P',
            Family::None => 'N',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'G' => Some(Family::Generic),
            'S' => Some(Family::Blocking),
            'P' => Some(Family::Paper),
            'N' => Some(Family::None),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusError {
    #[error("status code {0:?} must be four decimal digits")]
    InvalidCode(String),

    #[error("status message may not contain '|'")]
    MessageContainsPipe,

    #[error("status payload of {0} bytes exceeds the frame limit")]
    MessageTooLong(usize),

    #[error(transparent)]
    Frame(FrameError),
}

impl From<FrameError> for StatusError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::PayloadTooLarge(len) => StatusError::MessageTooLong(len),
            other => StatusError::Frame(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Status payload
// ---------------------------------------------------------------------------

/// Parsed `TYPE|FAMILY|CODE|MESSAGE` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub kind: StatusKind,
    pub family: Family,
    pub code: String,
    pub message: String,
}

impl StatusPayload {
    pub fn new(
        kind: StatusKind,
        family: Family,
        code: &str,
        message: &str,
    ) -> Result<Self, StatusError> {
        if code.len() != 4 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(StatusError::InvalidCode(code.to_string()));
        }
        if message.contains('|') {
            return Err(StatusError::MessageContainsPipe);
        }
        Ok(Self {
            kind,
            family,
            code: code.to_string(),
            message: message.to_string(),
        })
    }

    /// `O|N|0000|<message>`
    pub fn success(message: &str) -> Result<Self, StatusError> {
        Self::new(StatusKind::Success, Family::None, "0000", message)
    }

    /// Parse a payload. `None` means the payload is raw text, not a status.
    pub fn parse(payload: &str) -> Option<Self> {
        let mut fields = payload.splitn(4, '|');
        let kind = single_char(fields.next()?).and_then(StatusKind::from_char)?;
        let family = single_char(fields.next()?).and_then(Family::from_char)?;
        let code = fields.next()?;
        let message = fields.next()?;
        if code.len() != 4 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            kind,
            family,
            code: code.to_string(),
            message: message.to_string(),
        })
    }

    pub fn is_error(&self) -> bool {
        self.kind == StatusKind::Error
    }

    /// Wire form of the payload.
    pub fn to_payload(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StatusPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.kind.as_char(),
            self.family.as_char(),
            self.code,
            self.message
        )
    }
}

fn single_char(field: &str) -> Option<char> {
    let mut chars = field.chars();
    let c = chars.next()?;
    chars.next().is_none().then_some(c)
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Format a status payload and frame it for `client_id`.
pub fn build_status(
    client_id: ClientId,
    kind: StatusKind,
    family: Family,
    code: &str,
    message: &str,
) -> Result<Vec<u8>, StatusError> {
    let status = StatusPayload::new(kind, family, code, message)?;
    encode_status(client_id, &status)
}

pub fn encode_status(client_id: ClientId, status: &StatusPayload) -> Result<Vec<u8>, StatusError> {
    Ok(frame::encode(client_id, status.to_payload().as_bytes())?)
}

// ---------------------------------------------------------------------------
// Canonical gateway errors
// ---------------------------------------------------------------------------

/// Errors the gateway itself reports to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    EmptyCommand,
    UnrecognizedCommand,
    TooManyErrors,
    DeviceCommunication,
    FrameConstruction,
}

impl CoreError {
    pub fn code(self) -> &'static str {
        match self {
            CoreError::EmptyCommand => "0001",
            CoreError::UnrecognizedCommand => "0002",
            CoreError::TooManyErrors => "0003",
            CoreError::DeviceCommunication => "0004",
            CoreError::FrameConstruction => "0005",
        }
    }

    pub fn family(self) -> Family {
        match self {
            CoreError::TooManyErrors | CoreError::DeviceCommunication => Family::Blocking,
            _ => Family::Generic,
        }
    }

    /// Message text as existing clients expect it on the wire.
    pub fn message(self) -> &'static str {
        match self {
            CoreError::EmptyCommand => "Comando vuoto",
            CoreError::UnrecognizedCommand => "Comando non riconosciuto",
            CoreError::TooManyErrors => "Troppi errori consecutivi",
            CoreError::DeviceCommunication => "Errore comunicazione con stampante",
            CoreError::FrameConstruction => "Errore costruzione pacchetto interno",
        }
    }

    pub fn status(self) -> StatusPayload {
        StatusPayload {
            kind: StatusKind::Error,
            family: self.family(),
            code: self.code().to_string(),
            message: self.message().to_string(),
        }
    }

    pub fn frame(self, client_id: ClientId) -> Result<Vec<u8>, StatusError> {
        encode_status(client_id, &self.status())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
