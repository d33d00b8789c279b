//! Packet codec for the fiscal printer wire frame.
//!
//! Frame format (bit-exact):
//! `STX | ClientId(2) | Len(3, decimal) | 'N' | Payload(Len) | Seq(1) | CHK(2, hex) | ETX`
//!
//! The checksum is the XOR of every byte from the client id through the
//! sequence digit inclusive, rendered as two uppercase hex ASCII characters.
//! Decoding and checksum verification are separate steps: [`decode`] only
//! checks structure, [`Frame::verify_checksum`] is applied by callers that
//! enforce integrity (see `strict_checksum` in the gateway configuration).

use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;

/// Fixed protocol identifier carried after the length field.
pub const PROTOCOL_ID: u8 = b'N';

/// Largest payload the 3-digit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = 999;

/// Bytes surrounding the payload: STX + id(2) + len(3) + 'N' + seq + chk(2) + ETX.
pub const FRAME_OVERHEAD: usize = 11;

/// Bytes between STX and the payload (client id, length, protocol id).
pub const HEADER_LEN: usize = 6;

/// Bytes between the payload and ETX (sequence, checksum).
pub const TRAILER_LEN: usize = 3;

/// Sequence digit emitted by the gateway. The device protocol defines a
/// cyclic 0-9 counter but the installed printers have only ever been driven
/// with a fixed '1'.
pub const DEFAULT_SEQUENCE: u8 = b'1';

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Structural problems found while building or parsing a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the 999-byte frame limit")]
    PayloadTooLarge(usize),

    #[error("client id must be exactly two printable ASCII characters, got {0:?}")]
    InvalidClientId(String),

    #[error("sequence must be an ASCII digit, got 0x{0:02X}")]
    InvalidSequence(u8),

    #[error("no STX (0x02) found")]
    MissingStart,

    #[error("no ETX (0x03) found after STX")]
    MissingEnd,

    #[error("frame of {0} bytes is too short to hold a header and trailer")]
    Truncated(usize),

    #[error("length field {0:?} is not three decimal digits")]
    LengthFieldNotDigits(String),

    #[error("declared payload length {declared} does not match frame of {observed} bytes")]
    LengthMismatch { declared: usize, observed: usize },

    #[error("protocol id 0x{0:02X} is not 'N'")]
    BadProtocolId(u8),
}

// ---------------------------------------------------------------------------
// Client id
// ---------------------------------------------------------------------------

/// Two-character session identifier embedded in every frame (the "ADDS" field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId([u8; 2]);

impl ClientId {
    pub fn new(id: &str) -> Result<Self, FrameError> {
        match id.as_bytes() {
            [a, b] if a.is_ascii_graphic() && b.is_ascii_graphic() => Ok(Self([*a, *b])),
            _ => Err(FrameError::InvalidClientId(id.to_string())),
        }
    }

    /// Decimal id "00".."99" for the n-th accepted connection (wraps at 100).
    pub fn from_counter(n: u32) -> Self {
        let n = (n % 100) as u8;
        Self([b'0' + n / 10, b'0' + n % 10])
    }

    pub fn as_bytes(&self) -> &[u8; 2] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Constructors only admit ASCII.
        std::str::from_utf8(&self.0).unwrap_or("??")
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Decoded frame
// ---------------------------------------------------------------------------

/// A structurally valid frame. The checksum is kept as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub client_id: ClientId,
    pub payload: Vec<u8>,
    pub sequence: u8,
    pub checksum: [u8; 2],
}

/// Outcome of the explicit checksum verification step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumStatus {
    Valid,
    Invalid { expected: u8, received: [u8; 2] },
}

impl ChecksumStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, ChecksumStatus::Valid)
    }
}

impl Frame {
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Recompute the checksum over client id..sequence and compare it with
    /// the two hex characters that were received.
    pub fn verify_checksum(&self) -> ChecksumStatus {
        let expected = checksum_parts(&self.client_id, &self.payload, self.sequence);
        if hex_pair(expected) == self.checksum {
            ChecksumStatus::Valid
        } else {
            ChecksumStatus::Invalid {
                expected,
                received: self.checksum,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Checksum
// ---------------------------------------------------------------------------

/// XOR of all bytes in `data`.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}

fn checksum_parts(client_id: &ClientId, payload: &[u8], sequence: u8) -> u8 {
    // The length and protocol id are part of the covered range too.
    let len = length_field(payload.len());
    checksum(client_id.as_bytes()) ^ checksum(&len) ^ PROTOCOL_ID ^ checksum(payload) ^ sequence
}

fn length_field(len: usize) -> [u8; 3] {
    let len = len.min(MAX_PAYLOAD_LEN);
    [
        b'0' + (len / 100) as u8,
        b'0' + (len / 10 % 10) as u8,
        b'0' + (len % 10) as u8,
    ]
}

fn hex_pair(value: u8) -> [u8; 2] {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    [HEX[(value >> 4) as usize], HEX[(value & 0x0F) as usize]]
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Build a frame with the gateway's fixed sequence digit.
pub fn encode(client_id: ClientId, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    encode_with_sequence(client_id, payload, DEFAULT_SEQUENCE)
}

/// Build a frame with an explicit sequence digit ('0'..='9').
pub fn encode_with_sequence(
    client_id: ClientId,
    payload: &[u8],
    sequence: u8,
) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    if !sequence.is_ascii_digit() {
        return Err(FrameError::InvalidSequence(sequence));
    }

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    frame.push(STX);
    frame.extend_from_slice(client_id.as_bytes());
    frame.extend_from_slice(&length_field(payload.len()));
    frame.push(PROTOCOL_ID);
    frame.extend_from_slice(payload);
    frame.push(sequence);
    // Checksum covers everything assembled so far except STX.
    let chk = checksum(&frame[1..]);
    frame.extend_from_slice(&hex_pair(chk));
    frame.push(ETX);
    Ok(frame)
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Locate the first STX and the first ETX after it. Returns the inclusive
/// byte range of the candidate frame.
pub fn locate(bytes: &[u8]) -> Result<(usize, usize), FrameError> {
    let start = bytes
        .iter()
        .position(|&b| b == STX)
        .ok_or(FrameError::MissingStart)?;
    let end = bytes[start + 1..]
        .iter()
        .position(|&b| b == ETX)
        .map(|offset| start + 1 + offset)
        .ok_or(FrameError::MissingEnd)?;
    Ok((start, end))
}

/// Parse the first frame found in `bytes`. Checksum is not enforced here.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    let (start, end) = locate(bytes)?;
    let raw = &bytes[start..=end];
    let observed = raw.len();
    if observed < FRAME_OVERHEAD {
        return Err(FrameError::Truncated(observed));
    }

    let len_field = &raw[3..6];
    if !len_field.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::LengthFieldNotDigits(
            String::from_utf8_lossy(len_field).into_owned(),
        ));
    }
    if raw[6] != PROTOCOL_ID {
        return Err(FrameError::BadProtocolId(raw[6]));
    }

    let declared = len_field
        .iter()
        .fold(0usize, |acc, &d| acc * 10 + (d - b'0') as usize);
    if FRAME_OVERHEAD + declared != observed {
        return Err(FrameError::LengthMismatch { declared, observed });
    }

    let payload_start = 1 + HEADER_LEN;
    let payload_end = payload_start + declared;
    Ok(Frame {
        client_id: ClientId([raw[1], raw[2]]),
        payload: raw[payload_start..payload_end].to_vec(),
        sequence: raw[payload_end],
        checksum: [raw[payload_end + 1], raw[payload_end + 2]],
    })
}

/// Lenient payload extraction used by clients that do not enforce framing:
/// skip the fixed header after STX and the fixed trailer before ETX.
pub fn extract_payload(bytes: &[u8]) -> Result<&[u8], FrameError> {
    let (start, end) = locate(bytes)?;
    let payload_start = start + 1 + HEADER_LEN;
    let payload_end = end
        .checked_sub(TRAILER_LEN)
        .filter(|&e| e >= payload_start)
        .ok_or(FrameError::Truncated(end - start + 1))?;
    Ok(&bytes[payload_start..payload_end])
}

/// Render bytes as space-separated hex for debug logs.
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ClientId {
        ClientId::new(s).unwrap()
    }

    /// Checksum computed independently of the encoder.
    fn reference_checksum(frame: &[u8]) -> String {
        let covered = &frame[1..frame.len() - 3];
        let mut x = 0u8;
        for b in covered {
            x ^= b;
        }
        format!("{x:02X}")
    }

    #[test]
    fn test_encode_layout() {
        let frame = encode(id("01"), b"=K").unwrap();
        assert_eq!(frame[0], STX);
        assert_eq!(&frame[1..3], b"01");
        assert_eq!(&frame[3..6], b"002");
        assert_eq!(frame[6], b'N');
        assert_eq!(&frame[7..9], b"=K");
        assert_eq!(frame[9], b'1');
        assert_eq!(*frame.last().unwrap(), ETX);
        assert_eq!(frame.len(), FRAME_OVERHEAD + 2);
    }

    #[test]
    fn test_checksum_matches_independent_computation() {
        let frame = encode(id("01"), b"O|N|0000|Reset completato").unwrap();
        let chk = &frame[frame.len() - 3..frame.len() - 1];
        assert_eq!(chk, reference_checksum(&frame).as_bytes());
    }

    #[test]
    fn test_checksum_is_uppercase_hex() {
        for payload in [&b""[..], b"a", b"zzzz", b"\xff\xfe"] {
            let frame = encode(id("42"), payload).unwrap();
            let chk = &frame[frame.len() - 3..frame.len() - 1];
            assert!(chk
                .iter()
                .all(|c| c.is_ascii_digit() || (b'A'..=b'F').contains(c)));
        }
    }

    #[test]
    fn test_round_trip_payload_lengths() {
        for len in [0usize, 1, 2, 57, 500, 998, 999] {
            let payload: Vec<u8> = (0..len).map(|i| b'A' + (i % 26) as u8).collect();
            let frame = encode(id("07"), &payload).unwrap();
            assert_eq!(frame.len(), FRAME_OVERHEAD + len);
            let decoded = decode(&frame).unwrap();
            assert_eq!(decoded.payload, payload);
            assert_eq!(decoded.client_id, id("07"));
            assert!(decoded.verify_checksum().is_valid());
            assert_eq!(frame.len(), FRAME_OVERHEAD + payload.len());
        }
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![b'x'; 1000];
        assert_eq!(
            encode(id("01"), &payload),
            Err(FrameError::PayloadTooLarge(1000))
        );
    }

    #[test]
    fn test_encode_is_deterministic_and_sensitive() {
        let a = encode(id("01"), b"=R01/$100").unwrap();
        let b = encode(id("01"), b"=R01/$100").unwrap();
        assert_eq!(a, b);

        let other_id = encode(id("02"), b"=R01/$100").unwrap();
        let other_payload = encode(id("01"), b"=R01/$101").unwrap();
        let other_seq = encode_with_sequence(id("01"), b"=R01/$100", b'2').unwrap();
        let chk = |f: &[u8]| f[f.len() - 3..f.len() - 1].to_vec();
        assert_ne!(chk(&a), chk(&other_id));
        assert_ne!(chk(&a), chk(&other_payload));
        assert_ne!(chk(&a), chk(&other_seq));
    }

    #[test]
    fn test_invalid_sequence_rejected() {
        assert_eq!(
            encode_with_sequence(id("01"), b"x", b'A'),
            Err(FrameError::InvalidSequence(b'A'))
        );
    }

    #[test]
    fn test_client_id_validation() {
        assert!(ClientId::new("S1").is_ok());
        assert!(ClientId::new("1").is_err());
        assert!(ClientId::new("123").is_err());
        assert!(ClientId::new("0 ").is_err());
        assert_eq!(ClientId::from_counter(0).as_str(), "00");
        assert_eq!(ClientId::from_counter(7).as_str(), "07");
        assert_eq!(ClientId::from_counter(99).as_str(), "99");
        assert_eq!(ClientId::from_counter(100).as_str(), "00");
    }

    #[test]
    fn test_decode_missing_start() {
        assert_eq!(decode(b"0100 2N=K1AB\x03"), Err(FrameError::MissingStart));
    }

    #[test]
    fn test_decode_missing_end() {
        let mut frame = encode(id("01"), b"=K").unwrap();
        frame.pop();
        assert_eq!(decode(&frame), Err(FrameError::MissingEnd));
    }

    #[test]
    fn test_decode_length_not_digits() {
        let mut frame = encode(id("01"), b"=K").unwrap();
        frame[4] = b'x';
        assert!(matches!(
            decode(&frame),
            Err(FrameError::LengthFieldNotDigits(_))
        ));
    }

    #[test]
    fn test_decode_bad_protocol_id() {
        let mut frame = encode(id("01"), b"=K").unwrap();
        frame[6] = b'X';
        assert_eq!(decode(&frame), Err(FrameError::BadProtocolId(b'X')));
    }

    #[test]
    fn test_decode_length_mismatch() {
        let mut frame = encode(id("01"), b"=K").unwrap();
        frame[5] = b'5';
        assert_eq!(
            decode(&frame),
            Err(FrameError::LengthMismatch {
                declared: 5,
                observed: 13
            })
        );
    }

    #[test]
    fn test_decode_truncated() {
        assert_eq!(decode(b"\x0201\x03"), Err(FrameError::Truncated(4)));
    }

    #[test]
    fn test_checksum_mismatch_is_reported_not_rejected() {
        let mut frame = encode(id("01"), b"=K").unwrap();
        let n = frame.len();
        frame[n - 2] = if frame[n - 2] == b'0' { b'1' } else { b'0' };
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.payload, b"=K");
        assert!(!decoded.verify_checksum().is_valid());
    }

    #[test]
    fn test_decode_skips_leading_noise() {
        let mut bytes = vec![ACK, b' '];
        bytes.extend(encode(id("03"), b"hello").unwrap());
        bytes.extend_from_slice(b"trailing");
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn test_extract_payload_lenient() {
        let mut frame = encode(id("01"), b"O|N|0000|ok").unwrap();
        // Corrupt the length field: lenient extraction ignores it.
        frame[3] = b'?';
        assert_eq!(extract_payload(&frame).unwrap(), b"O|N|0000|ok");
        assert_eq!(extract_payload(b"\x02ab\x03"), Err(FrameError::Truncated(4)));
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0x02, 0x30, 0x03]), "02 30 03");
    }
}
