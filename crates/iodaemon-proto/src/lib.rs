//! Wire format shared by `iodaemon spawn` and its link clients.
//!
//! A link connects to the daemon's Unix socket and receives a single one-byte
//! message carrying [`DESCRIPTOR_COUNT`] descriptors as `SCM_RIGHTS`:
//! stdout-read, stderr-read and status-read, in that order. Everything the
//! link sends afterwards on the same connection is a stream of envelopes.
//!
//! ## Envelope format
//!
//! ```text
//! [4-byte length][1-byte kind][payload]
//! ```
//!
//! - **length**: big-endian u32, size of (kind + payload)
//! - **kind**: u8 envelope kind
//! - **payload**: kind-specific binary data
//!
//! | Kind | Name        | Payload |
//! |------|-------------|---------|
//! | 0x01 | data        | raw stdin bytes |
//! | 0x02 | eof         | (empty) |
//! | 0x03 | window_size | `[2B columns][2B rows]` |
//! | 0x04 | signal      | `[4B signal number]` |
//!
//! ## Exit status
//!
//! The status descriptor yields one newline-terminated ASCII decimal once the
//! child terminates: the exit code, or the negated signal number when the
//! child died from an uncaught signal (`-9\n`).

/// Header size (4-byte length prefix).
pub const HEADER_SIZE: usize = 4;

/// Maximum envelope body size (1 MB).
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Minimum body size: kind (1).
pub const MIN_BODY_SIZE: usize = 1;

/// Descriptors handed to every link: stdout-read, stderr-read, status-read.
pub const DESCRIPTOR_COUNT: usize = 3;

/// Payload byte of the descriptor-carrying message.
pub const HANDOFF_BYTE: u8 = 0x00;

// Envelope kind constants.
pub const KIND_DATA: u8 = 0x01;
pub const KIND_EOF: u8 = 0x02;
pub const KIND_WINDOW_SIZE: u8 = 0x03;
pub const KIND_SIGNAL: u8 = 0x04;

/// Protocol error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    EnvelopeTooLarge(usize),
    EnvelopeTooSmall(usize),
    UnknownKind(u8),
    InvalidPayload(&'static str),
    InvalidStatus(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnvelopeTooLarge(size) => write!(f, "envelope too large: {size}"),
            Self::EnvelopeTooSmall(size) => write!(f, "envelope too small: {size}"),
            Self::UnknownKind(kind) => write!(f, "unknown envelope kind: {kind:#04x}"),
            Self::InvalidPayload(msg) => write!(f, "invalid payload: {msg}"),
            Self::InvalidStatus(line) => write!(f, "invalid exit status: {line:?}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Read a `u16` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u16_at(data: &[u8], offset: usize) -> Option<u16> {
    let bytes: [u8; 2] = data.get(offset..offset + 2)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

/// Read a `u32` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Control record sent from a link to the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Data(Vec<u8>),
    Eof,
    WindowSize { columns: u16, rows: u16 },
    Signal(i32),
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

impl Envelope {
    fn kind(&self) -> u8 {
        match self {
            Self::Data(_) => KIND_DATA,
            Self::Eof => KIND_EOF,
            Self::WindowSize { .. } => KIND_WINDOW_SIZE,
            Self::Signal(_) => KIND_SIGNAL,
        }
    }

    /// Encode as `[4-byte length][1-byte kind][payload]`.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload_len = match self {
            Self::Data(bytes) => bytes.len(),
            Self::Eof => 0,
            Self::WindowSize { .. } => 4,
            Self::Signal(_) => 4,
        };
        let body_len = MIN_BODY_SIZE + payload_len;
        if body_len > MAX_ENVELOPE_SIZE {
            return Err(ProtocolError::EnvelopeTooLarge(body_len));
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
        buf.extend_from_slice(&(body_len as u32).to_be_bytes());
        buf.push(self.kind());
        match self {
            Self::Data(bytes) => buf.extend_from_slice(bytes),
            Self::Eof => {}
            Self::WindowSize { columns, rows } => {
                buf.extend_from_slice(&columns.to_be_bytes());
                buf.extend_from_slice(&rows.to_be_bytes());
            }
            Self::Signal(signum) => buf.extend_from_slice(&signum.to_be_bytes()),
        }
        Ok(buf)
    }

    fn decode_body(kind: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        match kind {
            KIND_DATA => Ok(Self::Data(payload.to_vec())),
            KIND_EOF => Ok(Self::Eof),
            KIND_WINDOW_SIZE => {
                let columns = read_u16_at(payload, 0)
                    .ok_or(ProtocolError::InvalidPayload("window_size too short"))?;
                let rows = read_u16_at(payload, 2)
                    .ok_or(ProtocolError::InvalidPayload("window_size too short"))?;
                Ok(Self::WindowSize { columns, rows })
            }
            KIND_SIGNAL => {
                let signum = read_u32_at(payload, 0)
                    .ok_or(ProtocolError::InvalidPayload("signal too short"))?;
                Ok(Self::Signal(signum as i32))
            }
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Decoder (buffered, handles partial reads)
// ---------------------------------------------------------------------------

/// Buffered envelope decoder for streaming data.
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(16 * 1024),
        }
    }

    /// Feed data and extract complete envelopes.
    ///
    /// A framing error discards everything buffered so far; the connection
    /// cannot be resynchronised after it.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Envelope>, ProtocolError> {
        self.buf.extend_from_slice(data);
        let mut envelopes = Vec::new();
        let mut offset = 0;

        while offset + HEADER_SIZE <= self.buf.len() {
            let length = match read_u32_at(&self.buf, offset) {
                Some(v) => v as usize,
                None => break,
            };

            if length > MAX_ENVELOPE_SIZE {
                self.buf.clear();
                return Err(ProtocolError::EnvelopeTooLarge(length));
            }
            if length < MIN_BODY_SIZE {
                self.buf.clear();
                return Err(ProtocolError::EnvelopeTooSmall(length));
            }

            let total = HEADER_SIZE + length;
            if offset + total > self.buf.len() {
                break;
            }

            let Some(&kind) = self.buf.get(offset + HEADER_SIZE) else {
                break;
            };
            let payload = self
                .buf
                .get(offset + HEADER_SIZE + MIN_BODY_SIZE..offset + total)
                .unwrap_or_default();
            match Envelope::decode_body(kind, payload) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            }
            offset += total;
        }

        // Compact: remove consumed bytes once at the end
        if offset > 0 {
            self.buf.drain(..offset);
        }

        Ok(envelopes)
    }

    /// Bytes received but not yet forming a complete envelope.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Exit status
// ---------------------------------------------------------------------------

/// How the child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    /// Killed by an uncaught signal.
    Signaled(i32),
}

impl ExitStatus {
    /// Status line written to the status pipe, newline included.
    pub fn encode(self) -> String {
        match self {
            Self::Exited(code) => format!("{code}\n"),
            Self::Signaled(signum) => format!("-{signum}\n"),
        }
    }

    /// Parse a status line. The trailing newline is required.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidStatus(line.to_string());
        let digits = line.strip_suffix('\n').ok_or_else(invalid)?;
        let value: i32 = digits.trim_end_matches('\r').parse().map_err(|_| invalid())?;
        if value < 0 {
            Ok(Self::Signaled(-value))
        } else {
            Ok(Self::Exited(value))
        }
    }

    /// Shell-style exit code: the code itself, or 128 + signal.
    pub fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signum) => 128 + signum,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Signaled(signum) => write!(f, "killed by signal {signum}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_envelope_roundtrip() {
        let data = Envelope::Data(b"hello\n".to_vec()).encode().unwrap();
        let mut dec = Decoder::new();
        let envs = dec.decode(&data).unwrap();
        assert_eq!(envs, vec![Envelope::Data(b"hello\n".to_vec())]);
    }

    #[test]
    fn eof_is_header_plus_kind() {
        let data = Envelope::Eof.encode().unwrap();
        assert_eq!(data, vec![0, 0, 0, 1, KIND_EOF]);
    }

    #[test]
    fn window_size_layout() {
        let data = Envelope::WindowSize {
            columns: 80,
            rows: 24,
        }
        .encode()
        .unwrap();
        assert_eq!(data, vec![0, 0, 0, 5, KIND_WINDOW_SIZE, 0, 80, 0, 24]);
    }

    #[test]
    fn decoder_handles_partial_reads() {
        let data = Envelope::Signal(15).encode().unwrap();
        let mut dec = Decoder::new();

        let envs = dec.decode(&data[..3]).unwrap();
        assert!(envs.is_empty());
        let envs = dec.decode(&data[3..6]).unwrap();
        assert!(envs.is_empty());
        assert_eq!(dec.pending(), 6);

        let envs = dec.decode(&data[6..]).unwrap();
        assert_eq!(envs, vec![Envelope::Signal(15)]);
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn decoder_handles_multiple_envelopes() {
        let mut data = Envelope::Data(b"a".to_vec()).encode().unwrap();
        data.extend_from_slice(&Envelope::Data(b"b".to_vec()).encode().unwrap());
        data.extend_from_slice(&Envelope::Eof.encode().unwrap());

        let mut dec = Decoder::new();
        let envs = dec.decode(&data).unwrap();
        assert_eq!(
            envs,
            vec![
                Envelope::Data(b"a".to_vec()),
                Envelope::Data(b"b".to_vec()),
                Envelope::Eof,
            ]
        );
    }

    #[test]
    fn decoder_byte_by_byte() {
        let data = Envelope::WindowSize {
            columns: 120,
            rows: 40,
        }
        .encode()
        .unwrap();
        let mut dec = Decoder::new();

        for (i, &byte) in data.iter().enumerate() {
            let envs = dec.decode(&[byte]).unwrap();
            if i < data.len() - 1 {
                assert!(envs.is_empty());
            } else {
                assert_eq!(
                    envs,
                    vec![Envelope::WindowSize {
                        columns: 120,
                        rows: 40
                    }]
                );
            }
        }
    }

    #[test]
    fn decoder_rejects_too_large() {
        let bad = (2 * 1024 * 1024_u32).to_be_bytes();
        let mut dec = Decoder::new();
        let err = dec.decode(&bad).unwrap_err();
        assert!(matches!(err, ProtocolError::EnvelopeTooLarge(_)));
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn decoder_rejects_empty_body() {
        let bad = 0_u32.to_be_bytes();
        let mut dec = Decoder::new();
        let err = dec.decode(&bad).unwrap_err();
        assert_eq!(err, ProtocolError::EnvelopeTooSmall(0));
    }

    #[test]
    fn decoder_rejects_unknown_kind() {
        let mut dec = Decoder::new();
        let err = dec.decode(&[0, 0, 0, 1, 0x7f]).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownKind(0x7f));
    }

    #[test]
    fn decoder_rejects_short_window_size() {
        let mut dec = Decoder::new();
        let err = dec.decode(&[0, 0, 0, 3, KIND_WINDOW_SIZE, 0, 80]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload(_)));
    }

    #[test]
    fn oversized_data_is_rejected_on_encode() {
        let big = vec![0u8; MAX_ENVELOPE_SIZE];
        let err = Envelope::Data(big).encode().unwrap_err();
        assert!(matches!(err, ProtocolError::EnvelopeTooLarge(_)));
    }

    #[test]
    fn exit_status_lines() {
        assert_eq!(ExitStatus::Exited(42).encode(), "42\n");
        assert_eq!(ExitStatus::Signaled(9).encode(), "-9\n");
        assert_eq!(ExitStatus::parse("0\n").unwrap(), ExitStatus::Exited(0));
        assert_eq!(ExitStatus::parse("-15\n").unwrap(), ExitStatus::Signaled(15));
    }

    #[test]
    fn exit_status_rejects_malformed_lines() {
        assert!(ExitStatus::parse("").is_err());
        assert!(ExitStatus::parse("\n").is_err());
        assert!(ExitStatus::parse("42").is_err());
        assert!(ExitStatus::parse("abc\n").is_err());
    }

    #[test]
    fn signaled_code_is_shell_style() {
        assert_eq!(ExitStatus::Signaled(9).code(), 137);
        assert_eq!(ExitStatus::Exited(3).code(), 3);
    }
}
