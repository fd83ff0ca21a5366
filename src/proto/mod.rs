//! Framed wire protocol: envelope, payload records, codec.
//!
//! Every message is a fixed 32-byte big-endian header followed by a payload
//! of at most [`MAX_PAYLOAD_LEN`] bytes. The header carries a magic constant,
//! the message kind, a correlation id echoed by responses, and a crc32c
//! checksum over the header itself.

mod frame;
mod header;
mod payload;
mod types;

pub use frame::{FrameReader, FrameWriter};
pub use header::{FrameHeader, HEADER_LEN, MAGIC, MAX_PAYLOAD_LEN};
pub use payload::{
    AdminCommand, CompileOutcome, CompileRequest, ErrorInfo, FileUploadChunk, FileUploadStart,
    Hello, JobStatus, Origin, Payload, PayloadError, ServerStatsRecord, ADMIN_DATA_LEN, ARGS_LEN,
    CONTEXT_LEN, ERROR_MSG_LEN, FILENAME_LEN, NAME_LEN, PLATFORM_LEN, STATUS_MSG_LEN,
};
pub use types::{ErrorCode, ExecMode, JobState, Language, MessageKind};

use thiserror::Error;

/// Framing failures. All of them are fatal to the transport: the connection
/// is torn down without writing a response byte.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic: {got:#010x}")]
    BadMagic { got: u32 },
    #[error("header checksum mismatch: expected {expected:#010x} got {got:#010x}")]
    BadChecksum { expected: u32, got: u32 },
    #[error("payload too large: max {max} got {got}")]
    TooLarge { max: usize, got: usize },
    #[error("short read inside a frame")]
    ShortRead,
    #[error("unknown message kind: {0}")]
    UnknownKind(u16),
}

/// A complete message: envelope fields plus a typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub flags: u16,
    pub correlation_id: u32,
    pub timestamp_ms: u64,
    pub payload: Payload,
}

impl Message {
    pub fn new(kind: MessageKind, correlation_id: u32, payload: Payload) -> Self {
        Self {
            kind,
            flags: 0,
            correlation_id,
            timestamp_ms: now_ms(),
            payload,
        }
    }

    /// Serialize header and payload into one buffer.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.payload.encode();
        let header = FrameHeader {
            kind: self.kind,
            flags: self.flags,
            payload_len: body.len() as u32,
            correlation_id: self.correlation_id,
            timestamp_ms: self.timestamp_ms,
        };
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&body);
        out
    }

    /// Reassemble a message from a decoded header and its payload bytes.
    pub fn decode(
        header: FrameHeader,
        body: &[u8],
        origin: Origin,
    ) -> Result<Self, PayloadError> {
        let payload = Payload::decode(header.kind, origin, body)?;
        Ok(Self {
            kind: header.kind,
            flags: header.flags,
            correlation_id: header.correlation_id,
            timestamp_ms: header.timestamp_ms,
            payload,
        })
    }
}

/// Milliseconds since the unix epoch, for the informational header field.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
