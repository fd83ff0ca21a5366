//! Payload records for every message kind.
//!
//! Records are fixed layouts: integers big-endian, strings NUL-padded to a
//! fixed width. A record followed by variable bytes (upload chunks, admin
//! text) consumes the remainder of the payload.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use super::{ErrorCode, ExecMode, JobState, Language, MessageKind};

pub const NAME_LEN: usize = 64;
pub const PLATFORM_LEN: usize = 32;
pub const FILENAME_LEN: usize = 256;
pub const ARGS_LEN: usize = 1024;
pub const ERROR_MSG_LEN: usize = 4096;
pub const CONTEXT_LEN: usize = 256;
pub const STATUS_MSG_LEN: usize = 256;
pub const ADMIN_DATA_LEN: usize = 512;

/// Payload shape errors. Unlike framing errors these are survivable: the
/// session answers with `Error{InvalidArgument}` and keeps the connection.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("{kind} payload truncated at {got} bytes")]
    Truncated { kind: &'static str, got: usize },
    #[error("invalid {field} value {value}")]
    InvalidField { field: &'static str, value: u32 },
    #[error("string field {field} is not valid utf-8")]
    BadUtf8 { field: &'static str },
}

/// Which side produced a message. Admin kinds reuse one kind number for the
/// command and its reply, so decoding needs to know the direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: (u16, u16, u16),
    pub capabilities: u16,
    pub name: String,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUploadStart {
    pub file_size: u64,
    pub chunk_count: u32,
    pub chunk_size: u32,
    pub filename: String,
    pub checksum: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUploadChunk {
    pub chunk_id: u32,
    pub chunk_size: u32,
    pub checksum: u32,
    pub data: Vec<u8>,
}

/// Language and mode stay raw on the wire; out-of-range values are a
/// session-level error, not a decode failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    pub language: u16,
    pub mode: u16,
    pub flags: u16,
    pub priority: u16,
    pub filename: String,
    pub compiler_args: String,
    pub execution_args: String,
}

impl CompileRequest {
    pub fn language(&self) -> Option<Language> {
        Language::from_u16(self.language)
    }

    pub fn mode(&self) -> Option<ExecMode> {
        ExecMode::from_u16(self.mode)
    }
}

/// Shared by `CompileResponse` and `ResultResponse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOutcome {
    pub job_id: u32,
    pub status: JobState,
    pub exit_code: i32,
    pub stdout_size: u32,
    pub stderr_size: u32,
    pub elapsed_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub job_id: u32,
    pub state: JobState,
    pub progress: u16,
    pub start_time: u64,
    pub end_time: u64,
    pub pid: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub line: u32,
    pub message: String,
    pub context: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            code,
            line: 0,
            message: message.into(),
            context: context.into(),
        }
    }
}

/// Request record for every admin kind. `target_id` addresses a client or
/// job (or holds the shutdown delay); bit 0 of `flags` means force.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdminCommand {
    pub flags: u16,
    pub target_id: u32,
    pub data: String,
}

impl AdminCommand {
    pub const FLAG_FORCE: u16 = 0x0001;

    pub fn force(&self) -> bool {
        self.flags & Self::FLAG_FORCE != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatsRecord {
    pub start_time: u64,
    pub current_time: u64,
    pub total_clients: u32,
    pub active_clients: u32,
    pub total_jobs: u32,
    pub active_jobs: u32,
    pub completed_jobs: u32,
    pub failed_jobs: u32,
    pub total_bytes_received: u64,
    pub total_bytes_sent: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Hello(Hello),
    FileUploadStart(FileUploadStart),
    FileUploadChunk(FileUploadChunk),
    FileUploadEnd,
    CompileRequest(CompileRequest),
    StatusRequest { job_id: u32 },
    ResultRequest { job_id: u32 },
    Ping,
    Ack,
    Nack,
    Error(ErrorInfo),
    CompileResponse(CompileOutcome),
    StatusResponse(JobStatus),
    ResultResponse(CompileOutcome),
    Pong,
    /// Any admin kind, control client to server.
    Admin(AdminCommand),
    /// Text reply to an admin command (snapshot tables, config values).
    AdminText(String),
    ServerStats(ServerStatsRecord),
}

impl Payload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self {
            Payload::Hello(hello) => {
                buf.put_u16(hello.version.0);
                buf.put_u16(hello.version.1);
                buf.put_u16(hello.version.2);
                buf.put_u16(hello.capabilities);
                put_str(&mut buf, &hello.name, NAME_LEN);
                put_str(&mut buf, &hello.platform, PLATFORM_LEN);
            }
            Payload::FileUploadStart(start) => {
                buf.put_u64(start.file_size);
                buf.put_u32(start.chunk_count);
                buf.put_u32(start.chunk_size);
                put_str(&mut buf, &start.filename, FILENAME_LEN);
                buf.put_u32(start.checksum);
            }
            Payload::FileUploadChunk(chunk) => {
                buf.put_u32(chunk.chunk_id);
                buf.put_u32(chunk.chunk_size);
                buf.put_u32(chunk.checksum);
                buf.put_slice(&chunk.data);
            }
            Payload::FileUploadEnd | Payload::Ping | Payload::Ack | Payload::Nack
            | Payload::Pong => {}
            Payload::CompileRequest(req) => {
                buf.put_u16(req.language);
                buf.put_u16(req.mode);
                buf.put_u16(req.flags);
                buf.put_u16(req.priority);
                put_str(&mut buf, &req.filename, FILENAME_LEN);
                put_str(&mut buf, &req.compiler_args, ARGS_LEN);
                put_str(&mut buf, &req.execution_args, ARGS_LEN);
            }
            Payload::StatusRequest { job_id } | Payload::ResultRequest { job_id } => {
                buf.put_u32(*job_id);
            }
            Payload::Error(err) => {
                buf.put_u32(err.code as u32);
                buf.put_u32(err.line);
                put_str(&mut buf, &err.message, ERROR_MSG_LEN);
                put_str(&mut buf, &err.context, CONTEXT_LEN);
            }
            Payload::CompileResponse(outcome) | Payload::ResultResponse(outcome) => {
                buf.put_u32(outcome.job_id);
                buf.put_u16(outcome.status as u16);
                buf.put_u16(0); // reserved
                buf.put_i32(outcome.exit_code);
                buf.put_u32(outcome.stdout_size);
                buf.put_u32(outcome.stderr_size);
                buf.put_u32(outcome.elapsed_ms);
            }
            Payload::StatusResponse(status) => {
                buf.put_u32(status.job_id);
                buf.put_u16(status.state as u16);
                buf.put_u16(status.progress);
                buf.put_u64(status.start_time);
                buf.put_u64(status.end_time);
                buf.put_u32(status.pid);
                put_str(&mut buf, &status.message, STATUS_MSG_LEN);
            }
            Payload::Admin(cmd) => {
                buf.put_u16(0); // command echoes the message kind; reserved here
                buf.put_u16(cmd.flags);
                buf.put_u32(cmd.target_id);
                put_str(&mut buf, &cmd.data, ADMIN_DATA_LEN);
            }
            Payload::AdminText(text) => {
                buf.put_slice(text.as_bytes());
            }
            Payload::ServerStats(stats) => {
                buf.put_u64(stats.start_time);
                buf.put_u64(stats.current_time);
                buf.put_u32(stats.total_clients);
                buf.put_u32(stats.active_clients);
                buf.put_u32(stats.total_jobs);
                buf.put_u32(stats.active_jobs);
                buf.put_u32(stats.completed_jobs);
                buf.put_u32(stats.failed_jobs);
                buf.put_u64(stats.total_bytes_received);
                buf.put_u64(stats.total_bytes_sent);
            }
        }
        buf.to_vec()
    }

    pub fn decode(
        kind: MessageKind,
        origin: Origin,
        body: &[u8],
    ) -> Result<Payload, PayloadError> {
        let mut buf = body;
        match kind {
            MessageKind::Hello => {
                need(buf, 8 + NAME_LEN + PLATFORM_LEN, "HELLO")?;
                Ok(Payload::Hello(Hello {
                    version: (buf.get_u16(), buf.get_u16(), buf.get_u16()),
                    capabilities: buf.get_u16(),
                    name: take_str(&mut buf, NAME_LEN, "name")?,
                    platform: take_str(&mut buf, PLATFORM_LEN, "platform")?,
                }))
            }
            MessageKind::FileUploadStart => {
                need(buf, 16 + FILENAME_LEN + 4, "FILE_UPLOAD_START")?;
                Ok(Payload::FileUploadStart(FileUploadStart {
                    file_size: buf.get_u64(),
                    chunk_count: buf.get_u32(),
                    chunk_size: buf.get_u32(),
                    filename: take_str(&mut buf, FILENAME_LEN, "filename")?,
                    checksum: buf.get_u32(),
                }))
            }
            MessageKind::FileUploadChunk => {
                need(buf, 12, "FILE_UPLOAD_CHUNK")?;
                Ok(Payload::FileUploadChunk(FileUploadChunk {
                    chunk_id: buf.get_u32(),
                    chunk_size: buf.get_u32(),
                    checksum: buf.get_u32(),
                    data: buf.to_vec(),
                }))
            }
            MessageKind::FileUploadEnd => Ok(Payload::FileUploadEnd),
            MessageKind::CompileRequest => {
                need(buf, 8 + FILENAME_LEN + 2 * ARGS_LEN, "COMPILE_REQUEST")?;
                Ok(Payload::CompileRequest(CompileRequest {
                    language: buf.get_u16(),
                    mode: buf.get_u16(),
                    flags: buf.get_u16(),
                    priority: buf.get_u16(),
                    filename: take_str(&mut buf, FILENAME_LEN, "filename")?,
                    compiler_args: take_str(&mut buf, ARGS_LEN, "compiler_args")?,
                    execution_args: take_str(&mut buf, ARGS_LEN, "execution_args")?,
                }))
            }
            MessageKind::StatusRequest => {
                need(buf, 4, "STATUS_REQUEST")?;
                Ok(Payload::StatusRequest {
                    job_id: buf.get_u32(),
                })
            }
            MessageKind::ResultRequest => {
                need(buf, 4, "RESULT_REQUEST")?;
                Ok(Payload::ResultRequest {
                    job_id: buf.get_u32(),
                })
            }
            MessageKind::Ping => Ok(Payload::Ping),
            MessageKind::Pong => Ok(Payload::Pong),
            MessageKind::Ack => Ok(Payload::Ack),
            MessageKind::Nack => Ok(Payload::Nack),
            MessageKind::Error => {
                need(buf, 8 + ERROR_MSG_LEN + CONTEXT_LEN, "ERROR")?;
                let raw_code = buf.get_u32();
                let code = ErrorCode::from_u32(raw_code).ok_or(PayloadError::InvalidField {
                    field: "error_code",
                    value: raw_code,
                })?;
                Ok(Payload::Error(ErrorInfo {
                    code,
                    line: buf.get_u32(),
                    message: take_str(&mut buf, ERROR_MSG_LEN, "error_message")?,
                    context: take_str(&mut buf, CONTEXT_LEN, "error_context")?,
                }))
            }
            MessageKind::CompileResponse | MessageKind::ResultResponse => {
                need(buf, 24, kind.as_str())?;
                let outcome = CompileOutcome {
                    job_id: buf.get_u32(),
                    status: take_state(&mut buf)?,
                    exit_code: {
                        let _reserved = buf.get_u16();
                        buf.get_i32()
                    },
                    stdout_size: buf.get_u32(),
                    stderr_size: buf.get_u32(),
                    elapsed_ms: buf.get_u32(),
                };
                if kind == MessageKind::CompileResponse {
                    Ok(Payload::CompileResponse(outcome))
                } else {
                    Ok(Payload::ResultResponse(outcome))
                }
            }
            MessageKind::StatusResponse => {
                need(buf, 28 + STATUS_MSG_LEN, "STATUS_RESPONSE")?;
                Ok(Payload::StatusResponse(JobStatus {
                    job_id: buf.get_u32(),
                    state: take_state(&mut buf)?,
                    progress: buf.get_u16(),
                    start_time: buf.get_u64(),
                    end_time: buf.get_u64(),
                    pid: buf.get_u32(),
                    message: take_str(&mut buf, STATUS_MSG_LEN, "status_message")?,
                }))
            }
            kind if kind.is_admin() => match origin {
                Origin::Client => {
                    // An empty body is a bare command (AdminConnect and friends).
                    if buf.is_empty() {
                        return Ok(Payload::Admin(AdminCommand::default()));
                    }
                    need(buf, 8 + ADMIN_DATA_LEN, kind.as_str())?;
                    let _command = buf.get_u16();
                    Ok(Payload::Admin(AdminCommand {
                        flags: buf.get_u16(),
                        target_id: buf.get_u32(),
                        data: take_str(&mut buf, ADMIN_DATA_LEN, "command_data")?,
                    }))
                }
                Origin::Server => {
                    if kind == MessageKind::ServerStats {
                        need(buf, 56, "ADMIN_SERVER_STATS")?;
                        return Ok(Payload::ServerStats(ServerStatsRecord {
                            start_time: buf.get_u64(),
                            current_time: buf.get_u64(),
                            total_clients: buf.get_u32(),
                            active_clients: buf.get_u32(),
                            total_jobs: buf.get_u32(),
                            active_jobs: buf.get_u32(),
                            completed_jobs: buf.get_u32(),
                            failed_jobs: buf.get_u32(),
                            total_bytes_received: buf.get_u64(),
                            total_bytes_sent: buf.get_u64(),
                        }));
                    }
                    let text = String::from_utf8(buf.to_vec())
                        .map_err(|_| PayloadError::BadUtf8 { field: "admin_text" })?;
                    Ok(Payload::AdminText(text))
                }
            },
            // All non-admin kinds are covered above.
            _ => unreachable!("non-admin kind {kind} fell through payload dispatch"),
        }
    }
}

fn need(buf: &[u8], len: usize, kind: &'static str) -> Result<(), PayloadError> {
    if buf.len() < len {
        return Err(PayloadError::Truncated {
            kind,
            got: buf.len(),
        });
    }
    Ok(())
}

fn take_state(buf: &mut &[u8]) -> Result<JobState, PayloadError> {
    let raw = buf.get_u16();
    JobState::from_u16(raw).ok_or(PayloadError::InvalidField {
        field: "job_state",
        value: u32::from(raw),
    })
}

fn put_str(buf: &mut BytesMut, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(width);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, width - n);
}

fn take_str(buf: &mut &[u8], width: usize, field: &'static str) -> Result<String, PayloadError> {
    debug_assert!(buf.len() >= width, "caller must check length for {field}");
    let (raw, rest) = buf.split_at(width);
    *buf = rest;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    std::str::from_utf8(&raw[..end])
        .map(str::to_owned)
        .map_err(|_| PayloadError::BadUtf8 { field })
}
