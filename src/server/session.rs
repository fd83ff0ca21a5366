//! Client session state machine.
//!
//! Pure message-in, actions-out: the connection thread owns the socket and
//! the roster entry, the session owns only protocol state. Side effects go
//! through [`SessionBackend`] so the machine is testable without a network.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::exec::{self, ExecError};
use crate::proto::{
    CompileOutcome, ErrorCode, ErrorInfo, Hello, JobStatus, Message, MessageKind, Origin, Payload,
};
use crate::sched::{JobSnapshot, JobSpec, SchedError, PRIORITY_HIGH, PRIORITY_NORMAL};

use super::ClientState;

const SERVER_NAME: &str = "smeltd";

/// Seam between the session machine and the rest of the service.
pub trait SessionBackend {
    fn language_available(&self, language: crate::proto::Language) -> bool;
    fn mode_supported(
        &self,
        language: crate::proto::Language,
        mode: crate::proto::ExecMode,
    ) -> bool;
    fn max_file_size(&self) -> u64;
    fn client_identified(&self, client_id: u32, name: &str, platform: &str);
    fn stage_file(&self, client_id: u32, filename: &str, bytes: &[u8]) -> Result<(), ExecError>;
    fn staged_file(&self, client_id: u32, filename: &str) -> Option<Vec<u8>>;
    fn submit(&self, spec: JobSpec) -> Result<u32, SchedError>;
    fn job(&self, id: u32) -> Option<JobSnapshot>;
}

#[derive(Debug)]
pub enum SessionAction {
    Send(Message),
    Close,
}

/// Transient upload record; exists exactly while the session is `Uploading`.
struct UploadInProgress {
    filename: String,
    expected_size: u64,
    chunk_count: u32,
    expected_checksum: u32,
    running_checksum: u32,
    received_chunks: u32,
    data: Vec<u8>,
}

pub struct Session {
    client_id: u32,
    state: ClientState,
    upload: Option<UploadInProgress>,
    active_jobs: u32,
}

impl Session {
    pub fn new(client_id: u32) -> Self {
        Self {
            client_id,
            state: ClientState::Connecting,
            upload: None,
            active_jobs: 0,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn active_jobs(&self) -> u32 {
        self.active_jobs
    }

    pub fn handle(
        &mut self,
        kind: MessageKind,
        correlation_id: u32,
        body: &[u8],
        backend: &impl SessionBackend,
    ) -> Vec<SessionAction> {
        let payload = match Payload::decode(kind, Origin::Client, body) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(client_id = self.client_id, %kind, "bad payload: {err}");
                self.abort_upload();
                let error = self.error(correlation_id, ErrorCode::InvalidArgument, err.to_string());
                if self.state == ClientState::Connecting {
                    self.state = ClientState::Disconnecting;
                    return vec![error, SessionAction::Close];
                }
                return vec![error];
            }
        };

        // The first message must be HELLO; anything else ends the session.
        if self.state == ClientState::Connecting {
            return match payload {
                Payload::Hello(hello) => self.handle_hello(correlation_id, hello, backend),
                _ => {
                    self.state = ClientState::Disconnecting;
                    vec![
                        self.error(
                            correlation_id,
                            ErrorCode::InvalidArgument,
                            "expected HELLO handshake",
                        ),
                        SessionAction::Close,
                    ]
                }
            };
        }

        match payload {
            Payload::Hello(_) => vec![self.error(
                correlation_id,
                ErrorCode::InvalidArgument,
                "handshake already complete",
            )],
            Payload::Ping => vec![self.reply(MessageKind::Pong, correlation_id, Payload::Pong)],
            Payload::FileUploadStart(start) => self.handle_upload_start(correlation_id, start, backend),
            Payload::FileUploadChunk(chunk) => self.handle_upload_chunk(correlation_id, chunk),
            Payload::FileUploadEnd => self.handle_upload_end(correlation_id, backend),
            Payload::CompileRequest(request) => self.handle_compile(correlation_id, request, backend),
            Payload::StatusRequest { job_id } => self.handle_status(correlation_id, job_id, backend),
            Payload::ResultRequest { job_id } => self.handle_result(correlation_id, job_id, backend),
            _ => vec![self.error(
                correlation_id,
                ErrorCode::InvalidArgument,
                format!("unexpected message kind {kind}"),
            )],
        }
    }

    fn handle_hello(
        &mut self,
        correlation_id: u32,
        hello: Hello,
        backend: &impl SessionBackend,
    ) -> Vec<SessionAction> {
        debug!(
            client_id = self.client_id,
            name = %hello.name,
            platform = %hello.platform,
            "client greeted"
        );
        backend.client_identified(self.client_id, &hello.name, &hello.platform);
        // Authenticated is transient: nothing gates on it, so the session
        // settles straight into Idle.
        self.state = ClientState::Idle;

        let response = Hello {
            version: server_version(),
            capabilities: 0,
            name: SERVER_NAME.into(),
            platform: std::env::consts::OS.into(),
        };
        vec![self.reply(MessageKind::Hello, correlation_id, Payload::Hello(response))]
    }

    fn handle_upload_start(
        &mut self,
        correlation_id: u32,
        start: crate::proto::FileUploadStart,
        backend: &impl SessionBackend,
    ) -> Vec<SessionAction> {
        if self.state != ClientState::Idle {
            return vec![self.error(
                correlation_id,
                ErrorCode::Permission,
                "upload not allowed in this state",
            )];
        }
        if start.file_size > backend.max_file_size() {
            return vec![self.error(
                correlation_id,
                ErrorCode::QuotaExceeded,
                format!(
                    "file of {} bytes exceeds the {} byte cap",
                    start.file_size,
                    backend.max_file_size()
                ),
            )];
        }
        if let Err(err) = exec::validate_filename(&start.filename) {
            return vec![self.error(correlation_id, ErrorCode::InvalidArgument, err.to_string())];
        }
        if start.chunk_count == 0 && start.file_size > 0 {
            return vec![self.error(
                correlation_id,
                ErrorCode::InvalidArgument,
                "chunk count cannot be zero",
            )];
        }

        self.upload = Some(UploadInProgress {
            filename: start.filename,
            expected_size: start.file_size,
            chunk_count: start.chunk_count,
            expected_checksum: start.checksum,
            running_checksum: 0,
            received_chunks: 0,
            data: Vec::with_capacity(start.file_size.min(1 << 20) as usize),
        });
        self.state = ClientState::Uploading;
        vec![self.reply(MessageKind::Ack, correlation_id, Payload::Ack)]
    }

    fn handle_upload_chunk(
        &mut self,
        correlation_id: u32,
        chunk: crate::proto::FileUploadChunk,
    ) -> Vec<SessionAction> {
        if self.state != ClientState::Uploading {
            return vec![self.error(
                correlation_id,
                ErrorCode::Permission,
                "no upload in progress",
            )];
        }
        let Some(upload) = self.upload.as_mut() else {
            debug_assert!(false, "Uploading state without an UploadInProgress");
            self.state = ClientState::Idle;
            return vec![self.error(correlation_id, ErrorCode::Internal, "upload state lost")];
        };

        if chunk.data.len() as u32 != chunk.chunk_size {
            self.abort_upload();
            return vec![self.error(
                correlation_id,
                ErrorCode::InvalidArgument,
                "chunk size mismatch",
            )];
        }
        if crc32c::crc32c(&chunk.data) != chunk.checksum {
            self.abort_upload();
            return vec![self.error(
                correlation_id,
                ErrorCode::InvalidArgument,
                "chunk checksum mismatch",
            )];
        }
        if upload.data.len() as u64 + chunk.data.len() as u64 > upload.expected_size {
            self.abort_upload();
            return vec![self.error(
                correlation_id,
                ErrorCode::QuotaExceeded,
                "upload exceeds its declared size",
            )];
        }

        upload.running_checksum = crc32c::crc32c_append(upload.running_checksum, &chunk.data);
        upload.data.extend_from_slice(&chunk.data);
        upload.received_chunks += 1;
        vec![self.reply(MessageKind::Ack, correlation_id, Payload::Ack)]
    }

    fn handle_upload_end(
        &mut self,
        correlation_id: u32,
        backend: &impl SessionBackend,
    ) -> Vec<SessionAction> {
        if self.state != ClientState::Uploading {
            return vec![self.error(
                correlation_id,
                ErrorCode::Permission,
                "no upload in progress",
            )];
        }
        let Some(upload) = self.upload.take() else {
            self.state = ClientState::Idle;
            return vec![self.error(correlation_id, ErrorCode::Internal, "upload state lost")];
        };
        self.state = ClientState::Idle;

        if upload.data.len() as u64 != upload.expected_size
            || upload.received_chunks != upload.chunk_count
        {
            return vec![self.error(
                correlation_id,
                ErrorCode::InvalidArgument,
                "upload incomplete",
            )];
        }
        if upload.running_checksum != upload.expected_checksum {
            return vec![self.error(
                correlation_id,
                ErrorCode::InvalidArgument,
                "file checksum mismatch",
            )];
        }

        match backend.stage_file(self.client_id, &upload.filename, &upload.data) {
            Ok(()) => {
                debug!(
                    client_id = self.client_id,
                    filename = %upload.filename,
                    bytes = upload.data.len(),
                    "upload staged"
                );
                vec![self.reply(MessageKind::Ack, correlation_id, Payload::Ack)]
            }
            Err(ExecError::InvalidFilename(reason)) => {
                vec![self.error(correlation_id, ErrorCode::InvalidArgument, reason)]
            }
            Err(err) => {
                warn!(client_id = self.client_id, "staging failed: {err}");
                vec![self.error(correlation_id, ErrorCode::Internal, "staging failed")]
            }
        }
    }

    fn handle_compile(
        &mut self,
        correlation_id: u32,
        request: crate::proto::CompileRequest,
        backend: &impl SessionBackend,
    ) -> Vec<SessionAction> {
        if self.state != ClientState::Idle {
            return vec![self.error(
                correlation_id,
                ErrorCode::Permission,
                "not ready for a compile request",
            )];
        }

        let Some(language) = request.language() else {
            return vec![self.error(
                correlation_id,
                ErrorCode::UnsupportedLanguage,
                format!("unknown language tag {}", request.language),
            )];
        };
        let Some(mode) = request.mode() else {
            return vec![self.error(
                correlation_id,
                ErrorCode::InvalidArgument,
                format!("unknown execution mode {}", request.mode),
            )];
        };
        if let Err(err) = exec::validate_filename(&request.filename) {
            return vec![self.error(correlation_id, ErrorCode::InvalidArgument, err.to_string())];
        }
        // Reject impossible language/mode pairings here rather than queueing
        // a job the worker can only fail.
        if !backend.mode_supported(language, mode) {
            return vec![self.error(
                correlation_id,
                ErrorCode::InvalidArgument,
                format!("{} is not valid for {language}", mode.as_str()),
            )];
        }
        if !backend.language_available(language) {
            return vec![self.error(
                correlation_id,
                ErrorCode::UnsupportedLanguage,
                format!("no {language} toolchain on this host"),
            )];
        }

        let priority = match request.priority {
            0 => PRIORITY_NORMAL,
            p if p <= u16::from(PRIORITY_HIGH) => p as u8,
            p => {
                return vec![self.error(
                    correlation_id,
                    ErrorCode::InvalidArgument,
                    format!("priority {p} out of range"),
                )]
            }
        };

        let Some(source) = backend.staged_file(self.client_id, &request.filename) else {
            return vec![self.error(
                correlation_id,
                ErrorCode::NotFound,
                format!("no staged file named {:?}", request.filename),
            )];
        };

        let spec = JobSpec {
            client_id: self.client_id,
            language,
            mode,
            priority,
            filename: request.filename,
            compiler_args: request.compiler_args,
            execution_args: request.execution_args,
            source: Arc::new(source),
        };

        match backend.submit(spec) {
            Ok(job_id) => {
                self.active_jobs += 1;
                self.state = ClientState::Processing;
                let outcome = CompileOutcome {
                    job_id,
                    status: crate::proto::JobState::Queued,
                    exit_code: 0,
                    stdout_size: 0,
                    stderr_size: 0,
                    elapsed_ms: 0,
                };
                vec![self.reply(
                    MessageKind::CompileResponse,
                    correlation_id,
                    Payload::CompileResponse(outcome),
                )]
            }
            Err(SchedError::QueueFull(depth)) => vec![self.error(
                correlation_id,
                ErrorCode::QuotaExceeded,
                format!("job queue is full ({depth} queued)"),
            )],
            Err(err) => vec![self.error(correlation_id, ErrorCode::InvalidArgument, err.to_string())],
        }
    }

    fn handle_status(
        &mut self,
        correlation_id: u32,
        job_id: u32,
        backend: &impl SessionBackend,
    ) -> Vec<SessionAction> {
        let job = match self.owned_job(correlation_id, job_id, backend) {
            Ok(job) => job,
            Err(action) => return vec![action],
        };

        let status = JobStatus {
            job_id: job.id,
            state: job.state,
            progress: job.progress(),
            start_time: unix_secs(job.started_at),
            end_time: unix_secs(job.ended_at),
            pid: job.pid.unwrap_or(0),
            message: format!("Job {}: {}", job.id, job.state),
        };
        vec![self.reply(
            MessageKind::StatusResponse,
            correlation_id,
            Payload::StatusResponse(status),
        )]
    }

    fn handle_result(
        &mut self,
        correlation_id: u32,
        job_id: u32,
        backend: &impl SessionBackend,
    ) -> Vec<SessionAction> {
        let job = match self.owned_job(correlation_id, job_id, backend) {
            Ok(job) => job,
            Err(action) => return vec![action],
        };

        if !job.state.is_terminal() {
            return vec![self.error(
                correlation_id,
                ErrorCode::Permission,
                "job not completed",
            )];
        }

        let outcome = CompileOutcome {
            job_id: job.id,
            status: job.state,
            exit_code: job.exit_code.unwrap_or(0),
            stdout_size: job.stdout_size as u32,
            stderr_size: job.stderr_size as u32,
            elapsed_ms: job.elapsed_ms(),
        };

        // Serving a terminal result settles the session back to Idle once no
        // other jobs are in flight.
        self.active_jobs = self.active_jobs.saturating_sub(1);
        if self.active_jobs == 0 && self.state == ClientState::Processing {
            self.state = ClientState::Idle;
        }

        vec![self.reply(
            MessageKind::ResultResponse,
            correlation_id,
            Payload::ResultResponse(outcome),
        )]
    }

    /// Look a job up and enforce ownership: sessions only ever observe their
    /// own jobs.
    fn owned_job(
        &mut self,
        correlation_id: u32,
        job_id: u32,
        backend: &impl SessionBackend,
    ) -> Result<JobSnapshot, SessionAction> {
        let Some(job) = backend.job(job_id) else {
            return Err(self.error(
                correlation_id,
                ErrorCode::NotFound,
                format!("job {job_id} not found"),
            ));
        };
        if job.client_id != self.client_id {
            return Err(self.error(correlation_id, ErrorCode::Permission, "access denied"));
        }
        Ok(job)
    }

    fn abort_upload(&mut self) {
        if self.upload.take().is_some() {
            self.state = ClientState::Idle;
        }
    }

    fn reply(&self, kind: MessageKind, correlation_id: u32, payload: Payload) -> SessionAction {
        SessionAction::Send(Message::new(kind, correlation_id, payload))
    }

    fn error(
        &self,
        correlation_id: u32,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> SessionAction {
        let info = ErrorInfo::new(code, message, format!("client {}", self.client_id));
        SessionAction::Send(Message::new(
            MessageKind::Error,
            correlation_id,
            Payload::Error(info),
        ))
    }
}

fn server_version() -> (u16, u16, u16) {
    let parse = |s: &str| s.parse::<u16>().unwrap_or(0);
    (
        parse(env!("CARGO_PKG_VERSION_MAJOR")),
        parse(env!("CARGO_PKG_VERSION_MINOR")),
        parse(env!("CARGO_PKG_VERSION_PATCH")),
    )
}

fn unix_secs(time: Option<std::time::SystemTime>) -> u64 {
    time.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{ExecMode, FileUploadChunk, FileUploadStart, JobState, Language};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::time::SystemTime;

    struct MockBackend {
        staged: RefCell<HashMap<(u32, String), Vec<u8>>>,
        jobs: RefCell<HashMap<u32, JobSnapshot>>,
        submitted: RefCell<Vec<JobSpec>>,
        next_job_id: RefCell<u32>,
        queue_full: bool,
        available: bool,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                staged: RefCell::new(HashMap::new()),
                jobs: RefCell::new(HashMap::new()),
                submitted: RefCell::new(Vec::new()),
                next_job_id: RefCell::new(1),
                queue_full: false,
                available: true,
            }
        }

        fn insert_job(&self, id: u32, client_id: u32, state: JobState) {
            self.jobs.borrow_mut().insert(
                id,
                JobSnapshot {
                    id,
                    client_id,
                    language: Language::C,
                    mode: ExecMode::CompileOnly,
                    priority: 5,
                    state,
                    filename: "a.c".into(),
                    submitted_at: SystemTime::now(),
                    started_at: None,
                    ended_at: None,
                    pid: None,
                    exit_code: if state.is_terminal() { Some(0) } else { None },
                    stdout_size: 0,
                    stderr_size: 0,
                    sandbox: None,
                },
            );
        }
    }

    impl SessionBackend for MockBackend {
        fn language_available(&self, _language: Language) -> bool {
            self.available
        }

        fn mode_supported(&self, language: Language, mode: ExecMode) -> bool {
            mode != ExecMode::Interpret
                || matches!(language, Language::Python | Language::JavaScript)
        }

        fn max_file_size(&self) -> u64 {
            1024
        }

        fn client_identified(&self, _client_id: u32, _name: &str, _platform: &str) {}

        fn stage_file(
            &self,
            client_id: u32,
            filename: &str,
            bytes: &[u8],
        ) -> Result<(), ExecError> {
            self.staged
                .borrow_mut()
                .insert((client_id, filename.to_string()), bytes.to_vec());
            Ok(())
        }

        fn staged_file(&self, client_id: u32, filename: &str) -> Option<Vec<u8>> {
            self.staged
                .borrow()
                .get(&(client_id, filename.to_string()))
                .cloned()
        }

        fn submit(&self, spec: JobSpec) -> Result<u32, SchedError> {
            if self.queue_full {
                return Err(SchedError::QueueFull(1));
            }
            let id = *self.next_job_id.borrow();
            *self.next_job_id.borrow_mut() += 1;
            self.submitted.borrow_mut().push(spec);
            Ok(id)
        }

        fn job(&self, id: u32) -> Option<JobSnapshot> {
            self.jobs.borrow().get(&id).cloned()
        }
    }

    fn hello_body() -> Vec<u8> {
        Payload::Hello(Hello {
            version: (1, 0, 0),
            capabilities: 0,
            name: "t".into(),
            platform: "x".into(),
        })
        .encode()
    }

    fn sent_kind(action: &SessionAction) -> MessageKind {
        match action {
            SessionAction::Send(msg) => msg.kind,
            SessionAction::Close => panic!("expected Send, got Close"),
        }
    }

    fn error_code(action: &SessionAction) -> ErrorCode {
        match action {
            SessionAction::Send(Message {
                payload: Payload::Error(info),
                ..
            }) => info.code,
            other => panic!("expected Error, got {other:?}"),
        }
    }

    fn greeted(backend: &MockBackend) -> Session {
        let mut session = Session::new(1);
        let actions = session.handle(MessageKind::Hello, 1, &hello_body(), backend);
        assert_eq!(sent_kind(&actions[0]), MessageKind::Hello);
        assert_eq!(session.state(), ClientState::Idle);
        session
    }

    fn upload(session: &mut Session, backend: &MockBackend, filename: &str, data: &[u8]) {
        let start = Payload::FileUploadStart(FileUploadStart {
            file_size: data.len() as u64,
            chunk_count: 1,
            chunk_size: data.len() as u32,
            filename: filename.into(),
            checksum: crc32c::crc32c(data),
        })
        .encode();
        let actions = session.handle(MessageKind::FileUploadStart, 2, &start, backend);
        assert_eq!(sent_kind(&actions[0]), MessageKind::Ack);

        let chunk = Payload::FileUploadChunk(FileUploadChunk {
            chunk_id: 0,
            chunk_size: data.len() as u32,
            checksum: crc32c::crc32c(data),
            data: data.to_vec(),
        })
        .encode();
        let actions = session.handle(MessageKind::FileUploadChunk, 3, &chunk, backend);
        assert_eq!(sent_kind(&actions[0]), MessageKind::Ack);

        let actions = session.handle(MessageKind::FileUploadEnd, 4, &[], backend);
        assert_eq!(sent_kind(&actions[0]), MessageKind::Ack);
        assert_eq!(session.state(), ClientState::Idle);
    }

    fn compile_body(filename: &str, priority: u16) -> Vec<u8> {
        Payload::CompileRequest(crate::proto::CompileRequest {
            language: Language::C as u16,
            mode: ExecMode::CompileOnly as u16,
            flags: 0,
            priority,
            filename: filename.into(),
            compiler_args: String::new(),
            execution_args: String::new(),
        })
        .encode()
    }

    #[test]
    fn first_message_must_be_hello() {
        let backend = MockBackend::new();
        let mut session = Session::new(1);
        let actions = session.handle(MessageKind::Ping, 9, &[], &backend);
        assert_eq!(error_code(&actions[0]), ErrorCode::InvalidArgument);
        assert!(matches!(actions[1], SessionAction::Close));
        assert_eq!(session.state(), ClientState::Disconnecting);
    }

    #[test]
    fn upload_then_compile_submits_a_job() {
        let backend = MockBackend::new();
        let mut session = greeted(&backend);
        upload(&mut session, &backend, "a.c", b"int main(){return 0;}\n");

        let actions = session.handle(MessageKind::CompileRequest, 5, &compile_body("a.c", 0), &backend);
        match &actions[0] {
            SessionAction::Send(Message {
                payload: Payload::CompileResponse(outcome),
                correlation_id,
                ..
            }) => {
                assert_eq!(*correlation_id, 5);
                assert_eq!(outcome.status, JobState::Queued);
                assert!(outcome.job_id >= 1);
            }
            other => panic!("expected CompileResponse, got {other:?}"),
        }
        assert_eq!(session.state(), ClientState::Processing);

        let submitted = backend.submitted.borrow();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].priority, PRIORITY_NORMAL);
        assert_eq!(&*submitted[0].source, b"int main(){return 0;}\n");
    }

    #[test]
    fn chunk_size_mismatch_aborts_the_upload() {
        let backend = MockBackend::new();
        let mut session = greeted(&backend);

        let start = Payload::FileUploadStart(FileUploadStart {
            file_size: 100,
            chunk_count: 1,
            chunk_size: 100,
            filename: "a.c".into(),
            checksum: 0,
        })
        .encode();
        session.handle(MessageKind::FileUploadStart, 2, &start, &backend);
        assert_eq!(session.state(), ClientState::Uploading);

        let chunk = Payload::FileUploadChunk(FileUploadChunk {
            chunk_id: 0,
            chunk_size: 100,
            checksum: 0,
            data: b"short".to_vec(),
        })
        .encode();
        let actions = session.handle(MessageKind::FileUploadChunk, 3, &chunk, &backend);
        assert_eq!(error_code(&actions[0]), ErrorCode::InvalidArgument);
        assert_eq!(session.state(), ClientState::Idle);

        // The transfer record is gone; further chunks are a permission error.
        let actions = session.handle(MessageKind::FileUploadChunk, 4, &chunk, &backend);
        assert_eq!(error_code(&actions[0]), ErrorCode::Permission);
    }

    #[test]
    fn oversize_upload_is_quota_exceeded() {
        let backend = MockBackend::new();
        let mut session = greeted(&backend);
        let start = Payload::FileUploadStart(FileUploadStart {
            file_size: 4096,
            chunk_count: 1,
            chunk_size: 4096,
            filename: "a.c".into(),
            checksum: 0,
        })
        .encode();
        let actions = session.handle(MessageKind::FileUploadStart, 2, &start, &backend);
        assert_eq!(error_code(&actions[0]), ErrorCode::QuotaExceeded);
        assert_eq!(session.state(), ClientState::Idle);
    }

    #[test]
    fn upload_end_outside_uploading_is_permission() {
        let backend = MockBackend::new();
        let mut session = greeted(&backend);
        let actions = session.handle(MessageKind::FileUploadEnd, 2, &[], &backend);
        assert_eq!(error_code(&actions[0]), ErrorCode::Permission);
    }

    #[test]
    fn file_checksum_mismatch_is_rejected_at_end() {
        let backend = MockBackend::new();
        let mut session = greeted(&backend);
        let data = b"hello world";
        let start = Payload::FileUploadStart(FileUploadStart {
            file_size: data.len() as u64,
            chunk_count: 1,
            chunk_size: data.len() as u32,
            filename: "a.c".into(),
            checksum: 0xdead_beef,
        })
        .encode();
        session.handle(MessageKind::FileUploadStart, 2, &start, &backend);
        let chunk = Payload::FileUploadChunk(FileUploadChunk {
            chunk_id: 0,
            chunk_size: data.len() as u32,
            checksum: crc32c::crc32c(data),
            data: data.to_vec(),
        })
        .encode();
        session.handle(MessageKind::FileUploadChunk, 3, &chunk, &backend);
        let actions = session.handle(MessageKind::FileUploadEnd, 4, &[], &backend);
        assert_eq!(error_code(&actions[0]), ErrorCode::InvalidArgument);
        assert!(backend.staged.borrow().is_empty());
    }

    #[test]
    fn compile_without_staged_file_is_not_found() {
        let backend = MockBackend::new();
        let mut session = greeted(&backend);
        let actions = session.handle(MessageKind::CompileRequest, 5, &compile_body("a.c", 5), &backend);
        assert_eq!(error_code(&actions[0]), ErrorCode::NotFound);
    }

    #[test]
    fn interpret_mode_on_a_compiled_language_is_rejected_at_submit() {
        let backend = MockBackend::new();
        let mut session = greeted(&backend);
        upload(&mut session, &backend, "a.c", b"int main(){return 0;}\n");

        let body = Payload::CompileRequest(crate::proto::CompileRequest {
            language: Language::C as u16,
            mode: ExecMode::Interpret as u16,
            flags: 0,
            priority: 5,
            filename: "a.c".into(),
            compiler_args: String::new(),
            execution_args: String::new(),
        })
        .encode();
        let actions = session.handle(MessageKind::CompileRequest, 5, &body, &backend);
        assert_eq!(error_code(&actions[0]), ErrorCode::InvalidArgument);

        // Nothing was queued and the session is still ready to submit.
        assert!(backend.submitted.borrow().is_empty());
        assert_eq!(session.state(), ClientState::Idle);
    }

    #[test]
    fn compile_with_unavailable_toolchain_is_unsupported() {
        let mut backend = MockBackend::new();
        backend.available = false;
        let mut session = greeted(&backend);
        upload(&mut session, &backend, "a.c", b"x");
        let actions = session.handle(MessageKind::CompileRequest, 5, &compile_body("a.c", 5), &backend);
        assert_eq!(error_code(&actions[0]), ErrorCode::UnsupportedLanguage);
    }

    #[test]
    fn queue_full_surfaces_as_quota_exceeded() {
        let mut backend = MockBackend::new();
        backend.queue_full = true;
        let mut session = greeted(&backend);
        upload(&mut session, &backend, "a.c", b"x");
        let actions = session.handle(MessageKind::CompileRequest, 5, &compile_body("a.c", 5), &backend);
        assert_eq!(error_code(&actions[0]), ErrorCode::QuotaExceeded);
        assert_eq!(session.state(), ClientState::Idle);
    }

    #[test]
    fn cross_session_job_access_is_denied() {
        let backend = MockBackend::new();
        backend.insert_job(7, 2, JobState::Running);
        let mut session = greeted(&backend);

        let body = Payload::StatusRequest { job_id: 7 }.encode();
        let actions = session.handle(MessageKind::StatusRequest, 6, &body, &backend);
        assert_eq!(error_code(&actions[0]), ErrorCode::Permission);

        let body = Payload::ResultRequest { job_id: 7 }.encode();
        let actions = session.handle(MessageKind::ResultRequest, 7, &body, &backend);
        assert_eq!(error_code(&actions[0]), ErrorCode::Permission);
    }

    #[test]
    fn result_before_terminal_state_is_denied() {
        let backend = MockBackend::new();
        backend.insert_job(3, 1, JobState::Running);
        let mut session = greeted(&backend);
        let body = Payload::ResultRequest { job_id: 3 }.encode();
        let actions = session.handle(MessageKind::ResultRequest, 8, &body, &backend);
        assert_eq!(error_code(&actions[0]), ErrorCode::Permission);
    }

    #[test]
    fn result_of_terminal_job_settles_session_to_idle() {
        let backend = MockBackend::new();
        let mut session = greeted(&backend);
        upload(&mut session, &backend, "a.c", b"x");
        session.handle(MessageKind::CompileRequest, 5, &compile_body("a.c", 5), &backend);
        assert_eq!(session.state(), ClientState::Processing);

        backend.insert_job(1, 1, JobState::Completed);
        let body = Payload::ResultRequest { job_id: 1 }.encode();
        let actions = session.handle(MessageKind::ResultRequest, 9, &body, &backend);
        assert_eq!(sent_kind(&actions[0]), MessageKind::ResultResponse);
        assert_eq!(session.state(), ClientState::Idle);
        assert_eq!(session.active_jobs(), 0);
    }

    #[test]
    fn status_of_unknown_job_is_not_found() {
        let backend = MockBackend::new();
        let mut session = greeted(&backend);
        let body = Payload::StatusRequest { job_id: 404 }.encode();
        let actions = session.handle(MessageKind::StatusRequest, 6, &body, &backend);
        assert_eq!(error_code(&actions[0]), ErrorCode::NotFound);
    }

    #[test]
    fn ping_pong_echoes_correlation_id() {
        let backend = MockBackend::new();
        let mut session = greeted(&backend);
        let actions = session.handle(MessageKind::Ping, 0xabcd, &[], &backend);
        match &actions[0] {
            SessionAction::Send(msg) => {
                assert_eq!(msg.kind, MessageKind::Pong);
                assert_eq!(msg.correlation_id, 0xabcd);
            }
            other => panic!("expected Pong, got {other:?}"),
        }
    }
}
