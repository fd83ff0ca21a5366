//! Wire-level enums shared across the protocol.

use std::fmt;

/// Message kinds, partitioned by numeric range: client requests 1..99,
/// server responses 100..199, admin 200..255.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    Hello = 1,
    FileUploadStart = 2,
    FileUploadChunk = 3,
    FileUploadEnd = 4,
    CompileRequest = 5,
    StatusRequest = 6,
    ResultRequest = 7,
    Ping = 8,

    Ack = 100,
    Nack = 101,
    Error = 102,
    CompileResponse = 103,
    StatusResponse = 104,
    ResultResponse = 105,
    Pong = 106,

    AdminConnect = 200,
    AdminDisconnect = 201,
    ListClients = 202,
    ListJobs = 203,
    ServerStats = 204,
    DisconnectClient = 205,
    KillJob = 206,
    Shutdown = 207,
    ConfigGet = 208,
    ConfigSet = 209,
}

impl MessageKind {
    pub fn from_u16(raw: u16) -> Option<Self> {
        use MessageKind::*;
        Some(match raw {
            1 => Hello,
            2 => FileUploadStart,
            3 => FileUploadChunk,
            4 => FileUploadEnd,
            5 => CompileRequest,
            6 => StatusRequest,
            7 => ResultRequest,
            8 => Ping,
            100 => Ack,
            101 => Nack,
            102 => Error,
            103 => CompileResponse,
            104 => StatusResponse,
            105 => ResultResponse,
            106 => Pong,
            200 => AdminConnect,
            201 => AdminDisconnect,
            202 => ListClients,
            203 => ListJobs,
            204 => ServerStats,
            205 => DisconnectClient,
            206 => KillJob,
            207 => Shutdown,
            208 => ConfigGet,
            209 => ConfigSet,
            _ => return None,
        })
    }

    pub fn is_admin(self) -> bool {
        self as u16 >= 200
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Hello => "HELLO",
            MessageKind::FileUploadStart => "FILE_UPLOAD_START",
            MessageKind::FileUploadChunk => "FILE_UPLOAD_CHUNK",
            MessageKind::FileUploadEnd => "FILE_UPLOAD_END",
            MessageKind::CompileRequest => "COMPILE_REQUEST",
            MessageKind::StatusRequest => "STATUS_REQUEST",
            MessageKind::ResultRequest => "RESULT_REQUEST",
            MessageKind::Ping => "PING",
            MessageKind::Ack => "ACK",
            MessageKind::Nack => "NACK",
            MessageKind::Error => "ERROR",
            MessageKind::CompileResponse => "COMPILE_RESPONSE",
            MessageKind::StatusResponse => "STATUS_RESPONSE",
            MessageKind::ResultResponse => "RESULT_RESPONSE",
            MessageKind::Pong => "PONG",
            MessageKind::AdminConnect => "ADMIN_CONNECT",
            MessageKind::AdminDisconnect => "ADMIN_DISCONNECT",
            MessageKind::ListClients => "ADMIN_LIST_CLIENTS",
            MessageKind::ListJobs => "ADMIN_LIST_JOBS",
            MessageKind::ServerStats => "ADMIN_SERVER_STATS",
            MessageKind::DisconnectClient => "ADMIN_DISCONNECT_CLIENT",
            MessageKind::KillJob => "ADMIN_KILL_JOB",
            MessageKind::Shutdown => "ADMIN_SHUTDOWN",
            MessageKind::ConfigGet => "ADMIN_CONFIG_GET",
            MessageKind::ConfigSet => "ADMIN_CONFIG_SET",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Language {
    C = 1,
    Cpp = 2,
    Java = 3,
    Python = 4,
    JavaScript = 5,
    Go = 6,
    Rust = 7,
}

impl Language {
    pub const ALL: [Language; 7] = [
        Language::C,
        Language::Cpp,
        Language::Java,
        Language::Python,
        Language::JavaScript,
        Language::Go,
        Language::Rust,
    ];

    pub fn from_u16(raw: u16) -> Option<Self> {
        Language::ALL.into_iter().find(|lang| *lang as u16 == raw)
    }

    /// Map a filename extension onto a language tag. The declared tag in a
    /// compile request wins; this is a cross-check only.
    pub fn from_extension(filename: &str) -> Option<Self> {
        let ext = filename.rsplit_once('.').map(|(_, ext)| ext)?;
        Some(match ext {
            "c" => Language::C,
            "cpp" | "cc" | "cxx" => Language::Cpp,
            "java" => Language::Java,
            "py" => Language::Python,
            "js" => Language::JavaScript,
            "go" => Language::Go,
            "rs" => Language::Rust,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Language::C => "C",
            Language::Cpp => "C++",
            Language::Java => "Java",
            Language::Python => "Python",
            Language::JavaScript => "JavaScript",
            Language::Go => "Go",
            Language::Rust => "Rust",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ExecMode {
    CompileOnly = 0,
    CompileAndRun = 1,
    Interpret = 2,
    SyntaxCheck = 3,
}

impl ExecMode {
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => ExecMode::CompileOnly,
            1 => ExecMode::CompileAndRun,
            2 => ExecMode::Interpret,
            3 => ExecMode::SyntaxCheck,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecMode::CompileOnly => "compile-only",
            ExecMode::CompileAndRun => "compile-and-run",
            ExecMode::Interpret => "interpret",
            ExecMode::SyntaxCheck => "syntax-check",
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle: `Queued -> Running -> {Completed|Failed|Cancelled|Timeout}`.
/// No backward transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum JobState {
    Queued = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
    Timeout = 5,
}

impl JobState {
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => JobState::Queued,
            1 => JobState::Running,
            2 => JobState::Completed,
            3 => JobState::Failed,
            4 => JobState::Cancelled,
            5 => JobState::Timeout,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "Queued",
            JobState::Running => "Running",
            JobState::Completed => "Completed",
            JobState::Failed => "Failed",
            JobState::Cancelled => "Cancelled",
            JobState::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes surfaced to peers in `Error` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    InvalidArgument = 1,
    Permission = 2,
    NotFound = 3,
    QuotaExceeded = 4,
    Internal = 6,
    Timeout = 7,
    Compilation = 8,
    Execution = 9,
    UnsupportedLanguage = 12,
}

impl ErrorCode {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => ErrorCode::InvalidArgument,
            2 => ErrorCode::Permission,
            3 => ErrorCode::NotFound,
            4 => ErrorCode::QuotaExceeded,
            6 => ErrorCode::Internal,
            7 => ErrorCode::Timeout,
            8 => ErrorCode::Compilation,
            9 => ErrorCode::Execution,
            12 => ErrorCode::UnsupportedLanguage,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::Permission => "permission denied",
            ErrorCode::NotFound => "not found",
            ErrorCode::QuotaExceeded => "quota exceeded",
            ErrorCode::Internal => "internal error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Compilation => "compilation error",
            ErrorCode::Execution => "execution error",
            ErrorCode::UnsupportedLanguage => "unsupported language",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_values_partition_by_range() {
        assert_eq!(MessageKind::from_u16(1), Some(MessageKind::Hello));
        assert_eq!(MessageKind::from_u16(106), Some(MessageKind::Pong));
        assert_eq!(MessageKind::from_u16(209), Some(MessageKind::ConfigSet));
        assert_eq!(MessageKind::from_u16(0), None);
        assert_eq!(MessageKind::from_u16(99), None);
        assert_eq!(MessageKind::from_u16(210), None);
        assert!(MessageKind::KillJob.is_admin());
        assert!(!MessageKind::Ping.is_admin());
    }

    #[test]
    fn language_round_trip_and_extensions() {
        for lang in Language::ALL {
            assert_eq!(Language::from_u16(lang as u16), Some(lang));
        }
        assert_eq!(Language::from_u16(0), None);
        assert_eq!(Language::from_extension("main.cc"), Some(Language::Cpp));
        assert_eq!(Language::from_extension("a.py"), Some(Language::Python));
        assert_eq!(Language::from_extension("noext"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        for state in [
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
            JobState::Timeout,
        ] {
            assert!(state.is_terminal());
        }
    }
}
