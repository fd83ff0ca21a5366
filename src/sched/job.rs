//! Job records.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::proto::{ExecMode, JobState, Language};

/// Everything a session hands the scheduler at submit time. The id is
/// assigned by the scheduler.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub client_id: u32,
    pub language: Language,
    pub mode: ExecMode,
    pub priority: u8,
    pub filename: String,
    pub compiler_args: String,
    pub execution_args: String,
    pub source: Arc<Vec<u8>>,
}

/// What the worker needs to execute one dequeued job.
#[derive(Debug, Clone)]
pub struct RunnableJob {
    pub id: u32,
    pub spec: JobSpec,
    pub submitted_at_unix: u64,
}

/// Immutable copy of a job's observable state.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: u32,
    pub client_id: u32,
    pub language: Language,
    pub mode: ExecMode,
    pub priority: u8,
    pub state: JobState,
    pub filename: String,
    pub submitted_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub ended_at: Option<SystemTime>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub stdout_size: u64,
    pub stderr_size: u64,
    pub sandbox: Option<PathBuf>,
}

impl JobSnapshot {
    pub fn elapsed_ms(&self) -> u32 {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => end
                .duration_since(start)
                .map(|d| d.as_millis() as u32)
                .unwrap_or(0),
            _ => 0,
        }
    }

    pub fn seconds_since_submit(&self) -> u64 {
        SystemTime::now()
            .duration_since(self.submitted_at)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Coarse progress for status polls: queued 0, running 50, terminal 100.
    pub fn progress(&self) -> u16 {
        match self.state {
            JobState::Queued => 0,
            JobState::Running => 50,
            _ => 100,
        }
    }
}

pub(super) struct JobEntry {
    pub id: u32,
    pub client_id: u32,
    pub submit_seq: u64,
    pub priority: u8,
    pub state: JobState,
    pub spec: JobSpec,
    pub submitted_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub ended_at: Option<SystemTime>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub stdout_size: u64,
    pub stderr_size: u64,
    pub sandbox: Option<PathBuf>,
    pub cancel_requested: bool,
}

impl JobEntry {
    pub fn new(id: u32, submit_seq: u64, spec: JobSpec) -> Self {
        Self {
            id,
            client_id: spec.client_id,
            submit_seq,
            priority: spec.priority,
            state: JobState::Queued,
            spec,
            submitted_at: SystemTime::now(),
            started_at: None,
            ended_at: None,
            pid: None,
            exit_code: None,
            stdout_size: 0,
            stderr_size: 0,
            sandbox: None,
            cancel_requested: false,
        }
    }

    pub fn runnable(&self) -> RunnableJob {
        RunnableJob {
            id: self.id,
            spec: self.spec.clone(),
            submitted_at_unix: self
                .submitted_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            client_id: self.client_id,
            language: self.spec.language,
            mode: self.spec.mode,
            priority: self.priority,
            state: self.state,
            filename: self.spec.filename.clone(),
            submitted_at: self.submitted_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            pid: self.pid,
            exit_code: self.exit_code,
            stdout_size: self.stdout_size,
            stderr_size: self.stderr_size,
            sandbox: self.sandbox.clone(),
        }
    }
}
