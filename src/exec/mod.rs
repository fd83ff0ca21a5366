//! Sandbox executor: per-job directories and time-limited process steps.

mod run;
mod sandbox;

pub use run::{kill_pid, terminate_pid, Step, StepOutcome};
pub use sandbox::{validate_filename, Sandbox};

pub(crate) use sandbox::remove_sandbox_dir;

use std::path::PathBuf;

use thiserror::Error;

/// Exit code reported when a step is killed for exceeding its wall clock,
/// matching the `timeout(1)` convention.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to create sandbox {path}: {source}")]
    SandboxCreate {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid source filename: {0}")]
    InvalidFilename(String),
    #[error("source of {got} bytes exceeds the {max} byte cap")]
    SourceTooLarge { got: u64, max: u64 },
    #[error("failed to write source {path}: {source}")]
    SourceWrite {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to launch step: {0}")]
    LaunchFailed(std::io::Error),
    #[error("failed to wait for pid {pid}: {source}")]
    WaitFailed { pid: u32, source: std::io::Error },
    #[error("failed to kill pid {pid}: {source}")]
    KillFailed { pid: u32, source: std::io::Error },
    #[error("failed to remove sandbox {path}: {source}")]
    SandboxRemove {
        path: PathBuf,
        source: std::io::Error,
    },
}
