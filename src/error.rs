use thiserror::Error;

use crate::admin::AdminError;
use crate::config::ConfigError;
use crate::exec::ExecError;
use crate::lang::ToolchainError;
use crate::proto::FrameError;
use crate::sched::SchedError;

/// Crate-level convenience error.
///
/// A thin wrapper over the canonical capability errors; subsystems return
/// their own error types and never throw across module boundaries.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Toolchain(#[from] ToolchainError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Sched(#[from] SchedError),

    #[error(transparent)]
    Admin(#[from] AdminError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
