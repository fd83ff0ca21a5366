//! On-disk layout under the configured service root.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// The three working directories live under one root: `processing/` holds
/// per-job sandboxes, `outgoing/` is reserved for result artifacts, `logs/`
/// for operational logs.
#[derive(Debug, Clone)]
pub struct ServiceRoot {
    root: PathBuf,
}

impl ServiceRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn processing(&self) -> PathBuf {
        self.root.join("processing")
    }

    pub fn outgoing(&self) -> PathBuf {
        self.root.join("outgoing")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Per-client staging area for uploaded files awaiting a compile request.
    pub fn staging(&self, client_id: u32) -> PathBuf {
        self.processing().join(format!("staging_{client_id}"))
    }

    /// Create the full directory layout. Safe to call on an existing root.
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(self.processing())?;
        fs::create_dir_all(self.outgoing())?;
        fs::create_dir_all(self.logs())?;
        Ok(())
    }
}
