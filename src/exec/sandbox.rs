//! Per-job sandbox directories.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::ExecError;

const MAX_FILENAME_LEN: usize = 255;

/// An isolated working directory for one job. Created before the first step
/// runs, removed on retirement; the directory must not pre-exist.
#[derive(Debug)]
pub struct Sandbox {
    dir: PathBuf,
    job_id: u32,
}

impl Sandbox {
    /// Create `processing/job_<id>_<timestamp>/`. A pre-existing path is a
    /// fatal executor error, not something to reuse.
    pub fn create(
        processing_root: &Path,
        job_id: u32,
        submitted_at_unix: u64,
    ) -> Result<Self, ExecError> {
        let dir = processing_root.join(format!("job_{job_id}_{submitted_at_unix}"));
        fs::create_dir_all(processing_root).map_err(|source| ExecError::SandboxCreate {
            path: processing_root.to_path_buf(),
            source,
        })?;
        fs::create_dir(&dir).map_err(|source| ExecError::SandboxCreate {
            path: dir.clone(),
            source,
        })?;
        debug!(job_id, dir = %dir.display(), "created sandbox");
        Ok(Self { dir, job_id })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Write the uploaded source under its declared filename.
    pub fn place_source(
        &self,
        filename: &str,
        bytes: &[u8],
        max_file_size: u64,
    ) -> Result<PathBuf, ExecError> {
        validate_filename(filename)?;
        if bytes.len() as u64 > max_file_size {
            return Err(ExecError::SourceTooLarge {
                got: bytes.len() as u64,
                max: max_file_size,
            });
        }
        let path = self.dir.join(filename);
        let mut file = fs::File::create(&path).map_err(|source| ExecError::SourceWrite {
            path: path.clone(),
            source,
        })?;
        file.write_all(bytes)
            .and_then(|()| file.flush())
            .map_err(|source| ExecError::SourceWrite {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    /// Persist a captured stream next to the source so result byte counts
    /// refer to real artifacts until retirement.
    pub fn write_capture(&self, name: &str, bytes: &[u8]) {
        let path = self.dir.join(name);
        if let Err(err) = fs::write(&path, bytes) {
            warn!(job_id = self.job_id, path = %path.display(), "failed to persist capture: {err}");
        }
    }

    /// Remove the directory and everything in it.
    pub fn retire(self) -> Result<(), ExecError> {
        debug!(job_id = self.job_id, dir = %self.dir.display(), "retiring sandbox");
        remove_sandbox_dir(&self.dir)
    }
}

pub(crate) fn remove_sandbox_dir(dir: &Path) -> Result<(), ExecError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ExecError::SandboxRemove {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

/// Filename rules for anything a client names: no path separators, no `..`,
/// no control characters, no reserved names, bounded length. Leading `-` is
/// rejected so a filename can never read as a flag.
pub fn validate_filename(name: &str) -> Result<(), ExecError> {
    let reject = |reason: &str| {
        Err(ExecError::InvalidFilename(format!(
            "{name:?}: {reason}"
        )))
    };
    if name.is_empty() {
        return reject("empty");
    }
    if name.len() > MAX_FILENAME_LEN {
        return reject("too long");
    }
    if name == "." || name == ".." {
        return reject("reserved name");
    }
    if name.contains('/') || name.contains('\\') {
        return reject("path separator");
    }
    if name.contains("..") {
        return reject("parent traversal");
    }
    if name.starts_with('-') {
        return reject("leading dash");
    }
    if name.bytes().any(|b| b.is_ascii_control()) {
        return reject("control character");
    }
    Ok(())
}
