//! Time-limited process steps with bounded output capture.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::warn;

use super::{ExecError, TIMEOUT_EXIT_CODE};

const TRUNCATION_MARKER: &[u8] = b"\n[truncated]\n";
const POLL_INTERVAL: Duration = Duration::from_millis(20);
const KILL_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct StepOutcome {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub elapsed: Duration,
    pub timed_out: bool,
}

/// One running compile or execute step: `sh -c <command>` with the sandbox
/// as working directory and both output pipes drained concurrently.
pub struct Step {
    child: Child,
    started: Instant,
    stdout_drain: JoinHandle<Vec<u8>>,
    stderr_drain: JoinHandle<Vec<u8>>,
}

impl Step {
    pub fn spawn(dir: &Path, command: &str, output_cap: usize) -> Result<Self, ExecError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ExecError::LaunchFailed)?;

        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");
        let stdout_drain = thread::spawn(move || drain(stdout, output_cap));
        let stderr_drain = thread::spawn(move || drain(stderr, output_cap));

        Ok(Self {
            child,
            started: Instant::now(),
            stdout_drain,
            stderr_drain,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Block until the child exits or the wall clock expires. On expiry the
    /// child gets SIGTERM, one second of grace, then SIGKILL.
    pub fn wait(mut self, timeout: Duration) -> Result<StepOutcome, ExecError> {
        let pid = self.child.id();
        let deadline = self.started + timeout;

        let mut status: Option<ExitStatus> = None;
        loop {
            match self.child.try_wait() {
                Ok(Some(done)) => {
                    status = Some(done);
                    break;
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(source) => return Err(ExecError::WaitFailed { pid, source }),
            }
        }

        let (exit_code, timed_out) = match status {
            Some(status) => (exit_code_of(status), false),
            None => {
                if let Err(err) = terminate_pid(pid) {
                    warn!(pid, "terminate failed, escalating: {err}");
                }
                let grace_deadline = Instant::now() + KILL_GRACE;
                let mut reaped = false;
                while Instant::now() < grace_deadline {
                    match self.child.try_wait() {
                        Ok(Some(_)) => {
                            reaped = true;
                            break;
                        }
                        Ok(None) => thread::sleep(POLL_INTERVAL),
                        Err(source) => return Err(ExecError::WaitFailed { pid, source }),
                    }
                }
                if !reaped {
                    self.child
                        .kill()
                        .map_err(|source| ExecError::KillFailed { pid, source })?;
                    self.child
                        .wait()
                        .map_err(|source| ExecError::WaitFailed { pid, source })?;
                }
                (TIMEOUT_EXIT_CODE, true)
            }
        };

        let elapsed = self.started.elapsed();
        let stdout = self.stdout_drain.join().unwrap_or_default();
        let stderr = self.stderr_drain.join().unwrap_or_default();

        Ok(StepOutcome {
            exit_code,
            stdout,
            stderr,
            elapsed,
            timed_out,
        })
    }
}

/// Graceful terminate. A process that is already gone is not an error; the
/// cancel path races normal completion by design.
pub fn terminate_pid(pid: u32) -> Result<(), ExecError> {
    signal_pid(pid, Signal::SIGTERM)
}

pub fn kill_pid(pid: u32) -> Result<(), ExecError> {
    signal_pid(pid, Signal::SIGKILL)
}

fn signal_pid(pid: u32, signal: Signal) -> Result<(), ExecError> {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(errno) => Err(ExecError::KillFailed {
            pid,
            source: std::io::Error::from_raw_os_error(errno as i32),
        }),
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        match status.code() {
            Some(code) => code,
            None => 128 + status.signal().unwrap_or(0),
        }
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

/// Drain a pipe fully (so the child never blocks on a full pipe) while
/// storing at most `cap` bytes, ending with a marker when capped.
fn drain(mut stream: impl Read, cap: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if out.len() < cap {
                    let take = n.min(cap - out.len());
                    out.extend_from_slice(&buf[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    if truncated {
        out.extend_from_slice(TRUNCATION_MARKER);
    }
    out
}
