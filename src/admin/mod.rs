//! Local control plane over a filesystem-namespace socket.
//!
//! One session at a time; further connections wait in the accept backlog.
//! The socket is mode 0600, so possession of filesystem access is the only
//! credential; the first message still must be `AdminConnect` before any
//! command is honored.

use std::fmt::Write as _;
use std::fs;
use std::io::{BufReader, BufWriter};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{info, warn};

use crate::config::TunableKey;
use crate::proto::{
    AdminCommand, ErrorCode, ErrorInfo, FrameError, FrameReader, FrameWriter, Message, MessageKind,
    Payload, ServerStatsRecord,
};
use crate::service::ServiceState;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("failed to remove stale admin socket {path}: {source}")]
    Unlink {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to bind admin socket {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to restrict admin socket {path}: {source}")]
    Permissions {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Bind the control socket, replacing a stale file, and restrict it to the
/// owning user.
pub fn bind_admin_socket(path: &Path) -> Result<UnixListener, AdminError> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(AdminError::Unlink {
                path: path.to_path_buf(),
                source,
            })
        }
    }
    let listener = UnixListener::bind(path).map_err(|source| AdminError::Bind {
        path: path.to_path_buf(),
        source,
    })?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| {
        AdminError::Permissions {
            path: path.to_path_buf(),
            source,
        }
    })?;
    Ok(listener)
}

/// Serve control-plane sessions until shutdown, one connection at a time.
pub(crate) fn run_admin(listener: UnixListener, state: Arc<ServiceState>) {
    if let Err(err) = listener.set_nonblocking(true) {
        warn!("admin listener failed to set nonblocking: {err}");
        return;
    }

    loop {
        if state.shutdown.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).ok();
                info!("admin connected");
                if let Err(err) = serve_session(stream, &state) {
                    warn!("admin session ended: {err}");
                }
                info!("admin disconnected");
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                warn!("admin accept error: {err}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

struct AdminSession {
    connected_at: Instant,
    last_activity: Instant,
    authenticated: bool,
    commands_executed: u32,
}

fn serve_session(stream: UnixStream, state: &Arc<ServiceState>) -> Result<(), FrameError> {
    let timeout = state.tunables.admin_timeout();
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut reader = FrameReader::new(BufReader::new(stream.try_clone()?));
    let mut writer = FrameWriter::new(BufWriter::new(stream.try_clone()?));
    let processor = CommandProcessor::new(Arc::clone(state));
    let mut session = AdminSession {
        connected_at: Instant::now(),
        last_activity: Instant::now(),
        authenticated: false,
        commands_executed: 0,
    };

    loop {
        if state.shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
        let (header, body) = match reader.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!(
                    commands = session.commands_executed,
                    connected_secs = session.connected_at.elapsed().as_secs(),
                    "admin session closed"
                );
                return Ok(());
            }
            Err(FrameError::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                info!(
                    commands = session.commands_executed,
                    idle_secs = session.last_activity.elapsed().as_secs(),
                    "admin session timed out"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        session.last_activity = Instant::now();

        let reply = processor.dispatch(&mut session, header.kind, header.correlation_id, &body);
        let closing = matches!(header.kind, MessageKind::AdminDisconnect);
        writer.write_message(&reply)?;
        if closing {
            return Ok(());
        }
    }
}

/// Executes admin commands against the live service state. All reads are
/// snapshots taken under the owning structure's lock; nothing here blocks
/// the scheduler or the sessions.
pub struct CommandProcessor {
    state: Arc<ServiceState>,
}

impl CommandProcessor {
    pub fn new(state: Arc<ServiceState>) -> Self {
        Self { state }
    }

    fn dispatch(
        &self,
        session: &mut AdminSession,
        kind: MessageKind,
        correlation_id: u32,
        body: &[u8],
    ) -> Message {
        if !kind.is_admin() {
            return error_reply(
                correlation_id,
                ErrorCode::InvalidArgument,
                format!("{kind} is not an admin command"),
            );
        }

        let command = match Payload::decode(kind, crate::proto::Origin::Client, body) {
            Ok(Payload::Admin(command)) => command,
            Ok(_) | Err(_) => {
                return error_reply(
                    correlation_id,
                    ErrorCode::InvalidArgument,
                    "malformed admin command",
                )
            }
        };

        if kind == MessageKind::AdminConnect {
            session.authenticated = true;
            info!("admin session authenticated");
            return Message::new(MessageKind::Ack, correlation_id, Payload::Ack);
        }
        if !session.authenticated {
            return error_reply(correlation_id, ErrorCode::Permission, "not authenticated");
        }

        session.commands_executed += 1;
        match kind {
            MessageKind::AdminDisconnect => {
                Message::new(MessageKind::Ack, correlation_id, Payload::Ack)
            }
            MessageKind::ListClients => self.list_clients(correlation_id),
            MessageKind::ListJobs => self.list_jobs(correlation_id),
            MessageKind::ServerStats => self.server_stats(correlation_id),
            MessageKind::DisconnectClient => self.disconnect_client(correlation_id, &command),
            MessageKind::KillJob => self.kill_job(correlation_id, &command),
            MessageKind::Shutdown => self.shutdown(correlation_id, &command),
            MessageKind::ConfigGet => self.config_get(correlation_id, &command),
            MessageKind::ConfigSet => self.config_set(correlation_id, &command),
            _ => error_reply(
                correlation_id,
                ErrorCode::InvalidArgument,
                format!("unhandled admin command {kind}"),
            ),
        }
    }

    fn list_clients(&self, correlation_id: u32) -> Message {
        let views = self.state.roster.views();
        let mut text = format!("Active Clients: {}\n\n", views.len());
        for view in views {
            let _ = writeln!(
                text,
                "id={} addr={} state={} connected={}s jobs={} sent={} recv={} name={:?} platform={:?}",
                view.id,
                view.addr,
                view.state,
                view.connected_secs,
                view.active_jobs,
                view.bytes_sent,
                view.bytes_received,
                view.name,
                view.platform,
            );
        }
        Message::new(
            MessageKind::ListClients,
            correlation_id,
            Payload::AdminText(text),
        )
    }

    fn list_jobs(&self, correlation_id: u32) -> Message {
        let jobs = self.state.sched.list();
        let mut text = format!("Jobs: {}\n\n", jobs.len());
        for job in jobs {
            let _ = writeln!(
                text,
                "id={} client={} lang={} mode={} state={} age={}s pid={} file={:?}",
                job.id,
                job.client_id,
                job.language,
                job.mode.as_str(),
                job.state,
                job.seconds_since_submit(),
                job.pid.unwrap_or(0),
                job.filename,
            );
        }
        Message::new(
            MessageKind::ListJobs,
            correlation_id,
            Payload::AdminText(text),
        )
    }

    fn server_stats(&self, correlation_id: u32) -> Message {
        let snap = self.state.stats.snapshot();
        let record = ServerStatsRecord {
            start_time: unix_secs(snap.started_at),
            current_time: unix_secs(SystemTime::now()),
            total_clients: snap.total_clients,
            active_clients: snap.active_clients,
            total_jobs: snap.total_jobs,
            active_jobs: snap.active_jobs,
            completed_jobs: snap.completed_jobs,
            failed_jobs: snap.failed_jobs,
            total_bytes_received: snap.total_bytes_received,
            total_bytes_sent: snap.total_bytes_sent,
        };
        Message::new(
            MessageKind::ServerStats,
            correlation_id,
            Payload::ServerStats(record),
        )
    }

    fn disconnect_client(&self, correlation_id: u32, command: &AdminCommand) -> Message {
        match self
            .state
            .roster
            .disconnect(command.target_id, command.force())
        {
            Ok(()) => {
                info!(
                    client_id = command.target_id,
                    force = command.force(),
                    "admin disconnect"
                );
                Message::new(MessageKind::Ack, correlation_id, Payload::Ack)
            }
            Err(()) => error_reply(
                correlation_id,
                ErrorCode::NotFound,
                format!("client {} not found", command.target_id),
            ),
        }
    }

    fn kill_job(&self, correlation_id: u32, command: &AdminCommand) -> Message {
        match self.state.sched.cancel(command.target_id, command.force()) {
            Ok(state) => {
                info!(
                    job_id = command.target_id,
                    force = command.force(),
                    state = %state,
                    "admin kill"
                );
                Message::new(MessageKind::Ack, correlation_id, Payload::Ack)
            }
            Err(err) => error_reply(correlation_id, ErrorCode::NotFound, err.to_string()),
        }
    }

    fn shutdown(&self, correlation_id: u32, command: &AdminCommand) -> Message {
        let delay = Duration::from_secs(u64::from(command.target_id));
        let force = command.force();
        info!(delay_secs = delay.as_secs(), force, "admin shutdown scheduled");

        let state = Arc::clone(&self.state);
        thread::spawn(move || {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            if force {
                state.sched.cancel_all(true);
            }
            state.shutdown.store(true, Ordering::Relaxed);
        });

        Message::new(MessageKind::Ack, correlation_id, Payload::Ack)
    }

    fn config_get(&self, correlation_id: u32, command: &AdminCommand) -> Message {
        let key_name = command.data.trim();
        if key_name.is_empty() {
            // Bare get lists the whole whitelist.
            let mut text = String::new();
            for key in TunableKey::ALL {
                let _ = writeln!(text, "{}={}", key, self.state.tunables.get(key));
            }
            return Message::new(
                MessageKind::ConfigGet,
                correlation_id,
                Payload::AdminText(text),
            );
        }
        match TunableKey::parse(key_name) {
            Some(key) => Message::new(
                MessageKind::ConfigGet,
                correlation_id,
                Payload::AdminText(format!("{}={}\n", key, self.state.tunables.get(key))),
            ),
            None => error_reply(
                correlation_id,
                ErrorCode::InvalidArgument,
                format!("unknown tunable {key_name:?}"),
            ),
        }
    }

    fn config_set(&self, correlation_id: u32, command: &AdminCommand) -> Message {
        let Some((key_name, raw_value)) = command.data.split_once('=') else {
            return error_reply(
                correlation_id,
                ErrorCode::InvalidArgument,
                "expected key=value",
            );
        };
        let Some(key) = TunableKey::parse(key_name.trim()) else {
            return error_reply(
                correlation_id,
                ErrorCode::InvalidArgument,
                format!("unknown tunable {:?}", key_name.trim()),
            );
        };
        let Ok(value) = raw_value.trim().parse::<u64>() else {
            return error_reply(
                correlation_id,
                ErrorCode::InvalidArgument,
                format!("{:?} is not an integer", raw_value.trim()),
            );
        };
        match self.state.tunables.set(key, value) {
            Ok(()) => {
                info!(%key, value, "tunable updated");
                Message::new(MessageKind::Ack, correlation_id, Payload::Ack)
            }
            Err(err) => error_reply(correlation_id, ErrorCode::InvalidArgument, err.to_string()),
        }
    }
}

fn error_reply(correlation_id: u32, code: ErrorCode, message: impl Into<String>) -> Message {
    Message::new(
        MessageKind::Error,
        correlation_id,
        Payload::Error(ErrorInfo::new(code, message, "admin")),
    )
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
