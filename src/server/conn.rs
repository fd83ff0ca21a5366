//! Per-connection driver: owns the socket, feeds the session machine.

use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::proto::{FrameError, FrameReader, FrameWriter, HEADER_LEN};
use crate::service::ServiceState;

use super::session::{Session, SessionAction};
use super::ClientState;

pub(crate) fn run_connection(
    state: Arc<ServiceState>,
    stream: TcpStream,
    client_id: u32,
    addr: SocketAddr,
) {
    if let Err(err) = drive(&state, &stream, client_id) {
        debug!(client_id, %addr, "connection ended: {err}");
    }

    // Teardown: cancel the client's jobs, drop its staging area, remove the
    // roster entry.
    state.sched.cancel_client_jobs(client_id);
    state.remove_staging(client_id);
    state.roster.remove(client_id);
    state.stats.client_disconnected();
    info!(client_id, %addr, "client disconnected");
}

fn drive(
    state: &Arc<ServiceState>,
    stream: &TcpStream,
    client_id: u32,
) -> Result<(), FrameError> {
    let timeout = state.tunables.client_timeout();
    stream.set_nodelay(true).ok();
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut reader = FrameReader::new(BufReader::new(stream.try_clone()?));
    let mut writer = FrameWriter::new(BufWriter::new(stream.try_clone()?));
    let mut session = Session::new(client_id);

    loop {
        if state.shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }

        let (header, body) = match reader.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()), // peer closed
            Err(FrameError::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                info!(client_id, "client inactive, tearing down");
                return Ok(());
            }
            // Framing errors tear the transport down without a response byte.
            Err(err) => return Err(err),
        };

        state.roster.touch(client_id);
        let received = (HEADER_LEN + body.len()) as u64;
        state.roster.add_bytes(client_id, 0, received);
        state.stats.add_bytes_received(received);

        let actions = session.handle(header.kind, header.correlation_id, &body, state.as_ref());

        let mut closing = false;
        for action in actions {
            match action {
                SessionAction::Send(message) => match writer.write_message(&message) {
                    Ok(sent) => {
                        state.roster.add_bytes(client_id, sent as u64, 0);
                        state.stats.add_bytes_sent(sent as u64);
                    }
                    Err(err) => {
                        warn!(client_id, "write failed: {err}");
                        closing = true;
                        break;
                    }
                },
                SessionAction::Close => closing = true,
            }
        }

        state.roster.set_state(client_id, session.state());
        state.roster.set_active_jobs(client_id, session.active_jobs());

        if closing {
            return Ok(());
        }
        // An operator may have marked this session for disconnect.
        if state.roster.state_of(client_id) == Some(ClientState::Disconnecting) {
            return Ok(());
        }
    }
}
