//! Public TCP listener and client sessions.

mod conn;
mod roster;
mod session;

pub use roster::{ClientState, ClientView, Roster};
pub use session::{Session, SessionAction, SessionBackend};

use std::net::TcpListener;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::service::ServiceState;

const ACCEPT_POLL: Duration = Duration::from_millis(25);

/// Accept public connections until shutdown. Each accepted connection gets a
/// roster slot and its own thread; beyond the session cap connections are
/// dropped at accept.
pub(crate) fn run_acceptor(listener: TcpListener, state: Arc<ServiceState>) {
    if let Err(err) = listener.set_nonblocking(true) {
        warn!("acceptor failed to set nonblocking: {err}");
        return;
    }

    loop {
        if state.shutdown.load(Ordering::Relaxed) {
            break;
        }

        match listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false).ok();
                let Ok(roster_handle) = stream.try_clone() else {
                    warn!(%addr, "failed to clone accepted stream");
                    continue;
                };
                match state.roster.register(addr, roster_handle) {
                    Some(client_id) => {
                        state.stats.client_connected();
                        info!(client_id, %addr, "client connected");
                        let conn_state = Arc::clone(&state);
                        let spawned = thread::Builder::new()
                            .name(format!("client-{client_id}"))
                            .spawn(move || {
                                conn::run_connection(conn_state, stream, client_id, addr)
                            });
                        if let Err(err) = spawned {
                            warn!(client_id, "failed to spawn connection thread: {err}");
                            state.roster.remove(client_id);
                            state.stats.client_disconnected();
                        }
                    }
                    None => {
                        warn!(%addr, "session cap reached, dropping connection");
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                warn!("accept error: {err}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}
