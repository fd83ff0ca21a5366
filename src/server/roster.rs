//! The connected-client roster.

use std::collections::HashMap;
use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use tracing::debug;

/// Session lifecycle; forward transitions only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Authenticated,
    Idle,
    Uploading,
    Processing,
    Disconnecting,
}

impl ClientState {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientState::Connecting => "Connecting",
            ClientState::Authenticated => "Authenticated",
            ClientState::Idle => "Idle",
            ClientState::Uploading => "Uploading",
            ClientState::Processing => "Processing",
            ClientState::Disconnecting => "Disconnecting",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot row for the control plane.
#[derive(Debug, Clone)]
pub struct ClientView {
    pub id: u32,
    pub addr: SocketAddr,
    pub state: ClientState,
    pub connected_secs: u64,
    pub active_jobs: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub name: String,
    pub platform: String,
}

struct ClientRecord {
    id: u32,
    addr: SocketAddr,
    state: ClientState,
    connected_at: SystemTime,
    last_activity: Instant,
    bytes_sent: u64,
    bytes_received: u64,
    active_jobs: u32,
    name: String,
    platform: String,
    /// Clone of the connection's stream, kept for forced teardown.
    stream: TcpStream,
}

struct RosterInner {
    clients: HashMap<u32, ClientRecord>,
    next_id: u32,
}

pub struct Roster {
    inner: Mutex<RosterInner>,
    max_clients: usize,
}

impl Roster {
    pub fn new(max_clients: usize) -> Self {
        Self {
            inner: Mutex::new(RosterInner {
                clients: HashMap::new(),
                next_id: 1,
            }),
            max_clients,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RosterInner> {
        self.inner.lock().expect("roster lock poisoned")
    }

    /// Admit a connection and assign its stable id. `None` means the session
    /// cap is reached and the caller must drop the connection.
    pub fn register(&self, addr: SocketAddr, stream: TcpStream) -> Option<u32> {
        let mut inner = self.lock();
        if inner.clients.len() >= self.max_clients {
            return None;
        }
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1).max(1);
        inner.clients.insert(
            id,
            ClientRecord {
                id,
                addr,
                state: ClientState::Connecting,
                connected_at: SystemTime::now(),
                last_activity: Instant::now(),
                bytes_sent: 0,
                bytes_received: 0,
                active_jobs: 0,
                name: String::new(),
                platform: String::new(),
                stream,
            },
        );
        debug!(client_id = id, %addr, "client registered");
        Some(id)
    }

    pub fn remove(&self, id: u32) {
        if self.lock().clients.remove(&id).is_some() {
            debug!(client_id = id, "client removed");
        }
    }

    pub fn touch(&self, id: u32) {
        if let Some(record) = self.lock().clients.get_mut(&id) {
            record.last_activity = Instant::now();
        }
    }

    /// Disconnecting is sticky: an operator mark survives later session
    /// updates so the connection thread observes it.
    pub fn set_state(&self, id: u32, state: ClientState) {
        if let Some(record) = self.lock().clients.get_mut(&id) {
            if record.state != ClientState::Disconnecting {
                record.state = state;
            }
        }
    }

    pub fn state_of(&self, id: u32) -> Option<ClientState> {
        self.lock().clients.get(&id).map(|record| record.state)
    }

    pub fn set_identity(&self, id: u32, name: &str, platform: &str) {
        if let Some(record) = self.lock().clients.get_mut(&id) {
            record.name = name.to_string();
            record.platform = platform.to_string();
        }
    }

    pub fn add_bytes(&self, id: u32, sent: u64, received: u64) {
        if let Some(record) = self.lock().clients.get_mut(&id) {
            record.bytes_sent += sent;
            record.bytes_received += received;
        }
    }

    pub fn set_active_jobs(&self, id: u32, active_jobs: u32) {
        if let Some(record) = self.lock().clients.get_mut(&id) {
            record.active_jobs = active_jobs;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn views(&self) -> Vec<ClientView> {
        let now = SystemTime::now();
        let inner = self.lock();
        let mut views: Vec<ClientView> = inner
            .clients
            .values()
            .map(|record| ClientView {
                id: record.id,
                addr: record.addr,
                state: record.state,
                connected_secs: now
                    .duration_since(record.connected_at)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
                active_jobs: record.active_jobs,
                bytes_sent: record.bytes_sent,
                bytes_received: record.bytes_received,
                name: record.name.clone(),
                platform: record.platform.clone(),
            })
            .collect();
        views.sort_by_key(|view| view.id);
        views
    }

    /// Mark a session `Disconnecting`; with `force` its transport is shut
    /// down immediately, which unblocks the connection thread.
    pub fn disconnect(&self, id: u32, force: bool) -> Result<(), ()> {
        let inner = &mut *self.lock();
        let record = inner.clients.get_mut(&id).ok_or(())?;
        record.state = ClientState::Disconnecting;
        if force {
            let _ = record.stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }

    /// Sessions with no activity for longer than `timeout`.
    pub fn idle_ids(&self, timeout: Duration) -> Vec<u32> {
        let now = Instant::now();
        self.lock()
            .clients
            .values()
            .filter(|record| now.duration_since(record.last_activity) > timeout)
            .map(|record| record.id)
            .collect()
    }

    /// Shut every transport down, for process shutdown.
    pub fn shutdown_all(&self) {
        for record in self.lock().clients.values() {
            let _ = record.stream.shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn register_assigns_ids_and_respects_cap() {
        let roster = Roster::new(2);
        let (_c1, s1) = pair();
        let (_c2, s2) = pair();
        let (_c3, s3) = pair();
        let addr = s1.peer_addr().unwrap();

        let a = roster.register(addr, s1).unwrap();
        let b = roster.register(addr, s2).unwrap();
        assert_ne!(a, b);
        assert!(roster.register(addr, s3).is_none());

        roster.remove(a);
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn views_reflect_updates() {
        let roster = Roster::new(8);
        let (_client, server) = pair();
        let addr = server.peer_addr().unwrap();
        let id = roster.register(addr, server).unwrap();

        roster.set_identity(id, "t", "x");
        roster.set_state(id, ClientState::Idle);
        roster.add_bytes(id, 10, 20);
        roster.set_active_jobs(id, 2);

        let views = roster.views();
        assert_eq!(views.len(), 1);
        let view = &views[0];
        assert_eq!(view.name, "t");
        assert_eq!(view.state, ClientState::Idle);
        assert_eq!(view.bytes_sent, 10);
        assert_eq!(view.bytes_received, 20);
        assert_eq!(view.active_jobs, 2);
    }

    #[test]
    fn idle_detection_uses_last_activity() {
        let roster = Roster::new(8);
        let (_client, server) = pair();
        let addr = server.peer_addr().unwrap();
        let id = roster.register(addr, server).unwrap();

        assert!(roster.idle_ids(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(roster.idle_ids(Duration::from_millis(10)), vec![id]);

        roster.touch(id);
        assert!(roster.idle_ids(Duration::from_millis(10)).is_empty());
    }

    #[test]
    fn disconnect_unknown_client_is_an_error() {
        let roster = Roster::new(8);
        assert!(roster.disconnect(404, false).is_err());
    }
}
