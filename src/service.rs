//! Service assembly.
//!
//! One `ServiceState` value owns every shared structure (roster, job table,
//! counters, registry, tunables); there are no ambient singletons. Threads:
//! the public acceptor, one per client connection, the admin loop, the job
//! worker, and the sweeper.

use std::fs;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{info, warn};

use crate::admin;
use crate::config::{Config, Tunables};
use crate::exec::{self, ExecError};
use crate::lang::Registry;
use crate::paths::ServiceRoot;
use crate::proto::Language;
use crate::sched::{run_worker, JobSnapshot, JobSpec, SchedError, Scheduler, WorkerContext};
use crate::server::{self, ClientState, Roster, SessionBackend};
use crate::stats::ServiceStats;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Shared state threaded through every subsystem.
pub struct ServiceState {
    pub(crate) config: Config,
    pub(crate) tunables: Arc<Tunables>,
    pub(crate) roster: Roster,
    pub(crate) sched: Arc<Scheduler>,
    pub(crate) stats: Arc<ServiceStats>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) root: ServiceRoot,
    pub(crate) shutdown: Arc<AtomicBool>,
}

impl ServiceState {
    pub(crate) fn remove_staging(&self, client_id: u32) {
        let dir = self.root.staging(client_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(client_id, dir = %dir.display(), "failed to remove staging: {err}"),
        }
    }
}

impl SessionBackend for ServiceState {
    fn language_available(&self, language: Language) -> bool {
        self.registry.is_available(language)
    }

    fn mode_supported(&self, language: Language, mode: crate::proto::ExecMode) -> bool {
        self.registry.mode_supported(language, mode)
    }

    fn max_file_size(&self) -> u64 {
        self.tunables.max_file_size()
    }

    fn client_identified(&self, client_id: u32, name: &str, platform: &str) {
        self.roster.set_identity(client_id, name, platform);
        self.roster.set_state(client_id, ClientState::Authenticated);
    }

    fn stage_file(&self, client_id: u32, filename: &str, bytes: &[u8]) -> Result<(), ExecError> {
        exec::validate_filename(filename)?;
        let dir = self.root.staging(client_id);
        let path = dir.join(filename);
        fs::create_dir_all(&dir)
            .and_then(|()| fs::write(&path, bytes))
            .map_err(|source| ExecError::SourceWrite { path, source })
    }

    fn staged_file(&self, client_id: u32, filename: &str) -> Option<Vec<u8>> {
        if exec::validate_filename(filename).is_err() {
            return None;
        }
        fs::read(self.root.staging(client_id).join(filename)).ok()
    }

    fn submit(&self, spec: JobSpec) -> Result<u32, SchedError> {
        self.sched.submit(spec)
    }

    fn job(&self, id: u32) -> Option<JobSnapshot> {
        self.sched.find(id)
    }
}

pub struct Service {
    config: Config,
}

impl Service {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Bind both listeners, launch every thread, and hand back the handle
    /// that joins them. Any failure here is a startup failure.
    pub fn start(self) -> crate::Result<ServiceHandle> {
        let config = self.config;
        config.validate()?;

        let root = ServiceRoot::new(&config.root);
        root.ensure()?;

        let registry = Arc::new(Registry::probe());
        let detected = registry.available().count();
        if detected == 0 {
            warn!("no toolchains detected; every compile request will be rejected");
        } else {
            info!(toolchains = detected, "compiler registry ready");
        }

        let listener = TcpListener::bind(("0.0.0.0", config.port))?;
        let local_addr = listener.local_addr()?;
        let admin_listener = admin::bind_admin_socket(&config.admin_socket)?;
        let admin_path = config.admin_socket.clone();

        let stats = Arc::new(ServiceStats::new());
        let tunables = Arc::new(Tunables::from_config(&config));
        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Arc::new(ServiceState {
            roster: Roster::new(config.max_clients),
            sched: Arc::new(Scheduler::new(config.max_queued_jobs, Arc::clone(&stats))),
            stats,
            registry,
            root: root.clone(),
            tunables,
            shutdown: Arc::clone(&shutdown),
            config,
        });

        let (shutdown_tx, shutdown_rx) = unbounded();
        let mut threads = Vec::new();

        {
            let state = Arc::clone(&state);
            threads.push(spawn_named("acceptor", move || {
                server::run_acceptor(listener, state)
            })?);
        }
        {
            let state = Arc::clone(&state);
            threads.push(spawn_named("admin", move || {
                admin::run_admin(admin_listener, state)
            })?);
        }
        {
            let ctx = WorkerContext {
                sched: Arc::clone(&state.sched),
                registry: Arc::clone(&state.registry),
                tunables: Arc::clone(&state.tunables),
                root,
                shutdown: Arc::clone(&shutdown),
                shutdown_rx: shutdown_rx.clone(),
            };
            threads.push(spawn_named("worker", move || run_worker(ctx))?);
        }
        {
            let state = Arc::clone(&state);
            let shutdown_rx = shutdown_rx.clone();
            threads.push(spawn_named("sweeper", move || run_sweeper(state, shutdown_rx))?);
        }

        info!(addr = %local_addr, admin = %admin_path.display(), "service started");

        Ok(ServiceHandle {
            state,
            threads,
            shutdown_tx: Some(shutdown_tx),
            local_addr,
            admin_path,
        })
    }
}

pub struct ServiceHandle {
    state: Arc<ServiceState>,
    threads: Vec<JoinHandle<()>>,
    shutdown_tx: Option<Sender<()>>,
    local_addr: SocketAddr,
    admin_path: PathBuf,
}

impl ServiceHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn admin_socket(&self) -> &Path {
        &self.admin_path
    }

    /// The flag SIGINT/SIGTERM handlers set.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.state.shutdown)
    }

    /// Block until something (a signal, an admin Shutdown) sets the flag,
    /// then tear everything down.
    pub fn wait(mut self) {
        while !self.state.shutdown.load(Ordering::Relaxed) {
            thread::sleep(SHUTDOWN_POLL);
        }
        self.finish();
    }

    /// Initiate shutdown and join every thread.
    pub fn shutdown(mut self) {
        self.state.shutdown.store(true, Ordering::Relaxed);
        self.finish();
    }

    fn finish(&mut self) {
        self.state.shutdown.store(true, Ordering::Relaxed);
        // Dropping the sender disconnects the channel, which every clone of
        // the receiver observes; that is the broadcast.
        self.shutdown_tx.take();
        self.state.roster.shutdown_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        match fs::remove_file(&self.admin_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to unlink admin socket: {err}"),
        }
        info!("service stopped");
    }
}

/// Register SIGINT and SIGTERM to set the shutdown flag. SIGPIPE is already
/// ignored by the runtime, which is what a socket server wants.
pub fn install_signal_handlers(flag: &Arc<AtomicBool>) -> std::io::Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(flag))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(flag))?;
    Ok(())
}

fn spawn_named(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name.to_string()).spawn(body)
}

/// Periodic maintenance: tear down inactive sessions and retire old jobs.
fn run_sweeper(state: Arc<ServiceState>, shutdown_rx: Receiver<()>) {
    let interval = Duration::from_secs(state.config.sweep_interval_secs);
    loop {
        crossbeam::select! {
            recv(shutdown_rx) -> _ => break,
            default(interval) => {}
        }
        if state.shutdown.load(Ordering::Relaxed) {
            break;
        }

        for client_id in state.roster.idle_ids(state.tunables.client_timeout()) {
            info!(client_id, "tearing down inactive session");
            let _ = state.roster.disconnect(client_id, true);
        }

        for dir in state.sched.sweep_retired(state.tunables.job_retention()) {
            if let Err(err) = exec::remove_sandbox_dir(&dir) {
                warn!(dir = %dir.display(), "sandbox removal failed: {err}");
            }
        }
    }
}
