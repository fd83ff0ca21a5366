use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use smeltd::{service, telemetry, Config, Service};

/// Networked code compilation and execution service.
#[derive(Debug, Parser)]
#[command(name = "smeltd", version, about)]
struct Cli {
    /// Public TCP port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// Control-plane socket path.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Configuration file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Service root for processing/, outgoing/ and logs/.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Increase log verbosity (-d for debug, -dd for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    /// Detach from the controlling terminal and log to files.
    #[arg(long)]
    daemon: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("smeltd: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(socket) = cli.socket {
        config.admin_socket = socket;
    }
    if let Some(root) = cli.root {
        config.root = root;
    }
    if cli.daemon {
        config.log_to_file = true;
    }

    let log_dir = config.log_to_file.then(|| config.root.join("logs"));
    let _telemetry = telemetry::init(cli.debug, log_dir.as_deref());

    if cli.daemon {
        if let Err(err) = nix::unistd::daemon(false, false) {
            eprintln!("smeltd: failed to daemonize: {err}");
            return ExitCode::FAILURE;
        }
    }

    let handle = match Service::new(config).start() {
        Ok(handle) => handle,
        Err(err) => {
            tracing::error!("startup failed: {err}");
            eprintln!("smeltd: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = service::install_signal_handlers(&handle.shutdown_flag()) {
        tracing::error!("failed to install signal handlers: {err}");
        handle.shutdown();
        return ExitCode::FAILURE;
    }

    handle.wait();
    ExitCode::SUCCESS
}
