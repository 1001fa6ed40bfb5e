//! The `crewd` command line.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! crewd start
//!
//! # Start the daemon (background/daemonized)
//! crewd start -d
//!
//! # Stop the daemon
//! crewd stop
//!
//! # Check daemon status
//! crewd status
//!
//! # Persist or clear the agent binary override
//! crewd config set-binary /opt/agent/bin/claude
//! crewd config set-binary --clear
//! crewd config show
//!
//! # List agent installations
//! crewd discover
//!
//! # Start with custom socket path and debug logging
//! CREW_SOCKET=/run/crew.sock RUST_LOG=crewd=debug crewd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown, attached agent processes are killed

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;
use crate::launcher::{BinaryDiscovery, Launcher, TokioSpawner};
use crate::registry::spawn_registry;
use crate::server::DaemonServer;

/// crew daemon - coding agent session orchestrator
#[derive(Parser, Debug)]
#[command(name = "crewd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
    /// Show or change persisted settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List agent CLI installations found on this machine
    Discover,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Persist the agent binary to launch
    SetBinary {
        /// Path to the agent executable
        #[arg(required_unless_present = "clear")]
        path: Option<PathBuf>,

        /// Remove the override and go back to discovery
        #[arg(long, conflicts_with = "path")]
        clear: bool,
    },
    /// Print the effective configuration
    Show,
}

/// Entry point of the `crewd` binary.
pub fn run() -> Result<()> {
    let args = Args::parse();

    // No subcommand means start in the foreground.
    let command = args.command.unwrap_or(Command::Start { daemon: false });

    match command {
        Command::Start { daemon } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'crewd stop' to stop it first.");
                process::exit(1);
            }

            let config = DaemonConfig::load().context("Failed to load configuration")?;

            if daemon {
                // Must happen before the tokio runtime starts.
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon(config);
            remove_pid_file();
            result
        }
        Command::Stop => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                return Ok(());
            };

            println!("Stopping daemon (PID {pid})...");
            stop_daemon(pid)?;

            for _ in 0..50 {
                if !is_process_running(pid) {
                    println!("Daemon stopped.");
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(100));
            }

            eprintln!("Daemon did not stop within 5 seconds.");
            process::exit(1);
        }
        Command::Status => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                process::exit(1);
            };

            println!("Daemon is running (PID {pid})");
            let config = DaemonConfig::load().unwrap_or_default();
            if config.socket_path.exists() {
                println!("Socket: {}", config.socket_path.display());
            }
            Ok(())
        }
        Command::Config { action } => run_config(action),
        Command::Discover => run_discover(),
    }
}

fn run_config(action: ConfigAction) -> Result<()> {
    let path = DaemonConfig::default_path()?;
    match action {
        ConfigAction::SetBinary { path: binary, clear } => {
            let binary = if clear { None } else { binary };
            let config = DaemonConfig::set_binary_override(&path, binary)?;
            match &config.binary_path {
                Some(binary) => println!("Agent binary set to {}", binary.display()),
                None => println!("Agent binary override cleared"),
            }
            println!("Saved {}", path.display());
        }
        ConfigAction::Show => {
            let config = DaemonConfig::load()?;
            println!("# {}", path.display());
            print!("{}", toml::to_string_pretty(&config)?);
            if let Some(env_binary) = &config.env_binary {
                println!(
                    "# {} overrides the binary: {}",
                    crate::config::ENV_AGENT_BINARY,
                    env_binary.display()
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn run_discover() -> Result<()> {
    let config = DaemonConfig::load()?;
    let discovery = BinaryDiscovery::from_config(&config);

    let found = discovery.discover_all().await;
    if found.is_empty() {
        bail!(
            "No '{}' installation found; set one with 'crewd config set-binary <path>'",
            discovery.binary_name()
        );
    }

    let selected = discovery.resolve().await.ok();
    for binary in &found {
        let marker = match &selected {
            Some(selected) if selected.path == binary.path => "*",
            _ => " ",
        };
        println!(
            "{marker} {:<60} {:<12} ({})",
            binary.path.display(),
            binary.version.as_deref().unwrap_or("unknown"),
            binary.source
        );
    }
    Ok(())
}

// ============================================================================
// PID and log files
// ============================================================================

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("crew")
}

/// Returns the path to the PID file.
fn pid_file_path() -> PathBuf {
    state_dir().join("crewd.pid")
}

/// Returns the path to the log file.
fn log_file_path() -> PathBuf {
    state_dir().join("crewd.log")
}

/// Reads the PID from the PID file, if it exists.
fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

/// Writes the current PID to the PID file.
fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

/// Checks if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// Returns the daemon's PID, removing a stale PID file.
fn is_daemon_running() -> Option<u32> {
    let pid = read_pid()?;
    if is_process_running(pid) {
        return Some(pid);
    }
    remove_pid_file();
    None
}

/// Sends SIGTERM to the daemon process.
fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let pid = i32::try_from(pid).context("PID out of range")?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems (pid {pid})");
    }
    Ok(())
}

/// Daemonizes the current process, sending output to the log file.
fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

// ============================================================================
// Daemon
// ============================================================================

/// Runs the daemon (async entry point).
#[tokio::main]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("crewd=info".parse()?)
                .add_directive("crew_core=info".parse()?)
                .add_directive("crew_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "crew daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let discovery = BinaryDiscovery::from_config(&config);
    match discovery.resolve().await {
        Ok(binary) => info!(
            path = %binary.path.display(),
            source = %binary.source,
            "Agent binary found"
        ),
        // Launches report BinaryNotFound until one is installed.
        Err(e) => warn!(error = %e, "No agent binary found yet"),
    }

    let launcher = Launcher::new(discovery, Arc::new(TokioSpawner))
        .with_config_file(DaemonConfig::default_path().ok())
        .with_default_model(config.default_model.clone());
    let registry = spawn_registry(Arc::new(launcher), config.registry_config());
    info!("Session registry started");

    let server = DaemonServer::new(&config.socket_path, registry.clone(), cancel_token);
    info!(socket = %config.socket_path.display(), "Starting server");

    let result = server.run().await;
    registry.shutdown_all().await;

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("crew daemon stopped");
    Ok(())
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
