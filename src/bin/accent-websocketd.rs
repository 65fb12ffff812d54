//! accent-websocketd - WebSocket gateway for bus events
//!
//! Authenticated WebSocket clients subscribe to bus events and receive
//! them as JSON text frames.
//!
//! # Usage
//!
//! ```bash
//! # Start the gateway (foreground)
//! accent-websocketd start
//!
//! # Start the gateway (background/daemonized)
//! accent-websocketd start -d
//!
//! # Use another configuration file
//! accent-websocketd --config ./config.toml start
//!
//! # Stop the gateway
//! accent-websocketd stop
//!
//! # Check gateway status
//! accent-websocketd status
//! ```

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use websocketd::config::{Config, ProcessWorkers, DEFAULT_CONFIG_PATH};
use websocketd::controller::Controller;
use websocketd::logging;

/// accent-websocketd - WebSocket gateway for bus events
#[derive(Parser, Debug)]
#[command(name = "accent-websocketd", version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,

    /// Number of workers, a positive integer or "auto"
    #[arg(long, global = true, value_parser = parse_workers)]
    workers: Option<ProcessWorkers>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the gateway
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running gateway
    Stop,
    /// Show gateway status
    Status,
}

fn parse_workers(value: &str) -> Result<ProcessWorkers, String> {
    match value.parse::<i64>() {
        Ok(count) => Ok(ProcessWorkers::Count(count)),
        Err(_) => Ok(ProcessWorkers::Named(value.to_string())),
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    let mut file = File::open(path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create PID directory")?;
    }
    let mut file = File::create(path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running(pid_file: &Path) -> Option<u32> {
    if let Some(pid) = read_pid(pid_file) {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file(pid_file);
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let pid = i32::try_from(pid).context("PID out of range")?;
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;

    if args.debug {
        config.debug = true;
    }
    if let Some(workers) = &args.workers {
        config.process_workers = workers.clone();
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let pid_file = config.pid_file.clone();

    let command = args.command.unwrap_or(Command::Start { daemon: false });

    match command {
        Command::Start { daemon } => {
            if let Some(pid) = is_daemon_running(&pid_file) {
                eprintln!("Gateway is already running (PID {pid})");
                eprintln!("Use 'accent-websocketd stop' to stop it first.");
                process::exit(1);
            }

            if daemon {
                daemonize(&config.log_file)?;
            }

            write_pid(&pid_file)?;

            let result = run_daemon(config);

            remove_pid_file(&pid_file);

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running(&pid_file) {
                println!("Stopping gateway (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Gateway stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Gateway did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Gateway is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running(&pid_file) {
                println!("Gateway is running (PID {pid})");
                println!("Listening on: {}", config.websocket.bind_address());
                Ok(())
            } else {
                println!("Gateway is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize(log_path: &Path) -> Result<()> {
    use daemonize::Daemonize;

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::options()
        .create(true)
        .append(true)
        .open(log_path)
        .context("Failed to open log file for stdout")?;
    let stderr = stdout.try_clone().context("Failed to open log file for stderr")?;

    let daemonize = Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start().context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config: Config) -> Result<()> {
    logging::init(config.debug)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "accent-websocketd starting"
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

    let controller = Controller::new(config, cancel_token)?;

    if let Err(e) = controller.run().await {
        error!(error = %e, "Gateway error");
        return Err(e);
    }

    info!("accent-websocketd stopped");
    Ok(())
}

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
