//! Universal variable daemon binary
//!
//! Runs the per-user daemon in the foreground, or reports whether one is
//! running.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixStream;
use std::process;
use uvars::config::UvarConfig;
use uvars::daemon::{DaemonConfig, Startup, UniversalDaemon};
use uvars::logging;
use uvars::notifier::new_notifier_for_strategy;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("start");

    match command {
        "start" => start_daemon(),
        "status" => check_status(),
        "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        _ => {
            eprintln!("Error: Unknown command '{}'", command);
            print_usage();
            process::exit(1);
        }
    }
}

fn start_daemon() -> Result<()> {
    let config = UvarConfig::from_env();
    logging::init(config.verbose);

    let notifier = new_notifier_for_strategy(config.notifier_strategy(), &config);
    let mut daemon = UniversalDaemon::from_config(&config, DaemonConfig::from_env())
        .context("Failed to configure universal variable daemon")?
        .with_notifier(notifier);
    daemon.setup_signal_handlers()?;

    match daemon.start()? {
        Startup::AlreadyRunning => {
            eprintln!("Daemon is already running at {}", config.socket_path().display());
        }
        Startup::Bound => {}
    }
    Ok(())
}

fn check_status() -> Result<()> {
    let config = UvarConfig::from_env();
    let socket_path = config.socket_path();

    if !socket_path.exists() {
        println!("Daemon is not running (socket not found).");
        return Ok(());
    }

    match UnixStream::connect(&socket_path) {
        Ok(_stream) => println!("Daemon is running at {}", socket_path.display()),
        Err(_) => {
            println!("Socket file exists but daemon is not responding.");
            println!("This may be a stale socket; 'uvarsd start' will replace it.");
        }
    }
    match config.vars_path() {
        Ok(path) => println!("Variables file: {}", path.display()),
        Err(e) => println!("Variables file: unavailable ({})", e),
    }

    Ok(())
}

fn print_usage() {
    println!("Universal variable daemon v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: uvarsd [command]");
    println!();
    println!("Commands:");
    println!("  start      Run the daemon in the foreground (default)");
    println!("  status     Check daemon status");
    println!("  -h, --help Show this help message");
    println!();
    println!("Environment:");
    println!("  UVAR_SOCKET_DIR, UVAR_USER   Socket location");
    println!("  UVAR_FILE                    Variables file");
    println!("  UVAR_SYNC_EVERY              Updates between saves (default 16)");
    println!("  UVAR_EXIT_WHEN_IDLE          Exit when the last client leaves (default true)");
    println!("  UVAR_VERBOSE, RUST_LOG       Logging");
}
