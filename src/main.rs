//! `uvar`: read, change and watch universal variables from the command line

use anyhow::{bail, Result};
use std::env;
use std::os::fd::BorrowedFd;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use uvars::config::{SyncMode, UvarConfig};
use uvars::daemon::dispatch::{wait_for, Interest};
use uvars::daemon::{spawn_daemon, Event};
use uvars::{logging, ChangeCallback, UniversalVars};

/// Wait between reconnect attempts while watching without a daemon
const IDLE_RETRY: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let config = UvarConfig::from_env();
    logging::init(config.verbose);

    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };
    let rest = &args[1..];

    match command.as_str() {
        "get" => cmd_get(&config, rest),
        "set" => cmd_set(&config, rest),
        "erase" => cmd_erase(&config, rest),
        "list" => cmd_list(&config, rest),
        "watch" => cmd_watch(&config),
        "-h" | "--help" => {
            print_usage();
            Ok(())
        }
        _ => {
            eprintln!("Error: Unknown command '{}'", command);
            print_usage();
            process::exit(2);
        }
    }
}

fn open(config: &UvarConfig, callback: Option<ChangeCallback>) -> UniversalVars {
    UniversalVars::open_with_launcher(config, callback, Some(Box::new(spawn_daemon)))
}

fn cmd_get(config: &UvarConfig, args: &[String]) -> Result<()> {
    let [name] = args else {
        bail!("usage: uvar get NAME");
    };
    let uvars = open(config, None);
    match uvars.get(name) {
        Some(value) => println!("{}", value),
        None => process::exit(1),
    }
    Ok(())
}

fn cmd_set(config: &UvarConfig, args: &[String]) -> Result<()> {
    let (exported, args) = match args.first().map(String::as_str) {
        Some("-x" | "--export") => (true, &args[1..]),
        _ => (false, args),
    };
    let Some((name, values)) = args.split_first() else {
        bail!("usage: uvar set [-x] NAME VALUE...");
    };

    let mut uvars = open(config, None);
    uvars.set(name, &values.join(" "), exported)?;
    if !uvars.barrier() {
        eprintln!("Warning: change could not be shared with other shells");
    }
    Ok(())
}

fn cmd_erase(config: &UvarConfig, args: &[String]) -> Result<()> {
    let [name] = args else {
        bail!("usage: uvar erase NAME");
    };
    let mut uvars = open(config, None);
    let existed = uvars.remove(name)?;
    uvars.barrier();
    if !existed {
        process::exit(1);
    }
    Ok(())
}

fn cmd_list(config: &UvarConfig, args: &[String]) -> Result<()> {
    let (exported, unexported) = match args.first().map(String::as_str) {
        None => (true, true),
        Some("-x" | "--export") => (true, false),
        Some("-u" | "--unexport") => (false, true),
        Some(other) => bail!("unknown option '{}'", other),
    };

    let uvars = open(config, None);
    let mut names = uvars.get_names(exported, unexported);
    names.sort();

    for name in names {
        let value = uvars.get(&name).unwrap_or_default();
        let flag = if uvars.get_export(&name) { "-x " } else { "" };
        println!("{}{} {}", flag, name, value);
    }
    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::Set {
            name,
            value,
            exported,
        } => {
            let flag = if *exported { "-x " } else { "" };
            println!("set {}{} {}", flag, name, value);
        }
        Event::Erase { name } => println!("erase {}", name),
        Event::Barrier | Event::BarrierReply => {}
    }
}

fn cmd_watch(config: &UvarConfig) -> Result<()> {
    let mut uvars = open(config, Some(Arc::new(print_event)));

    loop {
        let timeout = uvars.poll_interval();
        match uvars.watch_fd() {
            Some(fd) => {
                // SAFETY: the descriptor belongs to `uvars`, which outlives
                // this wait.
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                if wait_for(borrowed, Interest::Read, timeout)? {
                    uvars.on_readable(fd);
                }
            }
            None => {
                thread::sleep(timeout.unwrap_or(IDLE_RETRY));
                if uvars.mode() == SyncMode::Daemon {
                    uvars.barrier();
                }
            }
        }
        uvars.poll();
    }
}

fn print_usage() {
    println!("uvar v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: uvar <command> [args]");
    println!();
    println!("Commands:");
    println!("  get NAME              Print a universal variable");
    println!("  set [-x] NAME VALUE   Set a universal variable (-x exports it)");
    println!("  erase NAME            Erase a universal variable");
    println!("  list [-x|-u]          List universal variables");
    println!("  watch                 Print changes as other shells make them");
    println!("  -h, --help            Show this help message");
    println!();
    println!("Set UVAR_MODE=file to share through the variables file without a daemon.");
}
