use std::os::fd::BorrowedFd;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use uvars::config::{SyncMode, UvarConfig};
use uvars::daemon::dispatch::{wait_for, Interest};
use uvars::daemon::Event;
use uvars::notifier::NotifierStrategy;
use uvars::UniversalVars;

// The notifier is chosen once per process, so this binary holds a single test.

fn uvar(dir: &Path, args: &[&str]) {
    let output = Command::new(env!("CARGO_BIN_EXE_uvar"))
        .args(args)
        .env("UVAR_MODE", "file")
        .env("UVAR_NOTIFIER", "pipe")
        .env("UVAR_USER", "tester")
        .env("UVAR_FILE", dir.join("vars"))
        .env("UVAR_RUNTIME_DIR", dir)
        .env("UVAR_SOCKET_DIR", dir)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute uvar");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
}

fn wait_readable(uvars: &mut UniversalVars) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let Some(fd) = uvars.watch_fd() else {
            // Still draining an earlier notification.
            uvars.poll();
            thread::sleep(Duration::from_millis(10));
            continue;
        };
        // SAFETY: the descriptor belongs to `uvars`, which outlives this wait.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if wait_for(borrowed, Interest::Read, Some(Duration::from_millis(100))).unwrap() {
            return uvars.on_readable(fd);
        }
    }
    false
}

#[test]
fn test_named_pipe_wakes_watcher_for_other_process_changes() {
    let dir = TempDir::new().unwrap();
    let config = UvarConfig {
        mode: SyncMode::File,
        notifier: Some(NotifierStrategy::NamedPipe),
        user: Some("tester".to_string()),
        vars_path: Some(dir.path().join("vars")),
        runtime_dir: Some(dir.path().to_path_buf()),
        socket_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut watcher = UniversalVars::open(
        &config,
        Some(Arc::new(move |e: &Event| sink.lock().unwrap().push(e.clone()))),
    );
    assert!(watcher.watch_fd().is_some());
    assert_eq!(watcher.poll_interval(), None);

    uvar(dir.path(), &["set", "-x", "EDITOR", "vim"]);
    assert!(wait_readable(&mut watcher));
    assert_eq!(watcher.get("EDITOR").as_deref(), Some("vim"));
    assert!(watcher.get_export("EDITOR"));

    // The poster exited without draining; polling clears the pipe.
    let deadline = Instant::now() + Duration::from_secs(5);
    while watcher.watch_fd().is_none() && Instant::now() < deadline {
        watcher.poll();
        thread::sleep(Duration::from_millis(20));
    }
    assert!(watcher.watch_fd().is_some());

    uvar(dir.path(), &["erase", "EDITOR"]);
    assert!(wait_readable(&mut watcher));
    assert!(watcher.get("EDITOR").is_none());

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            Event::Set {
                name: "EDITOR".to_string(),
                value: "vim".to_string(),
                exported: true
            },
            Event::Erase {
                name: "EDITOR".to_string()
            },
        ]
    );
}
