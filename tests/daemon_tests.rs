use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::BorrowedFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use uvars::daemon::dispatch::{wait_for, Interest};
use uvars::daemon::{DaemonClient, DaemonConfig, Startup, UniversalDaemon};
use uvars::VariableStore;

struct Harness {
    dir: TempDir,
}

struct Running {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<UniversalDaemon>>,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn socket(&self) -> PathBuf {
        self.dir.path().join("uvarsd.socket.test")
    }

    fn vars(&self) -> PathBuf {
        self.dir.path().join("vars")
    }

    fn config() -> DaemonConfig {
        DaemonConfig {
            sync_every: 16,
            exit_when_idle: false,
            poll_timeout: Duration::from_millis(20),
        }
    }

    fn start(&self, config: DaemonConfig) -> Running {
        let mut daemon = UniversalDaemon::new(self.socket(), self.vars(), config);
        assert_eq!(daemon.bind().unwrap(), Startup::Bound);
        let shutdown = daemon.shutdown_handle();
        let handle = thread::spawn(move || {
            daemon.run().unwrap();
            daemon
        });
        Running {
            shutdown,
            handle: Some(handle),
        }
    }

    fn client(&self) -> DaemonClient {
        let mut client = DaemonClient::new(self.socket(), Arc::new(VariableStore::new()));
        assert!(client.connect(), "client failed to connect");
        client
    }

    fn raw(&self) -> (BufReader<UnixStream>, UnixStream) {
        let stream = UnixStream::connect(self.socket()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let writer = stream.try_clone().unwrap();
        (BufReader::new(stream), writer)
    }
}

impl Running {
    fn stop(mut self) -> UniversalDaemon {
        self.shutdown.store(true, Ordering::Relaxed);
        self.handle.take().unwrap().join().unwrap()
    }

    fn wait_for_exit(&mut self, limit: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < limit {
            if self.handle.as_ref().is_some_and(|h| h.is_finished()) {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn read_until(reader: &mut BufReader<UnixStream>, wanted: &str) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).unwrap();
        assert!(n > 0, "connection closed before '{}'", wanted);
        let line = line.trim_end_matches('\n').to_string();
        let done = line == wanted;
        lines.push(line);
        if done {
            return lines;
        }
    }
}

#[test]
fn test_set_reaches_other_client_after_barrier() {
    let harness = Harness::new();
    let _daemon = harness.start(Harness::config());

    let mut a = harness.client();
    let mut b = harness.client();

    a.set("color", "red", false).unwrap();
    assert!(b.barrier());
    assert_eq!(b.store().get("color").as_deref(), Some("red"));
}

#[test]
fn test_export_and_erase_propagate() {
    let harness = Harness::new();
    let _daemon = harness.start(Harness::config());

    let mut a = harness.client();
    let mut b = harness.client();

    a.set("PATH_EXTRA", "/opt/bin", true).unwrap();
    assert!(b.barrier());
    assert_eq!(b.store().get("PATH_EXTRA").as_deref(), Some("/opt/bin"));
    assert!(b.store().get_export("PATH_EXTRA"));

    assert!(a.remove("PATH_EXTRA").unwrap());
    assert!(b.barrier());
    assert!(b.store().get("PATH_EXTRA").is_none());
}

#[test]
fn test_new_client_receives_full_state() {
    let harness = Harness::new();
    let _daemon = harness.start(Harness::config());

    let mut a = harness.client();
    a.set("one", "1", false).unwrap();
    a.set("two", "2 two", true).unwrap();

    let late = harness.client();
    assert_eq!(late.store().get("one").as_deref(), Some("1"));
    assert_eq!(late.store().get("two").as_deref(), Some("2 two"));
    assert!(late.store().get_export("two"));
}

#[test]
fn test_greeting_precedes_state() {
    let harness = Harness::new();
    let _daemon = harness.start(Harness::config());

    let mut a = harness.client();
    a.set("x", "1", false).unwrap();

    let (mut reader, mut writer) = harness.raw();
    writer.write_all(b"BARRIER\n").unwrap();
    let lines = read_until(&mut reader, "BARRIER_REPLY");
    assert!(lines[0].starts_with('#'));
    assert_eq!(&lines[1..], &["SET x:1", "BARRIER_REPLY"]);
}

#[test]
fn test_malformed_line_keeps_connection() {
    let harness = Harness::new();
    let _daemon = harness.start(Harness::config());
    let mut observer = harness.client();

    let (mut reader, mut writer) = harness.raw();
    writer
        .write_all(b"SET nocolon\nFROB x\nSET bad name:1\nSET ok:1\nBARRIER\n")
        .unwrap();
    let lines = read_until(&mut reader, "BARRIER_REPLY");
    assert_eq!(lines.last().map(String::as_str), Some("BARRIER_REPLY"));

    writer.write_all(b"SET after:2\nBARRIER\n").unwrap();
    read_until(&mut reader, "BARRIER_REPLY");

    assert!(observer.barrier());
    assert_eq!(observer.store().get("ok").as_deref(), Some("1"));
    assert_eq!(observer.store().get("after").as_deref(), Some("2"));
    assert!(observer.store().get("nocolon").is_none());
}

#[test]
fn test_updates_relayed_verbatim_to_everyone() {
    let harness = Harness::new();
    let _daemon = harness.start(Harness::config());

    let (mut sender, mut sender_w) = harness.raw();
    let (mut receiver, mut receiver_w) = harness.raw();
    sender_w.write_all(b"BARRIER\n").unwrap();
    read_until(&mut sender, "BARRIER_REPLY");
    receiver_w.write_all(b"BARRIER\n").unwrap();
    read_until(&mut receiver, "BARRIER_REPLY");

    sender_w.write_all(b"set_export Mixed:caf\\xe9\nBARRIER\n").unwrap();
    let sender_lines = read_until(&mut sender, "BARRIER_REPLY");
    assert_eq!(sender_lines, vec!["set_export Mixed:caf\\xe9", "BARRIER_REPLY"]);

    receiver_w.write_all(b"BARRIER\n").unwrap();
    let lines = read_until(&mut receiver, "BARRIER_REPLY");
    assert_eq!(lines, vec!["set_export Mixed:caf\\xe9", "BARRIER_REPLY"]);
}

#[test]
fn test_later_write_from_other_shell_wins() {
    let harness = Harness::new();
    let _daemon = harness.start(Harness::config());

    let mut a = harness.client();
    a.set("x", "1", false).unwrap();

    let (mut other, mut other_w) = harness.raw();
    other_w.write_all(b"SET x:2\nBARRIER\n").unwrap();
    read_until(&mut other, "BARRIER_REPLY");

    assert!(a.barrier());
    assert_eq!(a.store().get("x").as_deref(), Some("2"));
    assert!(a.store().modified_names().is_empty());
}

#[test]
fn test_erase_seen_on_next_readable_event() {
    let harness = Harness::new();
    let _daemon = harness.start(Harness::config());

    let mut a = harness.client();
    let mut b = harness.client();
    a.set("foo", "1", false).unwrap();
    assert!(b.barrier());
    assert!(b.store().get_names(true, true).contains(&"foo".to_string()));

    assert!(a.remove("foo").unwrap());

    let deadline = Instant::now() + Duration::from_secs(5);
    while b.store().get("foo").is_some() && Instant::now() < deadline {
        let fd = b.fd().unwrap();
        // SAFETY: the descriptor belongs to `b`, which outlives this wait.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if wait_for(borrowed, Interest::Read, Some(Duration::from_millis(100))).unwrap() {
            assert!(b.read_all());
        }
    }
    assert!(!b.store().get_names(true, true).contains(&"foo".to_string()));
}

#[test]
fn test_persists_every_n_updates() {
    let harness = Harness::new();
    let _daemon = harness.start(DaemonConfig {
        sync_every: 2,
        ..Harness::config()
    });

    let mut a = harness.client();
    a.set("first", "1", false).unwrap();
    assert!(!harness.vars().exists());
    a.set("second", "2", false).unwrap();

    let contents = fs::read_to_string(harness.vars()).unwrap();
    assert!(contents.contains("SET first:1\n"));
    assert!(contents.contains("SET second:2\n"));
}

#[test]
fn test_state_survives_restart() {
    let harness = Harness::new();
    let daemon = harness.start(Harness::config());
    {
        let mut a = harness.client();
        a.set("kept", "yes", true).unwrap();
        a.set("dropped", "no", false).unwrap();
        a.remove("dropped").unwrap();
    }
    drop(daemon.stop());
    assert!(!harness.socket().exists());

    let _daemon = harness.start(Harness::config());
    let b = harness.client();
    assert_eq!(b.store().get("kept").as_deref(), Some("yes"));
    assert!(b.store().get_export("kept"));
    assert!(b.store().get("dropped").is_none());
}

#[test]
fn test_client_reconnects_and_replays_after_restart() {
    let harness = Harness::new();
    let daemon = harness.start(Harness::config());

    let mut a = harness.client();
    a.set("before", "1", false).unwrap();
    drop(daemon.stop());

    let _daemon = harness.start(Harness::config());
    a.set("after", "2", false).unwrap();
    assert!(a.is_connected());

    let b = harness.client();
    assert_eq!(b.store().get("before").as_deref(), Some("1"));
    assert_eq!(b.store().get("after").as_deref(), Some("2"));
}

#[test]
fn test_exits_when_last_client_leaves() {
    let harness = Harness::new();
    let mut daemon = harness.start(DaemonConfig {
        exit_when_idle: true,
        ..Harness::config()
    });

    assert!(!daemon.wait_for_exit(Duration::from_millis(100)));
    {
        let mut a = harness.client();
        a.set("bye", "1", false).unwrap();
    }
    assert!(daemon.wait_for_exit(Duration::from_secs(5)));
    let finished = daemon.stop();
    assert_eq!(finished.client_count(), 0);
    assert_eq!(finished.store().get("bye").as_deref(), Some("1"));
    assert!(fs::read_to_string(harness.vars()).unwrap().contains("SET bye:1\n"));
}
