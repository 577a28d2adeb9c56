//! Shell-side connection to the universal variable daemon
//!
//! The client keeps a local [`VariableStore`] in step with the daemon. Local
//! writes are applied immediately, queued to the daemon and confirmed with a
//! barrier. When the daemon goes away the client reconnects, launching it if
//! a launcher is configured, and replays whatever was not yet confirmed.
//!
//! The daemon relays every update to every client, the writer included, in
//! the order it applied them. Until a write's echo comes back, updates to the
//! same name were applied by the daemon before it and are skipped; after the
//! echo, everything is applied as received.

use std::collections::{HashMap, VecDeque};
use std::env;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::daemon::connection::Connection;
use crate::daemon::dispatch::{wait_for, Interest};
use crate::daemon::protocol::{Event, Message};
use crate::error::Result;
use crate::store::VariableStore;

/// Reconnect attempts before the client gives up for the rest of the process
pub const RECONNECT_COUNT: u32 = 32;

/// Connect retries after launching the daemon
pub const DEFAULT_RETRY_COUNT: usize = 15;

/// Delay between those retries
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Single wait while a barrier is outstanding
const BARRIER_POLL: Duration = Duration::from_millis(250);

/// Consecutive idle waits before a barrier is abandoned
const BARRIER_IDLE_LIMIT: u32 = 40;

/// Starts the daemon when it cannot be reached
pub type Launcher = Box<dyn FnMut() -> io::Result<()> + Send>;

/// Progress of the outstanding barrier, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierState {
    Idle,
    /// The barrier is queued but not fully written
    AwaitingSend,
    /// The barrier is written; waiting for its reply
    AwaitingReply,
}

pub struct DaemonClient {
    socket_path: PathBuf,
    conn: Option<Connection<UnixStream>>,
    store: Arc<VariableStore>,
    launcher: Option<Launcher>,
    connect_attempts: u32,
    state: BarrierState,
    /// Writes sent whose echo has not arrived yet, oldest first
    in_flight: HashMap<String, VecDeque<Event>>,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>, store: Arc<VariableStore>) -> Self {
        Self {
            socket_path: socket_path.into(),
            conn: None,
            store,
            launcher: None,
            connect_attempts: 0,
            state: BarrierState::Idle,
            in_flight: HashMap::new(),
        }
    }

    pub fn with_launcher(mut self, launcher: Launcher) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn store(&self) -> &Arc<VariableStore> {
        &self.store
    }

    pub fn state(&self) -> BarrierState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// No connection and no reconnect attempts left: every operation is
    /// local-only from here on
    pub fn is_degraded(&self) -> bool {
        self.conn.is_none() && self.connect_attempts >= RECONNECT_COUNT
    }

    /// Descriptor the host should watch for readability
    pub fn fd(&self) -> Option<RawFd> {
        self.conn.as_ref().map(|c| c.stream().as_raw_fd())
    }

    /// Connect and pull the daemon's full state.
    pub fn connect(&mut self) -> bool {
        if self.conn.is_none() && !self.reconnect() {
            return false;
        }
        self.barrier()
    }

    pub fn set(&mut self, name: &str, value: &str, exported: bool) -> Result<()> {
        let message = Message::set(name, value, exported)?;
        self.store.set(name, value, exported)?;
        self.send_and_confirm(
            &message,
            Event::Set {
                name: name.to_string(),
                value: value.to_string(),
                exported,
            },
        );
        Ok(())
    }

    /// Erase `name`, returning whether it existed locally
    pub fn remove(&mut self, name: &str) -> Result<bool> {
        let message = Message::erase(name)?;
        let existed = self.store.remove(name)?;
        self.send_and_confirm(
            &message,
            Event::Erase {
                name: name.to_string(),
            },
        );
        Ok(existed)
    }

    fn send_and_confirm(&mut self, message: &Message, event: Event) {
        match self.conn.as_mut() {
            Some(conn) => {
                conn.enqueue(message);
                self.track(event);
                self.barrier();
            }
            None => debug!("not connected to the daemon; change kept locally"),
        }
    }

    fn track(&mut self, event: Event) {
        if let Some(name) = event.name() {
            let name = name.to_string();
            self.in_flight.entry(name).or_default().push_back(event);
        }
    }

    /// Whether `update` belongs to a name with a write in flight. The echo of
    /// that write retires it; anything else was applied by the daemon before
    /// it and is stale.
    fn absorb_in_flight(&mut self, update: &Event) -> bool {
        let Some(name) = update.name() else {
            return false;
        };
        let Some(queue) = self.in_flight.get_mut(name) else {
            return false;
        };
        if queue.front() == Some(update) {
            queue.pop_front();
            if queue.is_empty() {
                self.in_flight.remove(name);
            }
        } else {
            debug!("skipping update to '{}' older than a local write", name);
        }
        true
    }

    /// Wait until the daemon has seen everything sent so far and everything
    /// it sent before the reply has been applied.
    ///
    /// Returns `false` when no daemon could be reached; the local table is
    /// still usable.
    pub fn barrier(&mut self) -> bool {
        loop {
            if self.conn.is_none() && !self.reconnect() {
                self.state = BarrierState::Idle;
                return false;
            }
            if self.run_barrier() {
                // Every write sent before the barrier has been applied.
                self.store.clear_modified();
                self.in_flight.clear();
                return true;
            }
            warn!("Lost connection to universal variable daemon during barrier");
            self.conn = None;
            self.state = BarrierState::Idle;
        }
    }

    fn run_barrier(&mut self) -> bool {
        let Some(conn) = self.conn.as_mut() else {
            return false;
        };
        conn.enqueue(&Message::barrier());
        self.state = BarrierState::AwaitingSend;
        let mut idle_waits = 0;

        loop {
            let (frames, dead, pending) = match self.conn.as_mut() {
                Some(conn) => {
                    conn.flush_nonblocking();
                    let frames = conn.read_available();
                    (frames, conn.is_dead(), conn.has_pending())
                }
                None => return false,
            };

            if self.state == BarrierState::AwaitingSend && !pending {
                self.state = BarrierState::AwaitingReply;
            }
            for frame in frames {
                self.handle_event(frame.event);
            }
            if self.state == BarrierState::Idle {
                return true;
            }
            if dead {
                return false;
            }

            let interest = if pending { Interest::ReadWrite } else { Interest::Read };
            let ready = match self.conn.as_ref() {
                Some(conn) => wait_for(conn.stream().as_fd(), interest, Some(BARRIER_POLL)),
                None => return false,
            };
            match ready {
                Ok(true) => idle_waits = 0,
                Ok(false) => {
                    idle_waits += 1;
                    if idle_waits >= BARRIER_IDLE_LIMIT {
                        warn!("Universal variable daemon stopped answering");
                        return false;
                    }
                }
                Err(e) => {
                    warn!("Error waiting for universal variable daemon: {}", e);
                    return false;
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::BarrierReply => {
                if self.state == BarrierState::AwaitingReply {
                    self.state = BarrierState::Idle;
                } else {
                    debug!("ignoring unexpected barrier reply");
                }
            }
            Event::Barrier => debug!("ignoring barrier request from daemon"),
            update => {
                if !self.absorb_in_flight(&update) {
                    self.store.apply_remote(&update);
                }
            }
        }
    }

    /// Service a readable socket: apply everything the daemon sent.
    ///
    /// A lost connection triggers a reconnect and resync. Returns `false`
    /// when the client is left without a daemon.
    pub fn read_all(&mut self) -> bool {
        let Some(conn) = self.conn.as_mut() else {
            return self.connect();
        };
        conn.flush_nonblocking();
        let frames = conn.read_available();
        let dead = conn.is_dead();

        for frame in frames {
            self.handle_event(frame.event);
        }
        if dead {
            warn!("Lost connection to universal variable daemon");
            self.conn = None;
            return self.connect();
        }
        true
    }

    /// Open a fresh connection and queue every unconfirmed local write.
    fn reconnect(&mut self) -> bool {
        if self.connect_attempts >= RECONNECT_COUNT {
            return false;
        }
        self.conn = None;
        let Some(stream) = self.open_socket() else {
            if self.is_degraded() {
                warn!("Giving up on universal variable daemon; variables are local to this process");
            }
            return false;
        };

        let mut conn = Connection::new(stream);
        self.store.retain_modified();
        self.in_flight.clear();
        for event in self.store.pending_writes() {
            match Message::from_event(&event) {
                Ok(message) => {
                    conn.enqueue(&message);
                    self.track(event);
                }
                Err(e) => warn!("not replaying {:?}: {}", event.name(), e),
            }
        }
        self.conn = Some(conn);
        true
    }

    fn open_socket(&mut self) -> Option<UnixStream> {
        self.connect_attempts += 1;

        match connect_nonblocking(&self.socket_path) {
            Ok(stream) => return Some(stream),
            Err(e) => debug!("connecting to {} failed: {}", self.socket_path.display(), e),
        }

        let launcher = self.launcher.as_mut()?;
        info!("Starting universal variable daemon");
        if let Err(e) = launcher() {
            warn!("Could not launch universal variable daemon: {}", e);
            return None;
        }

        for attempt in 0..DEFAULT_RETRY_COUNT {
            if attempt > 0 {
                thread::sleep(DEFAULT_RETRY_DELAY);
            }
            if let Ok(stream) = connect_nonblocking(&self.socket_path) {
                return Some(stream);
            }
        }
        warn!(
            "Could not connect to universal variable daemon at {}",
            self.socket_path.display()
        );
        None
    }

    /// Send everything still queued, blocking if necessary, then disconnect.
    pub fn close(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if conn.has_pending() {
            if let Err(e) = conn.stream().set_nonblocking(false) {
                debug!("could not switch socket to blocking: {}", e);
            }
            conn.flush_nonblocking();
        }
    }
}

impl Drop for DaemonClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn connect_nonblocking(path: &Path) -> io::Result<UnixStream> {
    let stream = UnixStream::connect(path)?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}

/// Launch `uvarsd` from the directory of the running executable
pub fn spawn_daemon() -> io::Result<()> {
    let exe_path = env::current_exe()?;
    let exe_dir = exe_path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Cannot determine executable directory"))?;
    let daemon_path = exe_dir.join("uvarsd");

    Command::new(&daemon_path)
        .arg("start")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(())
}
