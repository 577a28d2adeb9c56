//! Universal variable daemon
//!
//! One process per user owns the authoritative table. It accepts shells on
//! a Unix socket, relays every update to every shell including its sender,
//! answers barriers and saves the table to the variables file every few
//! updates and on exit.
//! Everything runs on one thread around a `poll(2)` loop.

use nix::sys::signal;
use std::fs;
use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::UvarConfig;
use crate::daemon::config::DaemonConfig;
use crate::daemon::connection::Connection;
use crate::daemon::dispatch::{Dispatcher, Interest, Readiness};
use crate::daemon::protocol::{Event, Message};
use crate::error::{Result, UvarError};
use crate::notifier::Notifier;
use crate::store::{lock_path_for, FileLock, LockMode, VariableStore};

/// Maximum concurrent clients
const MAX_CLIENTS: usize = 256;

/// How long startup waits for another starting daemon
const STARTUP_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// First line every client receives
pub const GREETING: &str = " uvarsd universal variable daemon";

/// Result of trying to become the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    /// This process owns the socket
    Bound,
    /// Another daemon already answers on the socket
    AlreadyRunning,
}

struct Client {
    id: u64,
    conn: Connection<UnixStream>,
}

pub struct UniversalDaemon {
    socket_path: PathBuf,
    vars_path: PathBuf,
    listener: Option<UnixListener>,
    owns_socket: bool,
    clients: Vec<Client>,
    next_id: u64,
    store: VariableStore,
    config: DaemonConfig,
    notifier: Option<Box<dyn Notifier>>,
    shutdown: Arc<AtomicBool>,
    updates_since_sync: usize,
    served_any: bool,
}

impl UniversalDaemon {
    pub fn new(socket_path: impl Into<PathBuf>, vars_path: impl Into<PathBuf>, config: DaemonConfig) -> Self {
        Self {
            socket_path: socket_path.into(),
            vars_path: vars_path.into(),
            listener: None,
            owns_socket: false,
            clients: Vec::new(),
            next_id: 0,
            store: VariableStore::new(),
            config,
            notifier: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            updates_since_sync: 0,
            served_any: false,
        }
    }

    /// Daemon at the paths `config` derives
    pub fn from_config(config: &UvarConfig, daemon_config: DaemonConfig) -> Result<Self> {
        Ok(Self::new(config.socket_path(), config.vars_path()?, daemon_config))
    }

    /// Post to `notifier` whenever a save writes the file
    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn store(&self) -> &VariableStore {
        &self.store
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Setting this flag stops the loop within one poll timeout
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Stop cleanly on SIGTERM, SIGINT and SIGHUP
    pub fn setup_signal_handlers(&self) -> Result<()> {
        for sig in [signal::SIGTERM, signal::SIGINT, signal::SIGHUP] {
            signal_hook::flag::register(sig as i32, Arc::clone(&self.shutdown))?;
        }
        Ok(())
    }

    /// Take ownership of the socket unless a live daemon already has it.
    pub fn bind(&mut self) -> Result<Startup> {
        if SocketAddr::from_pathname(&self.socket_path).is_err() {
            return Err(UvarError::SocketPathTooLong(self.socket_path.clone()));
        }
        if let Some(dir) = self.socket_path.parent() {
            fs::create_dir_all(dir)?;
        }

        // Serialises concurrent starts; released once the socket is bound.
        let _lock = FileLock::acquire(&lock_path_for(&self.socket_path), LockMode::Exclusive, STARTUP_LOCK_TIMEOUT)?;

        if UnixStream::connect(&self.socket_path).is_ok() {
            info!("Universal variable daemon already running on {}", self.socket_path.display());
            return Ok(Startup::AlreadyRunning);
        }

        // Nobody answers, so any socket file left here is stale.
        match fs::remove_file(&self.socket_path) {
            Ok(()) => debug!("removed stale socket {}", self.socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        self.owns_socket = true;

        let mut perms = fs::metadata(&self.socket_path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&self.socket_path, perms)?;

        listener.set_nonblocking(true)?;
        self.listener = Some(listener);
        Ok(Startup::Bound)
    }

    /// Bind and serve until shutdown or idle exit
    pub fn start(&mut self) -> Result<Startup> {
        if self.bind()? == Startup::AlreadyRunning {
            return Ok(Startup::AlreadyRunning);
        }
        info!("Universal variable daemon started on {}", self.socket_path.display());
        self.run()?;
        Ok(Startup::Bound)
    }

    /// Serve on the bound socket, then save.
    pub fn run(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "Socket not bound"))?;

        if !self.store.load(&self.vars_path) {
            debug!("starting with an empty table");
        }

        let result = self.serve(&listener);

        self.listener = Some(listener);
        info!("Shutting down universal variable daemon");
        self.persist();
        result
    }

    fn serve(&mut self, listener: &UnixListener) -> Result<()> {
        while !self.shutdown.load(Ordering::Relaxed) {
            let (listener_ready, ready) = self.wait_for_activity(listener)?;

            if listener_ready {
                self.accept_clients(listener);
            }
            for (index, readiness) in ready.iter().enumerate() {
                if readiness.readable {
                    self.service_client(index);
                }
            }
            for client in &mut self.clients {
                client.conn.flush_nonblocking();
            }
            self.reap_dead();

            if self.config.exit_when_idle && self.served_any && self.clients.is_empty() {
                info!("No clients left, exiting");
                break;
            }
        }
        Ok(())
    }

    /// Readiness of the listener and of each client, in `clients` order
    fn wait_for_activity(&self, listener: &UnixListener) -> Result<(bool, Vec<Readiness>)> {
        let mut dispatcher = Dispatcher::new();
        let listener_token = dispatcher.register(listener.as_fd(), Interest::Read);
        let tokens: Vec<usize> = self
            .clients
            .iter()
            .map(|client| {
                let interest = if client.conn.has_pending() {
                    Interest::ReadWrite
                } else {
                    Interest::Read
                };
                dispatcher.register(client.conn.stream().as_fd(), interest)
            })
            .collect();

        dispatcher.wait(Some(self.config.poll_timeout))?;

        Ok((
            dispatcher.readiness(listener_token).readable,
            tokens.iter().map(|&t| dispatcher.readiness(t)).collect(),
        ))
    }

    fn accept_clients(&mut self, listener: &UnixListener) {
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    if self.clients.len() >= MAX_CLIENTS {
                        warn!("Maximum number of clients reached, rejecting connection");
                        continue;
                    }
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("Error accepting connection: {}", e);
                        continue;
                    }
                    self.add_client(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Error accepting connection: {}", e);
                    break;
                }
            }
        }
    }

    fn add_client(&mut self, stream: UnixStream) {
        let mut conn = Connection::new(stream);
        conn.enqueue(&Message::comment(GREETING));
        for (name, var) in self.store.snapshot() {
            match Message::set(&name, &var.value, var.exported) {
                Ok(message) => conn.enqueue(&message),
                Err(e) => warn!("not sending '{}': {}", name, e),
            }
        }
        conn.flush_nonblocking();

        let id = self.next_id;
        self.next_id += 1;
        debug!(client = id, queued = conn.pending(), "client connected");
        self.clients.push(Client { id, conn });
        self.served_any = true;
    }

    fn service_client(&mut self, index: usize) {
        let frames = self.clients[index].conn.read_available();

        for frame in frames {
            match frame.event {
                Event::Barrier => {
                    self.clients[index].conn.enqueue(&Message::barrier_reply());
                }
                Event::BarrierReply => {
                    debug!(client = self.clients[index].id, "ignoring barrier reply");
                }
                ref update => {
                    if let Err(e) = self.apply(update) {
                        warn!("{}", e);
                        continue;
                    }
                    // Relay the client's own bytes, to the sender too: the
                    // echo marks where its write sits among everyone else's.
                    let message = Message::from_line(update.kind(), &frame.line);
                    self.broadcast(&message);

                    self.updates_since_sync += 1;
                    if self.updates_since_sync >= self.config.sync_every {
                        self.persist();
                    }
                }
            }
        }
    }

    fn apply(&self, update: &Event) -> Result<()> {
        match update {
            Event::Set {
                name,
                value,
                exported,
            } => self.store.set(name, value, *exported),
            Event::Erase { name } => self.store.remove(name).map(|_| ()),
            Event::Barrier | Event::BarrierReply => Ok(()),
        }
    }

    /// Queue `message` on every live client
    fn broadcast(&mut self, message: &Message) {
        for client in self.clients.iter_mut() {
            if !client.conn.is_dead() {
                client.conn.enqueue(message);
            }
        }
    }

    /// Save the table; changes somebody else saved meanwhile are relayed to
    /// every client
    fn persist(&mut self) {
        self.updates_since_sync = 0;
        let report = self.store.sync_reporting(&self.vars_path);

        for event in &report.changes {
            match Message::from_event(event) {
                Ok(message) => self.broadcast(&message),
                Err(e) => warn!("not relaying external change: {}", e),
            }
        }
        if report.wrote {
            if let Some(notifier) = self.notifier.as_mut() {
                notifier.post_notification();
            }
        }
    }

    fn reap_dead(&mut self) {
        self.clients.retain_mut(|client| {
            if !client.conn.is_dead() {
                return true;
            }
            let released = client.conn.release_queue();
            debug!(client = client.id, released, "client disconnected");
            false
        });
    }
}

impl Drop for UniversalDaemon {
    fn drop(&mut self) {
        if self.owns_socket && self.socket_path.exists() {
            let _ = fs::remove_file(&self.socket_path);
        }
    }
}
