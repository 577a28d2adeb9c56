//! Universal variables as seen by a shell
//!
//! [`UniversalVars`] is what the environment subsystem talks to. In daemon
//! mode changes travel through the daemon's socket; in file mode every
//! process reads and writes the variables file itself and wakes the others
//! through the process-wide notifier.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{SyncMode, UvarConfig};
use crate::daemon::client::{DaemonClient, Launcher};
use crate::error::Result;
use crate::notifier::{default_notifier, init_default_notifier};
use crate::store::{ChangeCallback, VariableStore};

enum Backend {
    Daemon(DaemonClient),
    File,
}

pub struct UniversalVars {
    store: Arc<VariableStore>,
    vars_path: Option<PathBuf>,
    backend: Backend,
}

impl UniversalVars {
    /// Connect according to `config`. Never fails: without a daemon or a
    /// variables file the variables are simply local to this process.
    pub fn open(config: &UvarConfig, callback: Option<ChangeCallback>) -> Self {
        Self::open_with_launcher(config, callback, None)
    }

    /// Like [`open`](Self::open), starting the daemon with `launcher` if it
    /// is not running
    pub fn open_with_launcher(config: &UvarConfig, callback: Option<ChangeCallback>, launcher: Option<Launcher>) -> Self {
        let store = Arc::new(match callback {
            Some(callback) => VariableStore::with_callback(callback),
            None => VariableStore::new(),
        });
        let vars_path = match config.vars_path() {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("{}; universal variables will not be saved", e);
                None
            }
        };

        let backend = match config.mode {
            SyncMode::Daemon => {
                let mut client = DaemonClient::new(config.socket_path(), Arc::clone(&store));
                if let Some(launcher) = launcher {
                    client = client.with_launcher(launcher);
                }
                if !client.connect() {
                    warn!("Could not connect to universal variable daemon; variables are local to this process");
                }
                Backend::Daemon(client)
            }
            SyncMode::File => {
                init_default_notifier(config);
                if let Some(path) = &vars_path {
                    store.load(path);
                }
                Backend::File
            }
        };

        Self {
            store,
            vars_path,
            backend,
        }
    }

    pub fn mode(&self) -> SyncMode {
        match self.backend {
            Backend::Daemon(_) => SyncMode::Daemon,
            Backend::File => SyncMode::File,
        }
    }

    pub fn vars_path(&self) -> Option<&Path> {
        self.vars_path.as_deref()
    }

    pub fn store(&self) -> &Arc<VariableStore> {
        &self.store
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.store.get(name)
    }

    pub fn get_export(&self, name: &str) -> bool {
        self.store.get_export(name)
    }

    pub fn get_names(&self, show_exported: bool, show_unexported: bool) -> Vec<String> {
        self.store.get_names(show_exported, show_unexported)
    }

    pub fn set(&mut self, name: &str, value: &str, exported: bool) -> Result<()> {
        match &mut self.backend {
            Backend::Daemon(client) => client.set(name, value, exported),
            Backend::File => self.store.set(name, value, exported),
        }
    }

    pub fn remove(&mut self, name: &str) -> Result<bool> {
        match &mut self.backend {
            Backend::Daemon(client) => client.remove(name),
            Backend::File => self.store.remove(name),
        }
    }

    /// Make local changes visible to other processes and pick up theirs.
    ///
    /// In file mode this saves and posts a notification.
    pub fn barrier(&mut self) -> bool {
        if let Backend::Daemon(client) = &mut self.backend {
            return client.barrier();
        }
        self.sync_file()
    }

    fn sync_file(&mut self) -> bool {
        let Some(path) = self.vars_path.as_deref() else {
            return false;
        };
        let report = self.store.sync_reporting(path);
        self.store.announce(&report.changes);
        if report.wrote {
            default_notifier().post_notification();
        }
        report.wrote
    }

    /// Re-read the variables file, reporting external changes through the
    /// change callback. Returns whether anything changed.
    pub fn refresh(&mut self) -> bool {
        let Some(path) = self.vars_path.as_deref() else {
            return false;
        };
        match self.store.load_reporting(path) {
            Some(changes) if !changes.is_empty() => {
                debug!(count = changes.len(), "picked up external changes");
                self.store.announce(&changes);
                true
            }
            _ => false,
        }
    }

    /// Descriptor to wait on for readability, if any
    pub fn watch_fd(&self) -> Option<RawFd> {
        match &self.backend {
            Backend::Daemon(client) => client.fd(),
            Backend::File => default_notifier().notification_fd(),
        }
    }

    /// How often [`poll`](Self::poll) should run; `None` if never
    pub fn poll_interval(&self) -> Option<Duration> {
        match &self.backend {
            Backend::Daemon(_) => None,
            Backend::File => Some(default_notifier().poll_interval()).filter(|d| !d.is_zero()),
        }
    }

    /// `fd` from [`watch_fd`](Self::watch_fd) became readable
    pub fn on_readable(&mut self, fd: RawFd) -> bool {
        if let Backend::Daemon(client) = &mut self.backend {
            return client.read_all();
        }
        let changed = default_notifier().on_fd_readable(fd);
        changed && self.refresh()
    }

    /// Periodic check for changes by other processes
    pub fn poll(&mut self) -> bool {
        if let Backend::Daemon(_) = self.backend {
            return false;
        }
        let changed = default_notifier().poll();
        changed && self.refresh()
    }
}
