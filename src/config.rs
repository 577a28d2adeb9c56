//! Process configuration from the environment
//!
//! - UVAR_MODE (daemon, file)
//! - UVAR_NOTIFIER (default, shmem, pipe, platform, null)
//! - UVAR_VERBOSE (debug logging)
//! - UVAR_SOCKET_DIR, UVAR_USER (socket location)
//! - UVAR_FILE (variables file)
//! - UVAR_RUNTIME_DIR (notifier pipe and shared memory)
//!
//! Everything resolves to a path under the user's control: the socket is
//! per user, the variables file per user and host.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Result, UvarError};
use crate::notifier::{resolve_default_strategy, NotifierStrategy};

pub const SOCKET_PREFIX: &str = "uvarsd.socket.";
pub const VARS_FILE_PREFIX: &str = ".uvarsd.";

/// Longest hostname kept in the variables file name
const HOSTNAME_MAX: usize = 255;

/// How a process shares its variables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Through the daemon's socket
    #[default]
    Daemon,
    /// Directly through the variables file, woken by a notifier
    File,
}

impl SyncMode {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "file" => SyncMode::File,
            _ => SyncMode::Daemon,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UvarConfig {
    pub mode: SyncMode,
    /// `None` picks the platform default
    pub notifier: Option<NotifierStrategy>,
    pub verbose: bool,
    pub socket_dir: Option<PathBuf>,
    pub user: Option<String>,
    pub vars_path: Option<PathBuf>,
    pub runtime_dir: Option<PathBuf>,
}

impl UvarConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(val) = non_empty("UVAR_MODE") {
            config.mode = SyncMode::from_str(&val);
        }
        if let Some(val) = non_empty("UVAR_NOTIFIER") {
            config.notifier = NotifierStrategy::from_name(&val);
        }
        if let Some(val) = non_empty("UVAR_VERBOSE") {
            config.verbose = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        config.socket_dir = non_empty("UVAR_SOCKET_DIR").map(PathBuf::from);
        config.user = non_empty("UVAR_USER");
        config.vars_path = non_empty("UVAR_FILE").map(PathBuf::from);
        config.runtime_dir = non_empty("UVAR_RUNTIME_DIR").map(PathBuf::from);

        config
    }

    pub fn user_name(&self) -> String {
        self.user.clone().unwrap_or_else(whoami::username)
    }

    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(env::temp_dir)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir().join(format!("{}{}", SOCKET_PREFIX, self.user_name()))
    }

    /// `~/.uvarsd.<hostname>` unless overridden
    pub fn vars_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.vars_path {
            return Ok(path.clone());
        }
        let home = dirs::home_dir().ok_or(UvarError::NoHomeDirectory)?;
        Ok(default_vars_path(&home, &hostname_identifier()))
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir
            .clone()
            .or_else(dirs::runtime_dir)
            .unwrap_or_else(env::temp_dir)
    }

    pub fn notifier_pipe_path(&self) -> PathBuf {
        self.runtime_dir()
            .join(format!("uvars.{}.notifier", self.user_name()))
    }

    pub fn shmem_path(&self) -> PathBuf {
        self.runtime_dir().join(format!("uvars.{}.shmem", self.user_name()))
    }

    pub fn notifier_strategy(&self) -> NotifierStrategy {
        self.notifier.unwrap_or_else(resolve_default_strategy)
    }
}

pub fn default_vars_path(home: &Path, host: &str) -> PathBuf {
    home.join(format!("{}{}", VARS_FILE_PREFIX, host))
}

/// This machine's hostname, or `nohost` if it has none
pub fn hostname_identifier() -> String {
    let name = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name: String = name.chars().take(HOSTNAME_MAX).collect();
    if name.is_empty() {
        "nohost".to_string()
    } else {
        name
    }
}
