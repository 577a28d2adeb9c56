//! Cross-process change notification
//!
//! A notifier tells processes that share the variables file directly that
//! somebody saved it. A process posts after it writes, and learns of other
//! writers either by polling ([`Notifier::poll`] every
//! [`Notifier::poll_interval`]) or by waiting on
//! [`Notifier::notification_fd`]. Notifications may be spurious or
//! coalesced; they only say "reload now".

pub mod named_pipe;
pub mod shmem;

#[cfg(target_os = "linux")]
pub mod inotify;

use std::os::fd::RawFd;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::UvarConfig;

pub use named_pipe::NamedPipeNotifier;
pub use shmem::ShmemNotifier;

#[cfg(target_os = "linux")]
pub use inotify::InotifyNotifier;

/// A change notification strategy
pub trait Notifier: Send {
    fn strategy(&self) -> NotifierStrategy;

    /// Whether another process posted since the last check. Called every
    /// [`poll_interval`](Self::poll_interval) when that is non-zero.
    fn poll(&mut self) -> bool {
        false
    }

    /// Descriptor to wait on for readability, if the strategy has one now
    fn notification_fd(&self) -> Option<RawFd> {
        None
    }

    /// The descriptor from [`notification_fd`](Self::notification_fd)
    /// became readable. Returns whether that means a change.
    fn on_fd_readable(&mut self, fd: RawFd) -> bool {
        let _ = fd;
        false
    }

    /// How often to call [`poll`](Self::poll); zero disables polling
    fn poll_interval(&self) -> Duration {
        Duration::ZERO
    }

    /// Tell everyone else the variables file changed
    fn post_notification(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierStrategy {
    ShmemPolling,
    NamedPipe,
    Platform,
    Null,
}

impl NotifierStrategy {
    /// Parse a `UVAR_NOTIFIER` value; `None` for `default` or anything
    /// unrecognised
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "shmem" | "shmem_polling" => Some(Self::ShmemPolling),
            "pipe" | "named_pipe" => Some(Self::NamedPipe),
            "platform" | "inotify" => Some(Self::Platform),
            "null" | "none" => Some(Self::Null),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ShmemPolling => "shmem",
            Self::NamedPipe => "pipe",
            Self::Platform => "platform",
            Self::Null => "null",
        }
    }
}

/// Strategy used when none is configured
pub fn resolve_default_strategy() -> NotifierStrategy {
    if cfg!(target_os = "linux") {
        NotifierStrategy::Platform
    } else {
        NotifierStrategy::NamedPipe
    }
}

/// Does nothing; every process must poll the file itself
#[derive(Debug, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn strategy(&self) -> NotifierStrategy {
        NotifierStrategy::Null
    }
}

/// Build the notifier for `strategy`, falling back to [`NullNotifier`] when
/// it cannot be set up.
pub fn new_notifier_for_strategy(strategy: NotifierStrategy, config: &UvarConfig) -> Box<dyn Notifier> {
    let built: std::io::Result<Box<dyn Notifier>> = match strategy {
        NotifierStrategy::Null => return Box::new(NullNotifier),
        NotifierStrategy::ShmemPolling => {
            ShmemNotifier::open(&config.shmem_path()).map(|n| Box::new(n) as Box<dyn Notifier>)
        }
        NotifierStrategy::NamedPipe => {
            NamedPipeNotifier::open(&config.notifier_pipe_path()).map(|n| Box::new(n) as Box<dyn Notifier>)
        }
        NotifierStrategy::Platform => platform_notifier(config),
    };

    match built {
        Ok(notifier) => {
            debug!("using {} notifier", notifier.strategy().name());
            notifier
        }
        Err(e) => {
            warn!(
                "Unable to set up {} change notifier: {}; falling back to none",
                strategy.name(),
                e
            );
            Box::new(NullNotifier)
        }
    }
}

#[cfg(target_os = "linux")]
fn platform_notifier(config: &UvarConfig) -> std::io::Result<Box<dyn Notifier>> {
    let path = config
        .vars_path()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()))?;
    Ok(Box::new(InotifyNotifier::open(&path)?))
}

#[cfg(not(target_os = "linux"))]
fn platform_notifier(config: &UvarConfig) -> std::io::Result<Box<dyn Notifier>> {
    Ok(Box::new(NamedPipeNotifier::open(&config.notifier_pipe_path())?))
}

static DEFAULT_NOTIFIER: OnceLock<Mutex<Box<dyn Notifier>>> = OnceLock::new();

/// Choose the process-wide notifier from `config`. Only the first call (or
/// the first [`default_notifier`]) has any effect; returns whether this call
/// made the choice.
pub fn init_default_notifier(config: &UvarConfig) -> bool {
    let mut chose = false;
    DEFAULT_NOTIFIER.get_or_init(|| {
        chose = true;
        Mutex::new(new_notifier_for_strategy(config.notifier_strategy(), config))
    });
    chose
}

/// The process-wide notifier, built from the environment on first use
pub fn default_notifier() -> MutexGuard<'static, Box<dyn Notifier>> {
    DEFAULT_NOTIFIER
        .get_or_init(|| {
            let config = UvarConfig::from_env();
            Mutex::new(new_notifier_for_strategy(config.notifier_strategy(), &config))
        })
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}
