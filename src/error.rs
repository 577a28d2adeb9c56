//! Error types for universal variables
//!
//! Every failure here is recoverable from the host shell's point of view:
//! callers log and degrade (local-only variables, no persistence this cycle)
//! rather than abort.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::daemon::protocol::ProtocolError;

/// Errors produced by the universal variable subsystem
#[derive(Debug, Error)]
pub enum UvarError {
    /// Variable name contains characters outside `[A-Za-z0-9_]` (or is empty)
    #[error("Illegal variable name: '{0}'")]
    InvalidName(String),

    /// A wire or file line could not be decoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Socket or file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An advisory lock could not be taken within its timeout
    #[error("Timed out after {waited:?} waiting for lock on {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    /// The socket path does not fit in `sockaddr_un`
    #[error("Socket path too long: {}", .0.display())]
    SocketPathTooLong(PathBuf),

    /// No home directory to place the variables file in
    #[error("Could not determine home directory")]
    NoHomeDirectory,
}

/// Result alias for universal variable operations
pub type Result<T> = std::result::Result<T, UvarError>;

/// Check that `name` is a legal variable name.
///
/// Legal names are non-empty and consist of letters, digits and underscores.
pub fn validate_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(UvarError::InvalidName(name.to_string()))
    }
}

/// Whether `c` may appear in a variable name
pub fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Non-failing form of [`validate_name`]
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(is_name_char)
}
