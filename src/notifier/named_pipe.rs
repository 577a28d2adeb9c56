//! Named-pipe notifier
//!
//! Every process opens one per-user FIFO read-write. Posting writes a byte,
//! which makes the pipe readable for everyone; the poster drains it again
//! after a short flash. Readers notice by waiting on the descriptor, then
//! switch to polling the FIFO's timestamps until it drains, since a
//! level-triggered readable pipe cannot be waited on repeatedly.

use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{Notifier, NotifierStrategy};
use crate::daemon::dispatch::is_readable;
use crate::store::FileIdentity;

/// How long a poster leaves its byte in the pipe
const FLASH_DURATION: Duration = Duration::from_millis(10);

/// A pipe readable for longer than this was abandoned by its poster
const READABLE_TOO_LONG: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeState {
    /// Idle; the host waits on the descriptor
    WaitingForReadable,
    /// Someone posted; poll until the pipe drains
    PollingDuringReadable,
    /// We posted; drain our byte once the flash is over
    WaitingToDrain,
}

pub struct NamedPipeNotifier {
    pipe: File,
    state: PipeState,
    state_start: Instant,
    pipe_identity: Option<FileIdentity>,
    drain_amount: usize,
}

impl NamedPipeNotifier {
    pub fn open(path: &Path) -> io::Result<Self> {
        match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
            Ok(()) | Err(Errno::EEXIST) => {}
            Err(e) => return Err(io::Error::from(e)),
        }
        let pipe = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;

        let pipe_identity = FileIdentity::for_file(&pipe);
        Ok(Self {
            pipe,
            state: PipeState::WaitingForReadable,
            state_start: Instant::now(),
            pipe_identity,
            drain_amount: 0,
        })
    }

    fn set_state(&mut self, state: PipeState) {
        self.state = state;
        self.state_start = Instant::now();
    }

    fn time_in_state(&self) -> Duration {
        self.state_start.elapsed()
    }

    /// Re-stat the pipe; true if its timestamps moved
    fn update_pipe_identity(&mut self) -> bool {
        let current = FileIdentity::for_file(&self.pipe);
        let changed = current != self.pipe_identity;
        self.pipe_identity = current;
        changed
    }

    fn pipe_is_readable(&self) -> bool {
        is_readable(self.pipe.as_fd())
    }

    /// Read and discard up to `amount` bytes
    fn drain(&mut self, amount: usize) {
        let mut buf = [0u8; 256];
        let mut remaining = amount;
        while remaining > 0 {
            let want = remaining.min(buf.len());
            match (&self.pipe).read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => remaining -= n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    /// Empty a pipe that stayed full, e.g. because its poster exited early
    fn drain_excess(&mut self) {
        let mut buf = [0u8; 512];
        while let Ok(n) = (&self.pipe).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

impl Notifier for NamedPipeNotifier {
    fn strategy(&self) -> NotifierStrategy {
        NotifierStrategy::NamedPipe
    }

    fn notification_fd(&self) -> Option<RawFd> {
        match self.state {
            PipeState::WaitingForReadable => Some(self.pipe.as_raw_fd()),
            _ => None,
        }
    }

    fn on_fd_readable(&mut self, fd: RawFd) -> bool {
        if self.state != PipeState::WaitingForReadable || fd != self.pipe.as_raw_fd() {
            return false;
        }
        self.set_state(PipeState::PollingDuringReadable);
        self.update_pipe_identity();
        true
    }

    fn poll_interval(&self) -> Duration {
        match self.state {
            PipeState::WaitingForReadable => Duration::ZERO,
            _ => FLASH_DURATION,
        }
    }

    fn poll(&mut self) -> bool {
        match self.state {
            PipeState::WaitingForReadable => false,
            PipeState::PollingDuringReadable => {
                if !self.pipe_is_readable() {
                    self.set_state(PipeState::WaitingForReadable);
                    return self.update_pipe_identity();
                }
                if self.time_in_state() > READABLE_TOO_LONG {
                    debug!("notifier pipe stayed readable, draining it");
                    self.drain_excess();
                    self.set_state(PipeState::WaitingForReadable);
                    return true;
                }
                self.update_pipe_identity()
            }
            PipeState::WaitingToDrain => {
                if self.time_in_state() < FLASH_DURATION {
                    return false;
                }
                let amount = std::mem::take(&mut self.drain_amount);
                self.drain(amount);
                self.set_state(PipeState::WaitingForReadable);
                self.update_pipe_identity();
                false
            }
        }
    }

    fn post_notification(&mut self) {
        let mut written = (&self.pipe).write(&[0u8]);
        if matches!(&written, Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
            self.drain_excess();
            written = (&self.pipe).write(&[0u8]);
        }
        match written {
            Ok(n) => {
                self.drain_amount += n;
                self.set_state(PipeState::WaitingToDrain);
                self.update_pipe_identity();
            }
            Err(e) => warn!("Unable to write to notifier pipe: {}", e),
        }
    }
}
