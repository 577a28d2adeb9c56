//! Readiness multiplexing over `poll(2)`
//!
//! One [`Dispatcher`] is built per loop iteration: register descriptors with
//! an [`Interest`], wait, then ask for the [`Readiness`] of each token.

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io;
use std::os::fd::BorrowedFd;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    ReadWrite,
}

impl Interest {
    fn flags(self) -> PollFlags {
        match self {
            Interest::Read => PollFlags::POLLIN,
            Interest::ReadWrite => PollFlags::POLLIN | PollFlags::POLLOUT,
        }
    }
}

/// What a registered descriptor is ready for after [`Dispatcher::wait`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Data, end of stream or an error condition is waiting to be read
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    pub fn any(self) -> bool {
        self.readable || self.writable
    }
}

#[derive(Default)]
pub struct Dispatcher<'fd> {
    fds: Vec<PollFd<'fd>>,
}

impl<'fd> Dispatcher<'fd> {
    pub fn new() -> Self {
        Self { fds: Vec::new() }
    }

    /// Register `fd`, returning the token to query readiness with
    pub fn register(&mut self, fd: BorrowedFd<'fd>, interest: Interest) -> usize {
        self.fds.push(PollFd::new(fd, interest.flags()));
        self.fds.len() - 1
    }

    /// Block until a registered descriptor is ready or `timeout` passes.
    ///
    /// `None` waits forever. Returns the number of ready descriptors; an
    /// interrupted wait reports zero.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        match poll(&mut self.fds, poll_timeout(timeout)) {
            Ok(n) => Ok(usize::try_from(n).unwrap_or(0)),
            Err(Errno::EINTR) => Ok(0),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    pub fn readiness(&self, token: usize) -> Readiness {
        let Some(revents) = self.fds.get(token).and_then(|fd| fd.revents()) else {
            return Readiness::default();
        };
        Readiness {
            readable: revents
                .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR),
            writable: revents.contains(PollFlags::POLLOUT),
        }
    }
}

fn poll_timeout(timeout: Option<Duration>) -> PollTimeout {
    match timeout {
        None => PollTimeout::NONE,
        Some(d) => PollTimeout::from(u16::try_from(d.as_millis()).unwrap_or(u16::MAX)),
    }
}

/// Wait for a single descriptor. Returns whether it became ready in time.
pub fn wait_for(fd: BorrowedFd<'_>, interest: Interest, timeout: Option<Duration>) -> io::Result<bool> {
    let mut dispatcher = Dispatcher::new();
    let token = dispatcher.register(fd, interest);
    dispatcher.wait(timeout)?;
    Ok(dispatcher.readiness(token).any())
}

/// Zero-timeout readability probe
pub fn is_readable(fd: BorrowedFd<'_>) -> bool {
    wait_for(fd, Interest::Read, Some(Duration::ZERO)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_idle_socket_times_out() {
        let (a, _b) = UnixStream::pair().unwrap();
        assert!(!wait_for(a.as_fd(), Interest::Read, Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn test_reports_readable_and_writable_per_token() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let (c, _d) = UnixStream::pair().unwrap();
        b.write_all(b"x").unwrap();

        let mut dispatcher = Dispatcher::new();
        let ta = dispatcher.register(a.as_fd(), Interest::Read);
        let tc = dispatcher.register(c.as_fd(), Interest::ReadWrite);
        let ready = dispatcher.wait(Some(Duration::from_millis(100))).unwrap();

        assert_eq!(ready, 2);
        assert!(dispatcher.readiness(ta).readable);
        assert!(!dispatcher.readiness(tc).readable);
        assert!(dispatcher.readiness(tc).writable);
        assert_eq!(dispatcher.readiness(99), Readiness::default());
    }

    #[test]
    fn test_hangup_counts_as_readable() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        assert!(is_readable(a.as_fd()));
    }

    #[test]
    fn test_poll_timeout_clamps() {
        assert_eq!(
            poll_timeout(Some(Duration::from_secs(3600))),
            PollTimeout::from(u16::MAX)
        );
        assert_eq!(poll_timeout(None), PollTimeout::NONE);
    }
}
