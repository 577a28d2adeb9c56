//! inotify notifier
//!
//! Watches the directory holding the variables file. A save renames a new
//! file into place, so posting needs no extra work.

use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use std::ffi::OsString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::Path;
use tracing::debug;

use super::{Notifier, NotifierStrategy};

pub struct InotifyNotifier {
    inotify: Inotify,
    file_name: OsString,
}

impl InotifyNotifier {
    pub fn open(vars_path: &Path) -> io::Result<Self> {
        let file_name = vars_path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "variables path has no file name"))?
            .to_os_string();
        let dir = match vars_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
        inotify.add_watch(
            dir,
            AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_MOVED_TO | AddWatchFlags::IN_DELETE,
        )?;
        Ok(Self { inotify, file_name })
    }
}

impl Notifier for InotifyNotifier {
    fn strategy(&self) -> NotifierStrategy {
        NotifierStrategy::Platform
    }

    fn notification_fd(&self) -> Option<RawFd> {
        Some(self.inotify.as_fd().as_raw_fd())
    }

    fn on_fd_readable(&mut self, fd: RawFd) -> bool {
        if fd != self.inotify.as_fd().as_raw_fd() {
            return false;
        }
        let mut changed = false;
        loop {
            match self.inotify.read_events() {
                Ok(events) if events.is_empty() => break,
                Ok(events) => {
                    changed |= events
                        .iter()
                        .any(|event| event.name.as_deref() == Some(self.file_name.as_os_str()));
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    debug!("reading inotify events failed: {}", e);
                    break;
                }
            }
        }
        changed
    }
}
