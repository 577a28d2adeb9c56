//! Shared-memory polling notifier
//!
//! A small per-user file is mapped by every process. It holds a magic, a
//! version and a seed, all big-endian. Posting bumps the seed; polling
//! compares it to the last value seen.

use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use super::{Notifier, NotifierStrategy};

const MAGIC: u32 = 0xF154;
const VERSION: u32 = 1000;

const MAGIC_WORD: usize = 0;
const VERSION_WORD: usize = 1;
const SEED_WORD: usize = 2;
const REGION_SIZE: usize = 3 * std::mem::size_of::<u32>();

const FAST_POLL: Duration = Duration::from_millis(100);
const SLOW_POLL: Duration = Duration::from_millis(333);
/// Poll fast for this long after the last observed change
const RECENT_CHANGE: Duration = Duration::from_secs(5);

pub struct ShmemNotifier {
    map: MmapMut,
    last_seed: u32,
    last_change: Option<Instant>,
}

impl ShmemNotifier {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)?;
        if file.metadata()?.len() < REGION_SIZE as u64 {
            file.set_len(REGION_SIZE as u64)?;
        }

        // SAFETY: the file is private to this user and only ever accessed
        // through the atomic words below.
        let map = unsafe { MmapOptions::new().len(REGION_SIZE).map_mut(&file)? };
        let mut notifier = Self {
            map,
            last_seed: 0,
            last_change: None,
        };
        notifier.last_seed = notifier.seed();
        Ok(notifier)
    }

    fn word(&self, index: usize) -> &AtomicU32 {
        debug_assert!(index * 4 + 4 <= REGION_SIZE);
        // SAFETY: the mapping is page aligned and REGION_SIZE bytes long, so
        // every word index below 3 is in bounds and 4-byte aligned.
        unsafe { &*(self.map.as_ptr().add(index * 4) as *const AtomicU32) }
    }

    fn seed(&self) -> u32 {
        u32::from_be(self.word(SEED_WORD).load(Ordering::SeqCst))
    }
}

impl Notifier for ShmemNotifier {
    fn strategy(&self) -> NotifierStrategy {
        NotifierStrategy::ShmemPolling
    }

    fn poll(&mut self) -> bool {
        let seed = self.seed();
        if seed == self.last_seed {
            return false;
        }
        self.last_seed = seed;
        self.last_change = Some(Instant::now());
        true
    }

    fn poll_interval(&self) -> Duration {
        match self.last_change {
            Some(t) if t.elapsed() < RECENT_CHANGE => FAST_POLL,
            _ => SLOW_POLL,
        }
    }

    fn post_notification(&mut self) {
        let next = match self.seed().wrapping_add(1) {
            0 => 1,
            n => n,
        };
        self.word(MAGIC_WORD).store(MAGIC.to_be(), Ordering::SeqCst);
        self.word(VERSION_WORD).store(VERSION.to_be(), Ordering::SeqCst);
        self.word(SEED_WORD).store(next.to_be(), Ordering::SeqCst);
        // Our own post is not news to us.
        self.last_seed = next;
    }
}
