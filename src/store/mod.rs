//! The universal variable table and its on-disk file
//!
//! [`VariableStore`] holds the process's view of every universal variable
//! together with the set of names changed locally but not yet confirmed
//! (persisted, or acknowledged by the daemon). Loading merges the file into
//! the table without clobbering those pending names; syncing merges, then
//! writes a complete replacement file and renames it over the old one.
//!
//! The table mutex is never held across file I/O.

pub mod file_id;
pub mod lock;

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::daemon::protocol::{decode_bytes, Event, Message};
use crate::error::{validate_name, Result};

pub use file_id::FileIdentity;
pub use lock::{lock_path_for, FileLock, LockMode};

/// First lines of every file written by [`VariableStore::sync`]
pub const SAVE_MSG: &str = "# This file is automatically generated by uvarsd.\n\
# Do NOT edit it directly, your changes will be overwritten.\n";

/// Format marker written after the header
pub const VERSION_LINE: &str = "# VERSION: 1\n";

/// Prefix of the temporary file a sync writes before renaming
pub const TEMP_PREFIX: &str = ".uvarsd.tmp.";

const LOAD_LOCK_TIMEOUT: Duration = Duration::from_millis(250);
const SYNC_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Files beyond this are read only up to this size
const MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub value: String,
    pub exported: bool,
}

/// Invoked with every change made through [`VariableStore::set`],
/// [`VariableStore::remove`] or [`VariableStore::apply_remote`]
pub type ChangeCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Outcome of a sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// A new file was renamed into place
    pub wrote: bool,
    /// Net changes picked up from the file before writing
    pub changes: Vec<Event>,
}

#[derive(Debug, Default)]
struct Tables {
    vars: BTreeMap<String, Variable>,
    /// Names changed locally and not yet confirmed; a name absent from
    /// `vars` but present here is a pending erase
    modified: BTreeSet<String>,
    last_read: Option<FileIdentity>,
}

pub struct VariableStore {
    tables: Mutex<Tables>,
    callback: Option<ChangeCallback>,
}

impl Default for VariableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VariableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableStore")
            .field("tables", &*self.tables())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl VariableStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            callback: None,
        }
    }

    pub fn with_callback(callback: ChangeCallback) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            callback: Some(callback),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forward events to the change callback, if any
    pub fn announce(&self, events: &[Event]) {
        if let Some(callback) = &self.callback {
            for event in events {
                callback(event);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.tables().vars.get(name).map(|v| v.value.clone())
    }

    /// Whether `name` is exported; `false` for unknown names
    pub fn get_export(&self, name: &str) -> bool {
        self.tables().vars.get(name).is_some_and(|v| v.exported)
    }

    /// Names of exported and/or unexported variables; neither flag yields nothing
    pub fn get_names(&self, show_exported: bool, show_unexported: bool) -> Vec<String> {
        self.tables()
            .vars
            .iter()
            .filter(|(_, v)| if v.exported { show_exported } else { show_unexported })
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tables().vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables().vars.is_empty()
    }

    /// Every variable, sorted by name
    pub fn snapshot(&self) -> Vec<(String, Variable)> {
        self.tables()
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Set a variable locally and mark it as an unconfirmed write
    pub fn set(&self, name: &str, value: &str, exported: bool) -> Result<()> {
        validate_name(name)?;
        {
            let mut tables = self.tables();
            tables.vars.insert(
                name.to_string(),
                Variable {
                    value: value.to_string(),
                    exported,
                },
            );
            tables.modified.insert(name.to_string());
        }
        self.announce(&[Event::Set {
            name: name.to_string(),
            value: value.to_string(),
            exported,
        }]);
        Ok(())
    }

    /// Erase a variable locally, recording a pending erase.
    ///
    /// Returns whether the variable existed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        let existed = {
            let mut tables = self.tables();
            tables.modified.insert(name.to_string());
            tables.vars.remove(name).is_some()
        };
        self.announce(&[Event::Erase {
            name: name.to_string(),
        }]);
        Ok(existed)
    }

    /// Apply a change received from another process, in the order it was
    /// received. Returns whether the table changed.
    ///
    /// The pending set is left as it is; deciding which updates a local
    /// write supersedes is up to the caller.
    pub fn apply_remote(&self, event: &Event) -> bool {
        let applied = {
            let mut tables = self.tables();
            match event {
                Event::Set {
                    name,
                    value,
                    exported,
                } => {
                    let var = Variable {
                        value: value.clone(),
                        exported: *exported,
                    };
                    match tables.vars.insert(name.clone(), var) {
                        Some(old) => old.value != *value || old.exported != *exported,
                        None => true,
                    }
                }
                Event::Erase { name } => tables.vars.remove(name).is_some(),
                Event::Barrier | Event::BarrierReply => false,
            }
        };
        if applied {
            self.announce(std::slice::from_ref(event));
        }
        applied
    }

    pub fn is_modified(&self, name: &str) -> bool {
        self.tables().modified.contains(name)
    }

    pub fn modified_names(&self) -> Vec<String> {
        self.tables().modified.iter().cloned().collect()
    }

    /// Forget all pending writes; they have been confirmed
    pub fn clear_modified(&self) {
        self.tables().modified.clear();
    }

    /// Drop every variable that has no pending write, without notifying.
    ///
    /// Used before a resync, after which the authoritative state is received
    /// again in full.
    pub fn retain_modified(&self) {
        let mut tables = self.tables();
        let Tables { vars, modified, .. } = &mut *tables;
        vars.retain(|name, _| modified.contains(name));
        tables.last_read = None;
    }

    /// Pending writes as the events that would replay them
    pub fn pending_writes(&self) -> Vec<Event> {
        let tables = self.tables();
        tables
            .modified
            .iter()
            .map(|name| match tables.vars.get(name) {
                Some(var) => Event::Set {
                    name: name.clone(),
                    value: var.value.clone(),
                    exported: var.exported,
                },
                None => Event::Erase { name: name.clone() },
            })
            .collect()
    }

    /// Reload from `path` if it changed since the last read.
    ///
    /// Returns `false` if the file could not be read.
    pub fn load(&self, path: &Path) -> bool {
        self.load_reporting(path).is_some()
    }

    /// [`load`](Self::load), returning the net changes it made to the table.
    ///
    /// The change callback is not invoked; callers forward the changes with
    /// [`announce`](Self::announce) when they want them observed.
    pub fn load_reporting(&self, path: &Path) -> Option<Vec<Event>> {
        let lock = match FileLock::acquire(&lock_path_for(path), LockMode::Shared, LOAD_LOCK_TIMEOUT) {
            Ok(lock) => Some(lock),
            Err(e) => {
                warn!("{}; reading universal variables without the lock", e);
                None
            }
        };
        let result = self.refresh(path);
        drop(lock);

        match result {
            Ok(changes) => Some(changes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no universal variable file at {}", path.display());
                None
            }
            Err(e) => {
                warn!("Unable to read universal variable file {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge the file into the table and write the result back if anything
    /// is pending. Returns whether a file was written.
    pub fn sync(&self, path: &Path) -> bool {
        self.sync_reporting(path).wrote
    }

    pub fn sync_reporting(&self, path: &Path) -> SyncReport {
        if self.tables().modified.is_empty() {
            return SyncReport {
                wrote: false,
                changes: self.load_reporting(path).unwrap_or_default(),
            };
        }

        let lock = match FileLock::acquire(&lock_path_for(path), LockMode::Exclusive, SYNC_LOCK_TIMEOUT) {
            Ok(lock) => lock,
            Err(e) => {
                warn!("{}; not saving universal variables this time", e);
                return SyncReport::default();
            }
        };

        let changes = match self.refresh(path) {
            Ok(changes) => changes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!("Unable to read universal variable file {}: {}", path.display(), e);
                return SyncReport::default();
            }
        };

        let (contents, written) = {
            let tables = self.tables();
            let written: Vec<(String, Option<Variable>)> = tables
                .modified
                .iter()
                .map(|name| (name.clone(), tables.vars.get(name).cloned()))
                .collect();
            (serialize(&tables.vars), written)
        };

        let wrote = match write_replacement(path, &contents) {
            Ok(identity) => {
                let mut tables = self.tables();
                for (name, value) in written {
                    // A name changed again while writing stays pending.
                    if tables.vars.get(&name).cloned() == value {
                        tables.modified.remove(&name);
                    }
                }
                tables.last_read = identity;
                true
            }
            Err(e) => {
                warn!("Unable to write universal variable file {}: {}", path.display(), e);
                false
            }
        };
        drop(lock);

        SyncReport { wrote, changes }
    }

    /// Read `path` unless its identity matches the last read, then merge.
    fn refresh(&self, path: &Path) -> io::Result<Vec<Event>> {
        let current = FileIdentity::for_path(path);
        if current.is_some() && self.tables().last_read == current {
            debug!("universal variable file unchanged, skipping reload");
            return Ok(Vec::new());
        }

        let (identity, file_vars) = read_file(path)?;
        Ok(self.merge_from_file(file_vars, identity))
    }

    fn merge_from_file(&self, mut file_vars: BTreeMap<String, Variable>, identity: Option<FileIdentity>) -> Vec<Event> {
        let mut tables = self.tables();
        let Tables {
            vars,
            modified,
            last_read,
        } = &mut *tables;

        modified.retain(|name| match (vars.get(name), file_vars.get(name)) {
            // The file already agrees: the write is confirmed.
            (Some(local), Some(on_disk)) if local == on_disk => false,
            (None, None) => false,
            (Some(local), _) => {
                file_vars.insert(name.clone(), local.clone());
                true
            }
            (None, Some(_)) => {
                file_vars.remove(name);
                true
            }
        });

        let mut changes = Vec::new();
        for (name, var) in &file_vars {
            if vars.get(name) != Some(var) {
                changes.push(Event::Set {
                    name: name.clone(),
                    value: var.value.clone(),
                    exported: var.exported,
                });
            }
        }
        for name in vars.keys() {
            if !file_vars.contains_key(name) {
                changes.push(Event::Erase { name: name.clone() });
            }
        }

        *vars = file_vars;
        *last_read = identity;
        changes
    }
}

fn read_file(path: &Path) -> io::Result<(Option<FileIdentity>, BTreeMap<String, Variable>)> {
    let file = File::open(path)?;
    let identity = FileIdentity::for_file(&file);
    let mut contents = Vec::new();
    file.take(MAX_FILE_SIZE).read_to_end(&mut contents)?;
    Ok((identity, parse(&contents)))
}

/// Parse file contents into a table.
///
/// Lines are applied in order; an unterminated final line is ignored.
pub fn parse(contents: &[u8]) -> BTreeMap<String, Variable> {
    let mut vars = BTreeMap::new();
    let mut lines: Vec<&[u8]> = contents.split(|&b| b == b'\n').collect();
    if let Some(tail) = lines.pop() {
        if !tail.is_empty() {
            warn!(
                "Ignoring unterminated line in universal variable file: '{}'",
                String::from_utf8_lossy(tail)
            );
        }
    }

    for line in lines {
        match decode_bytes(line) {
            Ok(Some(Event::Set {
                name,
                value,
                exported,
            })) => {
                vars.insert(name, Variable { value, exported });
            }
            Ok(Some(Event::Erase { name })) => {
                vars.remove(&name);
            }
            Ok(_) => {}
            Err(e) => warn!("{}", e),
        }
    }
    vars
}

/// Full file contents for `vars`: header, version marker, sorted entries
pub fn serialize(vars: &BTreeMap<String, Variable>) -> Vec<u8> {
    let mut out = Vec::with_capacity(SAVE_MSG.len() + VERSION_LINE.len() + vars.len() * 32);
    out.extend_from_slice(SAVE_MSG.as_bytes());
    out.extend_from_slice(VERSION_LINE.as_bytes());
    for (name, var) in vars {
        match Message::set(name, &var.value, var.exported) {
            Ok(msg) => out.extend_from_slice(msg.body()),
            Err(e) => warn!("not saving '{}': {}", name, e),
        }
    }
    out
}

/// Write `contents` to a temporary file beside `path` and rename it over
/// `path`. The old file is never modified in place.
fn write_replacement(path: &Path, contents: &[u8]) -> io::Result<Option<FileIdentity>> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(dir)?;
    tmp.write_all(contents)?;
    if let Ok(meta) = fs::metadata(path) {
        tmp.as_file().set_permissions(meta.permissions())?;
    }
    tmp.as_file().sync_all()?;

    let file = tmp.persist(path).map_err(|e| e.error)?;
    debug!("wrote {} bytes to {}", contents.len(), path.display());
    Ok(FileIdentity::for_file(&file))
}
