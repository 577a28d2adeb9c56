//! Cheap change detection for the variables file

use std::fs::{self, File, Metadata};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Identity of a file as of one `stat(2)`.
///
/// Two identities compare equal when nothing observable about the file
/// changed, which lets a reload be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
    pub size: u64,
}

impl FileIdentity {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            device: meta.dev(),
            inode: meta.ino(),
            mtime_sec: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
            size: meta.size(),
        }
    }

    /// `None` if the path cannot be stat'ed
    pub fn for_path(path: &Path) -> Option<Self> {
        fs::metadata(path).ok().map(|m| Self::from_metadata(&m))
    }

    pub fn for_file(file: &File) -> Option<Self> {
        file.metadata().ok().map(|m| Self::from_metadata(&m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_identity_tracks_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vars");
        assert!(FileIdentity::for_path(&path).is_none());

        fs::write(&path, "SET a:1\n").unwrap();
        let first = FileIdentity::for_path(&path).unwrap();
        assert_eq!(FileIdentity::for_path(&path), Some(first));

        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"SET b:2\n").unwrap();
        let second = FileIdentity::for_file(&file).unwrap();
        assert_ne!(first, second);
        assert_eq!(second.size, 16);
    }

    #[test]
    fn test_replacement_changes_inode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vars");
        fs::write(&path, "x").unwrap();
        // Keep the old file alive so its inode cannot be reused.
        let old = File::open(&path).unwrap();
        let before = FileIdentity::for_file(&old).unwrap();

        let other = dir.path().join("other");
        fs::write(&other, "x").unwrap();
        fs::rename(&other, &path).unwrap();

        assert_ne!(FileIdentity::for_path(&path), Some(before));
    }
}
