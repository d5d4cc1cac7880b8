//! File and directory metadata.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Kind of filesystem entry.
///
/// Links are not part of the vocabulary, so it is files and directories
/// only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// Metadata for a file or directory, as returned by `stat`.
///
/// `mode` carries the permission bits only (e.g. `0o644`); the entry type
/// lives in `kind` rather than in high mode bits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Kind of entry.
    pub kind: EntryKind,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Unix permission bits (e.g. `0o644`).
    pub mode: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Last access time.
    pub atime: SystemTime,
    /// Last modification time.
    pub mtime: SystemTime,
}

impl Metadata {
    /// Metadata for a regular file.
    pub fn file(size: u64, mode: u32) -> Self {
        let now = SystemTime::now();
        Self {
            kind: EntryKind::File,
            size,
            mode,
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
        }
    }

    /// Metadata for a directory.
    pub fn directory(mode: u32) -> Self {
        let now = SystemTime::now();
        Self {
            kind: EntryKind::Directory,
            size: 0,
            mode,
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
        }
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}
