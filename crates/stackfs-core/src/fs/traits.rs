//! Core filesystem traits.
//!
//! Every operation comes in an asynchronous form and a synchronous `_sync`
//! form. Backings that cannot operate synchronously leave the `_sync`
//! defaults in place (they return an unsupported error) and report
//! `supports_sync() == false`; composites answer their capability queries
//! from the layers they wrap.

use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use stackfs_types::{Metadata, OpenFlag};

use crate::error::{FsError, FsResult};

/// Abstract filesystem interface.
///
/// All paths are absolute; implementations normalize them internally.
/// Links are not part of the vocabulary: `lstat` defaults to `stat` and
/// `supports_links` defaults to false.
#[async_trait]
pub trait Filesystem: Send + Sync {
    // ───────────────────────── asynchronous operations ─────────────────────────

    /// Get metadata for a file or directory.
    async fn stat(&self, path: &Path) -> FsResult<Metadata>;

    /// Get metadata without following links.
    async fn lstat(&self, path: &Path) -> FsResult<Metadata> {
        self.stat(path).await
    }

    /// Open a file, returning a handle.
    ///
    /// `mode` applies when the open creates the file.
    async fn open(&self, path: &Path, flag: OpenFlag, mode: u32) -> FsResult<Box<dyn File>>;

    /// Read the entire contents of a file.
    async fn read_file(&self, path: &Path) -> FsResult<Vec<u8>>;

    /// Write an entire file, honoring the flag's exists/absent actions.
    async fn write_file(&self, path: &Path, data: &[u8], flag: OpenFlag, mode: u32)
    -> FsResult<()>;

    /// Remove a file.
    async fn unlink(&self, path: &Path) -> FsResult<()>;

    /// Remove an empty directory.
    async fn rmdir(&self, path: &Path) -> FsResult<()>;

    /// Create a directory. The parent must already exist.
    async fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()>;

    /// Rename (move) a file or directory.
    async fn rename(&self, from: &Path, to: &Path) -> FsResult<()>;

    /// List the names of a directory's children.
    async fn readdir(&self, path: &Path) -> FsResult<Vec<String>>;

    /// Check whether a path exists.
    async fn exists(&self, path: &Path) -> bool {
        self.stat(path).await.is_ok()
    }

    /// Change permission bits.
    async fn chmod(&self, path: &Path, mode: u32) -> FsResult<()>;

    /// Change ownership.
    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> FsResult<()>;

    /// Change access and modification times.
    async fn utimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> FsResult<()>;

    // ───────────────────────── synchronous variants ─────────────────────────

    fn stat_sync(&self, path: &Path) -> FsResult<Metadata> {
        let _ = path;
        Err(unsupported("stat_sync"))
    }

    fn lstat_sync(&self, path: &Path) -> FsResult<Metadata> {
        self.stat_sync(path)
    }

    fn open_sync(&self, path: &Path, flag: OpenFlag, mode: u32) -> FsResult<Box<dyn File>> {
        let _ = (path, flag, mode);
        Err(unsupported("open_sync"))
    }

    fn read_file_sync(&self, path: &Path) -> FsResult<Vec<u8>> {
        let _ = path;
        Err(unsupported("read_file_sync"))
    }

    fn write_file_sync(&self, path: &Path, data: &[u8], flag: OpenFlag, mode: u32) -> FsResult<()> {
        let _ = (path, data, flag, mode);
        Err(unsupported("write_file_sync"))
    }

    fn unlink_sync(&self, path: &Path) -> FsResult<()> {
        let _ = path;
        Err(unsupported("unlink_sync"))
    }

    fn rmdir_sync(&self, path: &Path) -> FsResult<()> {
        let _ = path;
        Err(unsupported("rmdir_sync"))
    }

    fn mkdir_sync(&self, path: &Path, mode: u32) -> FsResult<()> {
        let _ = (path, mode);
        Err(unsupported("mkdir_sync"))
    }

    fn rename_sync(&self, from: &Path, to: &Path) -> FsResult<()> {
        let _ = (from, to);
        Err(unsupported("rename_sync"))
    }

    fn readdir_sync(&self, path: &Path) -> FsResult<Vec<String>> {
        let _ = path;
        Err(unsupported("readdir_sync"))
    }

    fn exists_sync(&self, path: &Path) -> bool {
        self.stat_sync(path).is_ok()
    }

    fn chmod_sync(&self, path: &Path, mode: u32) -> FsResult<()> {
        let _ = (path, mode);
        Err(unsupported("chmod_sync"))
    }

    fn chown_sync(&self, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        let _ = (path, uid, gid);
        Err(unsupported("chown_sync"))
    }

    fn utimes_sync(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        let _ = (path, atime, mtime);
        Err(unsupported("utimes_sync"))
    }

    // ───────────────────────── capability queries ─────────────────────────

    /// True if this filesystem rejects all mutations.
    fn is_read_only(&self) -> bool;

    /// True if the `_sync` variants are usable.
    fn supports_sync(&self) -> bool {
        false
    }

    /// True if hard/symbolic links are supported.
    fn supports_links(&self) -> bool {
        false
    }

    /// True if ownership and timestamps are stored.
    fn supports_props(&self) -> bool {
        false
    }
}

/// An open file handle.
///
/// Reads and writes are positioned; handles carry no cursor. `close`
/// implies a final `flush`.
#[async_trait]
pub trait File: Send + Sync {
    /// Metadata as seen through this handle.
    async fn stat(&self) -> FsResult<Metadata>;

    /// Read up to `len` bytes at `offset`. Short reads happen at EOF.
    async fn read_at(&mut self, offset: u64, len: usize) -> FsResult<Vec<u8>>;

    /// Write `data` at `offset`, extending the file as needed.
    async fn write_at(&mut self, data: &[u8], offset: u64) -> FsResult<usize>;

    /// Truncate or extend the file to `size` bytes.
    async fn truncate(&mut self, size: u64) -> FsResult<()>;

    /// Persist buffered content to the backing store.
    async fn flush(&mut self) -> FsResult<()>;

    /// Flush and release the handle.
    async fn close(&mut self) -> FsResult<()>;

    // Synchronous variants, for backings that support them.

    fn write_at_sync(&mut self, data: &[u8], offset: u64) -> FsResult<usize> {
        let _ = (data, offset);
        Err(unsupported("write_at_sync"))
    }

    fn flush_sync(&mut self) -> FsResult<()> {
        Err(unsupported("flush_sync"))
    }

    fn close_sync(&mut self) -> FsResult<()> {
        Err(unsupported("close_sync"))
    }
}

fn unsupported(op: &str) -> FsError {
    FsError::Unsupported(format!("{op} not supported by this filesystem"))
}
