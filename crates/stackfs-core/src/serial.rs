//! Serializing wrapper: one top-level operation at a time.
//!
//! The union engine composes multi-step sub-operations across two layers;
//! without serialization a concurrent `readdir` could observe the middle
//! of an in-progress `rename`. Wrapping the engine in [`SerializingFs`]
//! makes every top-level call atomic with respect to every other.

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use stackfs_types::{Metadata, OpenFlag};

use crate::error::{FsError, FsResult};
use crate::fs::{File, Filesystem};
use crate::sync::FairMutex;

/// Wraps a filesystem and serializes all asynchronous operations through a
/// [`FairMutex`].
///
/// Synchronous calls never take the lock: they run directly when it is
/// free and fail with an invalid-argument error when an asynchronous
/// operation is in flight, failing fast instead of deadlocking the
/// single-threaded cooperative model.
pub struct SerializingFs {
    inner: Arc<dyn Filesystem>,
    lock: FairMutex,
}

impl SerializingFs {
    /// Wrap a filesystem.
    pub fn new(inner: Arc<dyn Filesystem>) -> Self {
        Self {
            inner,
            lock: FairMutex::new(),
        }
    }

    /// The wrapped filesystem.
    pub fn inner(&self) -> &Arc<dyn Filesystem> {
        &self.inner
    }

    fn check_unlocked(&self) -> FsResult<()> {
        if self.lock.is_locked() {
            Err(FsError::sync_call_in_flight())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Filesystem for SerializingFs {
    async fn stat(&self, path: &Path) -> FsResult<Metadata> {
        self.lock.lock().await;
        let result = self.inner.stat(path).await;
        self.lock.unlock();
        result
    }

    async fn lstat(&self, path: &Path) -> FsResult<Metadata> {
        self.lock.lock().await;
        let result = self.inner.lstat(path).await;
        self.lock.unlock();
        result
    }

    async fn open(&self, path: &Path, flag: OpenFlag, mode: u32) -> FsResult<Box<dyn File>> {
        self.lock.lock().await;
        let result = self.inner.open(path, flag, mode).await;
        self.lock.unlock();
        result
    }

    async fn read_file(&self, path: &Path) -> FsResult<Vec<u8>> {
        self.lock.lock().await;
        let result = self.inner.read_file(path).await;
        self.lock.unlock();
        result
    }

    async fn write_file(
        &self,
        path: &Path,
        data: &[u8],
        flag: OpenFlag,
        mode: u32,
    ) -> FsResult<()> {
        self.lock.lock().await;
        let result = self.inner.write_file(path, data, flag, mode).await;
        self.lock.unlock();
        result
    }

    async fn unlink(&self, path: &Path) -> FsResult<()> {
        self.lock.lock().await;
        let result = self.inner.unlink(path).await;
        self.lock.unlock();
        result
    }

    async fn rmdir(&self, path: &Path) -> FsResult<()> {
        self.lock.lock().await;
        let result = self.inner.rmdir(path).await;
        self.lock.unlock();
        result
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.lock.lock().await;
        let result = self.inner.mkdir(path, mode).await;
        self.lock.unlock();
        result
    }

    async fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        self.lock.lock().await;
        let result = self.inner.rename(from, to).await;
        self.lock.unlock();
        result
    }

    async fn readdir(&self, path: &Path) -> FsResult<Vec<String>> {
        self.lock.lock().await;
        let result = self.inner.readdir(path).await;
        self.lock.unlock();
        result
    }

    async fn exists(&self, path: &Path) -> bool {
        self.lock.lock().await;
        let result = self.inner.exists(path).await;
        self.lock.unlock();
        result
    }

    async fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.lock.lock().await;
        let result = self.inner.chmod(path, mode).await;
        self.lock.unlock();
        result
    }

    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        self.lock.lock().await;
        let result = self.inner.chown(path, uid, gid).await;
        self.lock.unlock();
        result
    }

    async fn utimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        self.lock.lock().await;
        let result = self.inner.utimes(path, atime, mtime).await;
        self.lock.unlock();
        result
    }

    fn stat_sync(&self, path: &Path) -> FsResult<Metadata> {
        self.check_unlocked()?;
        self.inner.stat_sync(path)
    }

    fn lstat_sync(&self, path: &Path) -> FsResult<Metadata> {
        self.check_unlocked()?;
        self.inner.lstat_sync(path)
    }

    fn open_sync(&self, path: &Path, flag: OpenFlag, mode: u32) -> FsResult<Box<dyn File>> {
        self.check_unlocked()?;
        self.inner.open_sync(path, flag, mode)
    }

    fn read_file_sync(&self, path: &Path) -> FsResult<Vec<u8>> {
        self.check_unlocked()?;
        self.inner.read_file_sync(path)
    }

    fn write_file_sync(&self, path: &Path, data: &[u8], flag: OpenFlag, mode: u32) -> FsResult<()> {
        self.check_unlocked()?;
        self.inner.write_file_sync(path, data, flag, mode)
    }

    fn unlink_sync(&self, path: &Path) -> FsResult<()> {
        self.check_unlocked()?;
        self.inner.unlink_sync(path)
    }

    fn rmdir_sync(&self, path: &Path) -> FsResult<()> {
        self.check_unlocked()?;
        self.inner.rmdir_sync(path)
    }

    fn mkdir_sync(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.check_unlocked()?;
        self.inner.mkdir_sync(path, mode)
    }

    fn rename_sync(&self, from: &Path, to: &Path) -> FsResult<()> {
        self.check_unlocked()?;
        self.inner.rename_sync(from, to)
    }

    fn readdir_sync(&self, path: &Path) -> FsResult<Vec<String>> {
        self.check_unlocked()?;
        self.inner.readdir_sync(path)
    }

    fn exists_sync(&self, path: &Path) -> bool {
        // A bool query cannot surface the invalid-call error; report the
        // path as absent while the lock is held.
        self.check_unlocked().is_ok() && self.inner.exists_sync(path)
    }

    fn chmod_sync(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.check_unlocked()?;
        self.inner.chmod_sync(path, mode)
    }

    fn chown_sync(&self, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        self.check_unlocked()?;
        self.inner.chown_sync(path, uid, gid)
    }

    fn utimes_sync(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        self.check_unlocked()?;
        self.inner.utimes_sync(path, atime, mtime)
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    fn supports_sync(&self) -> bool {
        self.inner.supports_sync()
    }

    fn supports_links(&self) -> bool {
        self.inner.supports_links()
    }

    fn supports_props(&self) -> bool {
        self.inner.supports_props()
    }
}
