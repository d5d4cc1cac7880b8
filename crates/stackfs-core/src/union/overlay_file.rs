//! Buffered handle over a readable-layer file opened for writing.
//!
//! When a file that lives only on the readable layer is opened with a
//! use-existing flag, there is nothing on the writable layer to hand out
//! yet. An [`OverlayFile`] buffers the readable content in memory; the
//! first flush drives the engine's copy-up write path, which is also when
//! the file materializes on the writable layer. A clean handle never
//! writes anything; until then the readable copy stays authoritative.

use std::time::SystemTime;

use async_trait::async_trait;
use stackfs_types::{Metadata, OpenFlag};
use tracing::warn;

use super::UnionFs;
use crate::error::{FsError, FsResult};
use crate::fs::File;

/// In-memory file handle bridging the readable layer and a deferred
/// write-back to the writable layer.
pub struct OverlayFile {
    /// Non-owning back-reference: the engine's state is all behind `Arc`s
    /// and the engine does not keep handles alive, so there is no cycle.
    fs: UnionFs,
    path: String,
    flag: OpenFlag,
    stats: Metadata,
    buffer: Vec<u8>,
    dirty: bool,
}

impl OverlayFile {
    pub(crate) fn new(
        fs: UnionFs,
        path: String,
        flag: OpenFlag,
        stats: Metadata,
        buffer: Vec<u8>,
    ) -> Self {
        Self {
            fs,
            path,
            flag,
            stats,
            buffer,
            dirty: false,
        }
    }

    fn check_readable(&self) -> FsResult<()> {
        if self.flag.is_readable() {
            Ok(())
        } else {
            Err(FsError::Permission(format!(
                "file not opened for reading: {}",
                self.path
            )))
        }
    }

    fn check_writable(&self) -> FsResult<()> {
        if self.flag.is_writable() {
            Ok(())
        } else {
            Err(FsError::Permission(format!(
                "file not opened for writing: {}",
                self.path
            )))
        }
    }

    fn touch(&mut self) {
        self.stats.size = self.buffer.len() as u64;
        self.stats.mtime = SystemTime::now();
        self.dirty = true;
    }
}

#[async_trait]
impl File for OverlayFile {
    async fn stat(&self) -> FsResult<Metadata> {
        Ok(self.stats.clone())
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        self.check_readable()?;
        let start = (offset as usize).min(self.buffer.len());
        let end = start.saturating_add(len).min(self.buffer.len());
        Ok(self.buffer[start..end].to_vec())
    }

    async fn write_at(&mut self, data: &[u8], offset: u64) -> FsResult<usize> {
        self.write_at_sync(data, offset)
    }

    async fn truncate(&mut self, size: u64) -> FsResult<()> {
        self.check_writable()?;
        self.buffer.resize(size as usize, 0);
        self.touch();
        Ok(())
    }

    async fn flush(&mut self) -> FsResult<()> {
        if !self.dirty {
            return Ok(());
        }
        // The engine's write path ensures parent directories and lands the
        // buffer on the writable layer, which is the copy-up proper.
        self.fs
            .write_file_at(&self.path, &self.buffer, UnionFs::write_flag(), self.stats.mode)
            .await?;
        self.dirty = false;
        Ok(())
    }

    async fn close(&mut self) -> FsResult<()> {
        self.flush().await
    }

    fn write_at_sync(&mut self, data: &[u8], offset: u64) -> FsResult<usize> {
        self.check_writable()?;
        let end = offset as usize + data.len();
        if end > self.buffer.len() {
            self.buffer.resize(end, 0);
        }
        self.buffer[offset as usize..end].copy_from_slice(data);
        self.touch();
        Ok(data.len())
    }

    fn flush_sync(&mut self) -> FsResult<()> {
        if !self.dirty {
            return Ok(());
        }
        self.fs
            .write_file_at_sync(&self.path, &self.buffer, UnionFs::write_flag(), self.stats.mode)?;
        self.dirty = false;
        Ok(())
    }

    fn close_sync(&mut self) -> FsResult<()> {
        self.flush_sync()
    }
}

impl Drop for OverlayFile {
    fn drop(&mut self) {
        if self.dirty {
            warn!("overlay file dropped with unflushed writes: {}", self.path);
        }
    }
}
