//! The whiteout log: persistent deletion markers for readable-layer paths.
//!
//! Deleting an entry that exists only on the read-only layer cannot touch
//! that layer, so the union records the deletion in an append-only log on
//! the writable layer and filters the path from every lookup. The log is
//! replayed on initialization and appended to for the life of the mount;
//! it is never compacted at runtime.
//!
//! Format: UTF-8 text, one record per line, a single tag character (`d`
//! for delete, `u` for undelete) immediately followed by the absolute
//! path. Every record is `\n`-terminated; recovery also accepts a final
//! unterminated line.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use stackfs_types::OpenFlag;
use tracing::{debug, warn};

use crate::error::{FsError, FsResult};
use crate::fs::{File, Filesystem};

/// Default location of the log on the writable layer.
pub(crate) const DEFAULT_LOG_PATH: &str = "/.deletedFiles.log";

struct LogWriter {
    handle: Box<dyn File>,
    /// Byte offset of the end of the log; appends land here.
    offset: u64,
}

/// In-memory whiteout set plus its on-disk append log.
///
/// Mutations are write-first: the record is appended and flushed before
/// the in-memory set changes, so a deletion that returned success is
/// durable. Only `true` entries affect visibility; `false` entries are
/// historical artifacts of undeletes.
pub struct WhiteoutLog {
    log_path: String,
    entries: Mutex<HashMap<String, bool>>,
    writer: tokio::sync::Mutex<Option<LogWriter>>,
}

impl WhiteoutLog {
    pub(crate) fn new(log_path: impl Into<String>) -> Self {
        Self {
            log_path: log_path.into(),
            entries: Mutex::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(None),
        }
    }

    /// Path of the log file on the writable layer.
    pub(crate) fn log_path(&self) -> &str {
        &self.log_path
    }

    /// Replay the log from the writable layer and open it for appending.
    ///
    /// A missing log file means a fresh mount; anything else propagates.
    pub(crate) async fn load(&self, writable: &Arc<dyn Filesystem>) -> FsResult<()> {
        let text = match writable.read_file(Path::new(&self.log_path)).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(FsError::NotFound(_)) => String::new(),
            Err(e) => return Err(e),
        };

        let mut entries = HashMap::new();
        for line in text.split('\n').filter(|l| !l.is_empty()) {
            let (tag, path) = line.split_at(1);
            if path.is_empty() {
                warn!("skipping malformed whiteout record: {line:?}");
                continue;
            }
            entries.insert(path.to_string(), tag == "d");
        }
        debug!(
            "replayed whiteout log: {} bytes, {} paths",
            text.len(),
            entries.len()
        );

        let append = OpenFlag::parse("a").expect("known flag");
        let handle = writable
            .open(Path::new(&self.log_path), append, 0o644)
            .await?;

        *self.writer.lock().await = Some(LogWriter {
            handle,
            offset: text.len() as u64,
        });
        *self.entries.lock() = entries;
        Ok(())
    }

    /// True if `path` is currently whited-out.
    pub(crate) fn is_whiteout(&self, path: &str) -> bool {
        self.entries.lock().get(path) == Some(&true)
    }

    /// Record a deletion: `path` disappears from the union view.
    pub(crate) async fn record_delete(&self, path: &str) -> FsResult<()> {
        debug!("whiteout delete: {path}");
        self.append(&format!("d{path}\n")).await?;
        self.entries.lock().insert(path.to_string(), true);
        Ok(())
    }

    /// Record an undelete: a prior deletion of `path` is revoked.
    pub(crate) async fn record_undelete(&self, path: &str) -> FsResult<()> {
        debug!("whiteout undelete: {path}");
        self.append(&format!("u{path}\n")).await?;
        self.entries.lock().insert(path.to_string(), false);
        Ok(())
    }

    pub(crate) fn record_delete_sync(&self, path: &str) -> FsResult<()> {
        debug!("whiteout delete: {path}");
        self.append_sync(&format!("d{path}\n"))?;
        self.entries.lock().insert(path.to_string(), true);
        Ok(())
    }

    pub(crate) fn record_undelete_sync(&self, path: &str) -> FsResult<()> {
        debug!("whiteout undelete: {path}");
        self.append_sync(&format!("u{path}\n"))?;
        self.entries.lock().insert(path.to_string(), false);
        Ok(())
    }

    async fn append(&self, record: &str) -> FsResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(FsError::not_initialized)?;
        writer.handle.write_at(record.as_bytes(), writer.offset).await?;
        writer.handle.flush().await?;
        writer.offset += record.len() as u64;
        Ok(())
    }

    fn append_sync(&self, record: &str) -> FsResult<()> {
        // Under the serialization contract the handle is uncontended
        // whenever a synchronous call is legal.
        let mut guard = self
            .writer
            .try_lock()
            .map_err(|_| FsError::sync_call_in_flight())?;
        let writer = guard
            .as_mut()
            .ok_or_else(FsError::not_initialized)?;
        writer.handle.write_at_sync(record.as_bytes(), writer.offset)?;
        writer.handle.flush_sync()?;
        writer.offset += record.len() as u64;
        Ok(())
    }
}
