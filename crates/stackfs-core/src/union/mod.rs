//! The union engine: a writable layer overlaid on a readable layer.
//!
//! Precedence is simple: the writable layer shadows the readable layer
//! entirely, and a whiteout hides a readable-layer path that was deleted
//! through the union. Everything else (copy-up, cross-layer rename, the
//! append-only whiteout log) exists to keep those two rules true across
//! mutations and remounts.

mod copy_up;
mod overlay_file;
mod whiteout;

pub use overlay_file::OverlayFile;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stackfs_types::{AbsentAction, ExistsAction, Metadata, OpenFlag};
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::fs::path::{join, normalize};
use crate::fs::{File, Filesystem};
use whiteout::{DEFAULT_LOG_PATH, WhiteoutLog};

/// Write-permission bits ORed into the mode of readable-layer entries, so
/// that everything seen through the union looks mutable.
const WIDEN_WRITE_BITS: u32 = 0o222;

/// Default mode for directories created while materializing a
/// readable-layer subtree during rename.
const RENAME_DIR_MODE: u32 = 0o777;

/// Union mount configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Location of the whiteout log on the writable layer.
    pub whiteout_log_path: String,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            whiteout_log_path: DEFAULT_LOG_PATH.to_string(),
        }
    }
}

struct InitState {
    done: AtomicBool,
    gate: tokio::sync::Mutex<()>,
}

/// The copy-on-write union filesystem.
///
/// Cheaply cloneable: all state is shared behind `Arc`s, which is how
/// [`OverlayFile`] handles keep a non-owning reference back to the engine.
///
/// A fresh engine must be [`initialize`](UnionFs::initialize)d before use;
/// every other operation fails with a permission error until then.
#[derive(Clone)]
pub struct UnionFs {
    pub(crate) writable: Arc<dyn Filesystem>,
    pub(crate) readable: Arc<dyn Filesystem>,
    pub(crate) whiteouts: Arc<WhiteoutLog>,
    init: Arc<InitState>,
}

impl UnionFs {
    /// Create a union of `writable` over `readable` with default options.
    ///
    /// Fails with an invalid-argument error if `writable` is read-only.
    pub fn new(writable: Arc<dyn Filesystem>, readable: Arc<dyn Filesystem>) -> FsResult<Self> {
        Self::with_options(writable, readable, MountOptions::default())
    }

    /// Create a union with explicit [`MountOptions`].
    pub fn with_options(
        writable: Arc<dyn Filesystem>,
        readable: Arc<dyn Filesystem>,
        options: MountOptions,
    ) -> FsResult<Self> {
        if writable.is_read_only() {
            return Err(FsError::InvalidArgument(
                "the writable layer of a union must not be read-only".into(),
            ));
        }
        Ok(Self {
            writable,
            readable,
            whiteouts: Arc::new(WhiteoutLog::new(options.whiteout_log_path)),
            init: Arc::new(InitState {
                done: AtomicBool::new(false),
                gate: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Recover the whiteout log and mark the engine ready.
    ///
    /// One-shot: concurrent callers queue behind the first and observe its
    /// outcome; calling again after success returns immediately; a failure
    /// leaves the engine uninitialized so the call can be retried.
    pub async fn initialize(&self) -> FsResult<()> {
        if self.init.done.load(Ordering::Acquire) {
            return Ok(());
        }
        let _gate = self.init.gate.lock().await;
        if self.init.done.load(Ordering::Acquire) {
            return Ok(());
        }
        self.whiteouts.load(&self.writable).await?;
        self.init.done.store(true, Ordering::Release);
        Ok(())
    }

    /// True once [`initialize`](UnionFs::initialize) has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.init.done.load(Ordering::Acquire)
    }

    /// The `(writable, readable)` layer handles this union composes.
    pub fn layers(&self) -> (Arc<dyn Filesystem>, Arc<dyn Filesystem>) {
        (Arc::clone(&self.writable), Arc::clone(&self.readable))
    }

    fn check_initialized(&self) -> FsResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(FsError::not_initialized())
        }
    }

    /// Initialization gate plus the reserved-path guard: the whiteout log
    /// is engine-private state, not part of the namespace.
    fn check_operable(&self, path: &str) -> FsResult<()> {
        self.check_initialized()?;
        if path == self.whiteouts.log_path() {
            return Err(FsError::InvalidArgument(format!(
                "{path} is reserved by the union filesystem"
            )));
        }
        Ok(())
    }

    fn widen(mut meta: Metadata) -> Metadata {
        meta.mode |= WIDEN_WRITE_BITS;
        meta
    }

    fn write_flag() -> OpenFlag {
        OpenFlag::parse("w").expect("known flag")
    }

    // ───────────────────── union resolution, asynchronous ─────────────────────

    /// Stat through the union: writable first, then readable behind the
    /// whiteout filter, with write bits widened for readable-layer hits.
    async fn stat_at(&self, p: &str) -> FsResult<Metadata> {
        match self.writable.stat(Path::new(p)).await {
            Ok(meta) => Ok(meta),
            Err(FsError::NotFound(_)) => {
                if self.whiteouts.is_whiteout(p) {
                    Err(FsError::NotFound(p.to_string()))
                } else {
                    Ok(Self::widen(self.readable.stat(Path::new(p)).await?))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn exists_at(&self, p: &str) -> bool {
        self.stat_at(p).await.is_ok()
    }

    async fn readdir_at(&self, p: &str) -> FsResult<Vec<String>> {
        let meta = self.stat_at(p).await?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory(p.to_string()));
        }
        let upper = match self.writable.readdir(Path::new(p)).await {
            Ok(names) => names,
            Err(FsError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let lower = match self.readable.readdir(Path::new(p)).await {
            Ok(names) => names,
            Err(FsError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok(self.merge_listing(p, upper, lower))
    }

    /// Concatenate upper and lower listings, deduplicate preserving first
    /// occurrence, and drop whited-out entries and the log file itself.
    fn merge_listing(&self, dir: &str, upper: Vec<String>, lower: Vec<String>) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        for name in upper.into_iter().chain(lower) {
            let full = join(dir, &name);
            if full == self.whiteouts.log_path() || self.whiteouts.is_whiteout(&full) {
                continue;
            }
            if seen.insert(name.clone()) {
                names.push(name);
            }
        }
        names
    }

    async fn read_file_at(&self, p: &str) -> FsResult<Vec<u8>> {
        match self.writable.read_file(Path::new(p)).await {
            Ok(data) => Ok(data),
            Err(FsError::NotFound(_)) => {
                if self.whiteouts.is_whiteout(p) {
                    Err(FsError::NotFound(p.to_string()))
                } else {
                    self.readable.read_file(Path::new(p)).await
                }
            }
            Err(e) => Err(e),
        }
    }

    /// The engine's write path: flag checks against the union view, parent
    /// materialization, whole-file write to the writable layer, and
    /// whiteout revocation. Copy-up and OverlayFile flush both land here.
    pub(crate) async fn write_file_at(
        &self,
        p: &str,
        data: &[u8],
        flag: OpenFlag,
        mode: u32,
    ) -> FsResult<()> {
        let visible = self.exists_at(p).await;
        if visible {
            if flag.on_exists() == ExistsAction::Fail {
                return Err(FsError::AlreadyExists(p.to_string()));
            }
        } else if flag.on_absent() == AbsentAction::Fail {
            return Err(FsError::NotFound(p.to_string()));
        }

        // Appends are resolved against union content, so appending to a
        // readable-layer file carries its bytes over.
        let payload = if flag.is_appending() && visible {
            let mut existing = self.read_file_at(p).await?;
            existing.extend_from_slice(data);
            existing
        } else {
            data.to_vec()
        };

        self.ensure_parent_dirs(p).await?;
        self.writable
            .write_file(Path::new(p), &payload, Self::write_flag(), mode)
            .await?;
        if self.whiteouts.is_whiteout(p) {
            self.whiteouts.record_undelete(p).await?;
        }
        Ok(())
    }

    async fn open_at(&self, p: &str, flag: OpenFlag, mode: u32) -> FsResult<Box<dyn File>> {
        match self.stat_at(p).await {
            Ok(meta) => match flag.on_exists() {
                ExistsAction::Fail => Err(FsError::AlreadyExists(p.to_string())),
                ExistsAction::Truncate => {
                    self.ensure_parent_dirs(p).await?;
                    self.writable.open(Path::new(p), flag, mode).await
                }
                ExistsAction::UseExisting => {
                    if self.writable.exists(Path::new(p)).await {
                        self.writable.open(Path::new(p), flag, mode).await
                    } else {
                        // Not yet copied up: buffer the readable content
                        // and defer the write-back to flush.
                        let data = self.readable.read_file(Path::new(p)).await?;
                        let mut stats = meta;
                        stats.mode = mode;
                        stats.size = data.len() as u64;
                        Ok(Box::new(OverlayFile::new(
                            self.clone(),
                            p.to_string(),
                            flag,
                            stats,
                            data,
                        )))
                    }
                }
            },
            Err(FsError::NotFound(_)) => match flag.on_absent() {
                AbsentAction::Fail => Err(FsError::NotFound(p.to_string())),
                AbsentAction::Create => {
                    self.ensure_parent_dirs(p).await?;
                    let file = self.writable.open(Path::new(p), flag, mode).await?;
                    if self.whiteouts.is_whiteout(p) {
                        self.whiteouts.record_undelete(p).await?;
                    }
                    Ok(file)
                }
            },
            Err(e) => Err(e),
        }
    }

    async fn unlink_at(&self, p: &str) -> FsResult<()> {
        if !self.exists_at(p).await {
            return Err(FsError::NotFound(p.to_string()));
        }
        if self.writable.exists(Path::new(p)).await {
            self.writable.unlink(Path::new(p)).await?;
            // The readable copy would become visible again; white it out.
            if self.readable.exists(Path::new(p)).await {
                self.whiteouts.record_delete(p).await?;
            }
        } else {
            self.whiteouts.record_delete(p).await?;
        }
        Ok(())
    }

    async fn rmdir_at(&self, p: &str) -> FsResult<()> {
        if !self.exists_at(p).await {
            return Err(FsError::NotFound(p.to_string()));
        }
        if self.writable.exists(Path::new(p)).await {
            self.writable.rmdir(Path::new(p)).await?;
        }
        // Still visible through the readable layer: it may only disappear
        // if the union view of the directory is empty.
        if self.exists_at(p).await {
            if !self.readdir_at(p).await?.is_empty() {
                return Err(FsError::NotEmpty(p.to_string()));
            }
            self.whiteouts.record_delete(p).await?;
        }
        Ok(())
    }

    async fn mkdir_at(&self, p: &str, mode: u32) -> FsResult<()> {
        if self.exists_at(p).await {
            return Err(FsError::AlreadyExists(p.to_string()));
        }
        self.ensure_parent_dirs(p).await?;
        self.writable.mkdir(Path::new(p), mode).await?;
        // The writable entry now shadows any stale whiteout; revoke it so
        // the log converges with the namespace.
        if self.whiteouts.is_whiteout(p) {
            self.whiteouts.record_undelete(p).await?;
        }
        Ok(())
    }

    /// The cross-layer rename algorithm.
    ///
    /// Directories that live on the readable layer are materialized on the
    /// writable layer and their children moved one by one; files move by
    /// read + write + unlink. Whiteouts recorded along the way are
    /// durable, so a failure mid-move leaves a consistent (if partial)
    /// merge rather than corruption.
    async fn rename_at(&self, old: &str, new: &str) -> FsResult<()> {
        if old == new {
            return Ok(());
        }
        debug!("rename: {old} -> {new}");
        let old_meta = self.stat_at(old).await?;
        let new_meta = match self.stat_at(new).await {
            Ok(meta) => Some(meta),
            Err(FsError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        if old_meta.is_dir() {
            match &new_meta {
                Some(meta) if !meta.is_dir() => {
                    return Err(FsError::NotADirectory(new.to_string()));
                }
                Some(_) => {
                    if !self.readdir_at(new).await?.is_empty() {
                        return Err(FsError::NotEmpty(new.to_string()));
                    }
                }
                None => {
                    if self.writable.exists(Path::new(old)).await {
                        // Whole subtree already on the writable layer.
                        return self.writable.rename(Path::new(old), Path::new(new)).await;
                    }
                    self.ensure_parent_dirs(new).await?;
                    self.writable.mkdir(Path::new(new), RENAME_DIR_MODE).await?;
                }
            }
            for child in self.readdir_at(old).await? {
                Box::pin(self.rename_at(&join(old, &child), &join(new, &child))).await?;
            }
            self.rmdir_at(old).await
        } else {
            if let Some(meta) = &new_meta
                && meta.is_dir()
            {
                return Err(FsError::IsADirectory(new.to_string()));
            }
            let data = self.read_file_at(old).await?;
            self.write_file_at(new, &data, Self::write_flag(), old_meta.mode)
                .await?;
            self.unlink_at(old).await
        }
    }

    async fn set_attr(&self, p: &str, op: AttrOp) -> FsResult<()> {
        let meta = self.stat_at(p).await?;
        if !self.writable.exists(Path::new(p)).await {
            self.copy_up(p, &meta).await?;
        }
        match op {
            AttrOp::Chmod(mode) => self.writable.chmod(Path::new(p), mode).await,
            AttrOp::Chown(uid, gid) => self.writable.chown(Path::new(p), uid, gid).await,
            AttrOp::Utimes(atime, mtime) => self.writable.utimes(Path::new(p), atime, mtime).await,
        }
    }

    // ───────────────────── union resolution, synchronous ─────────────────────

    fn stat_at_sync(&self, p: &str) -> FsResult<Metadata> {
        match self.writable.stat_sync(Path::new(p)) {
            Ok(meta) => Ok(meta),
            Err(FsError::NotFound(_)) => {
                if self.whiteouts.is_whiteout(p) {
                    Err(FsError::NotFound(p.to_string()))
                } else {
                    Ok(Self::widen(self.readable.stat_sync(Path::new(p))?))
                }
            }
            Err(e) => Err(e),
        }
    }

    fn exists_at_sync(&self, p: &str) -> bool {
        self.stat_at_sync(p).is_ok()
    }

    fn readdir_at_sync(&self, p: &str) -> FsResult<Vec<String>> {
        let meta = self.stat_at_sync(p)?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory(p.to_string()));
        }
        let upper = match self.writable.readdir_sync(Path::new(p)) {
            Ok(names) => names,
            Err(FsError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let lower = match self.readable.readdir_sync(Path::new(p)) {
            Ok(names) => names,
            Err(FsError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok(self.merge_listing(p, upper, lower))
    }

    fn read_file_at_sync(&self, p: &str) -> FsResult<Vec<u8>> {
        match self.writable.read_file_sync(Path::new(p)) {
            Ok(data) => Ok(data),
            Err(FsError::NotFound(_)) => {
                if self.whiteouts.is_whiteout(p) {
                    Err(FsError::NotFound(p.to_string()))
                } else {
                    self.readable.read_file_sync(Path::new(p))
                }
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn write_file_at_sync(
        &self,
        p: &str,
        data: &[u8],
        flag: OpenFlag,
        mode: u32,
    ) -> FsResult<()> {
        let visible = self.exists_at_sync(p);
        if visible {
            if flag.on_exists() == ExistsAction::Fail {
                return Err(FsError::AlreadyExists(p.to_string()));
            }
        } else if flag.on_absent() == AbsentAction::Fail {
            return Err(FsError::NotFound(p.to_string()));
        }

        let payload = if flag.is_appending() && visible {
            let mut existing = self.read_file_at_sync(p)?;
            existing.extend_from_slice(data);
            existing
        } else {
            data.to_vec()
        };

        self.ensure_parent_dirs_sync(p)?;
        self.writable
            .write_file_sync(Path::new(p), &payload, Self::write_flag(), mode)?;
        if self.whiteouts.is_whiteout(p) {
            self.whiteouts.record_undelete_sync(p)?;
        }
        Ok(())
    }

    fn open_at_sync(&self, p: &str, flag: OpenFlag, mode: u32) -> FsResult<Box<dyn File>> {
        match self.stat_at_sync(p) {
            Ok(meta) => match flag.on_exists() {
                ExistsAction::Fail => Err(FsError::AlreadyExists(p.to_string())),
                ExistsAction::Truncate => {
                    self.ensure_parent_dirs_sync(p)?;
                    self.writable.open_sync(Path::new(p), flag, mode)
                }
                ExistsAction::UseExisting => {
                    if self.writable.exists_sync(Path::new(p)) {
                        self.writable.open_sync(Path::new(p), flag, mode)
                    } else {
                        let data = self.readable.read_file_sync(Path::new(p))?;
                        let mut stats = meta;
                        stats.mode = mode;
                        stats.size = data.len() as u64;
                        Ok(Box::new(OverlayFile::new(
                            self.clone(),
                            p.to_string(),
                            flag,
                            stats,
                            data,
                        )))
                    }
                }
            },
            Err(FsError::NotFound(_)) => match flag.on_absent() {
                AbsentAction::Fail => Err(FsError::NotFound(p.to_string())),
                AbsentAction::Create => {
                    self.ensure_parent_dirs_sync(p)?;
                    let file = self.writable.open_sync(Path::new(p), flag, mode)?;
                    if self.whiteouts.is_whiteout(p) {
                        self.whiteouts.record_undelete_sync(p)?;
                    }
                    Ok(file)
                }
            },
            Err(e) => Err(e),
        }
    }

    fn unlink_at_sync(&self, p: &str) -> FsResult<()> {
        if !self.exists_at_sync(p) {
            return Err(FsError::NotFound(p.to_string()));
        }
        if self.writable.exists_sync(Path::new(p)) {
            self.writable.unlink_sync(Path::new(p))?;
            if self.readable.exists_sync(Path::new(p)) {
                self.whiteouts.record_delete_sync(p)?;
            }
        } else {
            self.whiteouts.record_delete_sync(p)?;
        }
        Ok(())
    }

    fn rmdir_at_sync(&self, p: &str) -> FsResult<()> {
        if !self.exists_at_sync(p) {
            return Err(FsError::NotFound(p.to_string()));
        }
        if self.writable.exists_sync(Path::new(p)) {
            self.writable.rmdir_sync(Path::new(p))?;
        }
        if self.exists_at_sync(p) {
            if !self.readdir_at_sync(p)?.is_empty() {
                return Err(FsError::NotEmpty(p.to_string()));
            }
            self.whiteouts.record_delete_sync(p)?;
        }
        Ok(())
    }

    fn mkdir_at_sync(&self, p: &str, mode: u32) -> FsResult<()> {
        if self.exists_at_sync(p) {
            return Err(FsError::AlreadyExists(p.to_string()));
        }
        self.ensure_parent_dirs_sync(p)?;
        self.writable.mkdir_sync(Path::new(p), mode)?;
        if self.whiteouts.is_whiteout(p) {
            self.whiteouts.record_undelete_sync(p)?;
        }
        Ok(())
    }

    fn rename_at_sync(&self, old: &str, new: &str) -> FsResult<()> {
        if old == new {
            return Ok(());
        }
        debug!("rename: {old} -> {new}");
        let old_meta = self.stat_at_sync(old)?;
        let new_meta = match self.stat_at_sync(new) {
            Ok(meta) => Some(meta),
            Err(FsError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        if old_meta.is_dir() {
            match &new_meta {
                Some(meta) if !meta.is_dir() => {
                    return Err(FsError::NotADirectory(new.to_string()));
                }
                Some(_) => {
                    if !self.readdir_at_sync(new)?.is_empty() {
                        return Err(FsError::NotEmpty(new.to_string()));
                    }
                }
                None => {
                    if self.writable.exists_sync(Path::new(old)) {
                        return self.writable.rename_sync(Path::new(old), Path::new(new));
                    }
                    self.ensure_parent_dirs_sync(new)?;
                    self.writable.mkdir_sync(Path::new(new), RENAME_DIR_MODE)?;
                }
            }
            for child in self.readdir_at_sync(old)? {
                self.rename_at_sync(&join(old, &child), &join(new, &child))?;
            }
            self.rmdir_at_sync(old)
        } else {
            if let Some(meta) = &new_meta
                && meta.is_dir()
            {
                return Err(FsError::IsADirectory(new.to_string()));
            }
            let data = self.read_file_at_sync(old)?;
            self.write_file_at_sync(new, &data, Self::write_flag(), old_meta.mode)?;
            self.unlink_at_sync(old)
        }
    }

    fn set_attr_sync(&self, p: &str, op: AttrOp) -> FsResult<()> {
        let meta = self.stat_at_sync(p)?;
        if !self.writable.exists_sync(Path::new(p)) {
            self.copy_up_sync(p, &meta)?;
        }
        match op {
            AttrOp::Chmod(mode) => self.writable.chmod_sync(Path::new(p), mode),
            AttrOp::Chown(uid, gid) => self.writable.chown_sync(Path::new(p), uid, gid),
            AttrOp::Utimes(atime, mtime) => self.writable.utimes_sync(Path::new(p), atime, mtime),
        }
    }
}

/// Attribute mutations share one copy-up-then-apply path.
enum AttrOp {
    Chmod(u32),
    Chown(u32, u32),
    Utimes(SystemTime, SystemTime),
}

#[async_trait]
impl Filesystem for UnionFs {
    async fn stat(&self, path: &Path) -> FsResult<Metadata> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.stat_at(&p).await
    }

    async fn open(&self, path: &Path, flag: OpenFlag, mode: u32) -> FsResult<Box<dyn File>> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.open_at(&p, flag, mode).await
    }

    async fn read_file(&self, path: &Path) -> FsResult<Vec<u8>> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.read_file_at(&p).await
    }

    async fn write_file(
        &self,
        path: &Path,
        data: &[u8],
        flag: OpenFlag,
        mode: u32,
    ) -> FsResult<()> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.write_file_at(&p, data, flag, mode).await
    }

    async fn unlink(&self, path: &Path) -> FsResult<()> {
        let p = normalize(path);
        self.check_operable(&p)?;
        debug!("unlink: {p}");
        self.unlink_at(&p).await
    }

    async fn rmdir(&self, path: &Path) -> FsResult<()> {
        let p = normalize(path);
        self.check_operable(&p)?;
        debug!("rmdir: {p}");
        self.rmdir_at(&p).await
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.mkdir_at(&p, mode).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        let old = normalize(from);
        let new = normalize(to);
        self.check_operable(&old)?;
        self.check_operable(&new)?;
        self.rename_at(&old, &new).await
    }

    async fn readdir(&self, path: &Path) -> FsResult<Vec<String>> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.readdir_at(&p).await
    }

    async fn exists(&self, path: &Path) -> bool {
        let p = normalize(path);
        if self.check_operable(&p).is_err() {
            return false;
        }
        self.exists_at(&p).await
    }

    async fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.set_attr(&p, AttrOp::Chmod(mode)).await
    }

    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.set_attr(&p, AttrOp::Chown(uid, gid)).await
    }

    async fn utimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.set_attr(&p, AttrOp::Utimes(atime, mtime)).await
    }

    fn stat_sync(&self, path: &Path) -> FsResult<Metadata> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.stat_at_sync(&p)
    }

    fn open_sync(&self, path: &Path, flag: OpenFlag, mode: u32) -> FsResult<Box<dyn File>> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.open_at_sync(&p, flag, mode)
    }

    fn read_file_sync(&self, path: &Path) -> FsResult<Vec<u8>> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.read_file_at_sync(&p)
    }

    fn write_file_sync(&self, path: &Path, data: &[u8], flag: OpenFlag, mode: u32) -> FsResult<()> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.write_file_at_sync(&p, data, flag, mode)
    }

    fn unlink_sync(&self, path: &Path) -> FsResult<()> {
        let p = normalize(path);
        self.check_operable(&p)?;
        debug!("unlink: {p}");
        self.unlink_at_sync(&p)
    }

    fn rmdir_sync(&self, path: &Path) -> FsResult<()> {
        let p = normalize(path);
        self.check_operable(&p)?;
        debug!("rmdir: {p}");
        self.rmdir_at_sync(&p)
    }

    fn mkdir_sync(&self, path: &Path, mode: u32) -> FsResult<()> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.mkdir_at_sync(&p, mode)
    }

    fn rename_sync(&self, from: &Path, to: &Path) -> FsResult<()> {
        let old = normalize(from);
        let new = normalize(to);
        self.check_operable(&old)?;
        self.check_operable(&new)?;
        self.rename_at_sync(&old, &new)
    }

    fn readdir_sync(&self, path: &Path) -> FsResult<Vec<String>> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.readdir_at_sync(&p)
    }

    fn exists_sync(&self, path: &Path) -> bool {
        let p = normalize(path);
        self.check_operable(&p).is_ok() && self.exists_at_sync(&p)
    }

    fn chmod_sync(&self, path: &Path, mode: u32) -> FsResult<()> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.set_attr_sync(&p, AttrOp::Chmod(mode))
    }

    fn chown_sync(&self, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.set_attr_sync(&p, AttrOp::Chown(uid, gid))
    }

    fn utimes_sync(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        let p = normalize(path);
        self.check_operable(&p)?;
        self.set_attr_sync(&p, AttrOp::Utimes(atime, mtime))
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn supports_sync(&self) -> bool {
        self.writable.supports_sync() && self.readable.supports_sync()
    }

    fn supports_links(&self) -> bool {
        false
    }

    fn supports_props(&self) -> bool {
        self.writable.supports_props() && self.readable.supports_props()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;

    fn w() -> OpenFlag {
        OpenFlag::parse("w").unwrap()
    }

    /// A union over two in-memory layers, with the readable side
    /// populated by `setup` and then frozen.
    async fn union_with<F>(setup: F) -> UnionFs
    where
        F: AsyncFnOnce(&MemoryFs),
    {
        let mut lower = MemoryFs::new();
        setup(&lower).await;
        lower.freeze();
        let fs = UnionFs::new(Arc::new(MemoryFs::new()), Arc::new(lower)).unwrap();
        fs.initialize().await.unwrap();
        fs
    }

    #[tokio::test]
    async fn test_rejects_read_only_writable_layer() {
        let result = UnionFs::new(Arc::new(MemoryFs::read_only()), Arc::new(MemoryFs::new()));
        assert!(matches!(result, Err(FsError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_operations_require_initialize() {
        let fs = UnionFs::new(Arc::new(MemoryFs::new()), Arc::new(MemoryFs::new())).unwrap();
        assert!(matches!(
            fs.stat(Path::new("/x")).await,
            Err(FsError::Permission(_))
        ));
        assert!(matches!(
            fs.mkdir_sync(Path::new("/d"), 0o755),
            Err(FsError::Permission(_))
        ));

        fs.initialize().await.unwrap();
        assert!(fs.is_initialized());
        fs.mkdir(Path::new("/d"), 0o755).await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let fs = UnionFs::new(Arc::new(MemoryFs::new()), Arc::new(MemoryFs::new())).unwrap();
        fs.initialize().await.unwrap();
        fs.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_initialize() {
        let fs = UnionFs::new(Arc::new(MemoryFs::new()), Arc::new(MemoryFs::new())).unwrap();
        let (a, b) = tokio::join!(fs.initialize(), fs.initialize());
        a.unwrap();
        b.unwrap();
        assert!(fs.is_initialized());
    }

    #[tokio::test]
    async fn test_writable_shadows_readable() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower
                .write_file(Path::new("/f"), b"lower", w(), 0o644)
                .await
                .unwrap();
        })
        .await;

        fs.write_file(Path::new("/f"), b"upper", w(), 0o600).await.unwrap();
        assert_eq!(fs.read_file(Path::new("/f")).await.unwrap(), b"upper");
        // Writable metadata wins wholesale; no widening applies.
        let meta = fs.stat(Path::new("/f")).await.unwrap();
        assert_eq!(meta.size, 5);
    }

    #[tokio::test]
    async fn test_stat_widens_readable_mode() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower
                .write_file(Path::new("/ro.txt"), b"data", w(), 0o444)
                .await
                .unwrap();
        })
        .await;

        let meta = fs.stat(Path::new("/ro.txt")).await.unwrap();
        assert_eq!(meta.mode, 0o666);
        assert_ne!(meta.mode & 0o222, 0);
        assert!(meta.is_file());
    }

    #[tokio::test]
    async fn test_readdir_merges_and_dedups() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower.write_file(Path::new("/d/a"), b"", w(), 0o644).await.unwrap();
            lower.write_file(Path::new("/d/b"), b"", w(), 0o644).await.unwrap();
        })
        .await;

        fs.write_file(Path::new("/d/a"), b"upper", w(), 0o644).await.unwrap();
        fs.write_file(Path::new("/d/c"), b"", w(), 0o644).await.unwrap();

        let mut names = fs.readdir(Path::new("/d")).await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_readdir_hides_whiteout_log() {
        let fs = union_with(async |_: &MemoryFs| {}).await;
        fs.unlink(Path::new("/nope")).await.unwrap_err();
        fs.write_file(Path::new("/visible"), b"", w(), 0o644).await.unwrap();

        let names = fs.readdir(Path::new("/")).await.unwrap();
        assert_eq!(names, vec!["visible"]);
    }

    #[tokio::test]
    async fn test_log_path_is_reserved() {
        let fs = union_with(async |_: &MemoryFs| {}).await;
        let result = fs.read_file(Path::new("/.deletedFiles.log")).await;
        assert!(matches!(result, Err(FsError::InvalidArgument(_))));
        assert!(!fs.exists(Path::new("/.deletedFiles.log")).await);
    }

    #[tokio::test]
    async fn test_unlink_readable_records_whiteout() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower.write_file(Path::new("/x"), b"data", w(), 0o644).await.unwrap();
        })
        .await;

        fs.unlink(Path::new("/x")).await.unwrap();
        assert!(!fs.exists(Path::new("/x")).await);
        assert!(matches!(
            fs.unlink(Path::new("/x")).await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unlink_on_both_layers_records_whiteout() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower.write_file(Path::new("/x"), b"lower", w(), 0o644).await.unwrap();
        })
        .await;
        fs.write_file(Path::new("/x"), b"upper", w(), 0o644).await.unwrap();

        fs.unlink(Path::new("/x")).await.unwrap();
        assert!(!fs.exists(Path::new("/x")).await);

        let (writable, _) = fs.layers();
        assert!(!writable.exists(Path::new("/x")).await);
    }

    #[tokio::test]
    async fn test_write_clears_whiteout() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower.write_file(Path::new("/x"), b"old", w(), 0o644).await.unwrap();
        })
        .await;

        fs.unlink(Path::new("/x")).await.unwrap();
        fs.write_file(Path::new("/x"), b"new", w(), 0o644).await.unwrap();
        assert_eq!(fs.read_file(Path::new("/x")).await.unwrap(), b"new");

        // The revocation is durable across a remount.
        let (writable, readable) = fs.layers();
        let fresh = UnionFs::new(writable, readable).unwrap();
        fresh.initialize().await.unwrap();
        assert_eq!(fresh.read_file(Path::new("/x")).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_mkdir_over_whiteout() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower.mkdir(Path::new("/d"), 0o755).await.unwrap();
        })
        .await;

        fs.rmdir(Path::new("/d")).await.unwrap();
        assert!(!fs.exists(Path::new("/d")).await);

        fs.mkdir(Path::new("/d"), 0o700).await.unwrap();
        assert!(fs.stat(Path::new("/d")).await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_mkdir_visible_fails() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower.mkdir(Path::new("/d"), 0o755).await.unwrap();
        })
        .await;
        assert!(matches!(
            fs.mkdir(Path::new("/d"), 0o755).await,
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_rmdir_non_empty_union_fails() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower
                .write_file(Path::new("/d/child"), b"", w(), 0o644)
                .await
                .unwrap();
        })
        .await;

        assert!(matches!(
            fs.rmdir(Path::new("/d")).await,
            Err(FsError::NotEmpty(_))
        ));

        // Whiting out the child empties the union view.
        fs.unlink(Path::new("/d/child")).await.unwrap();
        fs.rmdir(Path::new("/d")).await.unwrap();
        assert!(!fs.exists(Path::new("/d")).await);
    }

    #[tokio::test]
    async fn test_chmod_copies_up_directory() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower.mkdir(Path::new("/dir"), 0o755).await.unwrap();
        })
        .await;

        fs.chmod(Path::new("/dir"), 0o700).await.unwrap();

        let (writable, _) = fs.layers();
        let meta = writable.stat(Path::new("/dir")).await.unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.mode, 0o700);
    }

    #[tokio::test]
    async fn test_chown_and_utimes_copy_up() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower.write_file(Path::new("/f"), b"data", w(), 0o644).await.unwrap();
        })
        .await;

        fs.chown(Path::new("/f"), 7, 8).await.unwrap();
        let meta = fs.stat(Path::new("/f")).await.unwrap();
        assert_eq!((meta.uid, meta.gid), (7, 8));

        let t = SystemTime::UNIX_EPOCH;
        fs.utimes(Path::new("/f"), t, t).await.unwrap();
        assert_eq!(fs.stat(Path::new("/f")).await.unwrap().mtime, t);

        // Content was carried over by the copy-up.
        assert_eq!(fs.read_file(Path::new("/f")).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_open_missing_with_read_flag_fails() {
        let fs = union_with(async |_: &MemoryFs| {}).await;
        let result = fs
            .open(Path::new("/nope"), OpenFlag::parse("r").unwrap(), 0o644)
            .await;
        assert!(matches!(result, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_open_exclusive_on_visible_fails() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower.write_file(Path::new("/f"), b"x", w(), 0o644).await.unwrap();
        })
        .await;
        let result = fs
            .open(Path::new("/f"), OpenFlag::parse("wx").unwrap(), 0o644)
            .await;
        assert!(matches!(result, Err(FsError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_open_create_lands_on_writable() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower.mkdir(Path::new("/sub"), 0o755).await.unwrap();
        })
        .await;
        let mut file = fs
            .open(Path::new("/sub/new.txt"), w(), 0o644)
            .await
            .unwrap();
        file.write_at(b"fresh", 0).await.unwrap();
        file.close().await.unwrap();

        let (writable, _) = fs.layers();
        assert_eq!(
            writable.read_file(Path::new("/sub/new.txt")).await.unwrap(),
            b"fresh"
        );
    }

    #[tokio::test]
    async fn test_rename_file_within_union() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower.write_file(Path::new("/a.txt"), b"body", w(), 0o644).await.unwrap();
        })
        .await;

        fs.rename(Path::new("/a.txt"), Path::new("/b.txt")).await.unwrap();
        assert!(!fs.exists(Path::new("/a.txt")).await);
        assert_eq!(fs.read_file(Path::new("/b.txt")).await.unwrap(), b"body");
    }

    #[tokio::test]
    async fn test_rename_noop_on_same_path() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower.write_file(Path::new("/f"), b"x", w(), 0o644).await.unwrap();
        })
        .await;
        fs.rename(Path::new("/f"), Path::new("/f")).await.unwrap();
        assert!(fs.exists(Path::new("/f")).await);
    }

    #[tokio::test]
    async fn test_rename_missing_source_fails() {
        let fs = union_with(async |_: &MemoryFs| {}).await;
        assert!(matches!(
            fs.rename(Path::new("/a"), Path::new("/b")).await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_file_onto_directory_fails() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower.write_file(Path::new("/f"), b"x", w(), 0o644).await.unwrap();
            lower.mkdir(Path::new("/d"), 0o755).await.unwrap();
        })
        .await;
        assert!(matches!(
            fs.rename(Path::new("/f"), Path::new("/d")).await,
            Err(FsError::IsADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_directory_onto_file_fails() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower.mkdir(Path::new("/d"), 0o755).await.unwrap();
            lower.write_file(Path::new("/f"), b"x", w(), 0o644).await.unwrap();
        })
        .await;
        assert!(matches!(
            fs.rename(Path::new("/d"), Path::new("/f")).await,
            Err(FsError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_directory_into_non_empty_fails() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower.mkdir(Path::new("/src"), 0o755).await.unwrap();
            lower
                .write_file(Path::new("/dst/keep"), b"", w(), 0o644)
                .await
                .unwrap();
        })
        .await;
        assert!(matches!(
            fs.rename(Path::new("/src"), Path::new("/dst")).await,
            Err(FsError::NotEmpty(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_directory_native_on_writable() {
        let fs = union_with(async |_: &MemoryFs| {}).await;
        fs.mkdir(Path::new("/dir"), 0o755).await.unwrap();
        fs.write_file(Path::new("/dir/f"), b"x", w(), 0o644).await.unwrap();

        fs.rename(Path::new("/dir"), Path::new("/moved")).await.unwrap();
        assert!(fs.exists(Path::new("/moved/f")).await);
        assert!(!fs.exists(Path::new("/dir")).await);
    }

    #[tokio::test]
    async fn test_sync_variants_mirror_async() {
        let fs = union_with(async |lower: &MemoryFs| {
            lower.write_file(Path::new("/ro"), b"lower", w(), 0o444).await.unwrap();
        })
        .await;

        assert_eq!(fs.stat_sync(Path::new("/ro")).unwrap().mode, 0o666);
        assert_eq!(fs.read_file_sync(Path::new("/ro")).unwrap(), b"lower");

        fs.write_file_sync(Path::new("/new"), b"data", w(), 0o644).unwrap();
        assert_eq!(fs.read_file_sync(Path::new("/new")).unwrap(), b"data");

        fs.unlink_sync(Path::new("/ro")).unwrap();
        assert!(!fs.exists_sync(Path::new("/ro")));

        fs.mkdir_sync(Path::new("/d"), 0o755).unwrap();
        assert_eq!(fs.readdir_sync(Path::new("/d")).unwrap().len(), 0);

        fs.rename_sync(Path::new("/new"), Path::new("/d/new")).unwrap();
        assert_eq!(fs.read_file_sync(Path::new("/d/new")).unwrap(), b"data");

        fs.chmod_sync(Path::new("/d/new"), 0o600).unwrap();
        assert_eq!(fs.stat_sync(Path::new("/d/new")).unwrap().mode, 0o600);
    }

    #[tokio::test]
    async fn test_capabilities() {
        let fs = union_with(async |_: &MemoryFs| {}).await;
        assert!(!fs.is_read_only());
        assert!(!fs.supports_links());
        assert!(fs.supports_sync());
        assert!(fs.supports_props());
    }
}
