//! In-memory filesystem implementation.
//!
//! The bundled reference backing: carries modes, ownership, and timestamps
//! so attribute operations are exercisable, and implements both the
//! asynchronous and synchronous halves of the contract. All data is lost
//! on drop.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::RwLock;
use stackfs_types::{AbsentAction, EntryKind, ExistsAction, Metadata, OpenFlag};

use super::path::{join, normalize, parent};
use super::traits::{File, Filesystem};
use crate::error::{FsError, FsResult};

/// Default mode for directories created implicitly as parents.
const IMPLICIT_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone)]
enum Entry {
    File {
        data: Vec<u8>,
        mode: u32,
        uid: u32,
        gid: u32,
        atime: SystemTime,
        mtime: SystemTime,
    },
    Directory {
        mode: u32,
        uid: u32,
        gid: u32,
        atime: SystemTime,
        mtime: SystemTime,
    },
}

impl Entry {
    fn file(data: Vec<u8>, mode: u32) -> Self {
        let now = SystemTime::now();
        Entry::File {
            data,
            mode,
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
        }
    }

    fn directory(mode: u32) -> Self {
        let now = SystemTime::now();
        Entry::Directory {
            mode,
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
        }
    }

    fn metadata(&self) -> Metadata {
        match self {
            Entry::File {
                data,
                mode,
                uid,
                gid,
                atime,
                mtime,
            } => Metadata {
                kind: EntryKind::File,
                size: data.len() as u64,
                mode: *mode,
                uid: *uid,
                gid: *gid,
                atime: *atime,
                mtime: *mtime,
            },
            Entry::Directory {
                mode,
                uid,
                gid,
                atime,
                mtime,
            } => Metadata {
                kind: EntryKind::Directory,
                size: 0,
                mode: *mode,
                uid: *uid,
                gid: *gid,
                atime: *atime,
                mtime: *mtime,
            },
        }
    }
}

type EntryMap = HashMap<String, Entry>;

/// In-memory filesystem.
///
/// State lives behind a `parking_lot::RwLock` so the synchronous variants
/// never touch an async lock. Open handles share the entry map through an
/// `Arc` and write back on flush.
pub struct MemoryFs {
    entries: Arc<RwLock<EntryMap>>,
    read_only: bool,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    /// Create a new empty in-memory filesystem.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        // Root directory always exists
        entries.insert("/".to_string(), Entry::directory(0o777));
        Self {
            entries: Arc::new(RwLock::new(entries)),
            read_only: false,
        }
    }

    /// Create a read-only in-memory filesystem.
    ///
    /// Useful as the lower layer of a union: populate a writable instance,
    /// then freeze it with [`MemoryFs::freeze`].
    pub fn read_only() -> Self {
        let mut fs = Self::new();
        fs.read_only = true;
        fs
    }

    /// Freeze this filesystem, rejecting all further mutations.
    pub fn freeze(&mut self) {
        self.read_only = true;
    }

    fn check_writable(&self) -> FsResult<()> {
        if self.read_only {
            Err(FsError::Permission("read-only filesystem".into()))
        } else {
            Ok(())
        }
    }

    /// Create any missing ancestor directories of `path`.
    ///
    /// Must be called with the write lock held.
    fn ensure_parents(entries: &mut EntryMap, path: &str) -> FsResult<()> {
        let Some(dir) = parent(path) else {
            return Ok(());
        };
        let mut current = String::from("/");
        for component in dir.split('/').filter(|c| !c.is_empty()) {
            current = join(&current, component);
            match entries.get(&current) {
                Some(Entry::Directory { .. }) => {}
                Some(Entry::File { .. }) => {
                    return Err(FsError::NotADirectory(current));
                }
                None => {
                    entries.insert(current.clone(), Entry::directory(IMPLICIT_DIR_MODE));
                }
            }
        }
        Ok(())
    }

    fn has_children(entries: &EntryMap, dir: &str) -> bool {
        entries
            .keys()
            .any(|k| k != dir && parent(k) == Some(dir))
    }
}

#[async_trait]
impl Filesystem for MemoryFs {
    // Backing-layer calls are suspension points for the union engine;
    // yield so composed operations interleave the way real I/O would.

    async fn stat(&self, path: &Path) -> FsResult<Metadata> {
        tokio::task::yield_now().await;
        self.stat_sync(path)
    }

    async fn open(&self, path: &Path, flag: OpenFlag, mode: u32) -> FsResult<Box<dyn File>> {
        tokio::task::yield_now().await;
        self.open_sync(path, flag, mode)
    }

    async fn read_file(&self, path: &Path) -> FsResult<Vec<u8>> {
        tokio::task::yield_now().await;
        self.read_file_sync(path)
    }

    async fn write_file(
        &self,
        path: &Path,
        data: &[u8],
        flag: OpenFlag,
        mode: u32,
    ) -> FsResult<()> {
        tokio::task::yield_now().await;
        self.write_file_sync(path, data, flag, mode)
    }

    async fn unlink(&self, path: &Path) -> FsResult<()> {
        tokio::task::yield_now().await;
        self.unlink_sync(path)
    }

    async fn rmdir(&self, path: &Path) -> FsResult<()> {
        tokio::task::yield_now().await;
        self.rmdir_sync(path)
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()> {
        tokio::task::yield_now().await;
        self.mkdir_sync(path, mode)
    }

    async fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        tokio::task::yield_now().await;
        self.rename_sync(from, to)
    }

    async fn readdir(&self, path: &Path) -> FsResult<Vec<String>> {
        tokio::task::yield_now().await;
        self.readdir_sync(path)
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::task::yield_now().await;
        self.exists_sync(path)
    }

    async fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
        tokio::task::yield_now().await;
        self.chmod_sync(path, mode)
    }

    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        tokio::task::yield_now().await;
        self.chown_sync(path, uid, gid)
    }

    async fn utimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        tokio::task::yield_now().await;
        self.utimes_sync(path, atime, mtime)
    }

    fn stat_sync(&self, path: &Path) -> FsResult<Metadata> {
        let p = normalize(path);
        let entries = self.entries.read();
        entries
            .get(&p)
            .map(Entry::metadata)
            .ok_or(FsError::NotFound(p))
    }

    fn open_sync(&self, path: &Path, flag: OpenFlag, mode: u32) -> FsResult<Box<dyn File>> {
        let p = normalize(path);
        if flag.is_writable() {
            self.check_writable()?;
        }

        let mut entries = self.entries.write();
        let existing = match entries.get(&p) {
            Some(Entry::Directory { .. }) => return Err(FsError::IsADirectory(p)),
            Some(entry @ Entry::File { data, .. }) => Some((entry.metadata(), data.clone())),
            None => None,
        };
        let (stats, buffer, dirty) = match existing {
            Some((meta, data)) => match flag.on_exists() {
                ExistsAction::Fail => return Err(FsError::AlreadyExists(p)),
                ExistsAction::Truncate => {
                    let mut stats = meta;
                    stats.size = 0;
                    // Persist the truncation even if nothing is written.
                    (stats, Vec::new(), true)
                }
                ExistsAction::UseExisting => (meta, data, false),
            },
            None => match flag.on_absent() {
                AbsentAction::Fail => return Err(FsError::NotFound(p)),
                AbsentAction::Create => {
                    Self::ensure_parents(&mut entries, &p)?;
                    entries.insert(p.clone(), Entry::file(Vec::new(), mode));
                    (Metadata::file(0, mode), Vec::new(), false)
                }
            },
        };
        drop(entries);

        Ok(Box::new(MemFile {
            entries: Arc::clone(&self.entries),
            path: p,
            flag,
            stats,
            buffer,
            dirty,
        }))
    }

    fn read_file_sync(&self, path: &Path) -> FsResult<Vec<u8>> {
        let p = normalize(path);
        let entries = self.entries.read();
        match entries.get(&p) {
            Some(Entry::File { data, .. }) => Ok(data.clone()),
            Some(Entry::Directory { .. }) => Err(FsError::IsADirectory(p)),
            None => Err(FsError::NotFound(p)),
        }
    }

    fn write_file_sync(&self, path: &Path, data: &[u8], flag: OpenFlag, mode: u32) -> FsResult<()> {
        self.check_writable()?;
        let p = normalize(path);
        let mut entries = self.entries.write();
        let existing = match entries.get(&p) {
            Some(Entry::Directory { .. }) => return Err(FsError::IsADirectory(p)),
            Some(Entry::File { .. }) => true,
            None => false,
        };
        if existing {
            if flag.on_exists() == ExistsAction::Fail {
                return Err(FsError::AlreadyExists(p));
            }
            if let Some(Entry::File {
                data: content,
                mtime,
                ..
            }) = entries.get_mut(&p)
            {
                if flag.is_appending() {
                    content.extend_from_slice(data);
                } else {
                    *content = data.to_vec();
                }
                *mtime = SystemTime::now();
            }
            Ok(())
        } else {
            match flag.on_absent() {
                AbsentAction::Fail => Err(FsError::NotFound(p)),
                AbsentAction::Create => {
                    Self::ensure_parents(&mut entries, &p)?;
                    entries.insert(p, Entry::file(data.to_vec(), mode));
                    Ok(())
                }
            }
        }
    }

    fn unlink_sync(&self, path: &Path) -> FsResult<()> {
        self.check_writable()?;
        let p = normalize(path);
        let mut entries = self.entries.write();
        match entries.get(&p) {
            Some(Entry::File { .. }) => {
                entries.remove(&p);
                Ok(())
            }
            Some(Entry::Directory { .. }) => Err(FsError::IsADirectory(p)),
            None => Err(FsError::NotFound(p)),
        }
    }

    fn rmdir_sync(&self, path: &Path) -> FsResult<()> {
        self.check_writable()?;
        let p = normalize(path);
        if p == "/" {
            return Err(FsError::Permission("cannot remove root directory".into()));
        }
        let mut entries = self.entries.write();
        match entries.get(&p) {
            Some(Entry::Directory { .. }) => {
                if Self::has_children(&entries, &p) {
                    return Err(FsError::NotEmpty(p));
                }
                entries.remove(&p);
                Ok(())
            }
            Some(Entry::File { .. }) => Err(FsError::NotADirectory(p)),
            None => Err(FsError::NotFound(p)),
        }
    }

    fn mkdir_sync(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.check_writable()?;
        let p = normalize(path);
        let mut entries = self.entries.write();
        if entries.contains_key(&p) {
            return Err(FsError::AlreadyExists(p));
        }
        // The parent must already exist; creating ancestors is the
        // caller's job.
        match parent(&p).map(|d| entries.get(d)) {
            Some(Some(Entry::Directory { .. })) => {}
            Some(Some(Entry::File { .. })) => {
                return Err(FsError::NotADirectory(parent(&p).unwrap_or("/").into()));
            }
            Some(None) => return Err(FsError::NotFound(parent(&p).unwrap_or("/").into())),
            None => return Err(FsError::AlreadyExists(p)),
        }
        entries.insert(p, Entry::directory(mode));
        Ok(())
    }

    fn rename_sync(&self, from: &Path, to: &Path) -> FsResult<()> {
        self.check_writable()?;
        let from = normalize(from);
        let to = normalize(to);
        if from == "/" {
            return Err(FsError::Permission("cannot rename root directory".into()));
        }
        if from == to {
            return Ok(());
        }

        let mut entries = self.entries.write();
        let entry = entries
            .remove(&from)
            .ok_or_else(|| FsError::NotFound(from.clone()))?;

        // Type conflicts with an existing destination.
        if let Some(existing) = entries.get(&to) {
            match (&entry, existing) {
                (Entry::File { .. }, Entry::Directory { .. }) => {
                    entries.insert(from, entry);
                    return Err(FsError::IsADirectory(to));
                }
                (Entry::Directory { .. }, Entry::File { .. }) => {
                    entries.insert(from, entry);
                    return Err(FsError::NotADirectory(to));
                }
                _ => {}
            }
        }

        Self::ensure_parents(&mut entries, &to)?;

        // Directories bring their subtree along.
        if matches!(entry, Entry::Directory { .. }) {
            let prefix = format!("{from}/");
            let children: Vec<String> = entries
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .cloned()
                .collect();
            for old_path in children {
                let child = entries.remove(&old_path).expect("key just listed");
                let new_path = format!("{to}{}", &old_path[from.len()..]);
                entries.insert(new_path, child);
            }
        }

        entries.insert(to, entry);
        Ok(())
    }

    fn readdir_sync(&self, path: &Path) -> FsResult<Vec<String>> {
        let p = normalize(path);
        let entries = self.entries.read();
        match entries.get(&p) {
            Some(Entry::Directory { .. }) => {}
            Some(Entry::File { .. }) => return Err(FsError::NotADirectory(p)),
            None => return Err(FsError::NotFound(p)),
        }
        let mut names: Vec<String> = entries
            .keys()
            .filter(|k| *k != &p && parent(k) == Some(p.as_str()))
            .filter_map(|k| k.rsplit('/').next().map(str::to_string))
            .collect();
        // Sort for consistent ordering
        names.sort();
        Ok(names)
    }

    fn exists_sync(&self, path: &Path) -> bool {
        self.entries.read().contains_key(&normalize(path))
    }

    fn chmod_sync(&self, path: &Path, new_mode: u32) -> FsResult<()> {
        self.check_writable()?;
        let p = normalize(path);
        let mut entries = self.entries.write();
        match entries.get_mut(&p) {
            Some(Entry::File { mode, .. } | Entry::Directory { mode, .. }) => {
                *mode = new_mode;
                Ok(())
            }
            None => Err(FsError::NotFound(p)),
        }
    }

    fn chown_sync(&self, path: &Path, new_uid: u32, new_gid: u32) -> FsResult<()> {
        self.check_writable()?;
        let p = normalize(path);
        let mut entries = self.entries.write();
        match entries.get_mut(&p) {
            Some(Entry::File { uid, gid, .. } | Entry::Directory { uid, gid, .. }) => {
                *uid = new_uid;
                *gid = new_gid;
                Ok(())
            }
            None => Err(FsError::NotFound(p)),
        }
    }

    fn utimes_sync(&self, path: &Path, new_atime: SystemTime, new_mtime: SystemTime) -> FsResult<()> {
        self.check_writable()?;
        let p = normalize(path);
        let mut entries = self.entries.write();
        match entries.get_mut(&p) {
            Some(Entry::File { atime, mtime, .. } | Entry::Directory { atime, mtime, .. }) => {
                *atime = new_atime;
                *mtime = new_mtime;
                Ok(())
            }
            None => Err(FsError::NotFound(p)),
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn supports_sync(&self) -> bool {
        true
    }

    fn supports_props(&self) -> bool {
        true
    }
}

/// Handle over an in-memory file.
///
/// Content is buffered in the handle and written back to the entry map on
/// flush; a clean handle never writes.
struct MemFile {
    entries: Arc<RwLock<EntryMap>>,
    path: String,
    flag: OpenFlag,
    stats: Metadata,
    buffer: Vec<u8>,
    dirty: bool,
}

impl MemFile {
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
}

#[async_trait]
impl File for MemFile {
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
        tokio::task::yield_now().await;
        self.write_at_sync(data, offset)
    }

    async fn truncate(&mut self, size: u64) -> FsResult<()> {
        self.check_writable()?;
        self.buffer.resize(size as usize, 0);
        self.stats.size = size;
        self.stats.mtime = SystemTime::now();
        self.dirty = true;
        Ok(())
    }

    async fn flush(&mut self) -> FsResult<()> {
        tokio::task::yield_now().await;
        self.flush_sync()
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
        self.stats.size = self.buffer.len() as u64;
        self.stats.mtime = SystemTime::now();
        self.dirty = true;
        Ok(data.len())
    }

    fn flush_sync(&mut self) -> FsResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let mut entries = self.entries.write();
        MemoryFs::ensure_parents(&mut entries, &self.path)?;
        let mut entry = Entry::file(self.buffer.clone(), self.stats.mode);
        if let Entry::File { uid, gid, .. } = &mut entry {
            *uid = self.stats.uid;
            *gid = self.stats.gid;
        }
        entries.insert(self.path.clone(), entry);
        self.dirty = false;
        Ok(())
    }

    fn close_sync(&mut self) -> FsResult<()> {
        self.flush_sync()
    }
}
