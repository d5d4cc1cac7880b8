//! Copy-up: lazy promotion of readable-layer entries to the writable
//! layer on first mutation.
//!
//! Two pieces: `ensure_parent_dirs` materializes the chain of missing
//! ancestors (with the modes the union view reports for them), and
//! `copy_up` promotes the entry itself: directories by re-creating them,
//! regular files by a full content copy through the engine's write path.

use std::path::Path;

use stackfs_types::Metadata;
use tracing::debug;

use super::UnionFs;
use crate::error::FsResult;
use crate::fs::path::parent;

impl UnionFs {
    /// Create any ancestors of `p` missing from the writable layer.
    ///
    /// Walks upward until it finds an ancestor the writable layer already
    /// has (or the root), then creates the collected gap top-down. Each
    /// directory takes the mode the union view reports for it, so
    /// readable-layer ancestry keeps its shape. An ancestor that exists on
    /// neither layer surfaces as not-found while resolving its mode.
    pub(crate) async fn ensure_parent_dirs(&self, p: &str) -> FsResult<()> {
        let mut missing: Vec<&str> = Vec::new();
        let mut current = parent(p);
        while let Some(dir) = current {
            if dir == "/" || self.writable.exists(Path::new(dir)).await {
                break;
            }
            missing.push(dir);
            current = parent(dir);
        }
        for dir in missing.iter().rev() {
            let meta = self.stat_at(dir).await?;
            self.writable.mkdir(Path::new(dir), meta.mode).await?;
        }
        Ok(())
    }

    pub(crate) fn ensure_parent_dirs_sync(&self, p: &str) -> FsResult<()> {
        let mut missing: Vec<&str> = Vec::new();
        let mut current = parent(p);
        while let Some(dir) = current {
            if dir == "/" || self.writable.exists_sync(Path::new(dir)) {
                break;
            }
            missing.push(dir);
            current = parent(dir);
        }
        for dir in missing.iter().rev() {
            let meta = self.stat_at_sync(dir)?;
            self.writable.mkdir_sync(Path::new(dir), meta.mode)?;
        }
        Ok(())
    }

    /// Promote `p` from the readable layer onto the writable layer.
    ///
    /// `meta` is the union-view stat of `p`; the promoted entry keeps its
    /// mode. Callers check that `p` is not on the writable layer yet.
    pub(crate) async fn copy_up(&self, p: &str, meta: &Metadata) -> FsResult<()> {
        debug!("copy-up: {p}");
        if meta.is_dir() {
            self.ensure_parent_dirs(p).await?;
            self.writable.mkdir(Path::new(p), meta.mode).await
        } else {
            let data = self.readable.read_file(Path::new(p)).await?;
            self.write_file_at(p, &data, Self::write_flag(), meta.mode).await
        }
    }

    pub(crate) fn copy_up_sync(&self, p: &str, meta: &Metadata) -> FsResult<()> {
        debug!("copy-up: {p}");
        if meta.is_dir() {
            self.ensure_parent_dirs_sync(p)?;
            self.writable.mkdir_sync(Path::new(p), meta.mode)
        } else {
            let data = self.readable.read_file_sync(Path::new(p))?;
            self.write_file_at_sync(p, &data, Self::write_flag(), meta.mode)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;
    use crate::fs::{Filesystem, MemoryFs};
    use stackfs_types::OpenFlag;
    use std::sync::Arc;

    fn w() -> OpenFlag {
        OpenFlag::parse("w").unwrap()
    }

    async fn union(lower: MemoryFs) -> UnionFs {
        let mut lower = lower;
        lower.freeze();
        let fs = UnionFs::new(Arc::new(MemoryFs::new()), Arc::new(lower)).unwrap();
        fs.initialize().await.unwrap();
        fs
    }

    #[tokio::test]
    async fn test_ensure_parent_dirs_copies_modes() {
        let lower = MemoryFs::new();
        lower.mkdir(Path::new("/a"), 0o750).await.unwrap();
        lower.mkdir(Path::new("/a/b"), 0o700).await.unwrap();
        let fs = union(lower).await;

        fs.ensure_parent_dirs("/a/b/file.txt").await.unwrap();

        let (writable, _) = fs.layers();
        // Union-view modes carry the widened write bits.
        assert_eq!(writable.stat(Path::new("/a")).await.unwrap().mode, 0o772);
        assert_eq!(writable.stat(Path::new("/a/b")).await.unwrap().mode, 0o722);
    }

    #[tokio::test]
    async fn test_ensure_parent_dirs_stops_at_existing() {
        let lower = MemoryFs::new();
        lower.mkdir(Path::new("/a"), 0o755).await.unwrap();
        lower.mkdir(Path::new("/a/b"), 0o755).await.unwrap();
        let fs = union(lower).await;

        let (writable, _) = fs.layers();
        writable.mkdir(Path::new("/a"), 0o777).await.unwrap();

        fs.ensure_parent_dirs("/a/b/c").await.unwrap();
        assert!(writable.exists(Path::new("/a/b")).await);
        // The pre-existing writable ancestor is left alone.
        assert_eq!(writable.stat(Path::new("/a")).await.unwrap().mode, 0o777);
    }

    #[tokio::test]
    async fn test_ensure_parent_dirs_missing_everywhere() {
        let fs = union(MemoryFs::new()).await;
        let result = fs.ensure_parent_dirs("/no/such/parent/file").await;
        assert!(matches!(result, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_copy_up_file_preserves_content_and_mode() {
        let lower = MemoryFs::new();
        lower
            .write_file(Path::new("/a/data.bin"), b"payload", w(), 0o444)
            .await
            .unwrap();
        let fs = union(lower).await;

        let meta = fs.stat_at("/a/data.bin").await.unwrap();
        fs.copy_up("/a/data.bin", &meta).await.unwrap();

        let (writable, _) = fs.layers();
        assert_eq!(
            writable.read_file(Path::new("/a/data.bin")).await.unwrap(),
            b"payload"
        );
        assert_eq!(
            writable.stat(Path::new("/a/data.bin")).await.unwrap().mode,
            0o666
        );
        // Parent came along.
        assert!(writable.stat(Path::new("/a")).await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_copy_up_sync_directory() {
        let lower = MemoryFs::new();
        lower.mkdir(Path::new("/d"), 0o755).await.unwrap();
        let fs = union(lower).await;

        let meta = fs.stat_at_sync("/d").unwrap();
        fs.copy_up_sync("/d", &meta).unwrap();

        let (writable, _) = fs.layers();
        assert!(writable.stat_sync(Path::new("/d")).unwrap().is_dir());
    }
}
