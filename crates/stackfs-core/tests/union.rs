//! End-to-end scenarios for the union filesystem: copy-up, whiteout
//! durability across remounts, cross-layer rename, overlay flush, and
//! serialization, all driven over in-memory layer pairs.

use std::path::Path;
use std::sync::Arc;

use stackfs_core::{Filesystem, FsError, MemoryFs, OpenFlag, SerializingFs, UnionFs};

fn w() -> OpenFlag {
    OpenFlag::parse("w").unwrap()
}

/// Build a frozen readable layer from a list of `(path, content)` files,
/// an empty writable layer, and an initialized union over them.
async fn mount(files: &[(&str, &[u8], u32)]) -> (UnionFs, Arc<dyn Filesystem>, Arc<dyn Filesystem>) {
    let mut lower = MemoryFs::new();
    for (path, content, mode) in files {
        lower
            .write_file(Path::new(path), content, w(), *mode)
            .await
            .unwrap();
    }
    lower.freeze();

    let writable: Arc<dyn Filesystem> = Arc::new(MemoryFs::new());
    let readable: Arc<dyn Filesystem> = Arc::new(lower);
    let fs = UnionFs::new(Arc::clone(&writable), Arc::clone(&readable)).unwrap();
    fs.initialize().await.unwrap();
    (fs, writable, readable)
}

#[tokio::test]
async fn copy_up_on_chmod() {
    let (fs, writable, _) = mount(&[("/a/b", b"lower content", 0o444)]).await;

    fs.chmod(Path::new("/a/b"), 0o600).await.unwrap();

    // Both the parent directory and the file materialized on the writable
    // layer, with content intact and the new mode applied.
    assert!(writable.stat(Path::new("/a")).await.unwrap().is_dir());
    let meta = writable.stat(Path::new("/a/b")).await.unwrap();
    assert!(meta.is_file());
    assert_eq!(meta.mode, 0o600);
    assert_eq!(
        writable.read_file(Path::new("/a/b")).await.unwrap(),
        b"lower content"
    );
    assert_eq!(fs.stat(Path::new("/a/b")).await.unwrap().mode, 0o600);
}

#[tokio::test]
async fn whiteout_survives_restart() {
    let (fs, writable, readable) = mount(&[("/x", b"data", 0o644)]).await;

    fs.unlink(Path::new("/x")).await.unwrap();
    assert!(!fs.exists(Path::new("/x")).await);

    // The deletion is on disk before unlink returned.
    let log = writable
        .read_file(Path::new("/.deletedFiles.log"))
        .await
        .unwrap();
    let log = String::from_utf8(log).unwrap();
    assert!(log.lines().any(|line| line == "d/x"), "log was: {log:?}");

    // A fresh engine over the same two layers replays the log.
    let fresh = UnionFs::new(writable, Arc::clone(&readable)).unwrap();
    fresh.initialize().await.unwrap();
    assert!(!fresh.exists(Path::new("/x")).await);
    assert!(readable.exists(Path::new("/x")).await);
}

#[tokio::test]
async fn rename_across_layers() {
    let (fs, writable, _) = mount(&[
        ("/src/f1", b"one", 0o644),
        ("/src/f2", b"two", 0o644),
    ])
    .await;

    fs.rename(Path::new("/src"), Path::new("/dst")).await.unwrap();

    assert!(fs.exists(Path::new("/dst/f1")).await);
    assert!(fs.exists(Path::new("/dst/f2")).await);
    assert!(!fs.exists(Path::new("/src")).await);
    assert_eq!(fs.read_file(Path::new("/dst/f1")).await.unwrap(), b"one");
    assert_eq!(fs.read_file(Path::new("/dst/f2")).await.unwrap(), b"two");

    let log = writable
        .read_file(Path::new("/.deletedFiles.log"))
        .await
        .unwrap();
    let log = String::from_utf8(log).unwrap();
    for record in ["d/src/f1", "d/src/f2", "d/src"] {
        assert!(
            log.lines().any(|line| line == record),
            "missing {record} in {log:?}"
        );
    }
}

#[tokio::test]
async fn overlay_file_flush() {
    let (fs, writable, _) = mount(&[("/hello.txt", b"hi", 0o644)]).await;

    let mut file = fs
        .open(Path::new("/hello.txt"), OpenFlag::parse("a").unwrap(), 0o644)
        .await
        .unwrap();
    file.write_at(b" there", 2).await.unwrap();
    file.close().await.unwrap();

    assert_eq!(
        writable.read_file(Path::new("/hello.txt")).await.unwrap(),
        b"hi there"
    );
    assert_eq!(
        fs.read_file(Path::new("/hello.txt")).await.unwrap(),
        b"hi there"
    );
}

#[tokio::test]
async fn sync_call_under_lock_fails() {
    let (fs, _, _) = mount(&[
        ("/src/f1", b"one", 0o644),
        ("/src/f2", b"two", 0o644),
    ])
    .await;
    let fs = Arc::new(SerializingFs::new(Arc::new(fs)));

    let bg = Arc::clone(&fs);
    let rename = tokio::spawn(async move {
        bg.rename(Path::new("/src"), Path::new("/dst")).await
    });
    // Let the rename acquire the lock and suspend at a layer call.
    tokio::task::yield_now().await;

    let result = fs.stat_sync(Path::new("/src/f1"));
    assert!(matches!(result, Err(FsError::InvalidArgument(_))));

    rename.await.unwrap().unwrap();
    // With the lock free again, synchronous calls go through.
    assert!(fs.stat_sync(Path::new("/dst/f1")).is_ok());
}

#[tokio::test]
async fn readdir_merges_with_whiteout() {
    let mut lower = MemoryFs::new();
    for name in ["a", "b", "c"] {
        lower
            .write_file(Path::new(&format!("/d/{name}")), b"lower", w(), 0o644)
            .await
            .unwrap();
    }
    lower.freeze();

    let upper = MemoryFs::new();
    upper.write_file(Path::new("/d/a"), b"upper", w(), 0o644).await.unwrap();

    let fs = UnionFs::new(Arc::new(upper), Arc::new(lower)).unwrap();
    fs.initialize().await.unwrap();
    fs.unlink(Path::new("/d/b")).await.unwrap();

    let mut names = fs.readdir(Path::new("/d")).await.unwrap();
    names.sort();
    assert_eq!(names, vec!["a", "c"]);
    // The shadowing entry wins.
    assert_eq!(fs.read_file(Path::new("/d/a")).await.unwrap(), b"upper");
}

#[tokio::test]
async fn write_shadows_readable_content() {
    let (fs, _, _) = mount(&[("/f", b"original", 0o644)]).await;

    fs.write_file(Path::new("/f"), b"replaced", w(), 0o644).await.unwrap();
    assert_eq!(fs.read_file(Path::new("/f")).await.unwrap(), b"replaced");
}

#[tokio::test]
async fn unlink_twice_reports_not_found() {
    let (fs, _, _) = mount(&[("/x", b"data", 0o644)]).await;

    fs.unlink(Path::new("/x")).await.unwrap();
    assert!(matches!(
        fs.unlink(Path::new("/x")).await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn mkdir_twice_reports_already_exists() {
    let (fs, _, _) = mount(&[]).await;

    fs.mkdir(Path::new("/d"), 0o755).await.unwrap();
    assert!(matches!(
        fs.mkdir(Path::new("/d"), 0o755).await,
        Err(FsError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn rmdir_durable_across_restart() {
    let mut lower = MemoryFs::new();
    lower.mkdir(Path::new("/empty"), 0o755).await.unwrap();
    lower.freeze();

    let writable: Arc<dyn Filesystem> = Arc::new(MemoryFs::new());
    let readable: Arc<dyn Filesystem> = Arc::new(lower);
    let fs = UnionFs::new(Arc::clone(&writable), Arc::clone(&readable)).unwrap();
    fs.initialize().await.unwrap();

    fs.rmdir(Path::new("/empty")).await.unwrap();
    assert!(!fs.exists(Path::new("/empty")).await);

    let fresh = UnionFs::new(writable, readable).unwrap();
    fresh.initialize().await.unwrap();
    assert!(!fresh.exists(Path::new("/empty")).await);
}

#[tokio::test]
async fn visibility_invariant_holds() {
    let (fs, writable, readable) = mount(&[("/keep", b"k", 0o644), ("/drop", b"d", 0o644)]).await;
    fs.write_file(Path::new("/new"), b"n", w(), 0o644).await.unwrap();
    fs.unlink(Path::new("/drop")).await.unwrap();

    for path in ["/keep", "/drop", "/new", "/absent"] {
        let p = Path::new(path);
        let visible = fs.exists(p).await;
        let on_writable = writable.exists(p).await;
        let on_readable = readable.exists(p).await;
        // exists(p) ⇔ writable.exists(p) ∨ (readable.exists(p) ∧ ¬whiteout(p));
        // /drop is the whited-out case.
        let expected = on_writable || (on_readable && path != "/drop");
        assert_eq!(visible, expected, "visibility mismatch for {path}");
    }
}

#[tokio::test]
async fn rename_into_empty_existing_directory_merges() {
    let (fs, _, _) = mount(&[("/src/f", b"data", 0o644)]).await;
    fs.mkdir(Path::new("/dst"), 0o755).await.unwrap();

    fs.rename(Path::new("/src"), Path::new("/dst")).await.unwrap();
    assert_eq!(fs.read_file(Path::new("/dst/f")).await.unwrap(), b"data");
    assert!(!fs.exists(Path::new("/src")).await);
}

#[tokio::test]
async fn deep_rename_recurses() {
    let (fs, _, _) = mount(&[
        ("/tree/a/one", b"1", 0o644),
        ("/tree/a/b/two", b"2", 0o644),
        ("/tree/three", b"3", 0o644),
    ])
    .await;

    fs.rename(Path::new("/tree"), Path::new("/moved")).await.unwrap();

    assert_eq!(fs.read_file(Path::new("/moved/a/one")).await.unwrap(), b"1");
    assert_eq!(fs.read_file(Path::new("/moved/a/b/two")).await.unwrap(), b"2");
    assert_eq!(fs.read_file(Path::new("/moved/three")).await.unwrap(), b"3");
    assert!(!fs.exists(Path::new("/tree")).await);
    assert!(!fs.exists(Path::new("/tree/a/b/two")).await);
}

#[tokio::test]
async fn serialized_union_end_to_end() {
    let (fs, _, _) = mount(&[("/shared", b"base", 0o644)]).await;
    let fs = Arc::new(SerializingFs::new(Arc::new(fs)));

    let mut tasks = Vec::new();
    for i in 0..4 {
        let fs = Arc::clone(&fs);
        tasks.push(tokio::spawn(async move {
            let path = format!("/file-{i}");
            fs.write_file(Path::new(&path), b"body", OpenFlag::parse("w").unwrap(), 0o644)
                .await
                .unwrap();
            fs.read_file(Path::new(&path)).await.unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), b"body");
    }

    let names = fs.readdir(Path::new("/")).await.unwrap();
    assert_eq!(names.len(), 5); // /shared plus the four new files
}
