use super::*;
use std::sync::Arc;
use tempfile::TempDir;
use ufs_lib::{RequestContext, UfsError};
use volume_store::VolumeRegistry;

fn quota_uri(dir: &TempDir, name: &str, quota: u64) -> String {
    format!(
        "file://{}/{}?quota={}",
        dir.path().to_string_lossy(),
        name,
        quota
    )
}

/// Quota-exhausted write with a roomier sibling in the pool: the file moves,
/// every descriptor follows, the source vanishes and the write succeeds.
#[tokio::test]
async fn test_write_past_quota_relocates_file() {
    let dir = TempDir::new().unwrap();
    let uri_a = quota_uri(&dir, "a", 32 * 1024);
    let uri_b = quota_uri(&dir, "b", 1024 * 1024);
    let registry = Arc::new(VolumeRegistry::new());
    registry.add_volume(&uri_a, "/").await.unwrap();
    let resolver = Arc::new(PlacementResolver::new(registry.clone()));
    let ctx = RequestContext::local();

    // The file starts on a, the only volume at this point.
    let writer = resolver
        .create(&ctx, "/big.bin", libc::O_RDWR, 0o640)
        .await
        .unwrap();
    let head = vec![0xAAu8; 8 * 1024];
    resolver.write(&ctx, writer, 0, &head).await.unwrap();
    assert!(dir.path().join("a/big.bin").exists());

    // Second descriptor, positioned at 100 by a short read.
    let reader = resolver
        .open(&ctx, "/big.bin", libc::O_RDONLY)
        .await
        .unwrap();
    resolver.read(&ctx, reader, 0, 100).await.unwrap();
    assert_eq!(resolver.open_files().lookup(reader).unwrap().offset, 100);

    registry.add_volume(&uri_b, "/").await.unwrap();

    // This write overflows a's quota and must end up on b.
    let tail = vec![0xBBu8; 48 * 1024];
    let written = resolver
        .write(&ctx, writer, head.len() as u64, &tail)
        .await
        .unwrap();
    assert_eq!(written, tail.len() as u64);

    assert!(!dir.path().join("a/big.bin").exists());
    assert!(dir.path().join("b/big.bin").exists());

    // Both descriptors now point at b; the reader kept its offset.
    let rec_w = resolver.open_files().lookup(writer).unwrap();
    let rec_r = resolver.open_files().lookup(reader).unwrap();
    assert_eq!(rec_w.volume.uri(), uri_b);
    assert_eq!(rec_r.volume.uri(), uri_b);
    assert_eq!(rec_r.offset, 100);
    assert_eq!(rec_w.offset, (head.len() + tail.len()) as u64);

    // Content survived intact across the copy.
    let total = (head.len() + tail.len()) as u64;
    let meta = resolver.getattr(&ctx, "/big.bin").await.unwrap();
    assert_eq!(meta.st_size, total);
    let back = resolver.read(&ctx, writer, 0, total).await.unwrap();
    assert_eq!(&back[..head.len()], &head[..]);
    assert_eq!(&back[head.len()..], &tail[..]);

    // The pre-migration reader reads the same bytes at its old position.
    let window = resolver.read(&ctx, reader, 100, 64).await.unwrap();
    assert_eq!(window, vec![0xAAu8; 64]);

    resolver.release(&ctx, writer).await.unwrap();
    resolver.release(&ctx, reader).await.unwrap();
}

/// Files under different mounts may share a volume-relative path. Migrating
/// one of them must only touch its own descriptors.
#[tokio::test]
async fn test_migration_leaves_same_named_file_on_other_mount_alone() {
    let dir = TempDir::new().unwrap();
    let uri_a1 = quota_uri(&dir, "a1", 16 * 1024);
    let uri_a2 = quota_uri(&dir, "a2", 1024 * 1024);
    let uri_b = quota_uri(&dir, "b", 1024 * 1024);
    let registry = Arc::new(VolumeRegistry::new());
    registry.add_volume(&uri_a1, "/a").await.unwrap();
    registry.add_volume(&uri_b, "/b").await.unwrap();
    let resolver = Arc::new(PlacementResolver::new(registry.clone()));
    let ctx = RequestContext::local();

    // Both files resolve to relative path "/x" on their volumes.
    let fd_a = resolver
        .create(&ctx, "/a/x", libc::O_RDWR, 0o644)
        .await
        .unwrap();
    resolver.write(&ctx, fd_a, 0, &[1u8; 4096]).await.unwrap();
    let fd_b = resolver
        .create(&ctx, "/b/x", libc::O_RDWR, 0o644)
        .await
        .unwrap();
    resolver.write(&ctx, fd_b, 0, b"untouched").await.unwrap();

    registry.add_volume(&uri_a2, "/a").await.unwrap();

    // Overflow a1: /a/x migrates to a2.
    resolver
        .write(&ctx, fd_a, 4096, &vec![2u8; 32 * 1024])
        .await
        .unwrap();

    let rec_a = resolver.open_files().lookup(fd_a).unwrap();
    let rec_b = resolver.open_files().lookup(fd_b).unwrap();
    assert_eq!(rec_a.volume.uri(), uri_a2);
    assert_eq!(rec_b.volume.uri(), uri_b, "unrelated descriptor was moved");
    assert!(rec_b.valid);

    let back = resolver.read(&ctx, fd_b, 0, 9).await.unwrap();
    assert_eq!(back, b"untouched".to_vec());
    assert!(dir.path().join("b/x").exists());
    assert!(dir.path().join("a2/x").exists());
    assert!(!dir.path().join("a1/x").exists());

    resolver.release(&ctx, fd_a).await.unwrap();
    resolver.release(&ctx, fd_b).await.unwrap();
}

/// Readers racing the migration never see an error or wrong bytes: a read
/// that lands on a just-closed source descriptor retries at the new home.
#[tokio::test]
async fn test_reader_during_migration_never_fails() {
    let dir = TempDir::new().unwrap();
    let uri_a = quota_uri(&dir, "a", 32 * 1024);
    let uri_b = quota_uri(&dir, "b", 1024 * 1024);
    let registry = Arc::new(VolumeRegistry::new());
    registry.add_volume(&uri_a, "/").await.unwrap();
    let resolver = Arc::new(PlacementResolver::new(registry.clone()));
    let ctx = RequestContext::local();

    let writer = resolver
        .create(&ctx, "/f", libc::O_RDWR, 0o644)
        .await
        .unwrap();
    let head = vec![0xCDu8; 8 * 1024];
    resolver.write(&ctx, writer, 0, &head).await.unwrap();
    let reader = resolver.open(&ctx, "/f", libc::O_RDONLY).await.unwrap();

    registry.add_volume(&uri_b, "/").await.unwrap();

    let read_side = {
        let resolver = resolver.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                let data = resolver
                    .read(&ctx, reader, 0, 64)
                    .await
                    .expect("read failed while the file was relocating");
                assert_eq!(data, vec![0xCDu8; 64]);
                tokio::task::yield_now().await;
            }
        })
    };

    // Overflows a and relocates /f to b while the reads are in flight.
    let tail = vec![0xEFu8; 48 * 1024];
    resolver
        .write(&ctx, writer, head.len() as u64, &tail)
        .await
        .unwrap();
    read_side.await.unwrap();

    let rec = resolver.open_files().lookup(reader).unwrap();
    assert_eq!(rec.volume.uri(), uri_b);
    resolver.release(&ctx, writer).await.unwrap();
    resolver.release(&ctx, reader).await.unwrap();
}

/// Migrated files keep their permissions and xattr-independent metadata.
#[tokio::test]
async fn test_migration_preserves_mode() {
    let dir = TempDir::new().unwrap();
    let uri_a = quota_uri(&dir, "a", 16 * 1024);
    let uri_b = quota_uri(&dir, "b", 1024 * 1024);
    let registry = Arc::new(VolumeRegistry::new());
    registry.add_volume(&uri_a, "/").await.unwrap();
    let resolver = Arc::new(PlacementResolver::new(registry.clone()));
    let ctx = RequestContext::local();

    let fd = resolver
        .create(&ctx, "/f", libc::O_RDWR, 0o600)
        .await
        .unwrap();
    resolver.write(&ctx, fd, 0, &[1u8; 4096]).await.unwrap();
    let before = resolver.getattr(&ctx, "/f").await.unwrap();

    registry.add_volume(&uri_b, "/").await.unwrap();
    resolver
        .write(&ctx, fd, 4096, &vec![2u8; 32 * 1024])
        .await
        .unwrap();

    let after = resolver.getattr(&ctx, "/f").await.unwrap();
    assert_eq!(after.perm_mode(), before.perm_mode());
    assert_eq!(after.st_uid, before.st_uid);
    assert_eq!(after.st_gid, before.st_gid);
    resolver.release(&ctx, fd).await.unwrap();
}

/// No destination volume has room: the write fails with the original
/// `NoSpace` and the file stays where it was, unharmed.
#[tokio::test]
async fn test_no_destination_keeps_original_error() {
    let dir = TempDir::new().unwrap();
    let uri_a = quota_uri(&dir, "a", 16 * 1024);
    let registry = Arc::new(VolumeRegistry::new());
    registry.add_volume(&uri_a, "/").await.unwrap();
    let resolver = Arc::new(PlacementResolver::new(registry));
    let ctx = RequestContext::local();

    let fd = resolver
        .create(&ctx, "/f", libc::O_RDWR, 0o644)
        .await
        .unwrap();
    let head = vec![7u8; 4096];
    resolver.write(&ctx, fd, 0, &head).await.unwrap();

    let err = resolver
        .write(&ctx, fd, 4096, &vec![8u8; 64 * 1024])
        .await
        .unwrap_err();
    assert!(matches!(err, UfsError::NoSpace(_)));

    // Untouched: still on a, original content readable.
    assert!(dir.path().join("a/f").exists());
    let back = resolver.read(&ctx, fd, 0, head.len() as u64).await.unwrap();
    assert_eq!(back, head);
    resolver.release(&ctx, fd).await.unwrap();
}

/// A file with a second hard link is never migrated; the caller sees the
/// plain out-of-space failure.
#[tokio::test]
async fn test_hardlinked_file_refuses_migration() {
    let dir = TempDir::new().unwrap();
    let uri_a = quota_uri(&dir, "a", 16 * 1024);
    let uri_b = quota_uri(&dir, "b", 1024 * 1024);
    let registry = Arc::new(VolumeRegistry::new());
    registry.add_volume(&uri_a, "/").await.unwrap();
    let resolver = Arc::new(PlacementResolver::new(registry.clone()));
    let ctx = RequestContext::local();

    let fd = resolver
        .create(&ctx, "/h1", libc::O_RDWR, 0o644)
        .await
        .unwrap();
    resolver.write(&ctx, fd, 0, &[3u8; 4096]).await.unwrap();
    resolver.link(&ctx, "/h1", "/h2").await.unwrap();
    assert_eq!(resolver.getattr(&ctx, "/h1").await.unwrap().st_nlink, 2);

    registry.add_volume(&uri_b, "/").await.unwrap();

    let err = resolver
        .write(&ctx, fd, 4096, &vec![4u8; 64 * 1024])
        .await
        .unwrap_err();
    assert!(matches!(err, UfsError::NoSpace(_)));

    // Both names still live on a; nothing moved to b.
    assert!(dir.path().join("a/h1").exists());
    assert!(dir.path().join("a/h2").exists());
    assert!(!dir.path().join("b/h1").exists());
    resolver.release(&ctx, fd).await.unwrap();
}

/// Read-only pool members are never chosen as migration destinations.
#[tokio::test]
async fn test_readonly_volume_not_a_destination() {
    let dir = TempDir::new().unwrap();
    let uri_a = quota_uri(&dir, "a", 16 * 1024);
    let uri_ro = format!("file://{}/ro?ro=1", dir.path().to_string_lossy());
    let registry = Arc::new(VolumeRegistry::new());
    registry.add_volume(&uri_a, "/").await.unwrap();
    let resolver = Arc::new(PlacementResolver::new(registry.clone()));
    let ctx = RequestContext::local();

    let fd = resolver
        .create(&ctx, "/f", libc::O_RDWR, 0o644)
        .await
        .unwrap();
    resolver.write(&ctx, fd, 0, &[5u8; 4096]).await.unwrap();

    registry.add_volume(&uri_ro, "/").await.unwrap();

    let err = resolver
        .write(&ctx, fd, 4096, &vec![6u8; 64 * 1024])
        .await
        .unwrap_err();
    assert!(matches!(err, UfsError::NoSpace(_)));
    assert!(dir.path().join("a/f").exists());
    assert!(!dir.path().join("ro/f").exists());
    resolver.release(&ctx, fd).await.unwrap();
}
