use super::*;
use std::sync::Arc;
use tempfile::TempDir;
use ufs_lib::{RequestContext, UfsError};
use volume_store::VolumeRegistry;

fn file_uri(dir: &TempDir, name: &str) -> String {
    format!("file://{}/{}", dir.path().to_string_lossy(), name)
}

fn quota_uri(dir: &TempDir, name: &str, quota: u64) -> String {
    format!(
        "file://{}/{}?quota={}",
        dir.path().to_string_lossy(),
        name,
        quota
    )
}

async fn pooled_resolver(uris: &[&str]) -> Arc<PlacementResolver> {
    let registry = Arc::new(VolumeRegistry::new());
    for uri in uris {
        registry.add_volume(uri, "/").await.unwrap();
    }
    Arc::new(PlacementResolver::new(registry))
}

#[tokio::test]
async fn test_create_write_read_round_trip() {
    let dir = TempDir::new().unwrap();
    let uri = file_uri(&dir, "v1");
    let resolver = pooled_resolver(&[uri.as_str()]).await;
    let ctx = RequestContext::local();

    resolver.mkdir(&ctx, "/docs", 0o755).await.unwrap();
    let id = resolver
        .create(&ctx, "/docs/report.txt", libc::O_RDWR, 0o644)
        .await
        .unwrap();
    let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let written = resolver.write(&ctx, id, 0, &payload).await.unwrap();
    assert_eq!(written, payload.len() as u64);

    let back = resolver.read(&ctx, id, 0, payload.len() as u64).await.unwrap();
    assert_eq!(back, payload);

    let meta = resolver.getattr(&ctx, "/docs/report.txt").await.unwrap();
    assert_eq!(meta.st_size, payload.len() as u64);

    resolver.release(&ctx, id).await.unwrap();
    assert!(matches!(
        resolver.read(&ctx, id, 0, 1).await,
        Err(UfsError::BadDescriptor(_))
    ));
}

#[tokio::test]
async fn test_readonly_context_rejected_first() {
    let dir = TempDir::new().unwrap();
    let uri = file_uri(&dir, "v1");
    let resolver = pooled_resolver(&[uri.as_str()]).await;
    let mut ctx = RequestContext::local();
    ctx.readonly = true;

    assert!(matches!(
        resolver.mkdir(&ctx, "/d", 0o755).await,
        Err(UfsError::ReadOnly(_))
    ));
    assert!(matches!(
        resolver.create(&ctx, "/f", libc::O_WRONLY, 0o644).await,
        Err(UfsError::ReadOnly(_))
    ));
    assert!(matches!(
        resolver.unlink(&ctx, "/f").await,
        Err(UfsError::ReadOnly(_))
    ));
}

#[tokio::test]
async fn test_placement_prefers_most_free_space() {
    let dir = TempDir::new().unwrap();
    let small = quota_uri(&dir, "small", 16 * 1024);
    let big = quota_uri(&dir, "big", 1024 * 1024);
    let resolver = pooled_resolver(&[small.as_str(), big.as_str()]).await;

    let entry = resolver.select_for_creation("/new.bin").await.unwrap();
    assert_eq!(entry.uri, big);

    // The new file lands in the big volume's directory.
    let ctx = RequestContext::local();
    let id = resolver
        .create(&ctx, "/new.bin", libc::O_WRONLY, 0o644)
        .await
        .unwrap();
    resolver.release(&ctx, id).await.unwrap();
    assert!(dir.path().join("big/new.bin").exists());
    assert!(!dir.path().join("small/new.bin").exists());
}

#[tokio::test]
async fn test_parent_chain_cloned_lazily() {
    let dir = TempDir::new().unwrap();
    let a = quota_uri(&dir, "a", 1024 * 1024);
    let b = quota_uri(&dir, "b", 4 * 1024 * 1024);
    let resolver = pooled_resolver(&[a.as_str(), b.as_str()]).await;
    let ctx = RequestContext::local();

    // Directory tree starts on whichever volume mkdir picked (the one
    // holding "/" first in registration order).
    resolver.mkdir(&ctx, "/x", 0o750).await.unwrap();
    resolver.mkdir(&ctx, "/x/y", 0o750).await.unwrap();

    // File creation picks b; the /x/y chain must be cloned onto it.
    let id = resolver
        .create(&ctx, "/x/y/f.bin", libc::O_WRONLY, 0o644)
        .await
        .unwrap();
    resolver.release(&ctx, id).await.unwrap();

    assert!(dir.path().join("b/x/y/f.bin").exists());
    // The clone carries the authoritative directory's permissions.
    use std::os::unix::fs::PermissionsExt;
    let auth = std::fs::metadata(dir.path().join("a/x/y")).unwrap();
    let cloned = std::fs::metadata(dir.path().join("b/x/y")).unwrap();
    assert_eq!(
        cloned.permissions().mode() & 0o7777,
        auth.permissions().mode() & 0o7777
    );
}

#[tokio::test]
async fn test_readdir_union_and_dedup() {
    let dir = TempDir::new().unwrap();
    let a = file_uri(&dir, "a");
    let b = file_uri(&dir, "b");
    let resolver = pooled_resolver(&[a.as_str(), b.as_str()]).await;
    let ctx = RequestContext::local();

    // Same name on both volumes plus one unique name each, created behind
    // the resolver's back.
    std::fs::write(dir.path().join("a/shared"), b"from-a").unwrap();
    std::fs::write(dir.path().join("b/shared"), b"from-b").unwrap();
    std::fs::write(dir.path().join("a/only_a"), b"x").unwrap();
    std::fs::write(dir.path().join("b/only_b"), b"y").unwrap();

    let mut names: Vec<String> = resolver
        .readdir(&ctx, "/")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["only_a", "only_b", "shared"]);

    // First occurrence wins: "shared" resolves to volume a.
    let data = {
        let id = resolver
            .open(&ctx, "/shared", libc::O_RDONLY)
            .await
            .unwrap();
        let data = resolver.read(&ctx, id, 0, 64).await.unwrap();
        resolver.release(&ctx, id).await.unwrap();
        data
    };
    assert_eq!(data, b"from-a".to_vec());
}

#[tokio::test]
async fn test_metadata_ops_touch_every_holder() {
    let dir = TempDir::new().unwrap();
    let a = file_uri(&dir, "a");
    let b = file_uri(&dir, "b");
    let resolver = pooled_resolver(&[a.as_str(), b.as_str()]).await;
    let ctx = RequestContext::local();

    // Placeholder directory on both volumes.
    std::fs::create_dir(dir.path().join("a/shared_dir")).unwrap();
    std::fs::create_dir(dir.path().join("b/shared_dir")).unwrap();

    resolver.chmod(&ctx, "/shared_dir", 0o700).await.unwrap();

    use std::os::unix::fs::PermissionsExt;
    for vol in ["a", "b"] {
        let md = std::fs::metadata(dir.path().join(vol).join("shared_dir")).unwrap();
        assert_eq!(md.permissions().mode() & 0o7777, 0o700);
    }

    resolver.rename(&ctx, "/shared_dir", "/renamed_dir").await.unwrap();
    for vol in ["a", "b"] {
        assert!(dir.path().join(vol).join("renamed_dir").exists());
        assert!(!dir.path().join(vol).join("shared_dir").exists());
    }

    resolver.rmdir(&ctx, "/renamed_dir").await.unwrap();
    for vol in ["a", "b"] {
        assert!(!dir.path().join(vol).join("renamed_dir").exists());
    }
}

#[tokio::test]
async fn test_symlink_and_readlink() {
    let dir = TempDir::new().unwrap();
    let uri = file_uri(&dir, "v1");
    let resolver = pooled_resolver(&[uri.as_str()]).await;
    let ctx = RequestContext::local();

    resolver.symlink(&ctx, "target", "/lnk").await.unwrap();
    assert_eq!(resolver.readlink(&ctx, "/lnk").await.unwrap(), "target");
    let meta = resolver.getattr(&ctx, "/lnk").await.unwrap();
    assert!(meta.is_symlink());
}

#[tokio::test]
async fn test_path_lock_lifecycle_through_resolver() {
    let dir = TempDir::new().unwrap();
    let uri = file_uri(&dir, "v1");
    let resolver = pooled_resolver(&[uri.as_str()]).await;
    let ctx = RequestContext::local();

    let a = resolver.create(&ctx, "/f", libc::O_RDWR, 0o644).await.unwrap();
    let b = resolver.open(&ctx, "/f", libc::O_RDONLY).await.unwrap();
    assert_eq!(resolver.open_files().path_lock_refs("/f"), 2);

    resolver.release(&ctx, a).await.unwrap();
    resolver.release(&ctx, b).await.unwrap();
    assert_eq!(resolver.open_files().path_lock_refs("/f"), 0);
    assert_eq!(resolver.open_files().open_count(), 0);
}

#[tokio::test]
async fn test_statfs_aggregates_pool() {
    let dir = TempDir::new().unwrap();
    let a = quota_uri(&dir, "a", 1024 * 1024);
    let b = quota_uri(&dir, "b", 1024 * 1024);
    let resolver = pooled_resolver(&[a.as_str(), b.as_str()]).await;
    let ctx = RequestContext::local();

    let space = resolver.statfs(&ctx, "/").await.unwrap();
    let total = space.f_bsize * space.f_blocks;
    // Two 1 MiB quotas pooled; block rounding may shave a partial block.
    assert!(total > 1024 * 1024 && total <= 2 * 1024 * 1024);
}

#[tokio::test]
async fn test_statfs_no_volumes() {
    let registry = Arc::new(VolumeRegistry::new());
    let resolver = PlacementResolver::new(registry);
    let ctx = RequestContext::local();
    assert!(resolver.statfs(&ctx, "/").await.is_err());
    assert!(matches!(
        resolver.getattr(&ctx, "/x").await,
        Err(UfsError::NotFound(_))
    ));
}
