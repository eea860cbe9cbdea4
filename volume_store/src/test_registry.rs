use super::*;
use std::sync::Arc;
use tempfile::TempDir;
use ufs_lib::UfsError;

fn file_uri(dir: &TempDir, name: &str) -> String {
    format!("file://{}/{}", dir.path().to_string_lossy(), name)
}

#[tokio::test]
async fn test_unsupported_scheme_rejected() {
    let registry = VolumeRegistry::new();
    let err = registry.add_volume("ftp://host/share", "/").await;
    assert!(matches!(err, Err(UfsError::UnsupportedProtocol(_))));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_add_volume_idempotent() {
    let dir = TempDir::new().unwrap();
    let registry = VolumeRegistry::new();
    let uri = file_uri(&dir, "v1");
    registry.add_volume(&uri, "/").await.unwrap();
    registry.add_volume(&uri, "/").await.unwrap();
    assert_eq!(registry.list().len(), 1);

    // Same uri under a different prefix is a distinct entry.
    registry.add_volume(&uri, "/other").await.unwrap();
    assert_eq!(registry.list().len(), 2);
}

#[tokio::test]
async fn test_concurrent_adds_share_one_instance() {
    let dir = TempDir::new().unwrap();
    let registry = VolumeRegistry::new();
    let uri = file_uri(&dir, "v1");

    // Both racing first-time registrations must succeed even though the
    // local root guard admits a single writable instance per root.
    let (r1, r2) = tokio::join!(
        registry.add_volume(&uri, "/p1"),
        registry.add_volume(&uri, "/p2"),
    );
    r1.unwrap();
    r2.unwrap();
    assert_eq!(registry.list().len(), 2);

    let e1 = registry.resolve("/p1/x");
    let e2 = registry.resolve("/p2/x");
    assert_eq!(e1.len(), 1);
    assert_eq!(e2.len(), 1);
    assert!(Arc::ptr_eq(&e1[0].volume, &e2[0].volume));
}

#[tokio::test]
async fn test_remove_volume_exact_match() {
    let dir = TempDir::new().unwrap();
    let registry = VolumeRegistry::new();
    let uri = file_uri(&dir, "v1");
    registry.add_volume(&uri, "/").await.unwrap();
    registry.remove_volume(&uri, "/nope");
    assert_eq!(registry.list().len(), 1);
    registry.remove_volume(&uri, "/");
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_longest_prefix_wins() {
    let dir = TempDir::new().unwrap();
    let registry = VolumeRegistry::new();
    let v1 = file_uri(&dir, "v1");
    let v2 = file_uri(&dir, "v2");
    registry.add_volume(&v1, "/a/b").await.unwrap();
    registry.add_volume(&v2, "/a").await.unwrap();

    let hits = registry.resolve("/a/b/c");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].uri, v1);
    assert_eq!(hits[0].rel_path("/a/b/c"), "/c");

    let hits = registry.resolve("/a/x");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].uri, v2);
    assert_eq!(hits[0].rel_path("/a/x"), "/x");
}

#[tokio::test]
async fn test_equal_depth_candidates_pool() {
    let dir = TempDir::new().unwrap();
    let registry = VolumeRegistry::new();
    let v1 = file_uri(&dir, "v1");
    let v2 = file_uri(&dir, "v2");
    registry.add_volume(&v1, "/data").await.unwrap();
    registry.add_volume(&v2, "/data").await.unwrap();

    let hits = registry.resolve("/data/file");
    assert_eq!(hits.len(), 2);
}

#[tokio::test]
async fn test_root_fallback_fan_out() {
    let dir = TempDir::new().unwrap();
    let registry = VolumeRegistry::new();
    let v1 = file_uri(&dir, "v1");
    let v2 = file_uri(&dir, "v2");
    let v3 = file_uri(&dir, "v3");
    registry.add_volume(&v1, "/").await.unwrap();
    registry.add_volume(&v2, "/").await.unwrap();
    registry.add_volume(&v3, "/special").await.unwrap();

    // No deeper match: the whole root set, and only the root set.
    let hits = registry.resolve("/anything/else");
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|e| e.mount_prefix == "/"));

    // Deeper match excludes the root pool.
    let hits = registry.resolve("/special/x");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].uri, v3);
}

#[tokio::test]
async fn test_remote_volume_registration() {
    let registry = VolumeRegistry::new();
    registry
        .add_volume("http://127.0.0.1:19999/peer?ro=1", "/remote")
        .await
        .unwrap();
    let hits = registry.resolve("/remote/f");
    assert_eq!(hits.len(), 1);
    assert!(!hits[0].volume.is_local());
    assert!(hits[0].volume.readonly());
}
