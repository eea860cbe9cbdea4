use super::*;
use tempfile::TempDir;
use ufs_lib::UfsError;

async fn new_volume(dir: &TempDir, opts: LocalVolumeOptions) -> LocalVolume {
    LocalVolume::new(
        format!("file://{}", dir.path().to_string_lossy()),
        dir.path().to_path_buf(),
        opts,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_create_write_read_round_trip() {
    let dir = TempDir::new().unwrap();
    let vol = new_volume(&dir, LocalVolumeOptions::default()).await;

    let fd = vol
        .create("/hello.txt", libc::O_RDWR, 0o644)
        .await
        .unwrap();
    let payload = b"hello union fs".to_vec();
    let written = vol.write_at(fd, 0, &payload).await.unwrap();
    assert_eq!(written, payload.len() as u64);

    let back = vol.read_at(fd, 0, payload.len() as u64).await.unwrap();
    assert_eq!(back, payload);

    // Short read past EOF returns what is there.
    let tail = vol.read_at(fd, 6, 1024).await.unwrap();
    assert_eq!(tail, b"union fs".to_vec());

    vol.close(fd).await.unwrap();
    assert!(matches!(
        vol.read_at(fd, 0, 1).await,
        Err(UfsError::BadDescriptor(_))
    ));

    let meta = vol.metadata("/hello.txt").await.unwrap();
    assert_eq!(meta.st_size, payload.len() as u64);
    assert_eq!(meta.st_nlink, 1);
}

#[tokio::test]
async fn test_metadata_not_found() {
    let dir = TempDir::new().unwrap();
    let vol = new_volume(&dir, LocalVolumeOptions::default()).await;
    assert!(matches!(
        vol.metadata("/absent").await,
        Err(UfsError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_readonly_rejected_before_storage() {
    let dir = TempDir::new().unwrap();
    let vol = new_volume(
        &dir,
        LocalVolumeOptions {
            readonly: true,
            quota: None,
        },
    )
    .await;

    assert!(matches!(
        vol.create_directory("/d", 0o755).await,
        Err(UfsError::ReadOnly(_))
    ));
    assert!(matches!(
        vol.create("/f", libc::O_WRONLY, 0o644).await,
        Err(UfsError::ReadOnly(_))
    ));
    assert!(matches!(
        vol.open("/f", libc::O_WRONLY).await,
        Err(UfsError::ReadOnly(_))
    ));
    // Nothing was created on disk.
    assert!(!dir.path().join("d").exists());
    assert!(!dir.path().join("f").exists());
}

#[tokio::test]
async fn test_directory_ops_and_listing() {
    let dir = TempDir::new().unwrap();
    let vol = new_volume(&dir, LocalVolumeOptions::default()).await;

    vol.create_directory("/a", 0o750).await.unwrap();
    let fd = vol.create("/a/x", libc::O_WRONLY, 0o644).await.unwrap();
    vol.close(fd).await.unwrap();
    vol.symlink("x", "/a/lnk").await.unwrap();

    let mut names: Vec<String> = vol
        .list_directory("/a")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["lnk".to_string(), "x".to_string()]);

    assert_eq!(vol.read_symlink("/a/lnk").await.unwrap(), "x");

    let meta = vol.metadata("/a").await.unwrap();
    assert!(meta.is_dir());
    assert_eq!(meta.perm_mode(), 0o750);

    vol.rename("/a/x", "/a/y").await.unwrap();
    assert!(vol.metadata("/a/x").await.is_err());
    vol.unlink("/a/y").await.unwrap();
    vol.unlink("/a/lnk").await.unwrap();
    vol.remove_directory("/a").await.unwrap();
    assert!(matches!(
        vol.metadata("/a").await,
        Err(UfsError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_quota_enforced_as_no_space() {
    let dir = TempDir::new().unwrap();
    let vol = new_volume(
        &dir,
        LocalVolumeOptions {
            readonly: false,
            quota: Some(8 * 1024),
        },
    )
    .await;

    let fd = vol.create("/big", libc::O_RDWR, 0o644).await.unwrap();
    vol.write_at(fd, 0, &vec![7u8; 4 * 1024]).await.unwrap();

    // Growing past the quota fails with NoSpace before any bytes land.
    let err = vol.write_at(fd, 4 * 1024, &vec![7u8; 8 * 1024]).await;
    assert!(matches!(err, Err(UfsError::NoSpace(_))));
    assert_eq!(vol.metadata("/big").await.unwrap().st_size, 4 * 1024);

    let space = vol.space().await.unwrap();
    assert!(space.available_bytes() <= 8 * 1024);
    vol.close(fd).await.unwrap();
}

#[tokio::test]
async fn test_truncate_and_link_count() {
    let dir = TempDir::new().unwrap();
    let vol = new_volume(&dir, LocalVolumeOptions::default()).await;

    let fd = vol.create("/f", libc::O_RDWR, 0o644).await.unwrap();
    vol.write_at(fd, 0, b"0123456789").await.unwrap();
    vol.close(fd).await.unwrap();

    vol.truncate("/f", 4).await.unwrap();
    assert_eq!(vol.metadata("/f").await.unwrap().st_size, 4);

    vol.link("/f", "/f2").await.unwrap();
    assert_eq!(vol.metadata("/f").await.unwrap().st_nlink, 2);
}

#[tokio::test]
async fn test_root_guard_blocks_second_writable_instance() {
    let dir = TempDir::new().unwrap();
    let _vol = new_volume(&dir, LocalVolumeOptions::default()).await;
    let second = LocalVolume::new(
        format!("file://{}", dir.path().to_string_lossy()),
        dir.path().to_path_buf(),
        LocalVolumeOptions::default(),
    )
    .await;
    assert!(second.is_err());
}

#[tokio::test]
async fn test_xattr_not_found_vs_unsupported() {
    let dir = TempDir::new().unwrap();
    let vol = new_volume(&dir, LocalVolumeOptions::default()).await;
    let fd = vol.create("/f", libc::O_WRONLY, 0o644).await.unwrap();
    vol.close(fd).await.unwrap();

    // Depending on the host filesystem the attribute is either absent or
    // xattrs are unsupported altogether; both are distinct from plain I/O
    // failures.
    match vol.get_xattr("/f", "user.ufs_test").await {
        Err(UfsError::NotFound(_)) | Err(UfsError::Unsupported(_)) => {}
        other => panic!("unexpected xattr result: {:?}", other.map(|v| v.len())),
    }
}
