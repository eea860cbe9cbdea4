use async_trait::async_trait;
use ufs_lib::proto::LockKind;
use ufs_lib::{DirEntry, FileMetadata, TimeSpec, UfsResult, VolumeSpace};

/// Uniform capability set over one backing store.
///
/// Paths are volume-relative (always `/`-rooted); descriptors are
/// volume-local `u64` handles with no meaning outside the volume that issued
/// them. Implementations reject every mutating call on a read-only volume
/// with `ReadOnly` before touching storage.
#[async_trait]
pub trait Volume: Send + Sync {
    /// The URI this volume was registered under.
    fn uri(&self) -> &str;
    fn readonly(&self) -> bool;
    fn is_local(&self) -> bool;

    async fn metadata(&self, path: &str) -> UfsResult<FileMetadata>;
    async fn space(&self) -> UfsResult<VolumeSpace>;

    async fn create_directory(&self, path: &str, mode: u32) -> UfsResult<()>;
    async fn remove_directory(&self, path: &str) -> UfsResult<()>;
    async fn unlink(&self, path: &str) -> UfsResult<()>;
    async fn rename(&self, old: &str, new: &str) -> UfsResult<()>;
    async fn set_timestamps(&self, path: &str, atime: TimeSpec, mtime: TimeSpec) -> UfsResult<()>;
    async fn chmod(&self, path: &str, mode: u32) -> UfsResult<()>;
    async fn chown(&self, path: &str, uid: u32, gid: u32) -> UfsResult<()>;
    async fn list_directory(&self, path: &str) -> UfsResult<Vec<DirEntry>>;
    async fn read_symlink(&self, path: &str) -> UfsResult<String>;
    async fn symlink(&self, target: &str, path: &str) -> UfsResult<()>;
    async fn mknod(&self, path: &str, mode: u32, rdev: u64) -> UfsResult<()>;
    async fn link(&self, old: &str, new: &str) -> UfsResult<()>;
    async fn check_access(&self, path: &str, mask: i32) -> UfsResult<()>;
    async fn truncate(&self, path: &str, size: u64) -> UfsResult<()>;

    async fn open(&self, path: &str, flags: i32) -> UfsResult<u64>;
    async fn create(&self, path: &str, flags: i32, mode: u32) -> UfsResult<u64>;
    async fn close(&self, fd: u64) -> UfsResult<()>;
    async fn read_at(&self, fd: u64, offset: u64, count: u64) -> UfsResult<Vec<u8>>;
    async fn write_at(&self, fd: u64, offset: u64, buf: &[u8]) -> UfsResult<u64>;
    async fn sync(&self, fd: u64, datasync: bool) -> UfsResult<()>;
    async fn lock(&self, fd: u64, kind: LockKind, start: u64, len: u64) -> UfsResult<()>;

    /// Extended attributes. Backends without xattr support fail with
    /// `Unsupported`, distinct from I/O errors.
    async fn get_xattr(&self, path: &str, name: &str) -> UfsResult<Vec<u8>>;
    async fn set_xattr(&self, path: &str, name: &str, value: &[u8], flags: i32) -> UfsResult<()>;
    async fn list_xattr(&self, path: &str) -> UfsResult<Vec<String>>;
    async fn remove_xattr(&self, path: &str, name: &str) -> UfsResult<()>;
}
