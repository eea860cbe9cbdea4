use serde::{Deserialize, Serialize};

/// POSIX-stat-equivalent record. Field names follow the wire protocol, which
/// carries them at the top level of the response object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileMetadata {
    pub st_dev: u64,
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u64,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_size: u64,
    pub st_blksize: u64,
    pub st_blocks: u64,
    pub st_atime: i64,
    pub st_mtime: i64,
    pub st_ctime: i64,
}

impl FileMetadata {
    pub fn is_dir(&self) -> bool {
        self.st_mode & (libc::S_IFMT as u32) == libc::S_IFDIR as u32
    }

    pub fn is_symlink(&self) -> bool {
        self.st_mode & (libc::S_IFMT as u32) == libc::S_IFLNK as u32
    }

    /// Permission bits plus setuid/setgid/sticky.
    pub fn perm_mode(&self) -> u32 {
        self.st_mode & 0o7777
    }
}

/// statvfs-equivalent space report for one volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeSpace {
    pub f_bsize: u64,
    pub f_blocks: u64,
    pub f_bfree: u64,
    pub f_bavail: u64,
    pub f_files: u64,
    pub f_ffree: u64,
    pub f_favail: u64,
}

impl VolumeSpace {
    /// Bytes available to unprivileged writers. No cross-volume block-size
    /// normalization happens anywhere; each volume is judged by its own
    /// bsize * bavail product.
    pub fn available_bytes(&self) -> u64 {
        self.f_bsize.saturating_mul(self.f_bavail)
    }
}

/// One directory entry as returned by `list_directory`/`readdir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(flatten)]
    pub meta: FileMetadata,
}

/// Second/nanosecond timestamp pair for utimens.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

impl TimeSpec {
    pub fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }
}

/// Caller identity and permission context attached to every placement entry
/// point by the kernel-interface adapter or the RPC service.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub umask: u32,
    /// Request-scoped read-only flag; checked before any volume call.
    pub readonly: bool,
}

impl RequestContext {
    /// Context for server-local work: current process identity, no read-only
    /// restriction.
    pub fn local() -> Self {
        // Safety: getuid/getgid have no failure mode.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            uid,
            gid,
            pid: std::process::id(),
            umask: 0o022,
            readonly: false,
        }
    }

    pub fn apply_umask(&self, mode: u32) -> u32 {
        mode & !self.umask
    }
}
