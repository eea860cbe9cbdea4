use crate::volume::Volume;
use async_trait::async_trait;
use fs2::FileExt;
use log::{debug, warn};
use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use ufs_lib::proto::LockKind;
use ufs_lib::{DirEntry, FileMetadata, TimeSpec, UfsError, UfsResult, VolumeSpace};

/// Guard file at the volume root: one writable instance per directory.
const LOCK_FILE_NAME: &str = ".ufs_volume.lock";

#[cfg(target_os = "macos")]
const XATTR_NOT_FOUND: i32 = libc::ENOATTR;
#[cfg(not(target_os = "macos"))]
const XATTR_NOT_FOUND: i32 = libc::ENODATA;

#[derive(Debug, Clone, Default)]
pub struct LocalVolumeOptions {
    pub readonly: bool,
    /// Optional byte quota; when set, `space` and the write path account
    /// against it instead of the whole host filesystem.
    pub quota: Option<u64>,
}

/// Volume backed by a host directory. Every operation maps 1:1 onto host
/// filesystem calls rooted at `root`.
pub struct LocalVolume {
    uri: String,
    root: PathBuf,
    readonly: bool,
    quota: Option<u64>,
    next_fd: AtomicU64,
    files: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<File>>>>,
    // Held for the lifetime of a writable volume; dropped (and released) with it.
    _root_guard: Option<std::fs::File>,
}

impl LocalVolume {
    pub async fn new(uri: String, root: PathBuf, opts: LocalVolumeOptions) -> UfsResult<Self> {
        if !root.exists() {
            debug!("LocalVolume: create root dir {}", root.to_string_lossy());
            fs::create_dir_all(&root).await?;
        }

        let root_guard = if opts.readonly {
            None
        } else {
            let guard = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(root.join(LOCK_FILE_NAME))?;
            guard.try_lock_exclusive().map_err(|e| {
                UfsError::Internal(format!(
                    "volume root {} is locked by another instance: {}",
                    root.to_string_lossy(),
                    e
                ))
            })?;
            Some(guard)
        };

        Ok(Self {
            uri,
            root,
            readonly: opts.readonly,
            quota: opts.quota,
            next_fd: AtomicU64::new(1),
            files: Mutex::new(HashMap::new()),
            _root_guard: root_guard,
        })
    }

    fn host_path(&self, rel: &str) -> UfsResult<PathBuf> {
        if rel.split('/').any(|c| c == "..") {
            return Err(UfsError::Internal(format!("path escapes volume: {}", rel)));
        }
        Ok(self.root.join(rel.trim_start_matches('/')))
    }

    fn cpath(path: &Path) -> UfsResult<CString> {
        CString::new(path.as_os_str().as_bytes())
            .map_err(|_| UfsError::Internal(format!("NUL in path: {}", path.to_string_lossy())))
    }

    fn ensure_writable(&self, what: &str) -> UfsResult<()> {
        if self.readonly {
            return Err(UfsError::ReadOnly(format!(
                "{} on read-only volume {}",
                what, self.uri
            )));
        }
        Ok(())
    }

    fn file_handle(&self, fd: u64) -> UfsResult<Arc<tokio::sync::Mutex<File>>> {
        let files = self.files.lock().unwrap();
        files
            .get(&fd)
            .cloned()
            .ok_or_else(|| UfsError::BadDescriptor(format!("volume fd {} not open", fd)))
    }

    fn meta_from(md: &std::fs::Metadata) -> FileMetadata {
        FileMetadata {
            st_dev: md.dev(),
            st_ino: md.ino(),
            st_mode: md.mode(),
            st_nlink: md.nlink(),
            st_uid: md.uid(),
            st_gid: md.gid(),
            st_size: md.size(),
            st_blksize: md.blksize(),
            st_blocks: md.blocks(),
            st_atime: md.atime(),
            st_mtime: md.mtime(),
            st_ctime: md.ctime(),
        }
    }

    fn statvfs_root(&self) -> UfsResult<libc::statvfs> {
        let c = Self::cpath(&self.root)?;
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c.as_ptr(), &mut st) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(st)
    }

    /// Bytes of regular-file content under the root; used for quota
    /// accounting only, so errors are treated as zero-size entries.
    fn used_bytes(dir: &Path) -> u64 {
        let mut total = 0u64;
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return 0,
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy() == LOCK_FILE_NAME {
                continue;
            }
            let md = match entry.metadata() {
                Ok(md) => md,
                Err(_) => continue,
            };
            if md.is_dir() {
                total += Self::used_bytes(&entry.path());
            } else if md.is_file() {
                total += md.len();
            }
        }
        total
    }

    /// Quota check for growing a file from `old_size` to `new_size`.
    fn check_quota(&self, old_size: u64, new_size: u64) -> UfsResult<()> {
        let quota = match self.quota {
            Some(q) => q,
            None => return Ok(()),
        };
        if new_size <= old_size {
            return Ok(());
        }
        let used = Self::used_bytes(&self.root);
        let after = used - old_size.min(used) + new_size;
        if after > quota {
            return Err(UfsError::NoSpace(format!(
                "quota exceeded on {}: used {} + grow {} > {}",
                self.uri,
                used,
                new_size - old_size,
                quota
            )));
        }
        Ok(())
    }

    fn open_options(flags: i32) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => {
                opts.write(true);
            }
            libc::O_RDWR => {
                opts.read(true).write(true);
            }
            _ => {
                opts.read(true);
            }
        }
        if flags & libc::O_APPEND != 0 {
            opts.append(true);
        }
        if flags & libc::O_TRUNC != 0 {
            opts.write(true).truncate(true);
        }
        if flags & libc::O_CREAT != 0 {
            opts.create(true);
        }
        if flags & libc::O_EXCL != 0 {
            opts.create_new(true);
        }
        opts
    }

    fn wants_write(flags: i32) -> bool {
        (flags & libc::O_ACCMODE) != libc::O_RDONLY
            || flags & (libc::O_TRUNC | libc::O_CREAT | libc::O_APPEND) != 0
    }

    fn register_file(&self, file: File) -> u64 {
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .unwrap()
            .insert(fd, Arc::new(tokio::sync::Mutex::new(file)));
        fd
    }

    fn xattr_error(what: &str, path: &Path) -> UfsError {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == XATTR_NOT_FOUND => {
                UfsError::NotFound(format!("xattr absent: {}", path.to_string_lossy()))
            }
            Some(libc::ENOTSUP) | Some(libc::ENOSYS) => UfsError::Unsupported(format!(
                "{} unsupported on {}",
                what,
                path.to_string_lossy()
            )),
            _ => err.into(),
        }
    }
}

#[async_trait]
impl Volume for LocalVolume {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn readonly(&self) -> bool {
        self.readonly
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn metadata(&self, path: &str) -> UfsResult<FileMetadata> {
        let full = self.host_path(path)?;
        let md = fs::symlink_metadata(&full).await?;
        Ok(Self::meta_from(&md))
    }

    async fn space(&self) -> UfsResult<VolumeSpace> {
        let st = self.statvfs_root()?;
        let bsize = st.f_bsize.max(1);
        let mut space = VolumeSpace {
            f_bsize: bsize,
            f_blocks: st.f_blocks,
            f_bfree: st.f_bfree,
            f_bavail: st.f_bavail,
            f_files: st.f_files,
            f_ffree: st.f_ffree,
            f_favail: st.f_favail,
        };
        if let Some(quota) = self.quota {
            let used = Self::used_bytes(&self.root);
            let avail_blocks = quota.saturating_sub(used) / bsize;
            space.f_blocks = quota / bsize;
            space.f_bfree = avail_blocks;
            space.f_bavail = avail_blocks;
        }
        Ok(space)
    }

    async fn create_directory(&self, path: &str, mode: u32) -> UfsResult<()> {
        self.ensure_writable("mkdir")?;
        let full = self.host_path(path)?;
        fs::create_dir(&full).await?;
        fs::set_permissions(&full, std::fs::Permissions::from_mode(mode & 0o7777)).await?;
        Ok(())
    }

    async fn remove_directory(&self, path: &str) -> UfsResult<()> {
        self.ensure_writable("rmdir")?;
        let full = self.host_path(path)?;
        fs::remove_dir(&full).await?;
        Ok(())
    }

    async fn unlink(&self, path: &str) -> UfsResult<()> {
        self.ensure_writable("unlink")?;
        let full = self.host_path(path)?;
        fs::remove_file(&full).await?;
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> UfsResult<()> {
        self.ensure_writable("rename")?;
        let old_full = self.host_path(old)?;
        let new_full = self.host_path(new)?;
        fs::rename(&old_full, &new_full).await?;
        Ok(())
    }

    async fn set_timestamps(&self, path: &str, atime: TimeSpec, mtime: TimeSpec) -> UfsResult<()> {
        self.ensure_writable("utimens")?;
        let full = self.host_path(path)?;
        let c = Self::cpath(&full)?;
        let times = [
            libc::timespec {
                tv_sec: atime.sec as libc::time_t,
                tv_nsec: atime.nsec as libc::c_long,
            },
            libc::timespec {
                tv_sec: mtime.sec as libc::time_t,
                tv_nsec: mtime.nsec as libc::c_long,
            },
        ];
        let rc = unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                c.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: u32) -> UfsResult<()> {
        self.ensure_writable("chmod")?;
        let full = self.host_path(path)?;
        fs::set_permissions(&full, std::fs::Permissions::from_mode(mode & 0o7777)).await?;
        Ok(())
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> UfsResult<()> {
        self.ensure_writable("chown")?;
        let full = self.host_path(path)?;
        std::os::unix::fs::chown(&full, Some(uid), Some(gid))?;
        Ok(())
    }

    async fn list_directory(&self, path: &str) -> UfsResult<Vec<DirEntry>> {
        let full = self.host_path(path)?;
        let mut out = Vec::new();
        let mut dir = fs::read_dir(&full).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == LOCK_FILE_NAME {
                continue;
            }
            let md = match fs::symlink_metadata(entry.path()).await {
                Ok(md) => md,
                Err(e) => {
                    warn!("list_directory: stat {} failed: {}", name, e);
                    continue;
                }
            };
            out.push(DirEntry {
                name,
                meta: Self::meta_from(&md),
            });
        }
        Ok(out)
    }

    async fn read_symlink(&self, path: &str) -> UfsResult<String> {
        let full = self.host_path(path)?;
        let target = fs::read_link(&full).await?;
        Ok(target.to_string_lossy().to_string())
    }

    async fn symlink(&self, target: &str, path: &str) -> UfsResult<()> {
        self.ensure_writable("symlink")?;
        let full = self.host_path(path)?;
        fs::symlink(target, &full).await?;
        Ok(())
    }

    async fn mknod(&self, path: &str, mode: u32, rdev: u64) -> UfsResult<()> {
        self.ensure_writable("mknod")?;
        let full = self.host_path(path)?;
        let c = Self::cpath(&full)?;
        let rc = unsafe { libc::mknod(c.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    async fn link(&self, old: &str, new: &str) -> UfsResult<()> {
        self.ensure_writable("link")?;
        let old_full = self.host_path(old)?;
        let new_full = self.host_path(new)?;
        fs::hard_link(&old_full, &new_full).await?;
        Ok(())
    }

    async fn check_access(&self, path: &str, mask: i32) -> UfsResult<()> {
        let full = self.host_path(path)?;
        let c = Self::cpath(&full)?;
        let rc = unsafe { libc::access(c.as_ptr(), mask as libc::c_int) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    async fn truncate(&self, path: &str, size: u64) -> UfsResult<()> {
        self.ensure_writable("truncate")?;
        let full = self.host_path(path)?;
        let old_size = fs::metadata(&full).await?.len();
        self.check_quota(old_size, size)?;
        let file = OpenOptions::new().write(true).open(&full).await?;
        file.set_len(size).await?;
        Ok(())
    }

    async fn open(&self, path: &str, flags: i32) -> UfsResult<u64> {
        if Self::wants_write(flags) {
            self.ensure_writable("open for write")?;
        }
        let full = self.host_path(path)?;
        let file = Self::open_options(flags).open(&full).await?;
        Ok(self.register_file(file))
    }

    async fn create(&self, path: &str, flags: i32, mode: u32) -> UfsResult<u64> {
        self.ensure_writable("create")?;
        let full = self.host_path(path)?;
        let mut opts = Self::open_options(flags | libc::O_CREAT);
        opts.mode(mode & 0o7777);
        let file = opts.open(&full).await?;
        Ok(self.register_file(file))
    }

    async fn close(&self, fd: u64) -> UfsResult<()> {
        let removed = self.files.lock().unwrap().remove(&fd);
        match removed {
            Some(_) => Ok(()),
            None => Err(UfsError::BadDescriptor(format!("volume fd {} not open", fd))),
        }
    }

    async fn read_at(&self, fd: u64, offset: u64, count: u64) -> UfsResult<Vec<u8>> {
        let handle = self.file_handle(fd)?;
        let mut file = handle.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; count as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    async fn write_at(&self, fd: u64, offset: u64, buf: &[u8]) -> UfsResult<u64> {
        self.ensure_writable("write")?;
        let handle = self.file_handle(fd)?;
        let mut file = handle.lock().await;
        if self.quota.is_some() {
            let old_size = file.metadata().await?.len();
            let new_size = old_size.max(offset + buf.len() as u64);
            self.check_quota(old_size, new_size)?;
        }
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(buf).await?;
        file.flush().await?;
        Ok(buf.len() as u64)
    }

    async fn sync(&self, fd: u64, datasync: bool) -> UfsResult<()> {
        let handle = self.file_handle(fd)?;
        let file = handle.lock().await;
        if datasync {
            file.sync_data().await?;
        } else {
            file.sync_all().await?;
        }
        Ok(())
    }

    async fn lock(&self, fd: u64, kind: LockKind, start: u64, len: u64) -> UfsResult<()> {
        let handle = self.file_handle(fd)?;
        let file = handle.lock().await;
        let l_type = match kind {
            LockKind::Read => libc::F_RDLCK,
            LockKind::Write => libc::F_WRLCK,
            LockKind::Unlock => libc::F_UNLCK,
        };
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = l_type as i16;
        fl.l_whence = libc::SEEK_SET as i16;
        fl.l_start = start as libc::off_t;
        fl.l_len = len as libc::off_t;
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &fl) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    async fn get_xattr(&self, path: &str, name: &str) -> UfsResult<Vec<u8>> {
        let full = self.host_path(path)?;
        let c = Self::cpath(&full)?;
        let cname = CString::new(name)
            .map_err(|_| UfsError::Internal(format!("NUL in xattr name: {}", name)))?;
        let size = unsafe { libc::getxattr(c.as_ptr(), cname.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            return Err(Self::xattr_error("getxattr", &full));
        }
        let mut buf = vec![0u8; size as usize];
        let got = unsafe {
            libc::getxattr(
                c.as_ptr(),
                cname.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if got < 0 {
            return Err(Self::xattr_error("getxattr", &full));
        }
        buf.truncate(got as usize);
        Ok(buf)
    }

    async fn set_xattr(&self, path: &str, name: &str, value: &[u8], flags: i32) -> UfsResult<()> {
        self.ensure_writable("setxattr")?;
        let full = self.host_path(path)?;
        let c = Self::cpath(&full)?;
        let cname = CString::new(name)
            .map_err(|_| UfsError::Internal(format!("NUL in xattr name: {}", name)))?;
        let rc = unsafe {
            libc::setxattr(
                c.as_ptr(),
                cname.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                flags,
            )
        };
        if rc != 0 {
            return Err(Self::xattr_error("setxattr", &full));
        }
        Ok(())
    }

    async fn list_xattr(&self, path: &str) -> UfsResult<Vec<String>> {
        let full = self.host_path(path)?;
        let c = Self::cpath(&full)?;
        let size = unsafe { libc::listxattr(c.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            return Err(Self::xattr_error("listxattr", &full));
        }
        if size == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; size as usize];
        let got = unsafe {
            libc::listxattr(
                c.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
            )
        };
        if got < 0 {
            return Err(Self::xattr_error("listxattr", &full));
        }
        buf.truncate(got as usize);
        let names = buf
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).to_string())
            .collect();
        Ok(names)
    }

    async fn remove_xattr(&self, path: &str, name: &str) -> UfsResult<()> {
        self.ensure_writable("removexattr")?;
        let full = self.host_path(path)?;
        let c = Self::cpath(&full)?;
        let cname = CString::new(name)
            .map_err(|_| UfsError::Internal(format!("NUL in xattr name: {}", name)))?;
        let rc = unsafe { libc::removexattr(c.as_ptr(), cname.as_ptr()) };
        if rc != 0 {
            return Err(Self::xattr_error("removexattr", &full));
        }
        Ok(())
    }
}
