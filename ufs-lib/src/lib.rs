use thiserror::Error;

mod meta;
pub mod path;
pub mod proto;

pub use meta::{DirEntry, FileMetadata, RequestContext, TimeSpec, VolumeSpace};

/// Error taxonomy shared by every crate in the workspace.
///
/// Variants carry a human-readable payload; the errno mapping below is what
/// crosses the wire and what the kernel-interface adapter ultimately sees.
#[derive(Error, Debug)]
pub enum UfsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("no space left: {0}")]
    NoSpace(String),
    #[error("read-only: {0}")]
    ReadOnly(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("invalidated descriptor: {0}")]
    Invalid(String),
    #[error("bad descriptor: {0}")]
    BadDescriptor(String),
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("I/O error ({0}): {1}")]
    Io(i32, String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type UfsResult<T> = std::result::Result<T, UfsError>;

impl From<std::io::Error> for UfsError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOENT) => UfsError::NotFound(err.to_string()),
            Some(libc::ENOSPC) => UfsError::NoSpace(err.to_string()),
            Some(libc::EDQUOT) => UfsError::NoSpace(err.to_string()),
            Some(libc::EROFS) => UfsError::ReadOnly(err.to_string()),
            Some(libc::EBADF) => UfsError::BadDescriptor(err.to_string()),
            Some(code) => UfsError::Io(code, err.to_string()),
            None => UfsError::Io(libc::EIO, err.to_string()),
        }
    }
}

impl UfsError {
    /// Positive POSIX error code for the wire and the kernel boundary.
    pub fn to_errno(&self) -> i32 {
        match self {
            UfsError::NotFound(_) => libc::ENOENT,
            UfsError::NoSpace(_) => libc::ENOSPC,
            UfsError::ReadOnly(_) => libc::EROFS,
            UfsError::Unsupported(_) => libc::ENOTSUP,
            UfsError::NotSupported(_) => libc::ENOTSUP,
            UfsError::Invalid(_) => libc::EIO,
            UfsError::BadDescriptor(_) => libc::EBADF,
            UfsError::UnsupportedProtocol(_) => libc::EINVAL,
            UfsError::OutOfMemory(_) => libc::ENOMEM,
            UfsError::ResourceLimitExceeded(_) => libc::EMSGSIZE,
            UfsError::RemoteError(_) => libc::EIO,
            UfsError::Io(code, _) => *code,
            UfsError::Internal(_) => libc::EIO,
        }
    }

    /// Rebuild an error from a wire errno. The sign is normalized first: both
    /// `-ENOENT` and `ENOENT` decode to `NotFound`.
    pub fn from_errno(errno: i32, info: String) -> Self {
        let code = errno.abs();
        match code {
            libc::ENOENT => UfsError::NotFound(info),
            libc::ENOSPC => UfsError::NoSpace(info),
            libc::EROFS => UfsError::ReadOnly(info),
            libc::ENOTSUP => UfsError::Unsupported(info),
            libc::EBADF => UfsError::BadDescriptor(info),
            libc::ENOMEM => UfsError::OutOfMemory(info),
            libc::EMSGSIZE => UfsError::ResourceLimitExceeded(info),
            _ => UfsError::Io(code, info),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, UfsError::NotFound(_))
    }

    pub fn is_no_space(&self) -> bool {
        matches!(self, UfsError::NoSpace(_))
    }
}
