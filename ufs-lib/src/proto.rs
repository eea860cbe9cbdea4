//! Wire types for the volume RPC protocol.
//!
//! One JSON object per call, POSTed to `/api/volume/<op>` on the peer. The
//! request always carries `path` (or `fd`) plus the operation arguments; the
//! response always carries `errno` (0 on success, positive otherwise) with the
//! operation results flattened alongside it. Binary payloads (`buf`, `xattr`
//! values) are base64 strings because the transport is text.

use crate::{TimeSpec, UfsError, UfsResult};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Default ceiling for one RPC response body. Responses above this are
/// rejected with `ResourceLimitExceeded` to bound memory on the client.
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 8 * 1024 * 1024;

pub fn b64_encode(data: &[u8]) -> String {
    B64.encode(data)
}

pub fn b64_decode(text: &str) -> UfsResult<Vec<u8>> {
    B64.decode(text)
        .map_err(|e| UfsError::RemoteError(format!("bad base64 payload: {}", e)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PathArg {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MkdirArg {
    pub path: String,
    pub mode: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RenameArg {
    pub old: String,
    pub new: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UtimensArg {
    pub path: String,
    pub atime: TimeSpec,
    pub mtime: TimeSpec,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChmodArg {
    pub path: String,
    pub mode: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChownArg {
    pub path: String,
    pub owner: u32,
    pub group: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SymlinkArg {
    pub target: String,
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MknodArg {
    pub path: String,
    pub mode: u32,
    pub rdev: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LinkArg {
    pub old: String,
    pub new: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessArg {
    pub path: String,
    pub mask: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TruncateArg {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenArg {
    pub path: String,
    pub flags: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateArg {
    pub path: String,
    pub flags: i32,
    pub mode: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FdArg {
    pub fd: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadArg {
    pub fd: u64,
    pub offset: u64,
    pub count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteArg {
    pub fd: u64,
    pub offset: u64,
    /// base64
    pub buf: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FsyncArg {
    pub fd: u64,
    pub datasync: bool,
}

/// Advisory byte-range lock request (F_SETLK semantics, non-blocking).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
    Unlock,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockArg {
    pub fd: u64,
    pub kind: LockKind,
    pub start: u64,
    /// 0 means "to end of file", as with fcntl.
    pub len: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct XattrGetArg {
    pub path: String,
    pub xattr: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct XattrSetArg {
    pub path: String,
    pub xattr: String,
    /// base64
    pub value: String,
    pub flags: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmptyResp {}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenResp {
    pub fd: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadResp {
    /// base64
    pub buf: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteResp {
    pub written: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadlinkResp {
    pub target: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReaddirResp {
    pub entries: Vec<crate::DirEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct XattrValueResp {
    /// base64
    pub xattr: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct XattrListResp {
    pub xattrs: Vec<String>,
}
