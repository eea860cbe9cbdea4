use crate::volume::Volume;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::debug;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use ufs_lib::proto::{
    self, AccessArg, ChmodArg, ChownArg, CreateArg, EmptyResp, FdArg, FsyncArg, LinkArg, LockArg,
    LockKind, MkdirArg, MknodArg, OpenArg, OpenResp, PathArg, ReadArg, ReadResp, ReaddirResp,
    ReadlinkResp, RenameArg, SymlinkArg, TruncateArg, UtimensArg, WriteArg, WriteResp,
    XattrGetArg, XattrListResp, XattrSetArg, XattrValueResp, DEFAULT_MAX_RESPONSE_SIZE,
};
use ufs_lib::{DirEntry, FileMetadata, TimeSpec, UfsError, UfsResult, VolumeSpace};
use url::Url;

/// Volume backed by a peer running the same server logic.
///
/// Every operation is one JSON object POSTed to `/api/volume/<op>`; the
/// response carries `errno` plus the operation results. There is no timeout
/// at this layer; a dead peer stalls the caller until the connection drops.
pub struct RemoteVolume {
    uri: String,
    base: String,
    readonly: bool,
    max_response: usize,
    client: Client,
}

impl RemoteVolume {
    pub fn new(uri: &str) -> UfsResult<Self> {
        let url = Url::parse(uri)
            .map_err(|e| UfsError::UnsupportedProtocol(format!("bad volume uri {}: {}", uri, e)))?;
        let readonly = url
            .query_pairs()
            .any(|(k, v)| k == "ro" && (v == "1" || v == "true"));
        let host = url
            .host_str()
            .ok_or_else(|| UfsError::UnsupportedProtocol(format!("no host in {}", uri)))?;
        let mut base = format!("{}://{}", url.scheme(), host);
        if let Some(port) = url.port() {
            base.push_str(&format!(":{}", port));
        }
        let path = url.path().trim_end_matches('/');
        if !path.is_empty() {
            base.push_str(path);
        }
        Ok(Self {
            uri: uri.to_string(),
            base,
            readonly,
            max_response: DEFAULT_MAX_RESPONSE_SIZE,
            client: Client::new(),
        })
    }

    pub fn with_max_response(mut self, limit: usize) -> Self {
        self.max_response = limit;
        self
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

    async fn call<Req, Resp>(&self, op: &str, req: &Req) -> UfsResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/api/volume/{}", self.base, op);
        debug!("RemoteVolume: POST {}", url);
        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| UfsError::RemoteError(format!("post {} failed: {}", url, e)))?;
        let status = resp.status();

        if let Some(len) = resp.content_length() {
            if len as usize > self.max_response {
                return Err(UfsError::ResourceLimitExceeded(format!(
                    "response for {} is {} bytes, limit {}",
                    op, len, self.max_response
                )));
            }
        }
        let mut body: Vec<u8> = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| UfsError::RemoteError(format!("read {} failed: {}", url, e)))?;
            if body.len() + chunk.len() > self.max_response {
                return Err(UfsError::ResourceLimitExceeded(format!(
                    "response for {} exceeds limit {}",
                    op, self.max_response
                )));
            }
            body.extend_from_slice(&chunk);
        }

        if !status.is_success() {
            return Err(UfsError::RemoteError(format!(
                "HTTP {} from {}",
                status, url
            )));
        }

        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| UfsError::RemoteError(format!("bad response from {}: {}", url, e)))?;
        let errno = value
            .get("errno")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| UfsError::RemoteError(format!("missing errno from {}", url)))?;
        if errno != 0 {
            let info = value
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            return Err(UfsError::from_errno(errno as i32, info));
        }
        serde_json::from_value(value)
            .map_err(|e| UfsError::RemoteError(format!("decode {} response failed: {}", op, e)))
    }
}

#[async_trait]
impl Volume for RemoteVolume {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn readonly(&self) -> bool {
        self.readonly
    }

    fn is_local(&self) -> bool {
        false
    }

    async fn metadata(&self, path: &str) -> UfsResult<FileMetadata> {
        self.call(
            "getattr",
            &PathArg {
                path: path.to_string(),
            },
        )
        .await
    }

    async fn space(&self) -> UfsResult<VolumeSpace> {
        self.call(
            "statfs",
            &PathArg {
                path: "/".to_string(),
            },
        )
        .await
    }

    async fn create_directory(&self, path: &str, mode: u32) -> UfsResult<()> {
        self.ensure_writable("mkdir")?;
        let _: EmptyResp = self
            .call(
                "mkdir",
                &MkdirArg {
                    path: path.to_string(),
                    mode,
                },
            )
            .await?;
        Ok(())
    }

    async fn remove_directory(&self, path: &str) -> UfsResult<()> {
        self.ensure_writable("rmdir")?;
        let _: EmptyResp = self
            .call(
                "rmdir",
                &PathArg {
                    path: path.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn unlink(&self, path: &str) -> UfsResult<()> {
        self.ensure_writable("unlink")?;
        let _: EmptyResp = self
            .call(
                "unlink",
                &PathArg {
                    path: path.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn rename(&self, old: &str, new: &str) -> UfsResult<()> {
        self.ensure_writable("rename")?;
        let _: EmptyResp = self
            .call(
                "rename",
                &RenameArg {
                    old: old.to_string(),
                    new: new.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn set_timestamps(&self, path: &str, atime: TimeSpec, mtime: TimeSpec) -> UfsResult<()> {
        self.ensure_writable("utimens")?;
        let _: EmptyResp = self
            .call(
                "utimens",
                &UtimensArg {
                    path: path.to_string(),
                    atime,
                    mtime,
                },
            )
            .await?;
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: u32) -> UfsResult<()> {
        self.ensure_writable("chmod")?;
        let _: EmptyResp = self
            .call(
                "chmod",
                &ChmodArg {
                    path: path.to_string(),
                    mode,
                },
            )
            .await?;
        Ok(())
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> UfsResult<()> {
        self.ensure_writable("chown")?;
        let _: EmptyResp = self
            .call(
                "chown",
                &ChownArg {
                    path: path.to_string(),
                    owner: uid,
                    group: gid,
                },
            )
            .await?;
        Ok(())
    }

    async fn list_directory(&self, path: &str) -> UfsResult<Vec<DirEntry>> {
        let resp: ReaddirResp = self
            .call(
                "readdir",
                &PathArg {
                    path: path.to_string(),
                },
            )
            .await?;
        Ok(resp.entries)
    }

    async fn read_symlink(&self, path: &str) -> UfsResult<String> {
        let resp: ReadlinkResp = self
            .call(
                "readlink",
                &PathArg {
                    path: path.to_string(),
                },
            )
            .await?;
        Ok(resp.target)
    }

    async fn symlink(&self, target: &str, path: &str) -> UfsResult<()> {
        self.ensure_writable("symlink")?;
        let _: EmptyResp = self
            .call(
                "symlink",
                &SymlinkArg {
                    target: target.to_string(),
                    path: path.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn mknod(&self, path: &str, mode: u32, rdev: u64) -> UfsResult<()> {
        self.ensure_writable("mknod")?;
        let _: EmptyResp = self
            .call(
                "mknod",
                &MknodArg {
                    path: path.to_string(),
                    mode,
                    rdev,
                },
            )
            .await?;
        Ok(())
    }

    async fn link(&self, old: &str, new: &str) -> UfsResult<()> {
        self.ensure_writable("link")?;
        let _: EmptyResp = self
            .call(
                "link",
                &LinkArg {
                    old: old.to_string(),
                    new: new.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn check_access(&self, path: &str, mask: i32) -> UfsResult<()> {
        let _: EmptyResp = self
            .call(
                "access",
                &AccessArg {
                    path: path.to_string(),
                    mask,
                },
            )
            .await?;
        Ok(())
    }

    async fn truncate(&self, path: &str, size: u64) -> UfsResult<()> {
        self.ensure_writable("truncate")?;
        let _: EmptyResp = self
            .call(
                "truncate",
                &TruncateArg {
                    path: path.to_string(),
                    size,
                },
            )
            .await?;
        Ok(())
    }

    async fn open(&self, path: &str, flags: i32) -> UfsResult<u64> {
        let resp: OpenResp = self
            .call(
                "open",
                &OpenArg {
                    path: path.to_string(),
                    flags,
                },
            )
            .await?;
        Ok(resp.fd)
    }

    async fn create(&self, path: &str, flags: i32, mode: u32) -> UfsResult<u64> {
        self.ensure_writable("create")?;
        let resp: OpenResp = self
            .call(
                "create",
                &CreateArg {
                    path: path.to_string(),
                    flags,
                    mode,
                },
            )
            .await?;
        Ok(resp.fd)
    }

    async fn close(&self, fd: u64) -> UfsResult<()> {
        let _: EmptyResp = self.call("close", &FdArg { fd }).await?;
        Ok(())
    }

    async fn read_at(&self, fd: u64, offset: u64, count: u64) -> UfsResult<Vec<u8>> {
        let resp: ReadResp = self.call("read", &ReadArg { fd, offset, count }).await?;
        proto::b64_decode(&resp.buf)
    }

    async fn write_at(&self, fd: u64, offset: u64, buf: &[u8]) -> UfsResult<u64> {
        self.ensure_writable("write")?;
        let resp: WriteResp = self
            .call(
                "write",
                &WriteArg {
                    fd,
                    offset,
                    buf: proto::b64_encode(buf),
                },
            )
            .await?;
        Ok(resp.written)
    }

    async fn sync(&self, fd: u64, datasync: bool) -> UfsResult<()> {
        let _: EmptyResp = self.call("fsync", &FsyncArg { fd, datasync }).await?;
        Ok(())
    }

    async fn lock(&self, fd: u64, kind: LockKind, start: u64, len: u64) -> UfsResult<()> {
        let _: EmptyResp = self
            .call(
                "lock",
                &LockArg {
                    fd,
                    kind,
                    start,
                    len,
                },
            )
            .await?;
        Ok(())
    }

    async fn get_xattr(&self, path: &str, name: &str) -> UfsResult<Vec<u8>> {
        let resp: XattrValueResp = self
            .call(
                "getxattr",
                &XattrGetArg {
                    path: path.to_string(),
                    xattr: name.to_string(),
                },
            )
            .await?;
        proto::b64_decode(&resp.xattr)
    }

    async fn set_xattr(&self, path: &str, name: &str, value: &[u8], flags: i32) -> UfsResult<()> {
        self.ensure_writable("setxattr")?;
        let _: EmptyResp = self
            .call(
                "setxattr",
                &XattrSetArg {
                    path: path.to_string(),
                    xattr: name.to_string(),
                    value: proto::b64_encode(value),
                    flags,
                },
            )
            .await?;
        Ok(())
    }

    async fn list_xattr(&self, path: &str) -> UfsResult<Vec<String>> {
        let resp: XattrListResp = self
            .call(
                "listxattr",
                &PathArg {
                    path: path.to_string(),
                },
            )
            .await?;
        Ok(resp.xattrs)
    }

    async fn remove_xattr(&self, path: &str, name: &str) -> UfsResult<()> {
        self.ensure_writable("removexattr")?;
        let _: EmptyResp = self
            .call(
                "removexattr",
                &XattrGetArg {
                    path: path.to_string(),
                    xattr: name.to_string(),
                },
            )
            .await?;
        Ok(())
    }
}
