//! Server side of the volume wire protocol: one JSON object in, one JSON
//! object out, per call. The transport (HTTP framing) lives in the daemon;
//! this service only decodes arguments, runs the operation against the local
//! placement engine, and encodes `{errno, <results>}`.

use crate::resolver::PlacementResolver;
use log::debug;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use ufs_lib::proto::{
    self, AccessArg, ChmodArg, ChownArg, CreateArg, EmptyResp, FdArg, FsyncArg, LinkArg, LockArg,
    MkdirArg, MknodArg, OpenArg, OpenResp, PathArg, ReadArg, ReadResp, ReaddirResp, ReadlinkResp,
    RenameArg, SymlinkArg, TruncateArg, UtimensArg, WriteArg, WriteResp, XattrGetArg,
    XattrListResp, XattrSetArg, XattrValueResp,
};
use ufs_lib::{RequestContext, UfsError, UfsResult};

pub struct VolumeRpcService {
    resolver: Arc<PlacementResolver>,
    ctx: RequestContext,
}

impl VolumeRpcService {
    pub fn new(resolver: Arc<PlacementResolver>, readonly: bool) -> Self {
        let mut ctx = RequestContext::local();
        ctx.readonly = readonly;
        Self { resolver, ctx }
    }

    /// Handle one call. Never fails: errors become `{errno, error}`.
    pub async fn handle(&self, op: &str, args: Value) -> Value {
        debug!("VolumeRpcService: {} {}", op, args);
        match self.dispatch(op, args).await {
            Ok(mut value) => {
                value["errno"] = json!(0);
                value
            }
            Err(e) => json!({ "errno": e.to_errno(), "error": e.to_string() }),
        }
    }

    async fn dispatch(&self, op: &str, args: Value) -> UfsResult<Value> {
        let ctx = &self.ctx;
        let r = &self.resolver;
        match op {
            "getattr" => {
                let a: PathArg = decode(args)?;
                encode(&r.getattr(ctx, &a.path).await?)
            }
            "statfs" => {
                let a: PathArg = decode(args)?;
                encode(&r.statfs(ctx, &a.path).await?)
            }
            "mkdir" => {
                let a: MkdirArg = decode(args)?;
                r.mkdir(ctx, &a.path, a.mode).await?;
                encode(&EmptyResp {})
            }
            "rmdir" => {
                let a: PathArg = decode(args)?;
                r.rmdir(ctx, &a.path).await?;
                encode(&EmptyResp {})
            }
            "unlink" => {
                let a: PathArg = decode(args)?;
                r.unlink(ctx, &a.path).await?;
                encode(&EmptyResp {})
            }
            "rename" => {
                let a: RenameArg = decode(args)?;
                r.rename(ctx, &a.old, &a.new).await?;
                encode(&EmptyResp {})
            }
            "utimens" => {
                let a: UtimensArg = decode(args)?;
                r.utimens(ctx, &a.path, a.atime, a.mtime).await?;
                encode(&EmptyResp {})
            }
            "chmod" => {
                let a: ChmodArg = decode(args)?;
                r.chmod(ctx, &a.path, a.mode).await?;
                encode(&EmptyResp {})
            }
            "chown" => {
                let a: ChownArg = decode(args)?;
                r.chown(ctx, &a.path, a.owner, a.group).await?;
                encode(&EmptyResp {})
            }
            "readdir" => {
                let a: PathArg = decode(args)?;
                let entries = r.readdir(ctx, &a.path).await?;
                encode(&ReaddirResp { entries })
            }
            "readlink" => {
                let a: PathArg = decode(args)?;
                let target = r.readlink(ctx, &a.path).await?;
                encode(&ReadlinkResp { target })
            }
            "symlink" => {
                let a: SymlinkArg = decode(args)?;
                r.symlink(ctx, &a.target, &a.path).await?;
                encode(&EmptyResp {})
            }
            "mknod" => {
                let a: MknodArg = decode(args)?;
                r.mknod(ctx, &a.path, a.mode, a.rdev).await?;
                encode(&EmptyResp {})
            }
            "link" => {
                let a: LinkArg = decode(args)?;
                r.link(ctx, &a.old, &a.new).await?;
                encode(&EmptyResp {})
            }
            "access" => {
                let a: AccessArg = decode(args)?;
                r.access(ctx, &a.path, a.mask).await?;
                encode(&EmptyResp {})
            }
            "truncate" => {
                let a: TruncateArg = decode(args)?;
                r.truncate(ctx, &a.path, a.size).await?;
                encode(&EmptyResp {})
            }
            "open" => {
                let a: OpenArg = decode(args)?;
                let id = r.open(ctx, &a.path, a.flags).await?;
                encode(&OpenResp { fd: id as u64 })
            }
            "create" => {
                let a: CreateArg = decode(args)?;
                let id = r.create(ctx, &a.path, a.flags, a.mode).await?;
                encode(&OpenResp { fd: id as u64 })
            }
            "close" => {
                let a: FdArg = decode(args)?;
                r.release(ctx, descriptor(a.fd)?).await?;
                encode(&EmptyResp {})
            }
            "read" => {
                let a: ReadArg = decode(args)?;
                let data = r.read(ctx, descriptor(a.fd)?, a.offset, a.count).await?;
                encode(&ReadResp {
                    buf: proto::b64_encode(&data),
                })
            }
            "write" => {
                let a: WriteArg = decode(args)?;
                let data = proto::b64_decode(&a.buf)?;
                let written = r.write(ctx, descriptor(a.fd)?, a.offset, &data).await?;
                encode(&WriteResp { written })
            }
            "fsync" => {
                let a: FsyncArg = decode(args)?;
                r.fsync(ctx, descriptor(a.fd)?, a.datasync).await?;
                encode(&EmptyResp {})
            }
            "lock" => {
                let a: LockArg = decode(args)?;
                r.lock_file(ctx, descriptor(a.fd)?, a.kind, a.start, a.len)
                    .await?;
                encode(&EmptyResp {})
            }
            "getxattr" => {
                let a: XattrGetArg = decode(args)?;
                let value = r.getxattr(ctx, &a.path, &a.xattr).await?;
                encode(&XattrValueResp {
                    xattr: proto::b64_encode(&value),
                })
            }
            "setxattr" => {
                let a: XattrSetArg = decode(args)?;
                let value = proto::b64_decode(&a.value)?;
                r.setxattr(ctx, &a.path, &a.xattr, &value, a.flags).await?;
                encode(&EmptyResp {})
            }
            "listxattr" => {
                let a: PathArg = decode(args)?;
                let xattrs = r.listxattr(ctx, &a.path).await?;
                encode(&XattrListResp { xattrs })
            }
            "removexattr" => {
                let a: XattrGetArg = decode(args)?;
                r.removexattr(ctx, &a.path, &a.xattr).await?;
                encode(&EmptyResp {})
            }
            other => Err(UfsError::Io(
                libc::ENOSYS,
                format!("unknown volume op: {}", other),
            )),
        }
    }
}

fn decode<T: DeserializeOwned>(args: Value) -> UfsResult<T> {
    serde_json::from_value(args)
        .map_err(|e| UfsError::Io(libc::EINVAL, format!("bad rpc arguments: {}", e)))
}

fn encode<T: serde::Serialize>(value: &T) -> UfsResult<Value> {
    serde_json::to_value(value).map_err(|e| UfsError::Internal(format!("encode failed: {}", e)))
}

fn descriptor(fd: u64) -> UfsResult<u32> {
    u32::try_from(fd).map_err(|_| UfsError::BadDescriptor(format!("fd {} out of range", fd)))
}
