//! Cross-volume file relocation, entered only from the write path when a
//! write fails with `NoSpace`. The caller holds the file's path lock for the
//! whole migration, so every open descriptor of the logical file is
//! repointed under exclusion.

use crate::open_files::OpenFileRecord;
use crate::resolver::PlacementResolver;
use log::{info, warn};
use ufs_lib::{FileMetadata, RequestContext, TimeSpec, UfsError, UfsResult};
use volume_store::Volume;

/// Upper bound for the stream-copy buffer; halved on allocation failure down
/// to the filesystem block size before giving up.
const DEFAULT_COPY_BUF: usize = 4 * 1024 * 1024;

/// Relocate the file behind `record` to a volume with room for `required`
/// bytes, repoint every open descriptor, delete the source, and retry the
/// original write. Any failure strictly before the repoint leaves the source
/// untouched and surfaces as the write's failure; the hardlink and
/// no-destination cases surface the original `NoSpace` unchanged.
pub(crate) async fn migrate_and_retry(
    resolver: &PlacementResolver,
    _ctx: &RequestContext,
    record: &OpenFileRecord,
    offset: u64,
    data: &[u8],
    original_err: UfsError,
) -> UfsResult<u64> {
    let src = record.volume.clone();
    let rel = record.rel_path.clone();
    let vpath = record.vpath.clone();

    let meta = match src.metadata(&rel).await {
        Ok(m) => m,
        Err(e) => {
            warn!("migration: stat {} on {} failed: {}", rel, src.uri(), e);
            return Err(original_err);
        }
    };
    let required = meta.st_size.max(offset + data.len() as u64);

    // Cross-volume hardlink preservation is impossible; migrating would
    // duplicate data without freeing source space.
    if meta.st_nlink > 1 {
        let refused = UfsError::NotSupported(format!(
            "{} has {} hard links, not migratable",
            vpath, meta.st_nlink
        ));
        warn!("migration refused: {}", refused);
        return Err(original_err);
    }

    let dest = match resolver
        .select_for_migration(&vpath, src.uri(), required)
        .await
    {
        Some(entry) => entry,
        None => {
            warn!(
                "migration: no volume with {} bytes free for {}",
                required, vpath
            );
            return Err(original_err);
        }
    };
    info!(
        "migration: move {} ({} bytes) from {} to {}",
        vpath, meta.st_size, src.uri(), dest.uri
    );

    resolver.ensure_parent_chain(&dest, &vpath).await?;
    let dest_rel = dest.rel_path(&vpath);
    copy_file(src.as_ref(), &rel, dest.volume.as_ref(), &dest_rel, &meta).await?;

    // Point of no return: repoint every open descriptor of this logical
    // file, selected by virtual path so a file under another mount that
    // happens to share the relative path is left alone. The stale source fd
    // stays open until the repoint is published; a concurrent reader's
    // snapshot therefore always holds a live descriptor.
    for id in resolver.open_files().ids_for_path(&vpath) {
        let rec = match resolver.open_files().lookup(id) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let reopen_flags = rec.flags & !(libc::O_EXCL | libc::O_TRUNC);
        match dest.volume.open(&dest_rel, reopen_flags).await {
            Ok(new_fd) => {
                resolver.open_files().repoint(
                    id,
                    dest.volume.clone(),
                    dest.mount_prefix.clone(),
                    new_fd,
                );
            }
            Err(e) => {
                // Invalid beats silently misdirected: the descriptor keeps
                // its slot and fails on its next use.
                warn!("migration: reopen descriptor {} failed: {}", id, e);
                resolver.open_files().invalidate(id);
            }
        }
        if let Err(e) = rec.volume.close(rec.volume_fd).await {
            warn!("migration: close stale fd {} failed: {}", rec.volume_fd, e);
        }
    }

    if let Err(e) = src.unlink(&rel).await {
        // The destination copy is authoritative from here on; a stale source
        // is an accepted leak, not a failure.
        warn!(
            "migration: unlink source {} on {} failed: {}",
            rel, src.uri(), e
        );
    }

    let fresh = resolver.open_files().lookup(record.id)?;
    if !fresh.valid {
        return Err(UfsError::Invalid(format!(
            "descriptor {} lost in migration",
            record.id
        )));
    }
    let written = fresh.volume.write_at(fresh.volume_fd, offset, data).await?;
    resolver.open_files().set_offset(record.id, offset + written);
    Ok(written)
}

/// Stream-copy `src_rel` to `dst_rel`, preserving owner, mode and timestamps
/// and copying xattrs best-effort. A failed copy removes the partial
/// destination and leaves the source untouched.
async fn copy_file(
    src: &dyn Volume,
    src_rel: &str,
    dst: &dyn Volume,
    dst_rel: &str,
    meta: &FileMetadata,
) -> UfsResult<()> {
    let chunk = pick_copy_buf(meta.st_blksize)?;
    let src_fd = src.open(src_rel, libc::O_RDONLY).await?;
    let dst_fd = match dst
        .create(dst_rel, libc::O_WRONLY | libc::O_TRUNC, meta.perm_mode())
        .await
    {
        Ok(fd) => fd,
        Err(e) => {
            let _ = src.close(src_fd).await;
            return Err(e);
        }
    };

    let result = copy_content(src, src_fd, dst, dst_fd, dst_rel, meta, chunk).await;

    let _ = src.close(src_fd).await;
    let _ = dst.close(dst_fd).await;
    if result.is_err() {
        let _ = dst.unlink(dst_rel).await;
        return result;
    }

    copy_xattrs(src, src_rel, dst, dst_rel).await;
    Ok(())
}

async fn copy_content(
    src: &dyn Volume,
    src_fd: u64,
    dst: &dyn Volume,
    dst_fd: u64,
    dst_rel: &str,
    meta: &FileMetadata,
    chunk: usize,
) -> UfsResult<()> {
    let mut off = 0u64;
    loop {
        let buf = src.read_at(src_fd, off, chunk as u64).await?;
        if buf.is_empty() {
            break;
        }
        dst.write_at(dst_fd, off, &buf).await?;
        off += buf.len() as u64;
    }
    dst.chown(dst_rel, meta.st_uid, meta.st_gid).await?;
    dst.chmod(dst_rel, meta.perm_mode()).await?;
    dst.set_timestamps(
        dst_rel,
        TimeSpec::new(meta.st_atime, 0),
        TimeSpec::new(meta.st_mtime, 0),
    )
    .await?;
    Ok(())
}

/// Copy buffer sizing: probe the allocation, halving on failure down to the
/// block-size floor, then give up with `OutOfMemory`.
fn pick_copy_buf(blksize: u64) -> UfsResult<usize> {
    let floor = blksize.max(4096) as usize;
    let mut cap = DEFAULT_COPY_BUF.max(floor);
    loop {
        let mut probe: Vec<u8> = Vec::new();
        match probe.try_reserve_exact(cap) {
            Ok(()) => return Ok(cap),
            Err(_) if cap > floor => cap = (cap / 2).max(floor),
            Err(_) => {
                return Err(UfsError::OutOfMemory(format!(
                    "copy buffer of {} bytes",
                    cap
                )))
            }
        }
    }
}

async fn copy_xattrs(src: &dyn Volume, src_rel: &str, dst: &dyn Volume, dst_rel: &str) {
    let names = match src.list_xattr(src_rel).await {
        Ok(names) => names,
        Err(UfsError::Unsupported(_)) => return,
        Err(e) => {
            warn!("migration: listxattr {} failed: {}", src_rel, e);
            return;
        }
    };
    for name in names {
        let value = match src.get_xattr(src_rel, &name).await {
            Ok(v) => v,
            Err(e) => {
                warn!("migration: getxattr {}:{} failed: {}", src_rel, name, e);
                continue;
            }
        };
        if let Err(e) = dst.set_xattr(dst_rel, &name, &value, 0).await {
            warn!("migration: setxattr {}:{} failed: {}", dst_rel, name, e);
        }
    }
}
