use crate::migration;
use crate::open_files::OpenFileMgr;
use async_recursion::async_recursion;
use log::{debug, warn};
use std::sync::Arc;
use ufs_lib::proto::LockKind;
use ufs_lib::{
    path, DirEntry, FileMetadata, RequestContext, TimeSpec, UfsError, UfsResult, VolumeSpace,
};
use volume_store::{MountEntry, VolumeRegistry};

/// Result of `locate`: the entry that currently holds the object, the
/// volume-relative path, and the object's metadata.
pub struct Located {
    pub entry: MountEntry,
    pub rel_path: String,
    pub meta: FileMetadata,
}

/// The placement engine: decides which volume owns (or should own) a virtual
/// path, executes every filesystem entry point against it, and relocates file
/// content on out-of-space.
pub struct PlacementResolver {
    registry: Arc<VolumeRegistry>,
    open_files: OpenFileMgr,
}

impl PlacementResolver {
    pub fn new(registry: Arc<VolumeRegistry>) -> Self {
        Self {
            registry,
            open_files: OpenFileMgr::new(),
        }
    }

    pub fn registry(&self) -> &Arc<VolumeRegistry> {
        &self.registry
    }

    pub fn open_files(&self) -> &OpenFileMgr {
        &self.open_files
    }

    fn ensure_ctx_writable(ctx: &RequestContext, what: &str) -> UfsResult<()> {
        if ctx.readonly {
            return Err(UfsError::ReadOnly(format!("{} in read-only context", what)));
        }
        Ok(())
    }

    /// Find the volume currently holding `vpath`: probe each candidate's
    /// metadata in registration order, first hit wins.
    pub async fn locate(&self, vpath: &str) -> UfsResult<Located> {
        let vp = path::normalize(vpath);
        for entry in self.registry.resolve(&vp) {
            let rel = entry.rel_path(&vp);
            match entry.volume.metadata(&rel).await {
                Ok(meta) => {
                    return Ok(Located {
                        entry,
                        rel_path: rel,
                        meta,
                    })
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!("locate: probe {} on {} failed: {}", rel, entry.uri, e);
                }
            }
        }
        Err(UfsError::NotFound(format!("no volume holds {}", vp)))
    }

    /// Pick the candidate with the most available bytes for new content.
    /// Each candidate's space is queried fresh; read-only volumes never
    /// receive new content.
    pub async fn select_for_creation(&self, vpath: &str) -> UfsResult<MountEntry> {
        let vp = path::normalize(vpath);
        let mut best: Option<(u64, MountEntry)> = None;
        for entry in self.registry.resolve(&vp) {
            if entry.volume.readonly() {
                continue;
            }
            let space = match entry.volume.space().await {
                Ok(s) => s,
                Err(e) => {
                    warn!("select_for_creation: space on {} failed: {}", entry.uri, e);
                    continue;
                }
            };
            let avail = space.available_bytes();
            match &best {
                Some((best_avail, _)) if *best_avail >= avail => {}
                _ => best = Some((avail, entry)),
            }
        }
        best.map(|(_, e)| e).ok_or_else(|| {
            UfsError::NoSpace(format!("no writable volume reachable for {}", vp))
        })
    }

    /// Destination for a migration: best candidate excluding the source
    /// volume, with at least `required` bytes available. `None` means the
    /// migration cannot run and the original error stands.
    pub(crate) async fn select_for_migration(
        &self,
        vpath: &str,
        exclude_uri: &str,
        required: u64,
    ) -> Option<MountEntry> {
        let vp = path::normalize(vpath);
        let mut best: Option<(u64, MountEntry)> = None;
        for entry in self.registry.resolve(&vp) {
            if entry.volume.readonly() || entry.uri == exclude_uri {
                continue;
            }
            let space = match entry.volume.space().await {
                Ok(s) => s,
                Err(e) => {
                    warn!("select_for_migration: space on {} failed: {}", entry.uri, e);
                    continue;
                }
            };
            let avail = space.available_bytes();
            if avail < required {
                continue;
            }
            match &best {
                Some((best_avail, _)) if *best_avail >= avail => {}
                _ => best = Some((avail, entry)),
            }
        }
        best.map(|(_, e)| e)
    }

    /// Lazily clone the parent directory chain of `vpath` onto the entry's
    /// volume, top-down, copying mode from the authoritative holder. Owner
    /// matching is best-effort; a placeholder directory with the wrong owner
    /// is preferable to a failed create.
    #[async_recursion]
    pub async fn ensure_parent_chain(&self, entry: &MountEntry, vpath: &str) -> UfsResult<()> {
        let parent_v = match path::parent(vpath) {
            Some(p) => p,
            None => return Ok(()),
        };
        let rel_parent = entry.rel_path(&parent_v);
        if rel_parent == "/" || entry.volume.metadata(&rel_parent).await.is_ok() {
            return Ok(());
        }
        self.ensure_parent_chain(entry, &parent_v).await?;
        let auth = self.locate(&parent_v).await?;
        debug!(
            "ensure_parent_chain: clone {} onto {}",
            parent_v, entry.uri
        );
        entry
            .volume
            .create_directory(&rel_parent, auth.meta.perm_mode())
            .await?;
        if let Err(e) = entry
            .volume
            .chown(&rel_parent, auth.meta.st_uid, auth.meta.st_gid)
            .await
        {
            warn!("ensure_parent_chain: chown {} failed: {}", rel_parent, e);
        }
        Ok(())
    }

    /// Every (entry, rel_path) currently holding an object at `vpath`.
    /// Directory placeholders may be cloned onto several volumes, so
    /// metadata operations iterate this set.
    async fn holders(&self, vpath: &str) -> Vec<(MountEntry, String)> {
        let vp = path::normalize(vpath);
        let mut out = Vec::new();
        for entry in self.registry.resolve(&vp) {
            let rel = entry.rel_path(&vp);
            if entry.volume.metadata(&rel).await.is_ok() {
                out.push((entry, rel));
            }
        }
        out
    }

    // ---- per-operation entry points -------------------------------------

    pub async fn getattr(&self, _ctx: &RequestContext, vpath: &str) -> UfsResult<FileMetadata> {
        Ok(self.locate(vpath).await?.meta)
    }

    /// Aggregate space over the candidate set; block counts are normalized
    /// to the first reachable volume's block size by way of byte totals.
    pub async fn statfs(&self, _ctx: &RequestContext, vpath: &str) -> UfsResult<VolumeSpace> {
        let vp = path::normalize(vpath);
        let mut agg: Option<VolumeSpace> = None;
        let mut total = (0u64, 0u64, 0u64); // blocks, bfree, bavail in bytes
        for entry in self.registry.resolve(&vp) {
            let space = match entry.volume.space().await {
                Ok(s) => s,
                Err(e) => {
                    warn!("statfs: space on {} failed: {}", entry.uri, e);
                    continue;
                }
            };
            total.0 += space.f_bsize * space.f_blocks;
            total.1 += space.f_bsize * space.f_bfree;
            total.2 += space.f_bsize * space.f_bavail;
            match agg.as_mut() {
                None => agg = Some(space),
                Some(a) => {
                    a.f_files += space.f_files;
                    a.f_ffree += space.f_ffree;
                    a.f_favail += space.f_favail;
                }
            }
        }
        let mut agg =
            agg.ok_or_else(|| UfsError::NotFound(format!("no volume reachable for {}", vp)))?;
        let bsize = agg.f_bsize.max(1);
        agg.f_blocks = total.0 / bsize;
        agg.f_bfree = total.1 / bsize;
        agg.f_bavail = total.2 / bsize;
        Ok(agg)
    }

    pub async fn mkdir(&self, ctx: &RequestContext, vpath: &str, mode: u32) -> UfsResult<()> {
        Self::ensure_ctx_writable(ctx, "mkdir")?;
        let vp = path::normalize(vpath);
        if self.locate(&vp).await.is_ok() {
            return Err(UfsError::Io(libc::EEXIST, format!("{} exists", vp)));
        }
        let parent_v = path::parent(&vp)
            .ok_or_else(|| UfsError::Io(libc::EEXIST, "root exists".to_string()))?;
        let parent = self.locate(&parent_v).await?;
        let rel = parent.entry.rel_path(&vp);
        parent
            .entry
            .volume
            .create_directory(&rel, ctx.apply_umask(mode))
            .await?;
        if let Err(e) = parent.entry.volume.chown(&rel, ctx.uid, ctx.gid).await {
            warn!("mkdir: chown {} failed: {}", rel, e);
        }
        Ok(())
    }

    pub async fn rmdir(&self, ctx: &RequestContext, vpath: &str) -> UfsResult<()> {
        Self::ensure_ctx_writable(ctx, "rmdir")?;
        let holders = self.holders(vpath).await;
        if holders.is_empty() {
            return Err(UfsError::NotFound(format!("no volume holds {}", vpath)));
        }
        for (entry, rel) in holders {
            entry.volume.remove_directory(&rel).await?;
        }
        Ok(())
    }

    pub async fn unlink(&self, ctx: &RequestContext, vpath: &str) -> UfsResult<()> {
        Self::ensure_ctx_writable(ctx, "unlink")?;
        let holders = self.holders(vpath).await;
        if holders.is_empty() {
            return Err(UfsError::NotFound(format!("no volume holds {}", vpath)));
        }
        for (entry, rel) in holders {
            entry.volume.unlink(&rel).await?;
        }
        Ok(())
    }

    /// Applied to every volume holding the path. The first error aborts the
    /// loop; a partially applied state across volumes is accepted, not
    /// rolled back.
    pub async fn rename(&self, ctx: &RequestContext, old: &str, new: &str) -> UfsResult<()> {
        Self::ensure_ctx_writable(ctx, "rename")?;
        let new_vp = path::normalize(new);
        let holders = self.holders(old).await;
        if holders.is_empty() {
            return Err(UfsError::NotFound(format!("no volume holds {}", old)));
        }
        for (entry, rel_old) in holders {
            if entry.mount_prefix != "/"
                && !new_vp.starts_with(&format!("{}/", entry.mount_prefix))
            {
                return Err(UfsError::Io(
                    libc::EXDEV,
                    format!("rename {} -> {} crosses mount {}", old, new_vp, entry.mount_prefix),
                ));
            }
            let rel_new = entry.rel_path(&new_vp);
            entry.volume.rename(&rel_old, &rel_new).await?;
        }
        Ok(())
    }

    pub async fn chmod(&self, ctx: &RequestContext, vpath: &str, mode: u32) -> UfsResult<()> {
        Self::ensure_ctx_writable(ctx, "chmod")?;
        let holders = self.holders(vpath).await;
        if holders.is_empty() {
            return Err(UfsError::NotFound(format!("no volume holds {}", vpath)));
        }
        for (entry, rel) in holders {
            entry.volume.chmod(&rel, mode).await?;
        }
        Ok(())
    }

    pub async fn chown(&self, ctx: &RequestContext, vpath: &str, uid: u32, gid: u32) -> UfsResult<()> {
        Self::ensure_ctx_writable(ctx, "chown")?;
        let holders = self.holders(vpath).await;
        if holders.is_empty() {
            return Err(UfsError::NotFound(format!("no volume holds {}", vpath)));
        }
        for (entry, rel) in holders {
            entry.volume.chown(&rel, uid, gid).await?;
        }
        Ok(())
    }

    pub async fn utimens(
        &self,
        ctx: &RequestContext,
        vpath: &str,
        atime: TimeSpec,
        mtime: TimeSpec,
    ) -> UfsResult<()> {
        Self::ensure_ctx_writable(ctx, "utimens")?;
        let holders = self.holders(vpath).await;
        if holders.is_empty() {
            return Err(UfsError::NotFound(format!("no volume holds {}", vpath)));
        }
        for (entry, rel) in holders {
            entry.volume.set_timestamps(&rel, atime, mtime).await?;
        }
        Ok(())
    }

    /// Union listing over the candidate set. Duplicate names across a
    /// fanned-out mount point are deduplicated, first occurrence wins.
    pub async fn readdir(&self, _ctx: &RequestContext, vpath: &str) -> UfsResult<Vec<DirEntry>> {
        let vp = path::normalize(vpath);
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        let mut found = false;
        for entry in self.registry.resolve(&vp) {
            let rel = entry.rel_path(&vp);
            match entry.volume.list_directory(&rel).await {
                Ok(entries) => {
                    found = true;
                    for item in entries {
                        if seen.insert(item.name.clone()) {
                            out.push(item);
                        }
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!("readdir: list {} on {} failed: {}", rel, entry.uri, e);
                }
            }
        }
        if !found {
            return Err(UfsError::NotFound(format!("no volume holds {}", vp)));
        }
        Ok(out)
    }

    pub async fn readlink(&self, _ctx: &RequestContext, vpath: &str) -> UfsResult<String> {
        let located = self.locate(vpath).await?;
        located.entry.volume.read_symlink(&located.rel_path).await
    }

    pub async fn access(&self, _ctx: &RequestContext, vpath: &str, mask: i32) -> UfsResult<()> {
        let located = self.locate(vpath).await?;
        located
            .entry
            .volume
            .check_access(&located.rel_path, mask)
            .await
    }

    /// Node creation policy shared by symlink and mknod: try the parent's
    /// current volume first; on `NoSpace`, clone the parent chain onto the
    /// volume picked for creation and retry once there.
    pub async fn symlink(&self, ctx: &RequestContext, target: &str, vpath: &str) -> UfsResult<()> {
        Self::ensure_ctx_writable(ctx, "symlink")?;
        let vp = path::normalize(vpath);
        let parent_v = path::parent(&vp)
            .ok_or_else(|| UfsError::Io(libc::EEXIST, "root exists".to_string()))?;
        let parent = self.locate(&parent_v).await?;
        let rel = parent.entry.rel_path(&vp);
        match parent.entry.volume.symlink(target, &rel).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_no_space() => {
                let alt = self.select_for_creation(&vp).await?;
                self.ensure_parent_chain(&alt, &vp).await?;
                alt.volume.symlink(target, &alt.rel_path(&vp)).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn mknod(
        &self,
        ctx: &RequestContext,
        vpath: &str,
        mode: u32,
        rdev: u64,
    ) -> UfsResult<()> {
        Self::ensure_ctx_writable(ctx, "mknod")?;
        let vp = path::normalize(vpath);
        let parent_v = path::parent(&vp)
            .ok_or_else(|| UfsError::Io(libc::EEXIST, "root exists".to_string()))?;
        let parent = self.locate(&parent_v).await?;
        let rel = parent.entry.rel_path(&vp);
        let mode = ctx.apply_umask(mode & 0o7777) | (mode & !0o7777);
        match parent.entry.volume.mknod(&rel, mode, rdev).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_no_space() => {
                let alt = self.select_for_creation(&vp).await?;
                self.ensure_parent_chain(&alt, &vp).await?;
                alt.volume.mknod(&alt.rel_path(&vp), mode, rdev).await
            }
            Err(e) => Err(e),
        }
    }

    /// Hard links never cross volumes: the new name is created on the volume
    /// holding the existing file, with the parent chain cloned there if
    /// needed.
    pub async fn link(&self, ctx: &RequestContext, old: &str, new: &str) -> UfsResult<()> {
        Self::ensure_ctx_writable(ctx, "link")?;
        let new_vp = path::normalize(new);
        let located = self.locate(old).await?;
        if located.entry.mount_prefix != "/"
            && !new_vp.starts_with(&format!("{}/", located.entry.mount_prefix))
        {
            return Err(UfsError::Io(
                libc::EXDEV,
                format!("link {} -> {} crosses mount", old, new_vp),
            ));
        }
        self.ensure_parent_chain(&located.entry, &new_vp).await?;
        located
            .entry
            .volume
            .link(&located.rel_path, &located.entry.rel_path(&new_vp))
            .await
    }

    pub async fn truncate(&self, ctx: &RequestContext, vpath: &str, size: u64) -> UfsResult<()> {
        Self::ensure_ctx_writable(ctx, "truncate")?;
        let located = self.locate(vpath).await?;
        located.entry.volume.truncate(&located.rel_path, size).await
    }

    // ---- descriptor operations ------------------------------------------

    pub async fn open(&self, ctx: &RequestContext, vpath: &str, flags: i32) -> UfsResult<u32> {
        let wants_write = (flags & libc::O_ACCMODE) != libc::O_RDONLY
            || flags & (libc::O_TRUNC | libc::O_APPEND) != 0;
        if wants_write {
            Self::ensure_ctx_writable(ctx, "open for write")?;
        }
        let vp = path::normalize(vpath);
        match self.locate(&vp).await {
            Ok(located) => {
                let vfd = located.entry.volume.open(&located.rel_path, flags).await?;
                Ok(self.open_files.open(
                    located.entry.volume.clone(),
                    located.entry.mount_prefix.clone(),
                    located.rel_path,
                    vp,
                    flags,
                    vfd,
                ))
            }
            Err(e) if e.is_not_found() && flags & libc::O_CREAT != 0 => {
                self.create(ctx, &vp, flags, 0o644).await
            }
            Err(e) => Err(e),
        }
    }

    /// Place a new file on the candidate with most free space, cloning the
    /// parent chain onto it first.
    pub async fn create(
        &self,
        ctx: &RequestContext,
        vpath: &str,
        flags: i32,
        mode: u32,
    ) -> UfsResult<u32> {
        Self::ensure_ctx_writable(ctx, "create")?;
        let vp = path::normalize(vpath);
        match self.locate(&vp).await {
            Ok(located) => {
                if flags & libc::O_EXCL != 0 {
                    return Err(UfsError::Io(libc::EEXIST, format!("{} exists", vp)));
                }
                let vfd = located.entry.volume.open(&located.rel_path, flags).await?;
                Ok(self.open_files.open(
                    located.entry.volume.clone(),
                    located.entry.mount_prefix.clone(),
                    located.rel_path,
                    vp,
                    flags,
                    vfd,
                ))
            }
            Err(e) if e.is_not_found() => {
                let entry = self.select_for_creation(&vp).await?;
                self.ensure_parent_chain(&entry, &vp).await?;
                let rel = entry.rel_path(&vp);
                let vfd = entry
                    .volume
                    .create(&rel, flags, ctx.apply_umask(mode))
                    .await?;
                if let Err(e) = entry.volume.chown(&rel, ctx.uid, ctx.gid).await {
                    warn!("create: chown {} failed: {}", rel, e);
                }
                Ok(self
                    .open_files
                    .open(entry.volume.clone(), entry.mount_prefix.clone(), rel, vp, flags, vfd))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn release(&self, _ctx: &RequestContext, id: u32) -> UfsResult<()> {
        let record = self.open_files.close(id)?;
        if let Err(e) = record.volume.close(record.volume_fd).await {
            warn!("release: close volume fd {} failed: {}", record.volume_fd, e);
        }
        Ok(())
    }

    /// Reads skip the path lock (optimistic-read, serialized-write). A
    /// concurrent migration can move the record mid-flight; a failed read is
    /// retried once against the repointed record, and an invalidated record
    /// reports `Invalid` rather than a misdirected read.
    pub async fn read(
        &self,
        _ctx: &RequestContext,
        id: u32,
        offset: u64,
        count: u64,
    ) -> UfsResult<Vec<u8>> {
        let record = self.open_files.lookup(id)?;
        if !record.valid {
            return Err(UfsError::Invalid(format!("descriptor {} invalidated", id)));
        }
        match record.volume.read_at(record.volume_fd, offset, count).await {
            Ok(data) => {
                self.open_files.set_offset(id, offset + data.len() as u64);
                Ok(data)
            }
            Err(e) => {
                let fresh = match self.open_files.lookup(id) {
                    Ok(f) => f,
                    Err(_) => return Err(e),
                };
                if !fresh.valid {
                    return Err(UfsError::Invalid(format!("descriptor {} invalidated", id)));
                }
                if fresh.volume_fd == record.volume_fd
                    && Arc::ptr_eq(&fresh.volume, &record.volume)
                {
                    return Err(e);
                }
                // Our snapshot went stale under a migration; the descriptor
                // itself is fine at its new home.
                let data = fresh.volume.read_at(fresh.volume_fd, offset, count).await?;
                self.open_files.set_offset(id, offset + data.len() as u64);
                Ok(data)
            }
        }
    }

    /// The write path. Holds the file's path lock for the full duration,
    /// including any migration, so concurrent writers to the same logical
    /// file are strictly ordered and writers to different files never
    /// contend.
    pub async fn write(
        &self,
        ctx: &RequestContext,
        id: u32,
        offset: u64,
        data: &[u8],
    ) -> UfsResult<u64> {
        Self::ensure_ctx_writable(ctx, "write")?;
        let record = self.open_files.lookup(id)?;
        if !record.valid {
            return Err(UfsError::Invalid(format!("descriptor {} invalidated", id)));
        }
        let path_lock = record.path_lock.clone();
        let _guard = path_lock.lock().await;

        // Re-read the record: a migration may have repointed it while we
        // waited for the lock.
        let record = self.open_files.lookup(id)?;
        if !record.valid {
            return Err(UfsError::Invalid(format!("descriptor {} invalidated", id)));
        }
        match record.volume.write_at(record.volume_fd, offset, data).await {
            Ok(written) => {
                self.open_files.set_offset(id, offset + written);
                Ok(written)
            }
            Err(e) if e.is_no_space() => {
                migration::migrate_and_retry(self, ctx, &record, offset, data, e).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn fsync(&self, _ctx: &RequestContext, id: u32, datasync: bool) -> UfsResult<()> {
        let record = self.open_files.lookup(id)?;
        if !record.valid {
            return Err(UfsError::Invalid(format!("descriptor {} invalidated", id)));
        }
        record.volume.sync(record.volume_fd, datasync).await
    }

    pub async fn lock_file(
        &self,
        _ctx: &RequestContext,
        id: u32,
        kind: LockKind,
        start: u64,
        len: u64,
    ) -> UfsResult<()> {
        let record = self.open_files.lookup(id)?;
        if !record.valid {
            return Err(UfsError::Invalid(format!("descriptor {} invalidated", id)));
        }
        record.volume.lock(record.volume_fd, kind, start, len).await
    }

    // ---- extended attributes --------------------------------------------

    pub async fn getxattr(
        &self,
        _ctx: &RequestContext,
        vpath: &str,
        name: &str,
    ) -> UfsResult<Vec<u8>> {
        let located = self.locate(vpath).await?;
        located.entry.volume.get_xattr(&located.rel_path, name).await
    }

    pub async fn setxattr(
        &self,
        ctx: &RequestContext,
        vpath: &str,
        name: &str,
        value: &[u8],
        flags: i32,
    ) -> UfsResult<()> {
        Self::ensure_ctx_writable(ctx, "setxattr")?;
        let located = self.locate(vpath).await?;
        located
            .entry
            .volume
            .set_xattr(&located.rel_path, name, value, flags)
            .await
    }

    pub async fn listxattr(&self, _ctx: &RequestContext, vpath: &str) -> UfsResult<Vec<String>> {
        let located = self.locate(vpath).await?;
        located.entry.volume.list_xattr(&located.rel_path).await
    }

    pub async fn removexattr(
        &self,
        ctx: &RequestContext,
        vpath: &str,
        name: &str,
    ) -> UfsResult<()> {
        Self::ensure_ctx_writable(ctx, "removexattr")?;
        let located = self.locate(vpath).await?;
        located
            .entry
            .volume
            .remove_xattr(&located.rel_path, name)
            .await
    }
}
