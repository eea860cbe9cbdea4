use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use ufs_lib::{UfsError, UfsResult};
use volume_store::Volume;

/// One caller-visible open file. The id is process-unique and densely
/// reused; `volume`/`volume_fd` say which backing store currently serves it
/// and may change under migration. `path_lock` is shared by every record of
/// the same logical file.
#[derive(Clone)]
pub struct OpenFileRecord {
    pub id: u32,
    pub volume: Arc<dyn Volume>,
    pub mount_prefix: String,
    /// Volume-relative path; the key of the per-path lock. Survives a
    /// migration that changes which volume backs it.
    pub rel_path: String,
    pub vpath: String,
    pub flags: i32,
    pub volume_fd: u64,
    pub offset: u64,
    /// Cleared when a migration reopen fails; subsequent I/O on this id
    /// fails with `Invalid`.
    pub valid: bool,
    pub path_lock: Arc<AsyncMutex<()>>,
}

struct PathLockEntry {
    lock: Arc<AsyncMutex<()>>,
    refs: usize,
}

/// Descriptor table plus the per-path lock table.
///
/// Two lock tiers: the table mutexes here guard only record insert, erase,
/// and lookup (short, bounded); the per-path lock each record carries guards
/// the actual write/migration data path, so unrelated files never serialize
/// against each other.
pub struct OpenFileMgr {
    records: Mutex<HashMap<u32, OpenFileRecord>>,
    path_locks: Mutex<HashMap<String, PathLockEntry>>,
}

impl Default for OpenFileMgr {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenFileMgr {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            path_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a new record, allocating the smallest unused id. The path lock
    /// for `rel_path` is found-or-created and its refcount raised atomically
    /// under the table lock.
    pub fn open(
        &self,
        volume: Arc<dyn Volume>,
        mount_prefix: String,
        rel_path: String,
        vpath: String,
        flags: i32,
        volume_fd: u64,
    ) -> u32 {
        let path_lock = {
            let mut locks = self.path_locks.lock().unwrap();
            let entry = locks.entry(rel_path.clone()).or_insert_with(|| PathLockEntry {
                lock: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            entry.lock.clone()
        };

        let mut records = self.records.lock().unwrap();
        // Deterministic, compact id reuse.
        let id = (0u32..).find(|i| !records.contains_key(i)).unwrap();
        records.insert(
            id,
            OpenFileRecord {
                id,
                volume,
                mount_prefix,
                rel_path,
                vpath,
                flags,
                volume_fd,
                offset: 0,
                valid: true,
                path_lock,
            },
        );
        id
    }

    /// Remove the record. The path lock entry is dropped only when no other
    /// record references the path, and strictly after the record removal.
    pub fn close(&self, id: u32) -> UfsResult<OpenFileRecord> {
        let record = self
            .records
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or_else(|| UfsError::BadDescriptor(format!("descriptor {} not open", id)))?;

        let mut locks = self.path_locks.lock().unwrap();
        let drop_entry = match locks.get_mut(&record.rel_path) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0
            }
            None => false,
        };
        if drop_entry {
            locks.remove(&record.rel_path);
        }
        Ok(record)
    }

    /// Snapshot of the record; `BadDescriptor` if absent.
    pub fn lookup(&self, id: u32) -> UfsResult<OpenFileRecord> {
        self.records
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| UfsError::BadDescriptor(format!("descriptor {} not open", id)))
    }

    pub fn set_offset(&self, id: u32, offset: u64) {
        if let Some(record) = self.records.lock().unwrap().get_mut(&id) {
            record.offset = offset;
        }
    }

    /// Mark a record stale after a failed migration reopen. The descriptor
    /// stays in the table; only its next operation reports the failure.
    pub fn invalidate(&self, id: u32) {
        if let Some(record) = self.records.lock().unwrap().get_mut(&id) {
            record.valid = false;
        }
    }

    /// Point a record at a new backing volume/descriptor, keeping its offset.
    /// Returns false when the record was closed concurrently.
    pub fn repoint(
        &self,
        id: u32,
        volume: Arc<dyn Volume>,
        mount_prefix: String,
        volume_fd: u64,
    ) -> bool {
        match self.records.lock().unwrap().get_mut(&id) {
            Some(record) => {
                record.volume = volume;
                record.mount_prefix = mount_prefix;
                record.volume_fd = volume_fd;
                true
            }
            None => false,
        }
    }

    /// Ids of every live record for one logical file. Keyed by the virtual
    /// path: two files under different mounts may share a relative path, and
    /// only the addressed file's descriptors may ever be repointed.
    pub fn ids_for_path(&self, vpath: &str) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.vpath == vpath)
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn open_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Refcount of the path lock entry; 0 when no entry exists. Test hook
    /// for the lock lifecycle invariant.
    pub fn path_lock_refs(&self, rel_path: &str) -> usize {
        self.path_locks
            .lock()
            .unwrap()
            .get(rel_path)
            .map(|e| e.refs)
            .unwrap_or(0)
    }
}
