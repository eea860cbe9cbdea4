use crate::local_volume::{LocalVolume, LocalVolumeOptions};
use crate::remote_volume::RemoteVolume;
use crate::volume::Volume;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use ufs_lib::{path, UfsError, UfsResult};
use url::Url;

/// One (mount prefix, volume) pair. Several entries may share a prefix;
/// entries at `/` form the fallback pool for paths no deeper prefix claims.
#[derive(Clone)]
pub struct MountEntry {
    pub uri: String,
    pub mount_prefix: String,
    pub volume: Arc<dyn Volume>,
}

impl MountEntry {
    /// Volume-relative path for a virtual path resolved to this entry.
    pub fn rel_path(&self, vpath: &str) -> String {
        path::rel_path(&self.mount_prefix, vpath)
    }
}

/// Mount table: maps virtual path prefixes to backing volumes and resolves
/// a virtual path to its candidate volume set by longest-prefix match.
pub struct VolumeRegistry {
    entries: RwLock<Vec<MountEntry>>,
    /// Serializes registration: two racing adds of one local URI must not
    /// both construct the volume, or the loser trips the root guard.
    add_lock: tokio::sync::Mutex<()>,
}

impl Default for VolumeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            add_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Register a volume under `mount_prefix`. A duplicate (uri, prefix) pair
    /// is silently ignored; unknown URI schemes fail with
    /// `UnsupportedProtocol`.
    pub async fn add_volume(&self, uri: &str, mount_prefix: &str) -> UfsResult<()> {
        let _serial = self.add_lock.lock().await;
        let prefix = path::normalize(mount_prefix);
        let existing = {
            let entries = self.entries.read().unwrap();
            if entries
                .iter()
                .any(|e| e.uri == uri && e.mount_prefix == prefix)
            {
                return Ok(());
            }
            // The same URI under another prefix shares one volume instance;
            // a local volume's root guard forbids a second writable instance.
            entries
                .iter()
                .find(|e| e.uri == uri)
                .map(|e| e.volume.clone())
        };

        let volume = match existing {
            Some(v) => v,
            None => build_volume(uri).await?,
        };
        let mut entries = self.entries.write().unwrap();
        info!("VolumeRegistry: add {} at {}", uri, prefix);
        entries.push(MountEntry {
            uri: uri.to_string(),
            mount_prefix: prefix,
            volume,
        });
        Ok(())
    }

    /// Remove the exact (uri, prefix) entry; no-op when absent. The volume is
    /// disposed when the last resolver holding it drops its handle.
    pub fn remove_volume(&self, uri: &str, mount_prefix: &str) {
        let prefix = path::normalize(mount_prefix);
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|e| !(e.uri == uri && e.mount_prefix == prefix));
        if entries.len() != before {
            info!("VolumeRegistry: remove {} at {}", uri, prefix);
        } else {
            warn!("VolumeRegistry: remove {} at {}: no such entry", uri, prefix);
        }
    }

    /// Candidate volumes for a virtual path.
    ///
    /// For every non-root entry, count the leading components its prefix
    /// shares with `vpath` (the root itself never counts). An entry whose
    /// whole prefix matched is a candidate at that depth; only the deepest
    /// candidates are kept, ties included (the pooling case). If nothing
    /// matched, every `/`-registered entry is returned.
    pub fn resolve(&self, vpath: &str) -> Vec<MountEntry> {
        let entries = self.entries.read().unwrap();
        let mut best_depth = 0usize;
        let mut candidates: Vec<MountEntry> = Vec::new();
        for entry in entries.iter().filter(|e| e.mount_prefix != "/") {
            let prefix_len = path::components(&entry.mount_prefix).len();
            let shared = path::shared_components(&entry.mount_prefix, vpath);
            if shared != prefix_len {
                continue;
            }
            if shared > best_depth {
                best_depth = shared;
                candidates.clear();
                candidates.push(entry.clone());
            } else if shared == best_depth {
                candidates.push(entry.clone());
            }
        }
        if candidates.is_empty() {
            candidates = entries
                .iter()
                .filter(|e| e.mount_prefix == "/")
                .cloned()
                .collect();
        }
        candidates
    }

    pub fn list(&self) -> Vec<(String, String)> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|e| (e.uri.clone(), e.mount_prefix.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

/// Construct the Volume implementation matching the URI scheme.
async fn build_volume(uri: &str) -> UfsResult<Arc<dyn Volume>> {
    let url = Url::parse(uri)
        .map_err(|e| UfsError::UnsupportedProtocol(format!("bad volume uri {}: {}", uri, e)))?;
    let readonly = url
        .query_pairs()
        .any(|(k, v)| k == "ro" && (v == "1" || v == "true"));
    match url.scheme() {
        "file" => {
            let quota = url
                .query_pairs()
                .find(|(k, _)| k == "quota")
                .and_then(|(_, v)| v.parse::<u64>().ok());
            let root = PathBuf::from(url.path());
            let volume = LocalVolume::new(
                uri.to_string(),
                root,
                LocalVolumeOptions { readonly, quota },
            )
            .await?;
            Ok(Arc::new(volume))
        }
        "http" | "https" => Ok(Arc::new(RemoteVolume::new(uri)?)),
        other => Err(UfsError::UnsupportedProtocol(format!(
            "unsupported volume scheme: {}",
            other
        ))),
    }
}
