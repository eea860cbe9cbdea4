use fs_union::{ControlService, PlacementResolver, VolumeRpcService};
use log::info;
use serde::Deserialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Runtime;
use ufs_lib::{UfsError, UfsResult};
use volume_store::VolumeRegistry;
use warp::Filter;

pub const DEFAULT_FS_DAEMON_CONFIG_PATH: &str = "/etc/ufs/fs_daemon.json";

#[derive(Debug, Clone)]
pub struct FsDaemonRunOptions {
    pub config_path: PathBuf,
    pub listen_override: Option<String>,
    pub readonly_override: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FsDaemonConfig {
    #[serde(alias = "listen_addr")]
    pub listen: String,
    pub readonly: bool,
    #[serde(alias = "mounts")]
    pub volumes: Vec<VolumeMountConfig>,
}

impl Default for FsDaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3260".to_string(),
            readonly: false,
            volumes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumeMountConfig {
    pub uri: String,
    #[serde(default = "default_mount", alias = "mount_prefix")]
    pub mount: String,
}

fn default_mount() -> String {
    "/".to_string()
}

pub fn read_config(path: &Path) -> UfsResult<FsDaemonConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| UfsError::Internal(format!("read {} failed: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| UfsError::Internal(format!("parse {} failed: {}", path.display(), e)))
}

/// Shared state behind the HTTP surface: one registry, one placement engine,
/// the data-plane and control-plane handlers over them.
#[derive(Clone)]
pub struct FsDaemonState {
    pub registry: Arc<VolumeRegistry>,
    pub resolver: Arc<PlacementResolver>,
    pub rpc: Arc<VolumeRpcService>,
    pub control: Arc<ControlService>,
}

pub async fn build_state(config: &FsDaemonConfig) -> UfsResult<FsDaemonState> {
    let registry = Arc::new(VolumeRegistry::new());
    for mount in &config.volumes {
        registry.add_volume(&mount.uri, &mount.mount).await?;
        info!("fs_daemon: volume {} at {}", mount.uri, mount.mount);
    }
    let resolver = Arc::new(PlacementResolver::new(registry.clone()));
    let rpc = Arc::new(VolumeRpcService::new(resolver.clone(), config.readonly));
    let control = Arc::new(ControlService::new(registry.clone()));
    Ok(FsDaemonState {
        registry,
        resolver,
        rpc,
        control,
    })
}

/// `POST /api/volume/<op>` and `POST /api/control/<op>`, one JSON object per
/// call each way. Handlers never reject; every outcome is a JSON body.
pub fn routes(
    state: FsDaemonState,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let rpc = state.rpc.clone();
    let volume = warp::path!("api" / "volume" / String)
        .and(warp::post())
        .and(warp::body::json())
        .and_then(move |op: String, args: Value| {
            let rpc = rpc.clone();
            async move {
                let resp = rpc.handle(&op, args).await;
                Ok::<_, warp::Rejection>(warp::reply::json(&resp))
            }
        });

    let control = state.control.clone();
    let control_route = warp::path!("api" / "control" / String)
        .and(warp::post())
        .and(warp::body::json())
        .and_then(move |op: String, args: Value| {
            let control = control.clone();
            async move {
                let resp = control.handle(&op, args).await;
                Ok::<_, warp::Rejection>(warp::reply::json(&resp))
            }
        });

    volume.or(control_route)
}

pub fn run_fs_daemon(options: FsDaemonRunOptions) -> UfsResult<()> {
    let mut config = read_config(&options.config_path)?;
    if let Some(listen) = options.listen_override {
        config.listen = listen;
    }
    if options.readonly_override {
        config.readonly = true;
    }
    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| UfsError::Internal(format!("bad listen address {}: {}", config.listen, e)))?;

    let runtime = Runtime::new().map_err(|e| UfsError::Internal(e.to_string()))?;
    runtime.block_on(async move {
        let state = build_state(&config).await?;
        info!(
            "fs_daemon: listening on {} ({} volumes, readonly={})",
            addr,
            state.registry.list().len(),
            config.readonly
        );
        warp::serve(routes(state)).run(addr).await;
        Ok(())
    })
}
