//! Control-plane handlers: add/remove/list backing volumes at runtime. The
//! transport decodes one JSON object per call and hands it here; every
//! response carries a `success` flag plus a message or payload.

use log::info;
use serde_json::{json, Value};
use std::sync::Arc;
use volume_store::VolumeRegistry;

pub struct ControlService {
    registry: Arc<VolumeRegistry>,
}

impl ControlService {
    pub fn new(registry: Arc<VolumeRegistry>) -> Self {
        Self { registry }
    }

    pub async fn handle(&self, op: &str, args: Value) -> Value {
        match op {
            "add_volume" => self.add_volume(args).await,
            "remove_volume" => self.remove_volume(args),
            "list_volumes" => self.list_volumes(),
            other => json!({
                "success": false,
                "message": format!("unknown control op: {}", other),
            }),
        }
    }

    async fn add_volume(&self, args: Value) -> Value {
        let uri = match args.get("uri").and_then(|v| v.as_str()) {
            Some(u) => u,
            None => return json!({ "success": false, "message": "missing uri" }),
        };
        let mount = args.get("mount").and_then(|v| v.as_str()).unwrap_or("/");
        match self.registry.add_volume(uri, mount).await {
            Ok(()) => {
                info!("control: added volume {} at {}", uri, mount);
                json!({
                    "success": true,
                    "message": format!("added {} at {}", uri, mount),
                })
            }
            Err(e) => json!({ "success": false, "message": e.to_string() }),
        }
    }

    fn remove_volume(&self, args: Value) -> Value {
        let uri = match args.get("uri").and_then(|v| v.as_str()) {
            Some(u) => u,
            None => return json!({ "success": false, "message": "missing uri" }),
        };
        let mount = args.get("mount").and_then(|v| v.as_str()).unwrap_or("/");
        self.registry.remove_volume(uri, mount);
        json!({
            "success": true,
            "message": format!("removed {} at {}", uri, mount),
        })
    }

    fn list_volumes(&self) -> Value {
        let volumes: Vec<Value> = self
            .registry
            .list()
            .into_iter()
            .map(|(uri, mount)| json!({ "uri": uri, "mount": mount }))
            .collect();
        json!({ "success": true, "volumes": volumes })
    }
}
