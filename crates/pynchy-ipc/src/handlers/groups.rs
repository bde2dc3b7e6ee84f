//! Workspace registration.

use std::sync::Arc;

use chrono::Utc;
use pynchy_core::types::{ContainerOverrides, WorkspaceProfile};
use serde_json::Value;
use tracing::{info, warn};

use crate::deps::IpcDeps;
use crate::handlers::cop_gate::cop_gate;
use crate::write::{error_response, ipc_response_path, write_ipc_response};

fn respond(deps: &Arc<IpcDeps>, group: &str, data: &Value, body: Value) {
    if let Some(request_id) = data.get("request_id").and_then(|v| v.as_str()) {
        let path = ipc_response_path(&deps.config.ipc_root(), group, request_id);
        if let Err(e) = write_ipc_response(&path, &body) {
            warn!(group, request_id, error = %e, "failed to write IPC response");
        }
    }
}

/// `register_group` — create or update a workspace profile. Admin-only;
/// the payload passes the Cop because a registration can grant reach.
pub async fn handle_register_group(
    data: Value,
    source_group: String,
    is_admin: bool,
    deps: Arc<IpcDeps>,
) {
    if !is_admin {
        warn!(source = %source_group, "unauthorized register_group attempt");
        let _ = deps.store.record_security_event(&pynchy_store::SecurityEvent {
            chat_jid: deps.resolve_chat_jid(&source_group).unwrap_or_default(),
            workspace: source_group.clone(),
            tool_name: "register_group".into(),
            decision: "admin_denied".into(),
            corruption_tainted: false,
            secret_tainted: false,
            reason: None,
            request_id: data.get("request_id").and_then(|v| v.as_str()).map(String::from),
        });
        respond(&deps, &source_group, &data, error_response("Admin only"));
        return;
    }

    let jid = data.get("jid").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let name = data.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let folder = data.get("folder").and_then(|v| v.as_str()).unwrap_or_default().to_string();

    let summary = format!(
        "jid={jid}, name={name}, folder={folder}, is_admin={}",
        data.get("is_admin").and_then(|v| v.as_bool()).unwrap_or(false)
    );
    if !cop_gate("register_group", &summary, &data, &source_group, &deps).await {
        return;
    }

    if jid.is_empty() || name.is_empty() || folder.is_empty() {
        respond(&deps, &source_group, &data, error_response("Missing jid, name, or folder"));
        return;
    }

    let profile = WorkspaceProfile {
        jid: jid.clone(),
        name,
        folder: folder.clone(),
        trigger: data
            .get("trigger")
            .and_then(|v| v.as_str())
            .unwrap_or("@pynchy")
            .to_string(),
        is_admin: data.get("is_admin").and_then(|v| v.as_bool()).unwrap_or(false),
        container_config: data
            .get("container_config")
            .and_then(|v| serde_json::from_value::<ContainerOverrides>(v.clone()).ok()),
        added_at: Utc::now(),
    };

    if let Err(e) = deps.store.set_registered_group(&profile) {
        respond(&deps, &source_group, &data, error_response(format!("Store error: {e}")));
        return;
    }
    (deps.on_refresh_groups)();

    info!(jid = %jid, folder = %folder, "workspace registered via IPC");
    respond(&deps, &source_group, &data, serde_json::json!({ "ok": true, "jid": jid }));
}
