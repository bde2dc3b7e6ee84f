//! Session lifecycle handlers: `reset_context` and `finished_work`.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::deps::IpcDeps;
use crate::write::{error_response, ipc_response_path, write_ipc_response};

fn respond(deps: &Arc<IpcDeps>, group: &str, data: &Value, body: Value) {
    if let Some(request_id) = data.get("request_id").and_then(|v| v.as_str()) {
        let path = ipc_response_path(&deps.config.ipc_root(), group, request_id);
        if let Err(e) = write_ipc_response(&path, &body) {
            warn!(group, request_id, error = %e, "failed to write IPC response");
        }
    }
}

/// `reset_context` — forget the agent session and hide prior chat history
/// so the next invocation starts clean.
pub async fn handle_reset_context(
    data: Value,
    source_group: String,
    _is_admin: bool,
    deps: Arc<IpcDeps>,
) {
    if let Err(e) = deps.store.clear_session(&source_group) {
        respond(&deps, &source_group, &data, error_response(format!("{e}")));
        return;
    }
    if let Some(jid) = deps.resolve_chat_jid(&source_group) {
        if let Err(e) = deps.store.clear_chat(&jid) {
            warn!(group = %source_group, error = %e, "failed to set cleared_at");
        }
    }
    info!(group = %source_group, "context reset");
    respond(&deps, &source_group, &data, serde_json::json!({ "ok": true }));
}

/// `finished_work` — the agent declares the current run complete; the host
/// winds the container down instead of waiting for the idle timer.
pub async fn handle_finished_work(
    data: Value,
    source_group: String,
    _is_admin: bool,
    deps: Arc<IpcDeps>,
) {
    respond(&deps, &source_group, &data, serde_json::json!({ "ok": true }));
    deps.containers.request_close(&source_group).await;
    info!(group = %source_group, "finished_work — container close requested");
}
