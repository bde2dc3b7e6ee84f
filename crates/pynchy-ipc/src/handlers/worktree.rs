//! `sync_worktree_to_main` — synchronous git-op with its result written to
//! the `merge_results/` sink instead of `responses/`.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::deps::IpcDeps;
use crate::handlers::cop_gate::cop_gate;
use crate::write::{merge_result_path, write_ipc_response};

pub async fn handle_sync_worktree(
    data: Value,
    source_group: String,
    _is_admin: bool,
    deps: Arc<IpcDeps>,
) {
    let Some(request_id) = data.get("request_id").and_then(|v| v.as_str()).map(String::from)
    else {
        warn!(group = %source_group, "sync_worktree_to_main missing request_id");
        return;
    };

    let summary = format!(
        "merge worktree/{source_group} into main (diff summary: {})",
        data.get("summary").and_then(|v| v.as_str()).unwrap_or("none provided")
    );
    if !cop_gate("sync_worktree_to_main", &summary, &data, &source_group, &deps).await {
        return;
    }

    let result = deps.worktree.sync_to_main(&source_group).await;
    let body = match &result {
        Ok(message) => serde_json::json!({ "ok": true, "message": message }),
        Err(e) => serde_json::json!({ "ok": false, "error": e }),
    };

    let path = merge_result_path(&deps.config.ipc_root(), &source_group, &request_id);
    if let Err(e) = write_ipc_response(&path, &body) {
        warn!(group = %source_group, error = %e, "failed to write merge result");
    }
    info!(group = %source_group, ok = result.is_ok(), "worktree sync completed");
}
