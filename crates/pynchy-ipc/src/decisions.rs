//! Approval-decision processing.
//!
//! A decision file in `approval_decisions/` resolves a pending approval:
//! approved requests re-enter their handler with `_cop_approved` set (so
//! downstream gates do not re-trigger), denials write a "Denied by user"
//! error response. Both files are removed either way, and an audit event
//! is recorded. The pending file is the canonical state; only this
//! processor deletes it.

use std::path::Path;
use std::sync::Arc;

use pynchy_security::approval::{
    pending_approvals_dir, remove_approval_files, ApprovalDecision, PendingApproval,
};
use pynchy_store::SecurityEvent;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::deps::IpcDeps;
use crate::registry::HandlerRegistry;
use crate::write::{error_response, ipc_response_path, write_ipc_response};

pub async fn process_approval_decision(
    decision_path: &Path,
    source_group: &str,
    registry: &HandlerRegistry,
    deps: Arc<IpcDeps>,
) {
    let decision: ApprovalDecision = match std::fs::read_to_string(decision_path)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
    {
        Ok(d) => d,
        Err(e) => {
            error!(path = %decision_path.display(), error = %e, "unreadable decision file");
            let _ = std::fs::remove_file(decision_path);
            return;
        }
    };

    let ipc_root = deps.config.ipc_root();
    let pending_path =
        pending_approvals_dir(&ipc_root, source_group).join(format!("{}.json", decision.request_id));
    if !pending_path.exists() {
        warn!(request_id = %decision.request_id, "no pending approval for decision");
        let _ = std::fs::remove_file(decision_path);
        return;
    }

    let pending: PendingApproval = match std::fs::read_to_string(&pending_path)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
    {
        Ok(p) => p,
        Err(e) => {
            error!(path = %pending_path.display(), error = %e, "unreadable pending file");
            let _ = std::fs::remove_file(decision_path);
            let _ = std::fs::remove_file(&pending_path);
            return;
        }
    };

    if decision.approved {
        execute_approved(&pending, source_group, registry, &deps).await;
    } else {
        let path = ipc_response_path(&ipc_root, source_group, &pending.request_id);
        if let Err(e) = write_ipc_response(&path, &error_response("Denied by user")) {
            warn!(error = %e, "failed to write denial response");
        }
        info!(request_id = %pending.request_id, tool = %pending.tool_name, "request denied by user");
    }

    let _ = deps.store.record_security_event(&SecurityEvent {
        chat_jid: pending.chat_jid.clone(),
        workspace: source_group.to_string(),
        tool_name: pending.tool_name.clone(),
        decision: if decision.approved {
            "approved_by_user".into()
        } else {
            "denied_by_user".into()
        },
        corruption_tainted: false,
        secret_tainted: false,
        reason: decision.decided_by.map(|by| format!("decided by {by}")),
        request_id: Some(pending.request_id.clone()),
    });

    remove_approval_files(&ipc_root, source_group, &pending.request_id);
}

async fn execute_approved(
    pending: &PendingApproval,
    source_group: &str,
    registry: &HandlerRegistry,
    deps: &Arc<IpcDeps>,
) {
    let ipc_root = deps.config.ipc_root();
    let mut request = pending.request_data.clone();
    if let Some(obj) = request.as_object_mut() {
        obj.insert("_cop_approved".into(), Value::Bool(true));
    }

    match pending.handler_type.as_str() {
        // Host-mutating operations re-enter the dispatch registry. Admin
        // checks already passed before the gate fired.
        "ipc" => {
            registry.dispatch(request, source_group, true, Arc::clone(deps)).await;
            info!(request_id = %pending.request_id, "approved IPC request re-dispatched");
        }
        // Service requests execute directly against the tool router.
        _ => {
            let tool = &pending.tool_name;
            let body = if tool == "Bash" {
                // Bash approvals answer the original security check — the
                // container's hook re-runs the command itself.
                serde_json::json!({ "decision": "allow" })
            } else if deps.services.has_tool(tool) {
                match deps.services.call(tool, request).await {
                    Ok(response) => response,
                    Err(e) => error_response(format!("Execution failed: {e}")),
                }
            } else {
                warn!(tool = %tool, "approved tool no longer available");
                error_response(format!("Approved but tool '{tool}' is no longer available"))
            };
            let path = ipc_response_path(&ipc_root, source_group, &pending.request_id);
            if let Err(e) = write_ipc_response(&path, &body) {
                warn!(error = %e, "failed to write approved response");
            }
            info!(request_id = %pending.request_id, tool = %pending.tool_name, "approved request executed");
        }
    }
}
