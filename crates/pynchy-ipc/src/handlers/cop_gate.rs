//! Cop gate for host-mutating IPC operations.
//!
//! Every operation that changes host state outside the agent's workspace
//! passes its payload summary to the Cop before execution. A flagged
//! verdict does not deny outright — it escalates to human approval via the
//! pending-file protocol, with `handler_type = "ipc"` so an approval
//! re-enters the dispatch registry with `_cop_approved` set.

use std::sync::Arc;

use pynchy_security::approval::{create_pending_approval, format_approval_notification};
use pynchy_store::SecurityEvent;
use serde_json::Value;
use tracing::{info, warn};

use crate::deps::IpcDeps;

/// Returns `true` when the operation may proceed now. `false` means a
/// pending approval was created (or the request was malformed) and the
/// handler must stop without writing a response.
pub async fn cop_gate(
    operation: &str,
    payload_summary: &str,
    data: &Value,
    source_group: &str,
    deps: &Arc<IpcDeps>,
) -> bool {
    if data.get("_cop_approved").and_then(|v| v.as_bool()) == Some(true) {
        return true;
    }

    let verdict = deps.cop.inspect_outbound(operation, payload_summary).await;
    if !verdict.flagged {
        return true;
    }

    let Some(request_id) = data.get("request_id").and_then(|v| v.as_str()) else {
        warn!(operation, source_group, "cop flagged request without request_id — dropped");
        return false;
    };

    let chat_jid = deps
        .resolve_chat_jid(source_group)
        .unwrap_or_else(|| "unknown".to_string());

    let short_id = match create_pending_approval(
        &deps.config.ipc_root(),
        request_id,
        operation,
        source_group,
        &chat_jid,
        data.clone(),
        "ipc",
    ) {
        Ok(short_id) => short_id,
        Err(e) => {
            warn!(operation, error = %e, "failed to create pending approval");
            return false;
        }
    };

    let notification = format_approval_notification(operation, data, &short_id);
    deps.broadcaster.broadcast(&chat_jid, &notification).await;

    let _ = deps.store.record_security_event(&SecurityEvent {
        chat_jid,
        workspace: source_group.to_string(),
        tool_name: operation.to_string(),
        decision: "approval_requested".into(),
        corruption_tainted: false,
        secret_tainted: false,
        reason: verdict.reason.clone(),
        request_id: Some(request_id.to_string()),
    });

    info!(
        operation,
        source_group,
        short_id,
        reason = verdict.reason.as_deref().unwrap_or(""),
        "cop flagged host-mutating operation — awaiting human"
    );
    false
}
