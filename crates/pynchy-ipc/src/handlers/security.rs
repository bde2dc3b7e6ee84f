//! `security:*` handlers — pre-flight bash evaluation called from the
//! container's before-tool-use hook.

use std::sync::Arc;

use chrono::Utc;
use pynchy_security::approval::{create_pending_approval, format_approval_notification};
use pynchy_security::bash::{evaluate_bash_command, BashDecision};
use pynchy_security::gate::SecurityGate;
use pynchy_store::SecurityEvent;
use serde_json::Value;
use tracing::{info, warn};

use crate::deps::IpcDeps;
use crate::write::{ipc_response_path, write_ipc_response};

pub async fn handle_security_request(
    data: Value,
    source_group: String,
    is_admin: bool,
    deps: Arc<IpcDeps>,
) {
    let kind = data
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .strip_prefix("security:")
        .unwrap_or_default()
        .to_string();
    if kind != "bash_check" {
        warn!(kind = %kind, group = %source_group, "unknown security request");
        return;
    }

    let Some(request_id) = data.get("request_id").and_then(|v| v.as_str()).map(String::from)
    else {
        warn!(group = %source_group, "bash_check missing request_id");
        return;
    };
    let command = data
        .get("command")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    // Session-scoped gate created at container start; an ephemeral one
    // covers the window before the orchestrator registers it.
    let _ = is_admin;
    let gate = deps.gates.get_gate_for_group(&source_group).unwrap_or_else(|| {
        warn!(group = %source_group, "no gate for group, using ephemeral");
        let security = deps.config.resolve_workspace(&source_group).security;
        Arc::new(SecurityGate::new(&source_group, Utc::now().timestamp_millis(), security))
    });

    // Bash touches files; workspaces that hold secrets taint on any use.
    gate.notify_file_access();

    let chat_jid = deps
        .resolve_chat_jid(&source_group)
        .unwrap_or_else(|| "unknown".to_string());

    let decision = evaluate_bash_command(gate.as_ref(), deps.cop.as_ref(), &command).await;

    if let BashDecision::NeedsHuman { reason } = &decision {
        let short_id = match create_pending_approval(
            &deps.config.ipc_root(),
            &request_id,
            "Bash",
            &source_group,
            &chat_jid,
            serde_json::json!({ "command": command }),
            "service",
        ) {
            Ok(short_id) => short_id,
            Err(e) => {
                warn!(error = %e, "failed to create pending approval for bash");
                return;
            }
        };
        let notification = format_approval_notification(
            "Bash",
            &serde_json::json!({ "command": command }),
            &short_id,
        );
        deps.broadcaster.broadcast(&chat_jid, &notification).await;

        let _ = deps.store.record_security_event(&SecurityEvent {
            chat_jid,
            workspace: source_group.clone(),
            tool_name: "Bash".into(),
            decision: "approval_requested".into(),
            corruption_tainted: gate.corruption_tainted(),
            secret_tainted: gate.secret_tainted(),
            reason: Some(reason.clone()),
            request_id: Some(request_id),
        });
        info!(group = %source_group, "bash command awaiting human approval");
        // No response file — the container blocks until a decision lands.
        return;
    }

    let (decision_name, reason) = match &decision {
        BashDecision::Allow => ("allow", None),
        BashDecision::Deny { reason } => ("deny", Some(reason.clone())),
        BashDecision::NeedsHuman { .. } => unreachable!(),
    };
    let _ = deps.store.record_security_event(&SecurityEvent {
        chat_jid,
        workspace: source_group.clone(),
        tool_name: "Bash".into(),
        decision: decision_name.into(),
        corruption_tainted: gate.corruption_tainted(),
        secret_tainted: gate.secret_tainted(),
        reason,
        request_id: Some(request_id.clone()),
    });

    let body = serde_json::to_value(&decision).unwrap_or_else(|_| serde_json::json!({}));
    let path = ipc_response_path(&deps.config.ipc_root(), &source_group, &request_id);
    if let Err(e) = write_ipc_response(&path, &body) {
        warn!(group = %source_group, error = %e, "failed to write bash decision");
    }
}
