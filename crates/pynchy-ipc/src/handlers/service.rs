//! `service:*` handlers — tool calls routed to host-side service handlers
//! with policy enforcement.

use std::sync::Arc;

use chrono::Utc;
use pynchy_security::approval::{create_pending_approval, format_approval_notification};
use pynchy_security::gate::SecurityGate;
use pynchy_store::SecurityEvent;
use serde_json::Value;
use tracing::{info, warn};

use crate::deps::IpcDeps;
use crate::write::{error_response, ipc_response_path, write_ipc_response};

fn respond(deps: &Arc<IpcDeps>, group: &str, request_id: &str, body: Value) {
    let path = ipc_response_path(&deps.config.ipc_root(), group, request_id);
    if let Err(e) = write_ipc_response(&path, &body) {
        warn!(group, request_id, error = %e, "failed to write service response");
    }
}

pub async fn handle_service_request(
    data: Value,
    source_group: String,
    is_admin: bool,
    deps: Arc<IpcDeps>,
) {
    let tool_name = data
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .strip_prefix("service:")
        .unwrap_or_default()
        .to_string();
    let Some(request_id) = data.get("request_id").and_then(|v| v.as_str()).map(String::from)
    else {
        warn!(tool = %tool_name, group = %source_group, "service request missing request_id");
        return;
    };

    if !deps.services.has_tool(&tool_name) {
        warn!(tool = %tool_name, group = %source_group, "unknown service tool");
        respond(
            &deps,
            &source_group,
            &request_id,
            error_response(format!("Unknown service tool: {tool_name}")),
        );
        return;
    }

    let _ = is_admin;
    let gate = deps.gates.get_gate_for_group(&source_group).unwrap_or_else(|| {
        warn!(group = %source_group, "no gate for group, using ephemeral");
        let security = deps.config.resolve_workspace(&source_group).security;
        Arc::new(SecurityGate::new(&source_group, Utc::now().timestamp_millis(), security))
    });

    let chat_jid = deps
        .resolve_chat_jid(&source_group)
        .unwrap_or_else(|| "unknown".to_string());

    // Service requests perform actions — evaluated as writes.
    let decision = gate.evaluate_write(&tool_name, &data);
    let already_approved = data.get("_cop_approved").and_then(|v| v.as_bool()) == Some(true);

    if !decision.allowed {
        let _ = deps.store.record_security_event(&SecurityEvent {
            chat_jid,
            workspace: source_group.clone(),
            tool_name: tool_name.clone(),
            decision: "blocked_forbidden".into(),
            corruption_tainted: gate.corruption_tainted(),
            secret_tainted: gate.secret_tainted(),
            reason: decision.reason.clone(),
            request_id: Some(request_id.clone()),
        });
        info!(tool = %tool_name, group = %source_group, "service request denied by policy");
        respond(
            &deps,
            &source_group,
            &request_id,
            error_response(format!(
                "Policy denied: {}",
                decision.reason.unwrap_or_default()
            )),
        );
        return;
    }

    if decision.needs_human && !already_approved {
        let short_id = match create_pending_approval(
            &deps.config.ipc_root(),
            &request_id,
            &tool_name,
            &source_group,
            &chat_jid,
            data.clone(),
            "service",
        ) {
            Ok(short_id) => short_id,
            Err(e) => {
                warn!(error = %e, "failed to create pending approval");
                return;
            }
        };
        let notification = format_approval_notification(&tool_name, &data, &short_id);
        deps.broadcaster.broadcast(&chat_jid, &notification).await;

        let _ = deps.store.record_security_event(&SecurityEvent {
            chat_jid,
            workspace: source_group.clone(),
            tool_name: tool_name.clone(),
            decision: "approval_requested".into(),
            corruption_tainted: gate.corruption_tainted(),
            secret_tainted: gate.secret_tainted(),
            reason: decision.reason.clone(),
            request_id: Some(request_id.clone()),
        });
        info!(tool = %tool_name, group = %source_group, short_id, "service request awaiting human");
        // Container blocks on its response file until the decision lands.
        return;
    }

    if decision.needs_deputy && !already_approved {
        let summary = serde_json::to_string(&data).unwrap_or_default();
        let verdict = deps
            .cop
            .inspect_outbound(&format!("service:{tool_name}"), &summary)
            .await;
        if verdict.flagged {
            let reason = verdict.reason.unwrap_or_else(|| "Cop flagged payload".into());
            let _ = deps.store.record_security_event(&SecurityEvent {
                chat_jid,
                workspace: source_group.clone(),
                tool_name: tool_name.clone(),
                decision: "deny".into(),
                corruption_tainted: gate.corruption_tainted(),
                secret_tainted: gate.secret_tainted(),
                reason: Some(reason.clone()),
                request_id: Some(request_id.clone()),
            });
            respond(
                &deps,
                &source_group,
                &request_id,
                error_response(format!("Blocked by security inspection: {reason}")),
            );
            return;
        }
    }

    let _ = deps.store.record_security_event(&SecurityEvent {
        chat_jid,
        workspace: source_group.clone(),
        tool_name: tool_name.clone(),
        decision: "allowed".into(),
        corruption_tainted: gate.corruption_tainted(),
        secret_tainted: gate.secret_tainted(),
        reason: decision.reason.clone(),
        request_id: Some(request_id.clone()),
    });

    let mut payload = data;
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("source_group".into(), Value::String(source_group.clone()));
    }
    let body = match deps.services.call(&tool_name, payload).await {
        Ok(response) => response,
        Err(e) => error_response(format!("Execution failed: {e}")),
    };
    respond(&deps, &source_group, &request_id, body);
}
