//! Per-workspace message processing: the function the group queue drives.
//!
//! One call = one container invocation. The conversation slice since the
//! last agent turn is projected (host messages excluded), approval
//! commands are intercepted, the security gate is created for the
//! invocation, the container runs, and its event stream feeds the
//! streaming/trace pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pynchy_channels::format::{format_tool_preview, parse_host_tag};
use pynchy_container::{build_volume_mounts, run_container, AgentEvent, ContainerInput};
use pynchy_core::types::{MessageType, NewMessage, WorkspaceProfile};
use pynchy_core::util::{generate_message_id, now_iso};
use pynchy_security::approval::{find_pending_by_short_id, write_decision, ApprovalDecision};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::app::{ActiveContainer, App};

const LAST_AGENT_TS_PREFIX: &str = "last_agent_ts:";

/// Process pending messages for one workspace. Returns `false` to request
/// a queue retry.
pub async fn process_messages(app: Arc<App>, jid: String) -> bool {
    let Some(profile) = app.workspace_by_jid(&jid) else {
        warn!(jid, "message check for unregistered workspace — skipping");
        return true;
    };

    let since = app
        .store
        .get_router_state(&format!("{LAST_AGENT_TS_PREFIX}{jid}"))
        .ok()
        .flatten()
        .unwrap_or_default();
    let mut messages = match app.store.get_messages_since(&jid, &since) {
        Ok(msgs) => msgs,
        Err(e) => {
            error!(jid, error = %e, "failed to load messages");
            return false;
        }
    };

    // Approval commands are for the host, not the agent.
    messages.retain(|m| !intercept_approval_command(&app, m));

    // Host messages never reach the model.
    let visible: Vec<&NewMessage> = messages
        .iter()
        .filter(|m| m.message_type != MessageType::Host)
        .collect();
    if visible.is_empty() {
        return true;
    }
    let newest_ts = visible
        .iter()
        .map(|m| m.timestamp.clone())
        .max()
        .unwrap_or_else(now_iso);

    let payload: Vec<serde_json::Value> = visible
        .iter()
        .filter_map(|m| serde_json::to_value(m).ok())
        .collect();

    let ok = invoke_agent(&app, &profile, payload, None).await;

    if ok {
        let _ = app
            .store
            .set_router_state(&format!("{LAST_AGENT_TS_PREFIX}{jid}"), &newest_ts);
    }
    ok
}

/// Run the agent for a task prompt (scheduler path). Returns a summary.
pub async fn process_task(app: Arc<App>, profile: WorkspaceProfile, prompt: String) -> Result<String, String> {
    let ok = invoke_agent(&app, &profile, Vec::new(), Some(prompt)).await;
    if ok {
        Ok("completed".to_string())
    } else {
        Err("agent invocation failed".to_string())
    }
}

/// `approve <short_id>` / `deny <short_id>` from chat resolve pending
/// approvals. Returns true when the message was consumed as a command.
fn intercept_approval_command(app: &Arc<App>, msg: &NewMessage) -> bool {
    if msg.message_type != MessageType::User {
        return false;
    }
    let text = msg.content.trim();
    let (approved, short_id) = if let Some(rest) = text.strip_prefix("approve ") {
        (true, rest.trim())
    } else if let Some(rest) = text.strip_prefix("deny ") {
        (false, rest.trim())
    } else {
        return false;
    };
    if short_id.len() < 4 || !short_id.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }

    let ipc_root = app.config.ipc_root();
    let Some(pending) = find_pending_by_short_id(&ipc_root, short_id) else {
        info!(short_id, "approval command with no matching pending");
        return true; // consumed anyway — don't feed it to the agent
    };
    let decision = ApprovalDecision {
        request_id: pending.request_id.clone(),
        approved,
        decided_by: Some(msg.sender.clone()),
    };
    if let Err(e) = write_decision(&ipc_root, &pending, &decision) {
        warn!(error = %e, "failed to write approval decision");
    } else {
        info!(
            short_id,
            approved,
            tool = %pending.tool_name,
            "approval decision recorded from chat"
        );
    }
    true
}

/// Spawn one container invocation and pump its event stream.
async fn invoke_agent(
    app: &Arc<App>,
    profile: &WorkspaceProfile,
    messages: Vec<serde_json::Value>,
    prompt: Option<String>,
) -> bool {
    let folder = profile.folder.clone();
    let jid = profile.jid.clone();
    let resolved = app.config.resolve_workspace(&folder);
    let invocation_ts = Utc::now().timestamp_millis();

    // Worktree (when the workspace has project access).
    let worktree_path = if resolved.project_access {
        match app.worktrees.ensure_worktree(&folder).await {
            Ok(path) => Some(path),
            Err(e) => {
                error!(folder, error = %e, "worktree setup failed");
                app.post_host_message(&jid, &format!("Worktree setup failed: {e}")).await;
                return false;
            }
        }
    } else {
        None
    };

    let mounts = match build_volume_mounts(
        &app.config,
        profile,
        &resolved,
        worktree_path.as_deref(),
        &[],
    ) {
        Ok(mounts) => mounts,
        Err(e) => {
            error!(folder, error = %e, "mount construction failed");
            return false;
        }
    };

    // Fresh gate for this invocation; destroyed on exit.
    let gate_security = resolved.security.clone();
    app.gates.create_gate(&folder, invocation_ts, gate_security);

    let input = ContainerInput {
        messages,
        prompt,
        session_id: app.store.get_session(&folder).ok().flatten(),
        system_prompt: None,
        workspace_folder: folder.clone(),
        invocation_ts,
        mcp_proxy_url: Some(app.proxy.url_for(&folder, invocation_ts, "")),
    };

    let container = ActiveContainer {
        name: pynchy_container::mounts::container_name(&app.config, &folder, invocation_ts),
        input_dir: app.config.ipc_dir(&folder).join("input"),
    };
    app.active.insert(folder.clone(), container);

    let (events_tx, events_rx) = mpsc::channel::<AgentEvent>(256);
    let consumer = tokio::spawn(consume_events(Arc::clone(app), jid.clone(), events_rx));

    let idle_timeout = Duration::from_secs(
        profile
            .container_config
            .as_ref()
            .and_then(|c| c.idle_timeout_secs)
            .unwrap_or(app.config.container.idle_timeout_secs),
    );

    let outcome = run_container(
        app.runtime.as_ref(),
        &app.config,
        &folder,
        idle_timeout,
        &mounts,
        &input,
        events_tx,
    )
    .await;

    let _ = consumer.await;
    app.active.remove(&folder);
    app.gates.destroy_gate(&folder, invocation_ts);

    let success = match outcome {
        Ok(outcome) => {
            if let Some(session_id) = &outcome.session_id {
                let _ = app.store.set_session(&folder, session_id);
            }
            if let Some(err) = &outcome.error {
                warn!(folder, error = %err, "agent run ended with error");
            }
            if !outcome.completed {
                app.post_host_message(&jid, "Agent terminated unexpectedly.").await;
            }
            outcome.completed
        }
        Err(e) => {
            error!(folder, error = %e, "container spawn failed");
            app.post_host_message(&jid, "Agent failed to start.").await;
            false
        }
    };

    // Post-session merge for project workspaces, fire-and-forget.
    if success && resolved.project_access {
        let app_clone = Arc::clone(app);
        let folder_clone = folder.clone();
        pynchy_core::util::spawn_logged(format!("worktree-merge-{folder}"), async move {
            use pynchy_ipc::WorktreeOps;
            crate::services::AppWorktreeOps(app_clone)
                .sync_to_main(&folder_clone)
                .await
                .map(|_| ())
        });
    }

    success
}

/// Translate container events into streaming text, trace lines, stored
/// messages, and SSE events.
async fn consume_events(app: Arc<App>, chat_jid: String, mut rx: mpsc::Receiver<AgentEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::Text { text } => {
                app.streams.on_text_delta(&chat_jid, &text).await;
                app.emit(serde_json::json!({
                    "type": "text", "chat_jid": chat_jid, "delta": text,
                }));
            }
            AgentEvent::Thinking { text } => {
                finalize_stream(&app, &chat_jid).await;
                let preview = pynchy_core::util::truncate_chars(text.trim(), 150);
                if !preview.is_empty() {
                    app.traces.enqueue(&chat_jid, format!("\u{1f9e0} {preview}"));
                }
            }
            AgentEvent::ToolUse { tool, input } => {
                finalize_stream(&app, &chat_jid).await;
                app.traces.enqueue(&chat_jid, format_tool_preview(&tool, &input));
                app.emit(serde_json::json!({
                    "type": "tool_use", "chat_jid": chat_jid, "tool": tool,
                }));
            }
            AgentEvent::ToolResult { .. } => {}
            AgentEvent::System { subtype, message } => {
                tracing::debug!(chat_jid = %chat_jid, subtype, message, "container system event");
            }
            AgentEvent::Result { .. } => {
                // Traces land before the final reply.
                if let Some(batch) = app.traces.take(&chat_jid) {
                    app.fanout.broadcast(&chat_jid, &batch, true).await;
                }
                finalize_stream(&app, &chat_jid).await;
                app.emit(serde_json::json!({
                    "type": "result", "chat_jid": chat_jid,
                }));
            }
        }
    }
}

/// Close out the in-progress stream: store the completed text (host-
/// tagged output becomes an operational message) and deliver it to
/// channels that did not receive streaming edits.
async fn finalize_stream(app: &Arc<App>, chat_jid: &str) {
    let Some(final_text) = app.streams.finalize(chat_jid).await else {
        return;
    };
    let (is_host, content) = parse_host_tag(&final_text);

    let msg = NewMessage {
        id: generate_message_id(if is_host { "host" } else { "" }),
        chat_jid: chat_jid.to_string(),
        sender: if is_host { "host" } else { "assistant" }.into(),
        sender_name: if is_host { "host" } else { "assistant" }.into(),
        content: content.clone(),
        timestamp: now_iso(),
        is_from_me: true,
        message_type: if is_host {
            MessageType::Host
        } else {
            MessageType::Assistant
        },
        metadata: None,
    };
    if let Err(e) = app.store.store_message(&msg) {
        warn!(error = %e, "failed to store finalized message");
    }

    // Streaming channels already showed the text via in-place edits.
    let editing: Vec<String> = app
        .fanout
        .channels()
        .iter()
        .filter(|c| c.supports_editing())
        .map(|c| c.name().to_string())
        .collect();
    app.fanout
        .broadcast_skipping(chat_jid, &content, true, &editing)
        .await;
}
