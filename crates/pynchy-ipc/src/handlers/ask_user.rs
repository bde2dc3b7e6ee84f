//! `ask_user` — the agent poses questions and blocks until the user
//! answers through a channel widget or the pending entry expires.

use std::sync::Arc;

use pynchy_security::questions::{create_pending_question, QuestionBlock};
use serde_json::Value;
use tracing::{info, warn};

use crate::deps::IpcDeps;

pub async fn handle_ask_user(
    data: Value,
    source_group: String,
    _is_admin: bool,
    deps: Arc<IpcDeps>,
) {
    let Some(request_id) = data.get("request_id").and_then(|v| v.as_str()).map(String::from)
    else {
        warn!(group = %source_group, "ask_user missing request_id");
        return;
    };

    let questions: Vec<QuestionBlock> = data
        .get("questions")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    if questions.is_empty() {
        warn!(group = %source_group, "ask_user with no questions — dropped");
        return;
    }

    let chat_jid = deps
        .resolve_chat_jid(&source_group)
        .unwrap_or_else(|| "unknown".to_string());
    let channel_name = data
        .get("channel")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let session_id = deps
        .store
        .get_session(&source_group)
        .ok()
        .flatten()
        .unwrap_or_default();

    if let Err(e) = create_pending_question(
        &deps.config.ipc_root(),
        &request_id,
        &source_group,
        &chat_jid,
        &channel_name,
        &session_id,
        questions.clone(),
        None,
    ) {
        warn!(error = %e, "failed to create pending question");
        return;
    }

    // Text fallback so channels without widget support still surface it.
    let mut lines = vec!["\u{2753} The agent has a question:".to_string()];
    for q in &questions {
        lines.push(format!("  {}", q.question));
        if !q.options.is_empty() {
            lines.push(format!("    options: {}", q.options.join(" / ")));
        }
    }
    deps.broadcaster.broadcast(&chat_jid, &lines.join("\n")).await;
    info!(group = %source_group, request_id, "pending question posted");
    // No response file — answered via the questions protocol.
}
