//! Worktree notice routing: a workspace with an active session gets a
//! system notice the agent sees on next wake; otherwise the notice lands
//! as a host message for humans only.

use std::sync::Arc;

use async_trait::async_trait;
use pynchy_core::types::{MessageType, NewMessage};
use pynchy_core::util::{generate_message_id, now_iso};
use pynchy_git::{WorktreeNotice, WorktreeNotifier};
use tracing::warn;

use crate::app::App;

pub struct AppWorktreeNotifier(pub Arc<App>);

#[async_trait]
impl WorktreeNotifier for AppWorktreeNotifier {
    async fn notify(&self, folder: &str, notice: WorktreeNotice) {
        let app = &self.0;
        let Some(profile) = app.workspace_by_folder(folder) else {
            return;
        };
        let text = notice.message();

        let has_session = app
            .store
            .get_session(folder)
            .ok()
            .flatten()
            .is_some();

        if has_session {
            // System message: persisted into the conversation, included in
            // the LLM projection at the next invocation.
            let msg = NewMessage {
                id: generate_message_id("sys-notice"),
                chat_jid: profile.jid.clone(),
                sender: "system".into(),
                sender_name: "system".into(),
                content: text.clone(),
                timestamp: now_iso(),
                is_from_me: false,
                message_type: MessageType::System,
                metadata: None,
            };
            if let Err(e) = app.store.store_message(&msg) {
                warn!(folder, error = %e, "failed to store system notice");
            }
            app.queue.enqueue_message_check(&profile.jid);
        } else {
            app.post_host_message(&profile.jid, &text).await;
        }
    }
}
