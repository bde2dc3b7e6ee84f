//! Central shared state — one `Arc<App>` passed to every subsystem.
//!
//! The app owns the process-wide singletons (store, queue, gates, proxy,
//! channel fan-out) and implements the capability traits the IPC handlers
//! and scheduler consume, so no subsystem ever sees the orchestrator type
//! directly.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use dashmap::DashMap;
use pynchy_channels::{ChannelFanout, StreamManager, TraceBatcher};
use pynchy_core::config::PynchyConfig;
use pynchy_core::types::{MessageType, NewMessage, WorkspaceProfile};
use pynchy_core::util::{generate_message_id, now_iso};
use pynchy_git::WorktreeManager;
use pynchy_mcp::McpProxy;
use pynchy_queue::GroupQueue;
use pynchy_security::cop::Cop;
use pynchy_security::gate::GateRegistry;
use pynchy_store::Store;
use tracing::warn;

/// A workspace's currently running container, registered for the
/// lifetime of the invocation.
pub struct ActiveContainer {
    pub name: String,
    pub input_dir: std::path::PathBuf,
}

pub struct App {
    pub config: Arc<PynchyConfig>,
    pub store: Arc<Store>,
    pub queue: GroupQueue,
    pub gates: Arc<GateRegistry>,
    pub cop: Arc<dyn Cop>,
    pub fanout: Arc<ChannelFanout>,
    pub streams: Arc<StreamManager>,
    pub traces: Arc<TraceBatcher>,
    pub proxy: Arc<McpProxy>,
    pub worktrees: Arc<WorktreeManager>,
    pub runtime: Arc<dyn pynchy_container::ContainerRuntime>,
    /// Registered workspaces keyed by canonical jid; reloaded on the
    /// `refresh_groups` signal.
    pub workspaces: RwLock<HashMap<String, WorkspaceProfile>>,
    /// folder → running container.
    pub active: DashMap<String, ActiveContainer>,
    /// SSE fan-out of operational events.
    pub events: tokio::sync::broadcast::Sender<serde_json::Value>,
    pub started_at: Instant,
}

impl App {
    pub fn reload_workspaces(&self) {
        match self.store.all_registered_groups() {
            Ok(groups) => {
                *self.workspaces.write().unwrap() = groups;
            }
            Err(e) => warn!(error = %e, "workspace reload failed"),
        }
    }

    pub fn workspace_by_jid(&self, jid: &str) -> Option<WorkspaceProfile> {
        self.workspaces.read().unwrap().get(jid).cloned()
    }

    pub fn workspace_by_folder(&self, folder: &str) -> Option<WorkspaceProfile> {
        self.workspaces
            .read()
            .unwrap()
            .values()
            .find(|p| p.folder == folder)
            .cloned()
    }

    /// Canonical chat of the admin workspace — the destination for
    /// deploy and operational notices.
    pub fn admin_chat_jid(&self) -> Option<String> {
        self.workspaces
            .read()
            .unwrap()
            .values()
            .find(|p| p.is_admin)
            .map(|p| p.jid.clone())
    }

    /// Store an operational host message (never LLM-visible) and fan it
    /// out to humans.
    pub async fn post_host_message(&self, chat_jid: &str, text: &str) {
        let msg = NewMessage {
            id: generate_message_id("host"),
            chat_jid: chat_jid.to_string(),
            sender: "host".into(),
            sender_name: "host".into(),
            content: text.to_string(),
            timestamp: now_iso(),
            is_from_me: true,
            message_type: MessageType::Host,
            metadata: None,
        };
        if let Err(e) = self.store.store_message(&msg) {
            warn!(error = %e, "failed to store host message");
        }
        self.fanout.broadcast(chat_jid, text, true).await;
        self.emit(serde_json::json!({
            "type": "host_message",
            "chat_jid": chat_jid,
            "content": text,
        }));
    }

    /// Emit an SSE event; dropped silently when nobody listens.
    pub fn emit(&self, event: serde_json::Value) {
        let _ = self.events.send(event);
    }
}
