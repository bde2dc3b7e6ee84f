//! Handler dependencies.
//!
//! Handlers never see the orchestrator type; they receive [`IpcDeps`],
//! a bundle of narrow capability objects constructed and injected at
//! startup. Each trait lists only the callbacks its consumers need.

use std::sync::Arc;

use async_trait::async_trait;
use pynchy_core::config::PynchyConfig;
use pynchy_queue::GroupQueue;
use pynchy_security::cop::Cop;
use pynchy_security::gate::GateRegistry;
use pynchy_store::Store;
use serde_json::Value;

/// Fan a message out to every connected channel for a chat.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, chat_jid: &str, text: &str);
}

/// Git worktree operations exposed to handlers.
#[async_trait]
pub trait WorktreeOps: Send + Sync {
    /// Merge (or PR) the workspace's worktree per its git policy.
    /// Returns a human-readable summary.
    async fn sync_to_main(&self, folder: &str) -> Result<String, String>;
}

/// Host-side service tool router (`service:<tool>` requests).
#[async_trait]
pub trait ServiceRouter: Send + Sync {
    fn has_tool(&self, tool: &str) -> bool;
    async fn call(&self, tool: &str, payload: Value) -> Result<Value, String>;
}

/// Control over the running container of a workspace.
#[async_trait]
pub trait ContainerControl: Send + Sync {
    /// Ask the workspace's active container to wind down (writes the
    /// `_close` sentinel; escalates after a grace period).
    async fn request_close(&self, folder: &str);
}

/// Everything a handler may touch.
pub struct IpcDeps {
    pub config: Arc<PynchyConfig>,
    pub store: Arc<Store>,
    pub gates: Arc<GateRegistry>,
    pub cop: Arc<dyn Cop>,
    pub queue: GroupQueue,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub worktree: Arc<dyn WorktreeOps>,
    pub services: Arc<dyn ServiceRouter>,
    pub containers: Arc<dyn ContainerControl>,
    /// Invoked on the `refresh_groups` signal so in-memory caches reload.
    pub on_refresh_groups: Arc<dyn Fn() + Send + Sync>,
}

impl IpcDeps {
    /// Canonical chat jid for a workspace folder, if registered.
    pub fn resolve_chat_jid(&self, folder: &str) -> Option<String> {
        self.store
            .get_group_by_folder(folder)
            .ok()
            .flatten()
            .map(|p| p.jid)
    }
}

// --- inert defaults for tests ----------------------------------------------

/// No-op broadcaster.
pub struct NullBroadcaster;

#[async_trait]
impl Broadcaster for NullBroadcaster {
    async fn broadcast(&self, _chat_jid: &str, _text: &str) {}
}

/// Worktree ops that refuse everything.
pub struct NullWorktree;

#[async_trait]
impl WorktreeOps for NullWorktree {
    async fn sync_to_main(&self, _folder: &str) -> Result<String, String> {
        Err("worktrees not configured".into())
    }
}

/// Router with no tools.
pub struct NullServices;

#[async_trait]
impl ServiceRouter for NullServices {
    fn has_tool(&self, _tool: &str) -> bool {
        false
    }
    async fn call(&self, tool: &str, _payload: Value) -> Result<Value, String> {
        Err(format!("Unknown service tool: {tool}"))
    }
}

/// Container control that ignores requests.
pub struct NullContainers;

#[async_trait]
impl ContainerControl for NullContainers {
    async fn request_close(&self, _folder: &str) {}
}
