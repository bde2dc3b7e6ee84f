//! Host-side service tool registry and the capability-trait
//! implementations injected into the IPC handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pynchy_ipc::{Broadcaster, ContainerControl, ServiceRouter, WorktreeOps};
use serde_json::Value;
use tracing::info;

use crate::app::App;

type ServiceHandler =
    Arc<dyn Fn(Value) -> futures_util::future::BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Static registry of host-side tools populated at startup. Plugins
/// contribute entries through `register`; there is no runtime reload.
#[derive(Default)]
pub struct ServiceRegistry {
    tools: HashMap<String, ServiceHandler>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, handler: ServiceHandler) {
        info!(tool = name, "service tool registered");
        self.tools.insert(name.to_string(), handler);
    }
}

#[async_trait]
impl ServiceRouter for ServiceRegistry {
    fn has_tool(&self, tool: &str) -> bool {
        self.tools.contains_key(tool)
    }

    async fn call(&self, tool: &str, payload: Value) -> Result<Value, String> {
        match self.tools.get(tool) {
            Some(handler) => handler(payload).await,
            None => Err(format!("Unknown service tool: {tool}")),
        }
    }
}

/// Fan-out capability handed to IPC handlers.
pub struct AppBroadcaster(pub Arc<App>);

#[async_trait]
impl Broadcaster for AppBroadcaster {
    async fn broadcast(&self, chat_jid: &str, text: &str) {
        self.0.fanout.broadcast(chat_jid, text, true).await;
    }
}

/// Container close capability: drop the `_close` sentinel into the
/// active container's input directory.
pub struct AppContainerControl(pub Arc<App>);

#[async_trait]
impl ContainerControl for AppContainerControl {
    async fn request_close(&self, folder: &str) {
        if let Some(active) = self.0.active.get(folder) {
            pynchy_container::spawn::write_close_sentinel(&active.input_dir);
        }
    }
}

/// Worktree sync capability: merge or PR per the workspace's policy,
/// then rebase-or-notify the sibling worktrees.
pub struct AppWorktreeOps(pub Arc<App>);

#[async_trait]
impl WorktreeOps for AppWorktreeOps {
    async fn sync_to_main(&self, folder: &str) -> Result<String, String> {
        let app = &self.0;
        let policy = app.config.resolve_workspace(folder).git_policy;
        let action = app
            .worktrees
            .merge_worktree_to_main(folder, policy)
            .await
            .map_err(|e| e.to_string())?;

        let summary = match &action {
            pynchy_git::GitPolicyAction::NothingToMerge => "Nothing to merge".to_string(),
            pynchy_git::GitPolicyAction::Merged { commits } => {
                format!("Merged {commits} commit(s) into main")
            }
            pynchy_git::GitPolicyAction::PushedForReview => {
                "Branch pushed; pull request opened".to_string()
            }
        };

        if matches!(action, pynchy_git::GitPolicyAction::Merged { .. }) {
            let folders: Vec<String> = app
                .workspaces
                .read()
                .unwrap()
                .values()
                .filter(|p| app.config.resolve_workspace(&p.folder).project_access)
                .map(|p| p.folder.clone())
                .collect();
            let notifier = crate::notify::AppWorktreeNotifier(Arc::clone(app));
            pynchy_git::broadcast_rebase_to_worktrees(
                &app.worktrees,
                folder,
                &folders,
                &notifier,
            )
            .await;
        }

        Ok(summary)
    }
}
