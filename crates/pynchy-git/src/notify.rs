//! Post-merge fan-out: after one workspace's commits land on main, every
//! other workspace's worktree is rebased (when clean) or told what to do
//! (when dirty or conflicted).

use async_trait::async_trait;
use tracing::{info, warn};

use crate::worktree::WorktreeManager;

/// What happened to one sibling worktree during the broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorktreeNotice {
    /// Clean and behind — rebased automatically.
    AutoRebased { commits: usize, subject: String },
    /// Uncommitted changes block the rebase.
    Dirty,
    /// Rebase hit conflicts; markers left in place.
    Conflicts,
}

impl WorktreeNotice {
    /// Chat-facing text for the workspace's agent or humans.
    pub fn message(&self) -> String {
        match self {
            WorktreeNotice::AutoRebased { commits, subject } => format!(
                "Auto-rebased {commits} commit{} from main; latest: {subject}",
                if *commits == 1 { "" } else { "s" }
            ),
            WorktreeNotice::Dirty => {
                "Your worktree has uncommitted changes; stash or commit them, then sync to \
                 pick up the latest main."
                    .to_string()
            }
            WorktreeNotice::Conflicts => {
                "Rebase onto main hit conflicts; resolve them, then `git rebase --continue`."
                    .to_string()
            }
        }
    }
}

/// Delivery seam for notices. The host routes to a `system_notice`
/// (LLM-visible next wake) when the workspace has an active session, or a
/// host message otherwise.
#[async_trait]
pub trait WorktreeNotifier: Send + Sync {
    async fn notify(&self, folder: &str, notice: WorktreeNotice);
}

/// After a merge into main, walk every other workspace's worktree and
/// rebase or notify. Returns folders touched.
pub async fn broadcast_rebase_to_worktrees(
    manager: &WorktreeManager,
    merged_folder: &str,
    all_folders: &[String],
    notifier: &dyn WorktreeNotifier,
) -> Vec<String> {
    let mut touched = Vec::new();

    for folder in all_folders {
        if folder == merged_folder {
            continue;
        }
        if !manager.worktree_path(folder).join(".git").exists() {
            continue;
        }
        let behind = match manager.commits_behind(folder).await {
            Ok(n) => n,
            Err(e) => {
                warn!(folder, error = %e, "behind check failed");
                continue;
            }
        };
        if behind == 0 {
            continue;
        }

        let dirty = manager.is_dirty(folder).await.unwrap_or(true);
        if dirty {
            notifier.notify(folder, WorktreeNotice::Dirty).await;
            touched.push(folder.clone());
            continue;
        }

        match manager.rebase_worktree(folder).await {
            Ok(true) => {
                let subject = manager.last_commit_subject().await.unwrap_or_default();
                info!(folder, commits = behind, "sibling worktree auto-rebased");
                notifier
                    .notify(
                        folder,
                        WorktreeNotice::AutoRebased {
                            commits: behind,
                            subject,
                        },
                    )
                    .await;
            }
            Ok(false) => {
                // Conflict markers stay for the workspace agent to resolve.
                notifier.notify(folder, WorktreeNotice::Conflicts).await;
            }
            Err(e) => {
                warn!(folder, error = %e, "sibling rebase failed");
                notifier.notify(folder, WorktreeNotice::Conflicts).await;
            }
        }
        touched.push(folder.clone());
    }

    touched
}
