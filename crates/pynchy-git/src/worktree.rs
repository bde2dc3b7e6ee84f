use std::path::{Path, PathBuf};

use pynchy_core::config::GitPolicy;
use pynchy_core::{PynchyError, Result};
use tracing::{debug, info, warn};

use crate::cmd::{detect_main_branch, run_git};

/// What `merge_worktree_to_main` actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitPolicyAction {
    /// Nothing ahead of main — no-op.
    NothingToMerge,
    /// Commits rebased, fast-forwarded into main, pushed.
    Merged { commits: usize },
    /// Branch pushed and a PR created or updated.
    PushedForReview,
}

pub struct WorktreeManager {
    repo_root: PathBuf,
    worktrees_dir: PathBuf,
}

impl WorktreeManager {
    pub fn new(repo_root: PathBuf, worktrees_dir: PathBuf) -> Self {
        Self {
            repo_root,
            worktrees_dir,
        }
    }

    pub fn branch_name(folder: &str) -> String {
        format!("worktree/{folder}")
    }

    pub fn worktree_path(&self, folder: &str) -> PathBuf {
        self.worktrees_dir.join(folder)
    }

    /// Create the workspace's worktree on first access; afterwards fetch
    /// and fast-forward main, rebasing the worktree when it fell behind.
    /// Idempotent: an up-to-date worktree produces no side effects.
    pub async fn ensure_worktree(&self, folder: &str) -> Result<PathBuf> {
        let branch = Self::branch_name(folder);
        let path = self.worktree_path(folder);
        let main = detect_main_branch(&self.repo_root).await;

        if !path.join(".git").exists() {
            std::fs::create_dir_all(&self.worktrees_dir)?;
            let branch_exists = run_git(
                &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
                &self.repo_root,
            )
            .await?
            .ok();
            let path_str = path.to_string_lossy().to_string();
            let add = if branch_exists {
                run_git(&["worktree", "add", &path_str, &branch], &self.repo_root).await?
            } else {
                run_git(
                    &["worktree", "add", "-b", &branch, &path_str, &main],
                    &self.repo_root,
                )
                .await?
            };
            if !add.ok() {
                return Err(PynchyError::Git(format!(
                    "worktree add failed for {folder}: {}",
                    add.stderr
                )));
            }
            info!(folder, branch = %branch, "worktree created");
            return Ok(path);
        }

        // Existing worktree: refresh main, then rebase if behind.
        let fetch = run_git(&["fetch", "origin"], &self.repo_root).await?;
        if !fetch.ok() {
            debug!(folder, stderr = %fetch.stderr, "fetch failed (offline?) — continuing");
        }
        let behind = self.commits_between(&branch, &main).await?;
        if behind > 0 {
            // The branch is checked out here, so the rebase must run from
            // inside the worktree.
            let rebase = run_git(&["rebase", &main], &path).await?;
            if !rebase.ok() {
                let _ = run_git(&["rebase", "--abort"], &path).await;
                warn!(folder, stderr = %rebase.stderr, "worktree rebase failed");
                return Err(PynchyError::Git(format!("rebase failed for {folder}")));
            }
            info!(folder, commits = behind, "worktree rebased onto main");
        }
        Ok(path)
    }

    /// Commits reachable from `to` but not `from` (`git rev-list from..to`).
    async fn commits_between(&self, from: &str, to: &str) -> Result<usize> {
        let result = run_git(
            &["rev-list", &format!("{from}..{to}"), "--count"],
            &self.repo_root,
        )
        .await?;
        if !result.ok() {
            return Err(PynchyError::Git(format!("rev-list failed: {}", result.stderr)));
        }
        result
            .stdout
            .parse::<usize>()
            .map_err(|_| PynchyError::Git(format!("bad rev-list output: {}", result.stdout)))
    }

    /// Commits the worktree branch carries that main does not.
    pub async fn commits_ahead(&self, folder: &str) -> Result<usize> {
        let main = detect_main_branch(&self.repo_root).await;
        self.commits_between(&main, &Self::branch_name(folder)).await
    }

    /// Rebase-then-ff-merge the worktree into main, pushing with one
    /// rebase-retry if origin advanced between fetch and push. The
    /// `pull-request` policy pushes the branch and opens a PR instead.
    pub async fn merge_worktree_to_main(
        &self,
        folder: &str,
        policy: GitPolicy,
    ) -> Result<GitPolicyAction> {
        let branch = Self::branch_name(folder);
        let path = self.worktree_path(folder);
        let main = detect_main_branch(&self.repo_root).await;

        let ahead = self.commits_ahead(folder).await?;
        if ahead == 0 {
            debug!(folder, "nothing to merge from worktree");
            return Ok(GitPolicyAction::NothingToMerge);
        }

        if policy == GitPolicy::PullRequest {
            return self.push_for_review(folder, &branch, &path).await;
        }

        // Rebase inside the worktree so the ff-merge below cannot fail on
        // divergence.
        let rebase = run_git(&["rebase", &main], &path).await?;
        if !rebase.ok() {
            let _ = run_git(&["rebase", "--abort"], &path).await;
            return Err(PynchyError::Git(format!(
                "worktree rebase failed for {folder}: {}",
                rebase.stderr
            )));
        }

        let merge = run_git(&["merge", "--ff-only", &branch], &self.repo_root).await?;
        if !merge.ok() {
            return Err(PynchyError::Git(format!(
                "ff-merge failed for {folder}: {}",
                merge.stderr
            )));
        }
        info!(folder, commits = ahead, "worktree commits merged into main");

        self.push_with_retry(&main).await;
        Ok(GitPolicyAction::Merged { commits: ahead })
    }

    /// Push main; when origin advanced underneath us, pull --rebase once
    /// and push again.
    async fn push_with_retry(&self, main: &str) {
        let push = match run_git(&["push", "origin", main], &self.repo_root).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "push spawn failed");
                return;
            }
        };
        if push.ok() {
            return;
        }
        debug!(stderr = %push.stderr, "push rejected — rebasing onto origin and retrying");
        let pull = run_git(&["pull", "--rebase", "origin", main], &self.repo_root).await;
        if matches!(pull, Ok(r) if r.ok()) {
            match run_git(&["push", "origin", main], &self.repo_root).await {
                Ok(r) if r.ok() => {}
                Ok(r) => warn!(stderr = %r.stderr, "push failed after rebase-retry"),
                Err(e) => warn!(error = %e, "push retry spawn failed"),
            }
        } else {
            warn!("pull --rebase failed; local commits remain unpushed");
        }
    }

    async fn push_for_review(
        &self,
        folder: &str,
        branch: &str,
        path: &Path,
    ) -> Result<GitPolicyAction> {
        let push = run_git(&["push", "-u", "origin", branch, "--force-with-lease"], path).await?;
        if !push.ok() {
            return Err(PynchyError::Git(format!(
                "branch push failed for {folder}: {}",
                push.stderr
            )));
        }
        // Create the PR if none exists; an existing PR tracks the pushed
        // branch automatically.
        let existing = run_git(
            &["ls-remote", "--heads", "origin", branch],
            &self.repo_root,
        )
        .await?;
        let _ = existing;
        let pr = tokio::process::Command::new("gh")
            .args(["pr", "create", "--fill", "--head", branch])
            .current_dir(path)
            .output()
            .await;
        match pr {
            Ok(out) if out.status.success() => {
                info!(folder, "pull request created");
            }
            Ok(out) => {
                // Most commonly "a pull request already exists".
                debug!(folder, stderr = %String::from_utf8_lossy(&out.stderr).trim(), "gh pr create skipped");
            }
            Err(e) => warn!(folder, error = %e, "gh not available — branch pushed without PR"),
        }
        Ok(GitPolicyAction::PushedForReview)
    }

    /// Working tree has uncommitted changes.
    pub async fn is_dirty(&self, folder: &str) -> Result<bool> {
        let status = run_git(&["status", "--porcelain"], &self.worktree_path(folder)).await?;
        Ok(!status.stdout.is_empty())
    }

    /// Subject line of the newest commit on main.
    pub async fn last_commit_subject(&self) -> Result<String> {
        let result = run_git(&["log", "-1", "--format=%s"], &self.repo_root).await?;
        Ok(result.stdout)
    }

    /// Commits main carries that the worktree branch does not.
    pub async fn commits_behind(&self, folder: &str) -> Result<usize> {
        let main = detect_main_branch(&self.repo_root).await;
        self.commits_between(&Self::branch_name(folder), &main).await
    }

    /// Rebase a sibling worktree onto main. Conflict markers are left in
    /// place on failure (the workspace agent resolves them).
    pub async fn rebase_worktree(&self, folder: &str) -> Result<bool> {
        let main = detect_main_branch(&self.repo_root).await;
        let rebase = run_git(&["rebase", &main], &self.worktree_path(folder)).await?;
        Ok(rebase.ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn git(args: &[&str], cwd: &Path) {
        let result = run_git(args, cwd).await.unwrap();
        assert!(result.ok(), "git {args:?} failed: {}", result.stderr);
    }

    /// Initialise a repo with one commit on main and identity configured.
    async fn init_repo(dir: &Path) {
        git(&["init", "-b", "main"], dir).await;
        git(&["config", "user.email", "test@example.com"], dir).await;
        git(&["config", "user.name", "Test"], dir).await;
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        git(&["add", "."], dir).await;
        git(&["commit", "-m", "initial"], dir).await;
    }

    #[tokio::test]
    async fn ensure_worktree_creates_then_noops() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        std::fs::create_dir_all(&root).unwrap();
        init_repo(&root).await;

        let mgr = WorktreeManager::new(root.clone(), dir.path().join("worktrees"));
        let path = mgr.ensure_worktree("dev").await.unwrap();
        assert!(path.join("README.md").exists());

        // Branch exists, checked out in the worktree.
        let head = run_git(&["branch", "--show-current"], &path).await.unwrap();
        assert_eq!(head.stdout, "worktree/dev");

        // Repeated calls are side-effect free.
        let again = mgr.ensure_worktree("dev").await.unwrap();
        assert_eq!(path, again);
        assert_eq!(mgr.commits_ahead("dev").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn merge_brings_worktree_commits_to_main() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        std::fs::create_dir_all(&root).unwrap();
        init_repo(&root).await;

        let mgr = WorktreeManager::new(root.clone(), dir.path().join("worktrees"));
        let path = mgr.ensure_worktree("dev").await.unwrap();

        // Commit in the worktree (identity is inherited from repo config).
        std::fs::write(path.join("feature.txt"), "new\n").unwrap();
        git(&["add", "."], &path).await;
        git(&["commit", "-m", "add feature"], &path).await;

        assert_eq!(mgr.commits_ahead("dev").await.unwrap(), 1);
        let action = mgr
            .merge_worktree_to_main("dev", GitPolicy::MergeToMain)
            .await
            .unwrap();
        assert_eq!(action, GitPolicyAction::Merged { commits: 1 });
        assert!(root.join("feature.txt").exists());
        assert_eq!(mgr.last_commit_subject().await.unwrap(), "add feature");

        // Second merge: nothing left.
        let action = mgr
            .merge_worktree_to_main("dev", GitPolicy::MergeToMain)
            .await
            .unwrap();
        assert_eq!(action, GitPolicyAction::NothingToMerge);
    }

    #[tokio::test]
    async fn dirty_and_behind_detection() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        std::fs::create_dir_all(&root).unwrap();
        init_repo(&root).await;

        let mgr = WorktreeManager::new(root.clone(), dir.path().join("worktrees"));
        let path = mgr.ensure_worktree("dev").await.unwrap();
        assert!(!mgr.is_dirty("dev").await.unwrap());

        std::fs::write(path.join("scratch.txt"), "wip\n").unwrap();
        assert!(mgr.is_dirty("dev").await.unwrap());

        // Advance main directly; the worktree is now behind.
        std::fs::write(root.join("main-only.txt"), "x\n").unwrap();
        git(&["add", "."], &root).await;
        git(&["commit", "-m", "main advance"], &root).await;
        assert_eq!(mgr.commits_behind("dev").await.unwrap(), 1);
    }
}
