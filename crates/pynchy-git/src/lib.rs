//! Per-workspace git worktree isolation.
//!
//! Each workspace with project access owns branch `worktree/<folder>`
//! checked out in its own worktree directory. Merging rebases the
//! worktree onto main from *inside* the worktree (git refuses to touch a
//! branch checked out elsewhere), then fast-forward-merges into main and
//! pushes with one rebase-retry. After a successful merge, sibling
//! worktrees are rebased or notified.

mod cmd;
mod notify;
mod worktree;

pub use cmd::{run_git, GitResult};
pub use notify::{broadcast_rebase_to_worktrees, WorktreeNotice, WorktreeNotifier};
pub use worktree::{GitPolicyAction, WorktreeManager};
