use std::path::Path;
use std::process::Stdio;

use pynchy_core::{PynchyError, Result};
use tokio::process::Command;
use tracing::debug;

/// Outcome of one git invocation.
#[derive(Debug, Clone)]
pub struct GitResult {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitResult {
    pub fn ok(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run `git <args>` in `cwd`, capturing output. Only spawn-level failures
/// return `Err`; non-zero exits come back in the result.
pub async fn run_git(args: &[&str], cwd: &Path) -> Result<GitResult> {
    debug!(?args, cwd = %cwd.display(), "git");
    let out = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| PynchyError::Git(format!("git spawn failed: {e}")))?;
    Ok(GitResult {
        code: out.status.code(),
        stdout: String::from_utf8_lossy(&out.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
    })
}

/// `origin/HEAD` short name, defaulting to `main` when unset.
pub async fn detect_main_branch(cwd: &Path) -> String {
    let result = run_git(
        &["symbolic-ref", "--short", "refs/remotes/origin/HEAD"],
        cwd,
    )
    .await;
    match result {
        Ok(r) if r.ok() => r
            .stdout
            .rsplit('/')
            .next()
            .unwrap_or("main")
            .to_string(),
        _ => "main".to_string(),
    }
}
