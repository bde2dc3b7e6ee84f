//! Deploy flow and the rollback continuation protocol.
//!
//! `POST /deploy` pulls main, optionally validates, records the previous
//! sha, and restarts (exit 0; the supervisor brings the process back).
//! If the restarted process fails startup validation it writes a rollback
//! continuation file and exits 1; the *next* start consumes that file,
//! `git reset --hard`s to the recorded sha, and retries.

use std::path::Path;

use pynchy_core::config::PynchyConfig;
use pynchy_git::run_git;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Written by a successful deploy before restarting.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeployState {
    pub sha: String,
    pub previous_sha: String,
}

/// Written when startup validation fails; consumed by the next start.
#[derive(Debug, Serialize, Deserialize)]
pub struct RollbackContinuation {
    pub reset_to: String,
    pub reason: String,
}

fn deploy_state_path(config: &PynchyConfig) -> std::path::PathBuf {
    config.data_dir.join("deploy.json")
}

pub async fn head_sha(project_root: &Path) -> String {
    match run_git(&["rev-parse", "HEAD"], project_root).await {
        Ok(r) if r.ok() => r.stdout,
        _ => "unknown".to_string(),
    }
}

pub async fn head_commit_subject(project_root: &Path) -> String {
    match run_git(&["log", "-1", "--format=%s"], project_root).await {
        Ok(r) if r.ok() => pynchy_core::util::truncate_chars(&r.stdout, 72),
        _ => String::new(),
    }
}

/// Pull-and-restart. Returns `(new_sha, previous_sha)`; the caller sends
/// the HTTP response, then the process exits 0 shortly after.
pub async fn run_deploy(config: &PynchyConfig) -> Result<(String, String), String> {
    let root = &config.project_root;
    let old_sha = head_sha(root).await;

    let pull = run_git(&["pull", "--ff-only"], root)
        .await
        .map_err(|e| e.to_string())?;
    if !pull.ok() {
        // Non-fatal: a restart without new commits is still a restart.
        warn!(stderr = %pull.stderr, "git pull failed, restarting with current code");
    }
    let new_sha = head_sha(root).await;

    let state = DeployState {
        sha: new_sha.clone(),
        previous_sha: old_sha.clone(),
    };
    pynchy_core::util::write_json_atomic(&deploy_state_path(config), &state)
        .map_err(|e| e.to_string())?;

    Ok((new_sha, old_sha))
}

/// Startup hook, before anything side-effecting:
/// 1. Consume a rollback continuation (reset --hard and retry this boot).
/// 2. Report whether a deploy restart is in progress.
pub async fn consume_rollback_continuation(config: &PynchyConfig) {
    let path = config.rollback_file();
    let Ok(text) = std::fs::read_to_string(&path) else {
        return;
    };
    let Ok(continuation) = serde_json::from_str::<RollbackContinuation>(&text) else {
        warn!("unreadable rollback continuation — removing");
        let _ = std::fs::remove_file(&path);
        return;
    };
    error!(
        reset_to = %continuation.reset_to,
        reason = %continuation.reason,
        "consuming rollback continuation — resetting project"
    );
    match run_git(&["reset", "--hard", &continuation.reset_to], &config.project_root).await {
        Ok(r) if r.ok() => info!(sha = %continuation.reset_to, "project rolled back"),
        Ok(r) => error!(stderr = %r.stderr, "rollback reset failed"),
        Err(e) => error!(error = %e, "rollback reset failed"),
    }
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(deploy_state_path(config));
}

/// On startup validation failure: record where to roll back to (the sha
/// before the last deploy, when known) and exit 1.
pub fn write_rollback_and_exit(config: &PynchyConfig, reason: &str) -> ! {
    let reset_to = std::fs::read_to_string(deploy_state_path(config))
        .ok()
        .and_then(|text| serde_json::from_str::<DeployState>(&text).ok())
        .map(|s| s.previous_sha);

    if let Some(reset_to) = reset_to {
        let continuation = RollbackContinuation {
            reset_to,
            reason: reason.to_string(),
        };
        if let Err(e) =
            pynchy_core::util::write_json_atomic(&config.rollback_file(), &continuation)
        {
            error!(error = %e, "failed to write rollback continuation");
        }
    }
    error!(reason, "startup validation failed — exiting");
    std::process::exit(1);
}

/// Successful startup clears the deploy marker.
pub fn clear_deploy_marker(config: &PynchyConfig) {
    let _ = std::fs::remove_file(deploy_state_path(config));
}
