//! File-backed state for the human approval gate.
//!
//! Pending approval files under `ipc/<group>/pending_approvals/` ARE the
//! "awaiting a human" relation — they survive crashes and are resolved
//! only by deletion:
//!
//! ```text
//! request arrives (needs_human)
//!     → write pending_approvals/<request_id>.json
//!     → broadcast notice to chat (short id = first 8 hex chars)
//!     → container stays blocked (no response file written)
//!
//! user replies "approve <id>" / "deny <id>"
//!     → write approval_decisions/<request_id>.json
//!     → decision watcher executes or denies, writes the response
//!
//! startup sweep: auto-deny stale pendings, remove orphaned decisions
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use pynchy_core::util::write_json_atomic;
use pynchy_core::Result;

/// Pending approvals expire after this many seconds — matches the
/// container-side response poll timeout.
pub const APPROVAL_TIMEOUT_SECONDS: i64 = 300;

/// Request fields omitted from user-facing notifications.
const INTERNAL_FIELDS: &[&str] = &["type", "request_id", "source_group"];

/// Max characters for one detail value in a notification.
const MAX_DETAIL_LEN: usize = 100;

/// On-disk shape of a pending approval. Carries the full re-dispatchable
/// request so the decision handler is self-contained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub request_id: String,
    pub short_id: String,
    pub tool_name: String,
    pub source_group: String,
    pub chat_jid: String,
    pub request_data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// `"service"` for tool requests, `"ipc"` for host-mutating operations
    /// re-entered through the dispatch registry.
    #[serde(default = "default_handler_type")]
    pub handler_type: String,
}

fn default_handler_type() -> String {
    "service".to_string()
}

/// A human decision written by the chat router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub request_id: String,
    pub approved: bool,
    #[serde(default)]
    pub decided_by: Option<String>,
}

pub fn pending_approvals_dir(ipc_root: &Path, group: &str) -> PathBuf {
    ipc_root.join(group).join("pending_approvals")
}

pub fn approval_decisions_dir(ipc_root: &Path, group: &str) -> PathBuf {
    ipc_root.join(group).join("approval_decisions")
}

pub fn response_path(ipc_root: &Path, group: &str, request_id: &str) -> PathBuf {
    ipc_root
        .join(group)
        .join("responses")
        .join(format!("{request_id}.json"))
}

/// Write a pending approval file (PENDING state). Returns the short id.
pub fn create_pending_approval(
    ipc_root: &Path,
    request_id: &str,
    tool_name: &str,
    source_group: &str,
    chat_jid: &str,
    request_data: serde_json::Value,
    handler_type: &str,
) -> Result<String> {
    let short_id = request_id.chars().take(8).collect::<String>();
    let pending = PendingApproval {
        request_id: request_id.to_string(),
        short_id: short_id.clone(),
        tool_name: tool_name.to_string(),
        source_group: source_group.to_string(),
        chat_jid: chat_jid.to_string(),
        request_data,
        timestamp: Utc::now(),
        handler_type: handler_type.to_string(),
    };
    let path = pending_approvals_dir(ipc_root, source_group).join(format!("{request_id}.json"));
    write_json_atomic(&path, &pending)?;
    info!(
        request_id,
        short_id, tool_name, source_group, "pending approval created"
    );
    Ok(short_id)
}

fn group_dirs(ipc_root: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(ipc_root) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name != "errors")
        .collect()
}

fn read_pending(path: &Path) -> Option<PendingApproval> {
    let text = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(pending) => Some(pending),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable pending approval");
            None
        }
    }
}

/// All pending approvals, oldest first, optionally for a single group.
pub fn list_pending_approvals(ipc_root: &Path, group: Option<&str>) -> Vec<PendingApproval> {
    let groups = match group {
        Some(g) => vec![g.to_string()],
        None => group_dirs(ipc_root),
    };
    let mut results: Vec<PendingApproval> = Vec::new();
    for grp in groups {
        let dir = pending_approvals_dir(ipc_root, &grp);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(pending) = read_pending(&path) {
                results.push(pending);
            }
        }
    }
    results.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    results
}

/// Find a pending approval by short-id prefix across all group directories.
pub fn find_pending_by_short_id(ipc_root: &Path, short_id: &str) -> Option<PendingApproval> {
    for grp in group_dirs(ipc_root) {
        let dir = pending_approvals_dir(ipc_root, &grp);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with(short_id)
                && path.extension().and_then(|e| e.to_str()) == Some("json")
            {
                if let Some(pending) = read_pending(&path) {
                    return Some(pending);
                }
            }
        }
    }
    None
}

/// Record the user's verdict for the decision watcher to pick up.
pub fn write_decision(ipc_root: &Path, pending: &PendingApproval, decision: &ApprovalDecision) -> Result<()> {
    let path = approval_decisions_dir(ipc_root, &pending.source_group)
        .join(format!("{}.json", pending.request_id));
    write_json_atomic(&path, decision)
}

/// Remove both state files once a decision is processed.
pub fn remove_approval_files(ipc_root: &Path, group: &str, request_id: &str) {
    let pending = pending_approvals_dir(ipc_root, group).join(format!("{request_id}.json"));
    let decision = approval_decisions_dir(ipc_root, group).join(format!("{request_id}.json"));
    let _ = std::fs::remove_file(pending);
    let _ = std::fs::remove_file(decision);
}

/// Auto-deny expired pendings (writing an error response so the container
/// unblocks) and remove decision files with no matching pending. Returns
/// the expired entries. Runs at startup and on a slow timer.
pub fn sweep_expired_approvals(ipc_root: &Path, now: DateTime<Utc>) -> Result<Vec<PendingApproval>> {
    let mut expired = Vec::new();

    for grp in group_dirs(ipc_root) {
        let pending_dir = pending_approvals_dir(ipc_root, &grp);
        let decisions_dir = approval_decisions_dir(ipc_root, &grp);

        if let Ok(entries) = std::fs::read_dir(&pending_dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(pending) = read_pending(&path) else {
                    continue;
                };
                let age = (now - pending.timestamp).num_seconds();
                if age > APPROVAL_TIMEOUT_SECONDS {
                    write_json_atomic(
                        &response_path(ipc_root, &grp, &pending.request_id),
                        &serde_json::json!({
                            "error": "Approval expired (no response within timeout)"
                        }),
                    )?;
                    let _ = std::fs::remove_file(&path);
                    info!(
                        request_id = %pending.request_id,
                        tool_name = %pending.tool_name,
                        age_seconds = age,
                        "expired pending approval auto-denied"
                    );
                    expired.push(pending);
                }
            }
        }

        // Orphaned decisions: decision present, pending gone.
        if let Ok(entries) = std::fs::read_dir(&decisions_dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let matching = pending_dir.join(format!("{stem}.json"));
                if !matching.exists() {
                    info!(path = %path.display(), "removing orphaned decision file");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }

    Ok(expired)
}

/// Format the chat-facing approval notice. Internal and underscore-prefixed
/// fields are omitted; values are truncated.
pub fn format_approval_notification(
    tool_name: &str,
    request_data: &serde_json::Value,
    short_id: &str,
) -> String {
    let mut detail_parts: Vec<String> = Vec::new();
    if let Some(map) = request_data.as_object() {
        for (key, value) in map {
            if INTERNAL_FIELDS.contains(&key.as_str()) || key.starts_with('_') {
                continue;
            }
            let raw = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            detail_parts.push(format!(
                "  {key}: {}",
                pynchy_core::util::truncate_chars(&raw, MAX_DETAIL_LEN)
            ));
        }
    }
    let details = if detail_parts.is_empty() {
        "  (no details)".to_string()
    } else {
        detail_parts.join("\n")
    };

    format!(
        "\u{1f510} Approval required\n\nAction: {tool_name}\nDetails:\n{details}\n\n\
         \u{2192} approve {short_id}  /  deny {short_id}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_then_find_by_short_id() {
        let dir = tempfile::tempdir().unwrap();
        let short = create_pending_approval(
            dir.path(),
            "abcd1234ef567890",
            "Bash",
            "dev",
            "slack:C1",
            json!({"command": "curl https://x.test"}),
            "service",
        )
        .unwrap();
        assert_eq!(short, "abcd1234");

        let found = find_pending_by_short_id(dir.path(), "abcd1234").unwrap();
        assert_eq!(found.request_id, "abcd1234ef567890");
        assert_eq!(found.tool_name, "Bash");
        assert!(find_pending_by_short_id(dir.path(), "ffffffff").is_none());
    }

    #[test]
    fn sweep_expires_old_and_writes_error_response() {
        let dir = tempfile::tempdir().unwrap();
        create_pending_approval(
            dir.path(),
            "abcd1234ef567890",
            "Bash",
            "dev",
            "slack:C1",
            json!({}),
            "service",
        )
        .unwrap();

        // Fresh: nothing expires.
        let expired = sweep_expired_approvals(dir.path(), Utc::now()).unwrap();
        assert!(expired.is_empty());

        // Past the timeout: auto-denied with an error response.
        let later = Utc::now() + chrono::Duration::seconds(APPROVAL_TIMEOUT_SECONDS + 10);
        let expired = sweep_expired_approvals(dir.path(), later).unwrap();
        assert_eq!(expired.len(), 1);

        let resp = response_path(dir.path(), "dev", "abcd1234ef567890");
        let body: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(resp).unwrap()).unwrap();
        assert!(body["error"].as_str().unwrap().contains("expired"));
        assert!(list_pending_approvals(dir.path(), Some("dev")).is_empty());
    }

    #[test]
    fn sweep_removes_orphaned_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let decision_path = approval_decisions_dir(dir.path(), "dev").join("deadbeef00000000.json");
        write_json_atomic(
            &decision_path,
            &json!({"request_id": "deadbeef00000000", "approved": true}),
        )
        .unwrap();

        sweep_expired_approvals(dir.path(), Utc::now()).unwrap();
        assert!(!decision_path.exists());
    }

    #[test]
    fn notification_hides_internal_fields_and_truncates() {
        let long = "y".repeat(300);
        let text = format_approval_notification(
            "schedule_task",
            &json!({
                "type": "schedule_task",
                "request_id": "deadbeef",
                "_cop_approved": true,
                "prompt": long,
            }),
            "deadbeef",
        );
        assert!(text.contains("Action: schedule_task"));
        assert!(text.contains("approve deadbeef"));
        assert!(!text.contains("request_id: deadbeef"));
        assert!(!text.contains("_cop_approved"));
        // Truncated value plus ellipsis.
        assert!(text.contains("..."));
        assert!(!text.contains(&long));
    }
}
