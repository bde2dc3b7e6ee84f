//! File-backed pending questions for the `ask_user` flow.
//!
//! Same protocol as approvals but with a richer payload: a list of
//! question blocks, each free-text or option buttons. The channel plugin
//! posts an interactive widget; the user's answer is written back as the
//! IPC response keyed by the request id, and the pending file is removed.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use pynchy_core::util::write_json_atomic;
use pynchy_core::Result;

use crate::approval::response_path;

/// Pending questions expire after 30 minutes — matches the container-side
/// ask_user timeout.
pub const QUESTION_TIMEOUT_SECONDS: i64 = 1_800;

/// One question posed to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionBlock {
    pub question: String,
    /// Choice buttons; empty means free text.
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub allow_free_text: bool,
}

/// On-disk shape of a pending question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub request_id: String,
    pub short_id: String,
    pub source_group: String,
    pub chat_jid: String,
    pub channel_name: String,
    pub session_id: String,
    pub questions: Vec<QuestionBlock>,
    #[serde(default)]
    pub message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub fn pending_questions_dir(ipc_root: &Path, group: &str) -> PathBuf {
    ipc_root.join(group).join("pending_questions")
}

/// Write a pending question file. The container blocks on its response
/// file until the answer arrives or the sweep expires it.
#[allow(clippy::too_many_arguments)]
pub fn create_pending_question(
    ipc_root: &Path,
    request_id: &str,
    source_group: &str,
    chat_jid: &str,
    channel_name: &str,
    session_id: &str,
    questions: Vec<QuestionBlock>,
    message_id: Option<String>,
) -> Result<()> {
    let pending = PendingQuestion {
        request_id: request_id.to_string(),
        short_id: request_id.chars().take(8).collect(),
        source_group: source_group.to_string(),
        chat_jid: chat_jid.to_string(),
        channel_name: channel_name.to_string(),
        session_id: session_id.to_string(),
        questions,
        message_id,
        timestamp: Utc::now(),
    };
    let path = pending_questions_dir(ipc_root, source_group).join(format!("{request_id}.json"));
    write_json_atomic(&path, &pending)?;
    info!(request_id, source_group, channel_name, "pending question created");
    Ok(())
}

fn read_question(path: &Path) -> Option<PendingQuestion> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn group_dirs(ipc_root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(ipc_root) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| p.file_name().and_then(|n| n.to_str()) != Some("errors"))
        .collect()
}

/// Find a pending question by exact request id across all groups.
pub fn find_pending_question(ipc_root: &Path, request_id: &str) -> Option<PendingQuestion> {
    for group_dir in group_dirs(ipc_root) {
        let path = group_dir
            .join("pending_questions")
            .join(format!("{request_id}.json"));
        if path.exists() {
            if let Some(q) = read_question(&path) {
                return Some(q);
            }
        }
    }
    None
}

/// First pending question for a chat, if any — at most one should exist
/// per chat at a time.
pub fn find_pending_for_jid(ipc_root: &Path, chat_jid: &str) -> Option<PendingQuestion> {
    for group_dir in group_dirs(ipc_root) {
        let dir = group_dir.join("pending_questions");
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if let Some(q) = read_question(&entry.path()) {
                if q.chat_jid == chat_jid {
                    return Some(q);
                }
            }
        }
    }
    None
}

/// Deliver the user's answer: write the IPC response and drop the pending
/// file.
pub fn answer_pending_question(
    ipc_root: &Path,
    question: &PendingQuestion,
    answers: serde_json::Value,
) -> Result<()> {
    write_json_atomic(
        &response_path(ipc_root, &question.source_group, &question.request_id),
        &serde_json::json!({ "answers": answers }),
    )?;
    let path = pending_questions_dir(ipc_root, &question.source_group)
        .join(format!("{}.json", question.request_id));
    let _ = std::fs::remove_file(path);
    Ok(())
}

/// Expire stale questions, writing an error response so the container
/// unblocks. Returns the expired entries.
pub fn sweep_expired_questions(ipc_root: &Path, now: DateTime<Utc>) -> Result<Vec<PendingQuestion>> {
    let mut expired = Vec::new();
    for group_dir in group_dirs(ipc_root) {
        let dir = group_dir.join("pending_questions");
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(q) = read_question(&path) else {
                continue;
            };
            if (now - q.timestamp).num_seconds() > QUESTION_TIMEOUT_SECONDS {
                write_json_atomic(
                    &response_path(ipc_root, &q.source_group, &q.request_id),
                    &serde_json::json!({
                        "error": "Question expired (no answer within timeout)"
                    }),
                )?;
                let _ = std::fs::remove_file(&path);
                info!(request_id = %q.request_id, "expired pending question auto-denied");
                expired.push(q);
            }
        }
    }
    Ok(expired)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_questions() -> Vec<QuestionBlock> {
        vec![QuestionBlock {
            question: "Deploy to production?".into(),
            options: vec!["yes".into(), "no".into()],
            allow_free_text: false,
        }]
    }

    #[test]
    fn create_find_answer_cycle() {
        let dir = tempfile::tempdir().unwrap();
        create_pending_question(
            dir.path(),
            "1234abcd5678ef90",
            "dev",
            "slack:C1",
            "slack",
            "sess-1",
            sample_questions(),
            None,
        )
        .unwrap();

        let q = find_pending_question(dir.path(), "1234abcd5678ef90").unwrap();
        assert_eq!(q.short_id, "1234abcd");
        assert_eq!(find_pending_for_jid(dir.path(), "slack:C1").unwrap().request_id, q.request_id);

        answer_pending_question(dir.path(), &q, serde_json::json!(["yes"])).unwrap();
        assert!(find_pending_question(dir.path(), "1234abcd5678ef90").is_none());

        let resp = response_path(dir.path(), "dev", "1234abcd5678ef90");
        let body: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(resp).unwrap()).unwrap();
        assert_eq!(body["answers"][0], "yes");
    }

    #[test]
    fn sweep_expires_stale_questions() {
        let dir = tempfile::tempdir().unwrap();
        create_pending_question(
            dir.path(),
            "1234abcd5678ef90",
            "dev",
            "slack:C1",
            "slack",
            "sess-1",
            sample_questions(),
            None,
        )
        .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(QUESTION_TIMEOUT_SECONDS + 60);
        let expired = sweep_expired_questions(dir.path(), later).unwrap();
        assert_eq!(expired.len(), 1);
        assert!(find_pending_question(dir.path(), "1234abcd5678ef90").is_none());
    }
}
