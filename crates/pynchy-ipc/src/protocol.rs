//! The IPC wire protocol — the boundary between Tier 1 (signal-only) and
//! Tier 2 (data-carrying) requests.
//!
//! Tier 1 signals are `{"signal": "<name>"}` with nothing else but an
//! optional timestamp; they are idempotent hints. Tier 2 requests carry a
//! `type` plus free-form fields and a `request_id` for correlation.

use std::path::Path;

use pynchy_core::{PynchyError, Result};
use serde_json::Value;

/// Payload-free idempotent signals.
pub const SIGNAL_TYPES: &[&str] = &["refresh_groups"];

/// Known tier-2 request types (prefix families `service:` and `security:`
/// are matched by the registry, not listed here).
pub const TIER2_TYPES: &[&str] = &[
    "register_group",
    "create_periodic_agent",
    "schedule_task",
    "schedule_host_job",
    "pause_task",
    "resume_task",
    "cancel_task",
    "reset_context",
    "finished_work",
    "sync_worktree_to_main",
    "ask_user",
];

/// Requests and responses larger than this are rejected as malformed.
pub const MAX_IPC_BODY_BYTES: u64 = 1024 * 1024;

/// Identify a Tier-1 signal.
///
/// Returns `Ok(Some(name))` for a well-formed signal, `Ok(None)` when the
/// payload is not a signal at all (Tier 2), and an error for unknown
/// signal names or extra payload keys.
pub fn validate_signal(data: &Value) -> Result<Option<String>> {
    let Some(obj) = data.as_object() else {
        return Ok(None);
    };
    let Some(signal) = obj.get("signal").and_then(|v| v.as_str()) else {
        return Ok(None);
    };

    if !SIGNAL_TYPES.contains(&signal) {
        return Err(PynchyError::Schema(format!("Unknown signal type: {signal}")));
    }

    let extra: Vec<&String> = obj
        .keys()
        .filter(|k| k.as_str() != "signal" && k.as_str() != "timestamp")
        .collect();
    if !extra.is_empty() {
        return Err(PynchyError::Schema(format!(
            "Signal '{signal}' carries unexpected payload keys: {extra:?}"
        )));
    }

    Ok(Some(signal.to_string()))
}

/// Build a Tier-1 signal payload, rejecting non-signal names.
pub fn make_signal(name: &str) -> Result<Value> {
    if !SIGNAL_TYPES.contains(&name) {
        return Err(PynchyError::Schema(format!("Not a valid signal type: {name}")));
    }
    Ok(serde_json::json!({ "signal": name }))
}

/// Read and parse one IPC file, enforcing the body size cap.
pub fn parse_ipc_file(path: &Path) -> Result<Value> {
    let meta = std::fs::metadata(path)?;
    if meta.len() > MAX_IPC_BODY_BYTES {
        return Err(PynchyError::Schema(format!(
            "IPC file {} exceeds {} bytes",
            path.display(),
            MAX_IPC_BODY_BYTES
        )));
    }
    let text = std::fs::read_to_string(path)?;
    let value = serde_json::from_str(&text)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_signal_returns_name() {
        assert_eq!(
            validate_signal(&json!({"signal": "refresh_groups"})).unwrap(),
            Some("refresh_groups".to_string())
        );
        assert_eq!(
            validate_signal(&json!({"signal": "refresh_groups", "timestamp": "t"})).unwrap(),
            Some("refresh_groups".to_string())
        );
    }

    #[test]
    fn tier2_payload_is_not_a_signal() {
        assert!(validate_signal(&json!({"type": "schedule_task"})).unwrap().is_none());
        assert!(validate_signal(&json!({})).unwrap().is_none());
        assert!(validate_signal(&json!({"signal": null})).unwrap().is_none());
    }

    #[test]
    fn unknown_signal_rejected() {
        assert!(validate_signal(&json!({"signal": "nonexistent"})).is_err());
    }

    #[test]
    fn extra_payload_keys_rejected() {
        let err = validate_signal(&json!({"signal": "refresh_groups", "extra": 1})).unwrap_err();
        assert!(err.to_string().contains("unexpected payload keys"));
    }

    #[test]
    fn make_signal_roundtrips() {
        let payload = make_signal("refresh_groups").unwrap();
        assert_eq!(validate_signal(&payload).unwrap().as_deref(), Some("refresh_groups"));
        assert!(make_signal("schedule_task").is_err());
    }

    #[test]
    fn signal_and_tier2_disjoint() {
        for s in SIGNAL_TYPES {
            assert!(!TIER2_TYPES.contains(s));
        }
    }

    #[test]
    fn parse_rejects_oversized_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.json");
        let huge = format!("{{\"pad\": \"{}\"}}", "x".repeat(MAX_IPC_BODY_BYTES as usize));
        std::fs::write(&path, huge).unwrap();
        assert!(parse_ipc_file(&path).is_err());
    }

    #[test]
    fn parse_reads_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("req.json");
        std::fs::write(&path, "{\"type\": \"schedule_task\"}").unwrap();
        let v = parse_ipc_file(&path).unwrap();
        assert_eq!(v["type"], "schedule_task");
        assert!(parse_ipc_file(&dir.path().join("missing.json")).is_err());
    }
}
