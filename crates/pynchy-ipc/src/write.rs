//! Response-file writing. Responses unblock the container side, which
//! watches `responses/` for its request id and deletes the file once read.

use std::path::{Path, PathBuf};

use pynchy_core::util::write_json_atomic;
use pynchy_core::Result;
use serde_json::Value;

pub fn ipc_response_path(ipc_root: &Path, group: &str, request_id: &str) -> PathBuf {
    ipc_root
        .join(group)
        .join("responses")
        .join(format!("{request_id}.json"))
}

pub fn merge_result_path(ipc_root: &Path, group: &str, request_id: &str) -> PathBuf {
    ipc_root
        .join(group)
        .join("merge_results")
        .join(format!("{request_id}.json"))
}

pub fn write_ipc_response(path: &Path, response: &Value) -> Result<()> {
    write_json_atomic(path, response)
}

/// Error-shaped response body.
pub fn error_response(message: impl Into<String>) -> Value {
    serde_json::json!({ "error": message.into() })
}
