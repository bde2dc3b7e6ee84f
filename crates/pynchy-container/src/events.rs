//! Typed event stream between container and host.
//!
//! The container's agent runner emits one JSON object per stdout line;
//! each parses into an [`AgentEvent`]. A `result` event marks the end of
//! the stream and carries the session id (or error) for the invocation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Startup payload written to `input/initial.json` before spawn; the
/// container deletes it after the first read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerInput {
    /// LLM-visible conversation slice (host messages already filtered).
    #[serde(default)]
    pub messages: Vec<Value>,
    /// Direct prompt for task invocations (no conversation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Resume token from a prior invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Ephemeral system context (git notices etc.), not persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub workspace_folder: String,
    /// Invocation start in unix ms — keys the security gate and the MCP
    /// proxy URL.
    pub invocation_ts: i64,
    /// Base URL the agent's MCP clients are pointed at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_proxy_url: Option<String>,
}

/// One structured event from the container's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Streaming text delta.
    Text { text: String },
    Thinking { text: String },
    ToolUse {
        tool: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    /// Lifecycle notices from the runner itself.
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        message: String,
    },
    /// Final event; the container exits after emitting it.
    Result {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        cost_usd: Option<f64>,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
}

impl AgentEvent {
    pub fn is_result(&self) -> bool {
        matches!(self, AgentEvent::Result { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_parse_from_wire_form() {
        let e: AgentEvent = serde_json::from_str(r#"{"type":"text","text":"hi"}"#).unwrap();
        assert!(matches!(e, AgentEvent::Text { text } if text == "hi"));

        let e: AgentEvent =
            serde_json::from_str(r#"{"type":"tool_use","tool":"Bash","input":{"command":"ls"}}"#)
                .unwrap();
        assert!(matches!(e, AgentEvent::ToolUse { tool, .. } if tool == "Bash"));

        let e: AgentEvent =
            serde_json::from_str(r#"{"type":"result","session_id":"s1","cost_usd":0.02}"#).unwrap();
        assert!(e.is_result());
        if let AgentEvent::Result { session_id, error, .. } = e {
            assert_eq!(session_id.as_deref(), Some("s1"));
            assert!(error.is_none());
        }
    }

    #[test]
    fn unknown_event_type_fails_parse() {
        assert!(serde_json::from_str::<AgentEvent>(r#"{"type":"mystery"}"#).is_err());
    }
}
