//! Outbound message formatting: `<internal>` thought blocks, `<host>`
//! operational tags, and one-line tool-call previews for trace messages.

use pynchy_core::util::truncate_chars;
use serde_json::Value;

const INTERNAL_OPEN: &str = "<internal>";
const INTERNAL_CLOSE: &str = "</internal>";
const HOST_OPEN: &str = "<host>";
const HOST_CLOSE: &str = "</host>";

/// Remove completed `<internal>…</internal>` blocks entirely.
pub fn strip_internal_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(INTERNAL_OPEN) {
        out.push_str(&rest[..start]);
        match rest[start..].find(INTERNAL_CLOSE) {
            Some(end) => rest = &rest[start + end + INTERNAL_CLOSE.len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Render completed `<internal>…</internal>` blocks as 🧠-prefixed
/// thoughts instead of hiding them.
pub fn format_internal_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(INTERNAL_OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + INTERNAL_OPEN.len()..];
        match after_open.find(INTERNAL_CLOSE) {
            Some(end) => {
                let thought = after_open[..end].trim();
                if !thought.is_empty() {
                    out.push_str(&format!("\u{1f9e0} _{thought}_"));
                }
                rest = &after_open[end + INTERNAL_CLOSE.len()..];
            }
            None => {
                // Unclosed block: keep the tag so the streamer can hide it.
                out.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Whether text is wholly wrapped in `<host>` tags; returns the inner
/// content when it is. Host-tagged output is operational — stored with
/// `sender = "host"` and never shown to the model.
pub fn parse_host_tag(text: &str) -> (bool, String) {
    let trimmed = text.trim();
    if let Some(inner) = trimmed.strip_prefix(HOST_OPEN) {
        if let Some(content) = inner.strip_suffix(HOST_CLOSE) {
            return (true, content.trim().to_string());
        }
    }
    (false, text.to_string())
}

/// One-line preview of a tool invocation so chat users see what the agent
/// is doing, not just the tool name.
pub fn format_tool_preview(tool_name: &str, input: &Value) -> String {
    let get = |key: &str| input.get(key).and_then(|v| v.as_str()).unwrap_or("");

    match tool_name {
        "Bash" => {
            let cmd = get("command");
            if cmd.is_empty() {
                "Bash".into()
            } else {
                format!("Bash: {}", truncate_chars(cmd, 180))
            }
        }
        "Read" | "Edit" | "Write" => {
            let path = get("file_path");
            if path.is_empty() {
                tool_name.into()
            } else {
                format!("{tool_name}: {}", truncate_chars(path, 150))
            }
        }
        "Grep" => {
            let mut parts = vec![tool_name.to_string()];
            let pattern = get("pattern");
            if !pattern.is_empty() {
                parts.push(format!("/{pattern}/"));
            }
            let path = get("path");
            if !path.is_empty() {
                parts.push(path.to_string());
            }
            parts.join(" ")
        }
        "Glob" => {
            let pattern = get("pattern");
            if pattern.is_empty() {
                "Glob".into()
            } else {
                format!("Glob: {pattern}")
            }
        }
        "WebFetch" => {
            let url = get("url");
            if url.is_empty() {
                "WebFetch".into()
            } else {
                format!("WebFetch: {}", truncate_chars(url, 150))
            }
        }
        "WebSearch" => {
            let query = get("query");
            if query.is_empty() {
                "WebSearch".into()
            } else {
                format!("WebSearch: {}", truncate_chars(query, 150))
            }
        }
        "Task" => {
            let desc = get("description");
            if desc.is_empty() {
                "Task".into()
            } else {
                format!("Task: {desc}")
            }
        }
        _ => {
            if input.is_null() || input.as_object().map(|o| o.is_empty()).unwrap_or(false) {
                tool_name.into()
            } else {
                format!("{tool_name}: {}", truncate_chars(&input.to_string(), 150))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_removes_completed_blocks() {
        let text = "before <internal>secret thought</internal> after";
        assert_eq!(strip_internal_tags(text), "before  after");
    }

    #[test]
    fn format_renders_thoughts() {
        let text = "hi <internal>pondering</internal> there";
        let out = format_internal_tags(text);
        assert!(out.contains("\u{1f9e0} _pondering_"));
        assert!(!out.contains("<internal>"));
    }

    #[test]
    fn unclosed_internal_tag_is_preserved_for_hiding() {
        let text = "visible <internal>still streaming";
        let out = format_internal_tags(text);
        assert!(out.contains("<internal>"));
    }

    #[test]
    fn host_tag_detection() {
        let (is_host, content) = parse_host_tag("<host>Deploy finished</host>");
        assert!(is_host);
        assert_eq!(content, "Deploy finished");

        let (is_host, content) = parse_host_tag("plain reply");
        assert!(!is_host);
        assert_eq!(content, "plain reply");
    }

    #[test]
    fn tool_previews_extract_relevant_detail() {
        assert_eq!(
            format_tool_preview("Bash", &json!({"command": "ls -la"})),
            "Bash: ls -la"
        );
        assert_eq!(
            format_tool_preview("Read", &json!({"file_path": "/src/main.rs"})),
            "Read: /src/main.rs"
        );
        assert_eq!(
            format_tool_preview("Grep", &json!({"pattern": "todo", "path": "src"})),
            "Grep /todo/ src"
        );
        assert_eq!(format_tool_preview("Mystery", &json!({})), "Mystery");
        let long = "x".repeat(300);
        let preview = format_tool_preview("Bash", &json!({ "command": long }));
        assert!(preview.chars().count() <= 186);
        assert!(preview.ends_with("..."));
    }
}
