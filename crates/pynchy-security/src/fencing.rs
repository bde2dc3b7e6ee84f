//! Untrusted-content fencing.
//!
//! Text from public-source services is wrapped in sentinel markers before
//! it reaches the agent; the agent's system prompt instructs it to treat
//! fenced text as data, never as instructions.

pub const FENCE_OPEN_PREFIX: &str = "<EXTERNAL_UNTRUSTED_CONTENT source=";
pub const FENCE_CLOSE: &str = "</EXTERNAL_UNTRUSTED_CONTENT>";

/// Replacement text for content the Cop flagged as an injection attempt.
pub const BLOCKED_PLACEHOLDER: &str =
    "Content blocked by security policy. The source may contain unsafe content. \
     Try a different page.";

/// Wrap `text` in fence markers attributed to `source`.
pub fn fence_untrusted_content(text: &str, source: &str) -> String {
    format!("{FENCE_OPEN_PREFIX}\"{source}\">\n{text}\n{FENCE_CLOSE}")
}

/// Whether `text` already carries fence markers (avoid double-wrapping
/// when a response transits the proxy twice).
pub fn is_fenced(text: &str) -> bool {
    text.trim_start().starts_with(FENCE_OPEN_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_wraps_with_source_attribution() {
        let fenced = fence_untrusted_content("Hello from the web", "mcp:browser");
        assert!(fenced.starts_with("<EXTERNAL_UNTRUSTED_CONTENT source=\"mcp:browser\">"));
        assert!(fenced.ends_with(FENCE_CLOSE));
        assert!(fenced.contains("Hello from the web"));
    }

    #[test]
    fn detects_existing_fence() {
        let fenced = fence_untrusted_content("x", "mcp:browser");
        assert!(is_fenced(&fenced));
        assert!(!is_fenced("plain text"));
    }
}
