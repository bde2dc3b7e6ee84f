use async_trait::async_trait;
use pynchy_core::types::NewMessage;

use crate::error::ChannelError;

/// Result of an inbound history fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    /// Messages newer than the cursor, channel-native jids.
    pub messages: Vec<NewMessage>,
    /// Channel's own high-watermark for the page — lets the cursor
    /// advance past bot-only pages where no user messages appear.
    pub high_water_mark: String,
}

/// Interface implemented by every channel adapter (Slack, WhatsApp, TUI).
///
/// Implementations must be `Send + Sync`; the fan-out drives them from
/// multiple tasks concurrently.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable lowercase identifier, unique across registered adapters.
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Whether this channel is the native owner of a jid (its namespace).
    fn owns_jid(&self, jid: &str) -> bool;

    /// Deliver one outbound message.
    async fn send_message(&self, jid: &str, text: &str) -> Result<(), ChannelError>;

    /// Fetch messages newer than `cursor` for crash-tolerant catch-up.
    async fn fetch_inbound_since(
        &self,
        jid: &str,
        cursor: &str,
    ) -> Result<FetchResult, ChannelError>;

    /// Whether `post_message`/`update_message` are usable for in-place
    /// streaming edits.
    fn supports_editing(&self) -> bool {
        false
    }

    /// Post a new message, returning its channel message id for edits.
    async fn post_message(&self, _jid: &str, _text: &str) -> Result<Option<String>, ChannelError> {
        Err(ChannelError::Unsupported("post_message".into()))
    }

    /// Replace a previously posted message's text.
    async fn update_message(
        &self,
        _jid: &str,
        _message_id: &str,
        _text: &str,
    ) -> Result<(), ChannelError> {
        Err(ChannelError::Unsupported("update_message".into()))
    }
}
