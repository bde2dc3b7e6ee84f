//! Real-time text streaming to channels and debounce-batched trace lines.
//!
//! Channels that support in-place edits get the streaming treatment: the
//! first visible chunk posts a message, later chunks update it, throttled
//! to ~0.5 s. Completed `<internal>` blocks render as 🧠 thoughts and
//! unclosed ones are hidden until the closing tag streams in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pynchy_store::Store;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::channel::Channel;
use crate::format::format_internal_tags;

/// Minimum interval between in-place updates.
const STREAM_THROTTLE: Duration = Duration::from_millis(500);

/// Cursor glyph appended while the message is still streaming.
const STREAM_CURSOR: &str = " \u{258c}";

#[derive(Default)]
struct StreamState {
    buffer: String,
    /// channel name → message id for in-place updates.
    message_ids: HashMap<String, String>,
    last_update: Option<Instant>,
}

/// Per-chat streaming state across channels that support edits.
pub struct StreamManager {
    channels: Vec<Arc<dyn Channel>>,
    store: Arc<Store>,
    states: Mutex<HashMap<String, StreamState>>,
}

impl StreamManager {
    pub fn new(channels: Vec<Arc<dyn Channel>>, store: Arc<Store>) -> Self {
        Self {
            channels,
            store,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Append a streamed delta and push if the throttle window passed.
    pub async fn on_text_delta(&self, chat_jid: &str, delta: &str) {
        let display = {
            let mut states = self.states.lock().unwrap();
            let state = states.entry(chat_jid.to_string()).or_default();
            state.buffer.push_str(delta);
            let throttled = state
                .last_update
                .map(|t| t.elapsed() < STREAM_THROTTLE)
                .unwrap_or(false);
            if throttled {
                return;
            }
            let Some(display) = visible_text(&state.buffer, false) else {
                return;
            };
            state.last_update = Some(Instant::now());
            display
        };
        self.push(chat_jid, &display, false).await;
    }

    /// Flush and drop the stream for a chat — called before trace events
    /// and on result so text becomes its own completed message.
    pub async fn finalize(&self, chat_jid: &str) -> Option<String> {
        let (display, raw) = {
            let mut states = self.states.lock().unwrap();
            let state = states.remove(chat_jid)?;
            if state.buffer.is_empty() {
                return None;
            }
            let display = visible_text(&state.buffer, true)?;
            (display, state)
        };
        // Re-insert message ids briefly so push can update in place.
        {
            let mut states = self.states.lock().unwrap();
            states.insert(
                chat_jid.to_string(),
                StreamState {
                    buffer: String::new(),
                    message_ids: raw.message_ids,
                    last_update: None,
                },
            );
        }
        self.push(chat_jid, &display, true).await;
        self.states.lock().unwrap().remove(chat_jid);
        Some(display)
    }

    async fn push(&self, chat_jid: &str, display: &str, final_push: bool) {
        let text = if final_push {
            display.to_string()
        } else {
            format!("{display}{STREAM_CURSOR}")
        };
        for ch in self.channels.iter().filter(|c| c.is_connected() && c.supports_editing()) {
            let target_jid = self
                .store
                .resolve_channel_jid(chat_jid, ch.name())
                .unwrap_or_else(|_| chat_jid.to_string());
            let existing = {
                let states = self.states.lock().unwrap();
                states
                    .get(chat_jid)
                    .and_then(|s| s.message_ids.get(ch.name()).cloned())
            };
            match existing {
                Some(message_id) => {
                    if let Err(e) = ch.update_message(&target_jid, &message_id, &text).await {
                        warn!(channel = ch.name(), error = %e, "stream update failed");
                    }
                }
                None => match ch.post_message(&target_jid, &text).await {
                    Ok(Some(message_id)) => {
                        let mut states = self.states.lock().unwrap();
                        if let Some(state) = states.get_mut(chat_jid) {
                            state.message_ids.insert(ch.name().to_string(), message_id);
                        }
                    }
                    Ok(None) => {
                        warn!(channel = ch.name(), "post_message returned no message id");
                    }
                    Err(e) => {
                        warn!(channel = ch.name(), error = %e, "stream post failed");
                    }
                },
            }
        }
    }
}

/// Thought-rendered text with unclosed `<internal>` blocks hidden.
/// `None` when nothing is visible yet.
fn visible_text(buffer: &str, final_push: bool) -> Option<String> {
    let mut filtered = format_internal_tags(buffer);
    if let Some(unclosed) = filtered.rfind("<internal>") {
        filtered.truncate(unclosed);
        let trimmed = filtered.trim_end().len();
        filtered.truncate(trimmed);
    }
    if filtered.is_empty() && !final_push {
        return None;
    }
    Some(filtered)
}

/// Debounce-batches trace lines (tool previews, thinking snippets) per
/// chat so rapid tool sequences arrive as one message. Result and host
/// messages bypass the batcher; callers flush before sending them so
/// traces stay ahead of the reply.
pub struct TraceBatcher {
    cooldown: Duration,
    buffers: Arc<Mutex<HashMap<String, Vec<String>>>>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    flush_tx: tokio::sync::mpsc::UnboundedSender<String>,
}

impl TraceBatcher {
    /// Returns the batcher plus the receiver of flush requests; the owner
    /// drains it and broadcasts each drained batch.
    pub fn new(cooldown: Duration) -> (Self, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let (flush_tx, flush_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                cooldown,
                buffers: Arc::new(Mutex::new(HashMap::new())),
                timers: Mutex::new(HashMap::new()),
                flush_tx,
            },
            flush_rx,
        )
    }

    /// Append a trace line and (re)start the cooldown timer.
    pub fn enqueue(&self, chat_jid: &str, line: String) {
        self.buffers
            .lock()
            .unwrap()
            .entry(chat_jid.to_string())
            .or_default()
            .push(line);

        let mut timers = self.timers.lock().unwrap();
        if let Some(old) = timers.remove(chat_jid) {
            old.abort();
        }
        let tx = self.flush_tx.clone();
        let jid = chat_jid.to_string();
        let cooldown = self.cooldown;
        timers.insert(
            chat_jid.to_string(),
            tokio::spawn(async move {
                tokio::time::sleep(cooldown).await;
                let _ = tx.send(jid);
            }),
        );
    }

    /// Take pending lines for a chat (joined), cancelling its timer.
    pub fn take(&self, chat_jid: &str) -> Option<String> {
        if let Some(timer) = self.timers.lock().unwrap().remove(chat_jid) {
            timer.abort();
        }
        let lines = self.buffers.lock().unwrap().remove(chat_jid)?;
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    /// All chats with pending traces — drained at shutdown.
    pub fn pending_jids(&self) -> Vec<String> {
        self.buffers.lock().unwrap().keys().cloned().collect()
    }
}
