use pynchy_core::types::{MessageType, NewMessage};
use rusqlite::params;

use crate::{Result, Store};

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<NewMessage> {
    let type_str: String = row.get(7)?;
    let metadata_str: Option<String> = row.get(8)?;
    Ok(NewMessage {
        id: row.get(0)?,
        chat_jid: row.get(1)?,
        sender: row.get(2)?,
        sender_name: row.get(3)?,
        content: row.get(4)?,
        timestamp: row.get(5)?,
        is_from_me: row.get::<_, i64>(6)? != 0,
        message_type: type_str.parse().unwrap_or(MessageType::User),
        metadata: metadata_str.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

const MESSAGE_COLUMNS: &str =
    "id, chat_jid, sender, sender_name, content, timestamp, is_from_me, message_type, metadata";

impl Store {
    /// Store a message, replacing any previous row with the same
    /// `(id, chat_jid)`. Also bumps the chat's last-message time.
    pub fn store_message(&self, msg: &NewMessage) -> Result<()> {
        let conn = self.lock();
        let metadata = msg
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT OR IGNORE INTO chats (jid, name) VALUES (?1, ?1)",
            params![msg.chat_jid],
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO messages
             (id, chat_jid, sender, sender_name, content, timestamp, is_from_me,
              message_type, metadata)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                msg.id,
                msg.chat_jid,
                msg.sender,
                msg.sender_name,
                msg.content,
                msg.timestamp,
                msg.is_from_me as i64,
                msg.message_type.to_string(),
                metadata,
            ],
        )?;
        conn.execute(
            "UPDATE chats SET last_message_time = ?1
             WHERE jid = ?2 AND (last_message_time IS NULL OR last_message_time < ?1)",
            params![msg.timestamp, msg.chat_jid],
        )?;
        Ok(())
    }

    pub fn message_exists(&self, msg_id: &str, chat_jid: &str) -> Result<bool> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare_cached("SELECT 1 FROM messages WHERE id = ?1 AND chat_jid = ?2 LIMIT 1")?;
        Ok(stmt.exists(params![msg_id, chat_jid])?)
    }

    /// Messages for a chat since a timestamp, excluding our own sends.
    /// Used to build the agent-visible conversation slice.
    pub fn get_messages_since(&self, chat_jid: &str, since: &str) -> Result<Vec<NewMessage>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_jid = ?1 AND timestamp > ?2 AND is_from_me = 0
             ORDER BY timestamp"
        ))?;
        let rows = stmt.query_map(params![chat_jid, since], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Recent history for a chat, newest last, respecting the `cleared_at`
    /// boundary set by `reset_context`.
    pub fn get_chat_history(&self, chat_jid: &str, limit: usize) -> Result<Vec<NewMessage>> {
        let conn = self.lock();
        let cleared_at: Option<String> = conn
            .query_row(
                "SELECT cleared_at FROM chats WHERE jid = ?1",
                params![chat_jid],
                |row| row.get(0),
            )
            .unwrap_or(None);

        let mut messages: Vec<NewMessage> = match cleared_at {
            Some(boundary) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE chat_jid = ?1 AND timestamp > ?2
                     ORDER BY timestamp DESC LIMIT ?3"
                ))?;
                let rows =
                    stmt.query_map(params![chat_jid, boundary, limit as i64], row_to_message)?;
                rows.filter_map(|r| r.ok()).collect()
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE chat_jid = ?1
                     ORDER BY timestamp DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![chat_jid, limit as i64], row_to_message)?;
                rows.filter_map(|r| r.ok()).collect()
            }
        };
        messages.reverse();
        Ok(messages)
    }

    /// Hide all history before now — the agent starts clean on next wake.
    pub fn clear_chat(&self, chat_jid: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO chats (jid, cleared_at) VALUES (?1, ?2)
             ON CONFLICT(jid) DO UPDATE SET cleared_at = ?2",
            params![chat_jid, pynchy_core::util::now_iso()],
        )?;
        Ok(())
    }
}

/// Project stored messages into the LLM-visible form.
///
/// Host messages are operational notifications and must never reach the
/// model; everything else passes through unchanged.
pub fn llm_visible(messages: &[NewMessage]) -> Vec<&NewMessage> {
    messages
        .iter()
        .filter(|m| m.message_type != MessageType::Host)
        .collect()
}
