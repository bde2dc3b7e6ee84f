//! Outbound broadcast ledger and per-(channel, jid, direction) cursors.
//!
//! Every broadcast inserts one ledger row plus one delivery row per target
//! channel. A delivery succeeds by setting `delivered_at`; failure records
//! `error_message` and leaves it pending. The reconciler retries pending
//! rows in insertion order and stops at the first failure so per-channel
//! ordering holds. Cursor advances are monotonic and committed in the same
//! transaction as the delivery updates that produced them.

use rusqlite::params;

use crate::{Result, Store};

/// An undelivered broadcast row for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub ledger_id: i64,
    pub chat_jid: String,
    pub content: String,
    pub timestamp: String,
}

impl Store {
    /// Record a broadcast and its per-channel delivery slots. Returns the
    /// ledger id. One transaction — the ledger row never exists without
    /// its delivery rows.
    pub fn record_broadcast(
        &self,
        chat_jid: &str,
        content: &str,
        channels: &[String],
    ) -> Result<i64> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO outbound_ledger (chat_jid, content, timestamp) VALUES (?1, ?2, ?3)",
            params![chat_jid, content, pynchy_core::util::now_iso()],
        )?;
        let ledger_id = tx.last_insert_rowid();
        for channel in channels {
            tx.execute(
                "INSERT INTO outbound_deliveries (ledger_id, channel_name) VALUES (?1, ?2)",
                params![ledger_id, channel],
            )?;
        }
        tx.commit()?;
        Ok(ledger_id)
    }

    pub fn mark_delivered(&self, ledger_id: i64, channel: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE outbound_deliveries
             SET delivered_at = ?1, error_message = NULL
             WHERE ledger_id = ?2 AND channel_name = ?3",
            params![pynchy_core::util::now_iso(), ledger_id, channel],
        )?;
        Ok(())
    }

    pub fn mark_delivery_error(&self, ledger_id: i64, channel: &str, error: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE outbound_deliveries
             SET error_message = ?1
             WHERE ledger_id = ?2 AND channel_name = ?3 AND delivered_at IS NULL",
            params![error, ledger_id, channel],
        )?;
        Ok(())
    }

    /// Undelivered rows for `(channel, jid)` in ledger-insertion order.
    pub fn get_pending_outbound(&self, channel: &str, chat_jid: &str) -> Result<Vec<PendingDelivery>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT l.id, l.chat_jid, l.content, l.timestamp
             FROM outbound_ledger l
             JOIN outbound_deliveries d ON d.ledger_id = l.id
             WHERE d.channel_name = ?1 AND l.chat_jid = ?2 AND d.delivered_at IS NULL
             ORDER BY l.id",
        )?;
        let rows = stmt.query_map(params![channel, chat_jid], |row| {
            Ok(PendingDelivery {
                ledger_id: row.get(0)?,
                chat_jid: row.get(1)?,
                content: row.get(2)?,
                timestamp: row.get(3)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Drop fully-delivered ledger rows older than `max_age_days`.
    pub fn gc_delivered_ledger(&self, max_age_days: i64) -> Result<usize> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(max_age_days)).to_rfc3339();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM outbound_deliveries WHERE ledger_id IN
             (SELECT id FROM outbound_ledger l
              WHERE l.timestamp < ?1
                AND NOT EXISTS (SELECT 1 FROM outbound_deliveries d
                                WHERE d.ledger_id = l.id AND d.delivered_at IS NULL))",
            params![cutoff],
        )?;
        let n = tx.execute(
            "DELETE FROM outbound_ledger
             WHERE timestamp < ?1
               AND NOT EXISTS (SELECT 1 FROM outbound_deliveries d
                               WHERE d.ledger_id = outbound_ledger.id)",
            params![cutoff],
        )?;
        tx.commit()?;
        Ok(n)
    }

    // --- cursors -----------------------------------------------------------

    pub fn get_channel_cursor(
        &self,
        channel: &str,
        chat_jid: &str,
        direction: &str,
    ) -> Result<Option<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT cursor FROM channel_cursors
             WHERE channel_name = ?1 AND chat_jid = ?2 AND direction = ?3",
        )?;
        let mut rows = stmt.query_map(params![channel, chat_jid, direction], |row| {
            row.get::<_, String>(0)
        })?;
        Ok(rows.next().transpose()?)
    }

    /// Commit inbound/outbound cursor advances atomically. Each cursor only
    /// moves to lexicographically greater ISO-8601 values; regressions are
    /// silently ignored.
    pub fn advance_cursors_atomic(
        &self,
        channel: &str,
        chat_jid: &str,
        inbound: Option<&str>,
        outbound: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for (direction, value) in [("inbound", inbound), ("outbound", outbound)] {
            if let Some(cursor) = value {
                tx.execute(
                    "INSERT INTO channel_cursors (channel_name, chat_jid, direction, cursor)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(channel_name, chat_jid, direction)
                     DO UPDATE SET cursor = excluded.cursor
                     WHERE excluded.cursor > channel_cursors.cursor",
                    params![channel, chat_jid, direction, cursor],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove cursors for channels that no longer exist (e.g. after a
    /// connection rename). Returns the number of rows pruned.
    pub fn prune_stale_cursors(&self, active_channels: &[String]) -> Result<usize> {
        let conn = self.lock();
        if active_channels.is_empty() {
            return Ok(conn.execute("DELETE FROM channel_cursors", [])? as usize);
        }
        let placeholders = active_channels
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(",");
        let n = conn.execute(
            &format!("DELETE FROM channel_cursors WHERE channel_name NOT IN ({placeholders})"),
            rusqlite::params_from_iter(active_channels.iter()),
        )?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_creates_delivery_per_channel() {
        let store = Store::open_in_memory().unwrap();
        let channels = vec!["chA".to_string(), "chB".to_string()];
        let id = store.record_broadcast("g1@x", "hello", &channels).unwrap();

        assert_eq!(store.get_pending_outbound("chA", "g1@x").unwrap().len(), 1);
        assert_eq!(store.get_pending_outbound("chB", "g1@x").unwrap().len(), 1);

        store.mark_delivered(id, "chA").unwrap();
        assert!(store.get_pending_outbound("chA", "g1@x").unwrap().is_empty());
        assert_eq!(store.get_pending_outbound("chB", "g1@x").unwrap().len(), 1);
    }

    #[test]
    fn pending_returned_in_insertion_order() {
        let store = Store::open_in_memory().unwrap();
        let channels = vec!["chA".to_string()];
        for content in ["A", "B", "C"] {
            store.record_broadcast("g1@x", content, &channels).unwrap();
        }
        let pending = store.get_pending_outbound("chA", "g1@x").unwrap();
        let contents: Vec<_> = pending.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(contents, vec!["A", "B", "C"]);
    }

    #[test]
    fn delivery_error_keeps_row_pending() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .record_broadcast("g1@x", "msg", &["chA".to_string()])
            .unwrap();
        store.mark_delivery_error(id, "chA", "timeout").unwrap();
        let pending = store.get_pending_outbound("chA", "g1@x").unwrap();
        assert_eq!(pending.len(), 1);
        // A later success clears the error.
        store.mark_delivered(id, "chA").unwrap();
        assert!(store.get_pending_outbound("chA", "g1@x").unwrap().is_empty());
    }

    #[test]
    fn cursor_advances_are_monotonic() {
        let store = Store::open_in_memory().unwrap();
        store
            .advance_cursors_atomic("chA", "g1@x", Some("2026-01-02T00:00:00+00:00"), None)
            .unwrap();
        // Attempted regression is ignored.
        store
            .advance_cursors_atomic("chA", "g1@x", Some("2026-01-01T00:00:00+00:00"), None)
            .unwrap();
        assert_eq!(
            store.get_channel_cursor("chA", "g1@x", "inbound").unwrap().unwrap(),
            "2026-01-02T00:00:00+00:00"
        );
        store
            .advance_cursors_atomic("chA", "g1@x", Some("2026-01-03T00:00:00+00:00"), None)
            .unwrap();
        assert_eq!(
            store.get_channel_cursor("chA", "g1@x", "inbound").unwrap().unwrap(),
            "2026-01-03T00:00:00+00:00"
        );
    }

    #[test]
    fn gc_keeps_rows_with_pending_deliveries() {
        let store = Store::open_in_memory().unwrap();
        let channels = vec!["chA".to_string(), "chB".to_string()];
        let id = store.record_broadcast("g1@x", "old", &channels).unwrap();
        store.mark_delivered(id, "chA").unwrap();

        // chB still pending — nothing may be collected even for old rows.
        {
            let conn = store.lock();
            conn.execute(
                "UPDATE outbound_ledger SET timestamp = '2020-01-01T00:00:00+00:00'",
                [],
            )
            .unwrap();
        }
        assert_eq!(store.gc_delivered_ledger(30).unwrap(), 0);

        store.mark_delivered(id, "chB").unwrap();
        assert_eq!(store.gc_delivered_ledger(30).unwrap(), 1);
    }

    #[test]
    fn prune_stale_cursors_respects_active_set() {
        let store = Store::open_in_memory().unwrap();
        store.advance_cursors_atomic("chA", "g1@x", Some("t"), None).unwrap();
        store.advance_cursors_atomic("gone", "g1@x", Some("t"), None).unwrap();
        let pruned = store.prune_stale_cursors(&["chA".to_string()]).unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get_channel_cursor("chA", "g1@x", "inbound").unwrap().is_some());
        assert!(store.get_channel_cursor("gone", "g1@x", "inbound").unwrap().is_none());
    }
}
