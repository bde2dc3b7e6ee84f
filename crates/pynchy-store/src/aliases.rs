use rusqlite::params;

use crate::{Result, Store};

impl Store {
    /// Map a channel-native jid onto a canonical workspace jid.
    pub fn set_jid_alias(&self, alias_jid: &str, canonical_jid: &str, channel: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO jid_aliases (alias_jid, canonical_jid, channel_name)
             VALUES (?1, ?2, ?3)",
            params![alias_jid, canonical_jid, channel],
        )?;
        Ok(())
    }

    /// Normalize an inbound jid: returns the canonical jid when an alias
    /// exists, otherwise the input unchanged.
    pub fn resolve_canonical_jid(&self, jid: &str) -> Result<String> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare_cached("SELECT canonical_jid FROM jid_aliases WHERE alias_jid = ?1")?;
        let mut rows = stmt.query_map(params![jid], |row| row.get::<_, String>(0))?;
        Ok(rows.next().transpose()?.unwrap_or_else(|| jid.to_string()))
    }

    /// Channel-local address for an outbound send, falling back to the
    /// canonical jid when the channel holds no alias.
    pub fn resolve_channel_jid(&self, canonical_jid: &str, channel: &str) -> Result<String> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT alias_jid FROM jid_aliases
             WHERE canonical_jid = ?1 AND channel_name = ?2",
        )?;
        let mut rows = stmt.query_map(params![canonical_jid, channel], |row| {
            row.get::<_, String>(0)
        })?;
        Ok(rows
            .next()
            .transpose()?
            .unwrap_or_else(|| canonical_jid.to_string()))
    }

    /// Whether `channel` owns `jid` — an alias exists, or no alias exists
    /// anywhere (the canonical owner case).
    pub fn channel_owns_jid(&self, canonical_jid: &str, channel: &str) -> Result<bool> {
        let conn = self.lock();
        let mut any_stmt = conn
            .prepare_cached("SELECT 1 FROM jid_aliases WHERE canonical_jid = ?1 LIMIT 1")?;
        if !any_stmt.exists(params![canonical_jid])? {
            return Ok(true);
        }
        let mut mine_stmt = conn.prepare_cached(
            "SELECT 1 FROM jid_aliases
             WHERE canonical_jid = ?1 AND channel_name = ?2 LIMIT 1",
        )?;
        Ok(mine_stmt.exists(params![canonical_jid, channel])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_normalization_both_directions() {
        let store = Store::open_in_memory().unwrap();
        store.set_jid_alias("wa:123@g.us", "slack:C1", "whatsapp").unwrap();

        assert_eq!(store.resolve_canonical_jid("wa:123@g.us").unwrap(), "slack:C1");
        assert_eq!(store.resolve_canonical_jid("slack:C1").unwrap(), "slack:C1");

        assert_eq!(
            store.resolve_channel_jid("slack:C1", "whatsapp").unwrap(),
            "wa:123@g.us"
        );
        assert_eq!(store.resolve_channel_jid("slack:C1", "slack").unwrap(), "slack:C1");
    }

    #[test]
    fn ownership_without_aliases_defaults_true() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.channel_owns_jid("slack:C9", "slack").unwrap());

        store.set_jid_alias("wa:1@g.us", "slack:C9", "whatsapp").unwrap();
        assert!(store.channel_owns_jid("slack:C9", "whatsapp").unwrap());
        assert!(!store.channel_owns_jid("slack:C9", "telegram").unwrap());
    }
}
