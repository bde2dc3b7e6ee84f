use rusqlite::params;

use crate::{Result, Store};

impl Store {
    /// Agent-runtime session id for a workspace, if one has been assigned.
    pub fn get_session(&self, folder: &str) -> Result<Option<String>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare_cached("SELECT session_id FROM sessions WHERE group_folder = ?1")?;
        let mut rows = stmt.query_map(params![folder], |row| row.get::<_, String>(0))?;
        Ok(rows.next().transpose()?)
    }

    pub fn set_session(&self, folder: &str, session_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO sessions (group_folder, session_id) VALUES (?1, ?2)",
            params![folder, session_id],
        )?;
        Ok(())
    }

    /// Forget the session so the next invocation starts a fresh context.
    pub fn clear_session(&self, folder: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM sessions WHERE group_folder = ?1", params![folder])?;
        Ok(())
    }

    pub fn get_router_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached("SELECT value FROM router_state WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        Ok(rows.next().transpose()?)
    }

    pub fn set_router_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO router_state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_roundtrip_and_reset() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_session("dev").unwrap().is_none());
        store.set_session("dev", "sess-abc").unwrap();
        assert_eq!(store.get_session("dev").unwrap().unwrap(), "sess-abc");
        store.set_session("dev", "sess-def").unwrap();
        assert_eq!(store.get_session("dev").unwrap().unwrap(), "sess-def");
        store.clear_session("dev").unwrap();
        assert!(store.get_session("dev").unwrap().is_none());
    }

    #[test]
    fn router_state_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store.set_router_state("last_timestamp", "2026-01-01T00:00:00+00:00").unwrap();
        assert_eq!(
            store.get_router_state("last_timestamp").unwrap().unwrap(),
            "2026-01-01T00:00:00+00:00"
        );
    }
}
