use rusqlite::params;

use crate::{Result, Store};

/// One row in the taint-audit log.
#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub chat_jid: String,
    pub workspace: String,
    pub tool_name: String,
    /// e.g. `allow`, `deny`, `approval_requested`, `approved_by_user`,
    /// `denied_by_user`, `approval_expired`, `admin_denied`.
    pub decision: String,
    pub corruption_tainted: bool,
    pub secret_tainted: bool,
    pub reason: Option<String>,
    pub request_id: Option<String>,
}

impl Store {
    pub fn record_security_event(&self, event: &SecurityEvent) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO security_audit
             (timestamp, chat_jid, workspace, tool_name, decision,
              corruption_tainted, secret_tainted, reason, request_id)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                pynchy_core::util::now_iso(),
                event.chat_jid,
                event.workspace,
                event.tool_name,
                event.decision,
                event.corruption_tainted as i64,
                event.secret_tainted as i64,
                event.reason,
                event.request_id,
            ],
        )?;
        Ok(())
    }

    /// Recent audit decisions for a workspace, newest first.
    pub fn recent_security_events(&self, workspace: &str, limit: usize) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp || ' ' || tool_name || ' ' || decision
             FROM security_audit WHERE workspace = ?1
             ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![workspace, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}
