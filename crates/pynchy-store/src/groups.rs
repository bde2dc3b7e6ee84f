use std::collections::HashMap;

use chrono::{DateTime, Utc};
use pynchy_core::types::{ContainerOverrides, WorkspaceProfile};
use rusqlite::params;

use crate::{Result, Store};

fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkspaceProfile> {
    let added_at: String = row.get(4)?;
    let container_config: Option<String> = row.get(5)?;
    Ok(WorkspaceProfile {
        jid: row.get(0)?,
        name: row.get(1)?,
        folder: row.get(2)?,
        trigger: row.get(3)?,
        added_at: added_at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        container_config: container_config
            .and_then(|s| serde_json::from_str::<ContainerOverrides>(&s).ok()),
        is_admin: row.get::<_, i64>(6)? != 0,
    })
}

const GROUP_COLUMNS: &str =
    "jid, name, folder, trigger_pattern, added_at, container_config, is_admin";

impl Store {
    /// Register or re-register a workspace (upsert by jid).
    pub fn set_registered_group(&self, profile: &WorkspaceProfile) -> Result<()> {
        let conn = self.lock();
        let container_config = profile
            .container_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT OR REPLACE INTO registered_groups
             (jid, name, folder, trigger_pattern, added_at, container_config, is_admin)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                profile.jid,
                profile.name,
                profile.folder,
                profile.trigger,
                profile.added_at.to_rfc3339(),
                container_config,
                profile.is_admin as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_registered_group(&self, jid: &str) -> Result<Option<WorkspaceProfile>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {GROUP_COLUMNS} FROM registered_groups WHERE jid = ?1"
        ))?;
        let mut rows = stmt.query_map(params![jid], row_to_profile)?;
        Ok(rows.next().transpose()?)
    }

    pub fn get_group_by_folder(&self, folder: &str) -> Result<Option<WorkspaceProfile>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {GROUP_COLUMNS} FROM registered_groups WHERE folder = ?1"
        ))?;
        let mut rows = stmt.query_map(params![folder], row_to_profile)?;
        Ok(rows.next().transpose()?)
    }

    /// All workspaces keyed by canonical jid.
    pub fn all_registered_groups(&self) -> Result<HashMap<String, WorkspaceProfile>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {GROUP_COLUMNS} FROM registered_groups"))?;
        let rows = stmt.query_map([], row_to_profile)?;
        Ok(rows
            .filter_map(|r| r.ok())
            .map(|p| (p.jid.clone(), p))
            .collect())
    }

    pub fn delete_registered_group(&self, jid: &str) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute("DELETE FROM registered_groups WHERE jid = ?1", params![jid])?;
        Ok(n > 0)
    }
}
