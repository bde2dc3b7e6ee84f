use rusqlite::Connection;

use crate::Result;

/// Initialise the full host schema. Safe to call on every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS chats (
            jid               TEXT PRIMARY KEY,
            name              TEXT,
            last_message_time TEXT,
            cleared_at        TEXT
        );

        CREATE TABLE IF NOT EXISTS messages (
            id           TEXT NOT NULL,
            chat_jid     TEXT NOT NULL,
            sender       TEXT NOT NULL,
            sender_name  TEXT NOT NULL,
            content      TEXT NOT NULL,
            timestamp    TEXT NOT NULL,
            is_from_me   INTEGER NOT NULL DEFAULT 0,
            message_type TEXT NOT NULL DEFAULT 'user',
            metadata     TEXT,
            PRIMARY KEY (id, chat_jid)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
        CREATE INDEX IF NOT EXISTS idx_messages_by_chat ON messages(chat_jid, timestamp);

        CREATE TABLE IF NOT EXISTS scheduled_tasks (
            id             TEXT PRIMARY KEY,
            group_folder   TEXT NOT NULL,
            chat_jid       TEXT NOT NULL,
            prompt         TEXT NOT NULL,
            schedule_type  TEXT NOT NULL,
            schedule_value TEXT NOT NULL,
            timezone       TEXT NOT NULL DEFAULT 'UTC',
            next_run       TEXT,
            last_run       TEXT,
            last_result    TEXT,
            status         TEXT NOT NULL DEFAULT 'active',
            created_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON scheduled_tasks(next_run);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON scheduled_tasks(status);
        CREATE INDEX IF NOT EXISTS idx_tasks_group ON scheduled_tasks(group_folder);

        CREATE TABLE IF NOT EXISTS task_run_logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id     TEXT NOT NULL,
            run_at      TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            status      TEXT NOT NULL,
            result      TEXT,
            error       TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_task_run_logs ON task_run_logs(task_id, run_at);

        CREATE TABLE IF NOT EXISTS host_jobs (
            id              TEXT PRIMARY KEY,
            name            TEXT NOT NULL UNIQUE,
            command         TEXT NOT NULL,
            schedule_type   TEXT NOT NULL,
            schedule_value  TEXT NOT NULL,
            timezone        TEXT NOT NULL DEFAULT 'UTC',
            next_run        TEXT,
            last_run        TEXT,
            last_result     TEXT,
            status          TEXT NOT NULL DEFAULT 'active',
            created_at      TEXT NOT NULL,
            created_by      TEXT NOT NULL,
            cwd             TEXT,
            timeout_seconds INTEGER NOT NULL DEFAULT 600
        );
        CREATE INDEX IF NOT EXISTS idx_host_jobs_next_run ON host_jobs(next_run);

        CREATE TABLE IF NOT EXISTS jid_aliases (
            alias_jid     TEXT PRIMARY KEY,
            canonical_jid TEXT NOT NULL,
            channel_name  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_jid_aliases_canonical ON jid_aliases(canonical_jid);

        CREATE TABLE IF NOT EXISTS router_state (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            group_folder TEXT PRIMARY KEY,
            session_id   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS registered_groups (
            jid              TEXT PRIMARY KEY,
            name             TEXT NOT NULL,
            folder           TEXT NOT NULL UNIQUE,
            trigger_pattern  TEXT NOT NULL,
            added_at         TEXT NOT NULL,
            container_config TEXT,
            is_admin         INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS channel_cursors (
            channel_name TEXT NOT NULL,
            chat_jid     TEXT NOT NULL,
            direction    TEXT NOT NULL,
            cursor       TEXT NOT NULL,
            PRIMARY KEY (channel_name, chat_jid, direction)
        );

        CREATE TABLE IF NOT EXISTS outbound_ledger (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_jid  TEXT NOT NULL,
            content   TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ledger_jid ON outbound_ledger(chat_jid, id);

        CREATE TABLE IF NOT EXISTS outbound_deliveries (
            ledger_id     INTEGER NOT NULL,
            channel_name  TEXT NOT NULL,
            delivered_at  TEXT,
            error_message TEXT,
            PRIMARY KEY (ledger_id, channel_name)
        );
        CREATE INDEX IF NOT EXISTS idx_deliveries_pending
            ON outbound_deliveries(channel_name, delivered_at);

        CREATE TABLE IF NOT EXISTS security_audit (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp          TEXT NOT NULL,
            chat_jid           TEXT NOT NULL,
            workspace          TEXT NOT NULL,
            tool_name          TEXT NOT NULL,
            decision           TEXT NOT NULL,
            corruption_tainted INTEGER NOT NULL DEFAULT 0,
            secret_tainted     INTEGER NOT NULL DEFAULT 0,
            reason             TEXT,
            request_id         TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_audit_workspace ON security_audit(workspace, timestamp);
        ",
    )?;
    Ok(())
}
