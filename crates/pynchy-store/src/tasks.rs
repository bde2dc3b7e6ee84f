use pynchy_core::types::{ScheduleType, ScheduledTask, TaskStatus};
use rusqlite::params;

use crate::{Result, Store, StoreError};

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let schedule_type: String = row.get(4)?;
    let status: String = row.get(10)?;
    Ok(ScheduledTask {
        id: row.get(0)?,
        group_folder: row.get(1)?,
        chat_jid: row.get(2)?,
        prompt: row.get(3)?,
        schedule_type: schedule_type.parse().unwrap_or(ScheduleType::Once),
        schedule_value: row.get(5)?,
        timezone: row.get(6)?,
        next_run: row.get(7)?,
        last_run: row.get(8)?,
        last_result: row.get(9)?,
        status: status.parse().unwrap_or(TaskStatus::Paused),
        created_at: row.get(11)?,
    })
}

const TASK_COLUMNS: &str = "id, group_folder, chat_jid, prompt, schedule_type, schedule_value, \
                            timezone, next_run, last_run, last_result, status, created_at";

impl Store {
    pub fn create_task(&self, task: &ScheduledTask) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            &format!(
                "INSERT INTO scheduled_tasks ({TASK_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)"
            ),
            params![
                task.id,
                task.group_folder,
                task.chat_jid,
                task.prompt,
                task.schedule_type.to_string(),
                task.schedule_value,
                task.timezone,
                task.next_run,
                task.last_run,
                task.last_result,
                task.status.to_string(),
                task.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare_cached(&format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"))?;
        let mut rows = stmt.query_map(params![id], row_to_task)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_tasks(&self, folder: Option<&str>) -> Result<Vec<ScheduledTask>> {
        let conn = self.lock();
        let tasks = match folder {
            Some(f) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                     WHERE group_folder = ?1 ORDER BY created_at"
                ))?;
                let rows = stmt.query_map(params![f], row_to_task)?;
                rows.filter_map(|r| r.ok()).collect()
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY created_at"
                ))?;
                let rows = stmt.query_map([], row_to_task)?;
                rows.filter_map(|r| r.ok()).collect()
            }
        };
        Ok(tasks)
    }

    /// Tasks due now: `status=active AND next_run <= now`, oldest first.
    pub fn get_due_tasks(&self, now_iso: &str) -> Result<Vec<ScheduledTask>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks
             WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run"
        ))?;
        let rows = stmt.query_map(params![now_iso], row_to_task)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE scheduled_tasks SET status = ?1 WHERE id = ?2",
            params![status.to_string(), id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    /// Record the outcome of a run and roll the schedule forward.
    /// `next_run = None` marks the task completed (exhausted `once`).
    pub fn record_task_run(
        &self,
        id: &str,
        last_run: &str,
        last_result: &str,
        next_run: Option<&str>,
        duration_ms: i64,
        error: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let status = if next_run.is_none() {
            "completed"
        } else {
            "active"
        };
        tx.execute(
            "UPDATE scheduled_tasks
             SET last_run = ?1, last_result = ?2, next_run = ?3, status = ?4
             WHERE id = ?5",
            params![last_run, last_result, next_run, status, id],
        )?;
        tx.execute(
            "INSERT INTO task_run_logs (task_id, run_at, duration_ms, status, result, error)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                id,
                last_run,
                duration_ms,
                if error.is_some() { "error" } else { "ok" },
                last_result,
                error,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn delete_task(&self, id: &str) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// Drop completed tasks (and their run logs) older than `max_age_days`.
    pub fn prune_completed_tasks(&self, max_age_days: i64) -> Result<usize> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(max_age_days)).to_rfc3339();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM task_run_logs WHERE task_id IN
             (SELECT id FROM scheduled_tasks
              WHERE status = 'completed' AND last_run IS NOT NULL AND last_run < ?1)",
            params![cutoff],
        )?;
        let n = tx.execute(
            "DELETE FROM scheduled_tasks
             WHERE status = 'completed' AND last_run IS NOT NULL AND last_run < ?1",
            params![cutoff],
        )?;
        tx.commit()?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, next_run: Option<&str>, status: TaskStatus) -> ScheduledTask {
        ScheduledTask {
            id: id.into(),
            group_folder: "dev".into(),
            chat_jid: "slack:C1".into(),
            prompt: "check the builds".into(),
            schedule_type: ScheduleType::Interval,
            schedule_value: "60000".into(),
            timezone: "UTC".into(),
            status,
            next_run: next_run.map(String::from),
            last_run: None,
            last_result: None,
            created_at: "2026-01-01T00:00:00+00:00".into(),
        }
    }

    #[test]
    fn due_query_filters_status_and_time() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_task(&task("t1", Some("2026-01-01T00:00:00+00:00"), TaskStatus::Active))
            .unwrap();
        store
            .create_task(&task("t2", Some("2099-01-01T00:00:00+00:00"), TaskStatus::Active))
            .unwrap();
        store
            .create_task(&task("t3", Some("2026-01-01T00:00:00+00:00"), TaskStatus::Paused))
            .unwrap();

        let due = store.get_due_tasks("2026-06-01T00:00:00+00:00").unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "t1");
    }

    #[test]
    fn record_run_completes_exhausted_schedules() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_task(&task("t1", Some("2026-01-01T00:00:00+00:00"), TaskStatus::Active))
            .unwrap();
        store
            .record_task_run("t1", "2026-01-01T00:00:05+00:00", "done", None, 1200, None)
            .unwrap();
        let got = store.get_task("t1").unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Completed);
        assert!(got.next_run.is_none());
        assert_eq!(got.last_result.as_deref(), Some("done"));
    }

    #[test]
    fn pause_resume_cycle() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_task(&task("t1", Some("2026-01-01T00:00:00+00:00"), TaskStatus::Active))
            .unwrap();
        store.set_task_status("t1", TaskStatus::Paused).unwrap();
        assert!(store.get_due_tasks("2099-01-01T00:00:00+00:00").unwrap().is_empty());
        store.set_task_status("t1", TaskStatus::Active).unwrap();
        assert_eq!(store.get_due_tasks("2099-01-01T00:00:00+00:00").unwrap().len(), 1);
        assert!(store.set_task_status("missing", TaskStatus::Paused).is_err());
    }

    #[test]
    fn prune_removes_old_completed_only() {
        let store = Store::open_in_memory().unwrap();
        store.create_task(&task("t1", None, TaskStatus::Completed)).unwrap();
        store
            .record_task_run("t1", "2020-01-01T00:00:00+00:00", "done", None, 10, None)
            .unwrap();
        store
            .create_task(&task("t2", Some("2099-01-01T00:00:00+00:00"), TaskStatus::Active))
            .unwrap();

        let pruned = store.prune_completed_tasks(30).unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get_task("t1").unwrap().is_none());
        assert!(store.get_task("t2").unwrap().is_some());
    }
}
