use pynchy_core::types::{HostJob, ScheduleType, TaskStatus};
use rusqlite::params;

use crate::{Result, Store, StoreError};

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<HostJob> {
    let schedule_type: String = row.get(3)?;
    let status: String = row.get(9)?;
    Ok(HostJob {
        id: row.get(0)?,
        name: row.get(1)?,
        command: row.get(2)?,
        schedule_type: schedule_type.parse().unwrap_or(ScheduleType::Once),
        schedule_value: row.get(4)?,
        timezone: row.get(5)?,
        next_run: row.get(6)?,
        last_run: row.get(7)?,
        last_result: row.get(8)?,
        status: status.parse().unwrap_or(TaskStatus::Paused),
        created_at: row.get(10)?,
        created_by: row.get(11)?,
        cwd: row.get(12)?,
        timeout_seconds: row.get::<_, i64>(13)? as u64,
    })
}

const JOB_COLUMNS: &str = "id, name, command, schedule_type, schedule_value, timezone, next_run, \
                           last_run, last_result, status, created_at, created_by, cwd, \
                           timeout_seconds";

impl Store {
    pub fn create_host_job(&self, job: &HostJob) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            &format!(
                "INSERT INTO host_jobs ({JOB_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)"
            ),
            params![
                job.id,
                job.name,
                job.command,
                job.schedule_type.to_string(),
                job.schedule_value,
                job.timezone,
                job.next_run,
                job.last_run,
                job.last_result,
                job.status.to_string(),
                job.created_at,
                job.created_by,
                job.cwd,
                job.timeout_seconds as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_host_job(&self, id: &str) -> Result<Option<HostJob>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare_cached(&format!("SELECT {JOB_COLUMNS} FROM host_jobs WHERE id = ?1"))?;
        let mut rows = stmt.query_map(params![id], row_to_job)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_host_jobs(&self) -> Result<Vec<HostJob>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare_cached(&format!("SELECT {JOB_COLUMNS} FROM host_jobs ORDER BY created_at"))?;
        let rows = stmt.query_map([], row_to_job)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn get_due_host_jobs(&self, now_iso: &str) -> Result<Vec<HostJob>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM host_jobs
             WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run"
        ))?;
        let rows = stmt.query_map(params![now_iso], row_to_job)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn set_host_job_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE host_jobs SET status = ?1 WHERE id = ?2",
            params![status.to_string(), id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("host job {id}")));
        }
        Ok(())
    }

    pub fn record_host_job_run(
        &self,
        id: &str,
        last_run: &str,
        last_result: &str,
        next_run: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();
        let status = if next_run.is_none() {
            "completed"
        } else {
            "active"
        };
        conn.execute(
            "UPDATE host_jobs
             SET last_run = ?1, last_result = ?2, next_run = ?3, status = ?4
             WHERE id = ?5",
            params![last_run, last_result, next_run, status, id],
        )?;
        Ok(())
    }

    pub fn delete_host_job(&self, id: &str) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute("DELETE FROM host_jobs WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, next_run: Option<&str>) -> HostJob {
        HostJob {
            id: id.into(),
            name: id.into(),
            command: "echo ok".into(),
            schedule_type: ScheduleType::Interval,
            schedule_value: "3600000".into(),
            timezone: "UTC".into(),
            status: TaskStatus::Active,
            next_run: next_run.map(String::from),
            last_run: None,
            last_result: None,
            created_at: "2026-01-01T00:00:00+00:00".into(),
            created_by: "admin".into(),
            cwd: None,
            timeout_seconds: 600,
        }
    }

    #[test]
    fn due_jobs_and_run_recording() {
        let store = Store::open_in_memory().unwrap();
        store.create_host_job(&job("host-backup", Some("2026-01-01T00:00:00+00:00"))).unwrap();

        let due = store.get_due_host_jobs("2026-06-01T00:00:00+00:00").unwrap();
        assert_eq!(due.len(), 1);

        store
            .record_host_job_run(
                "host-backup",
                "2026-06-01T00:00:01+00:00",
                "exit 0",
                Some("2026-06-01T01:00:01+00:00"),
            )
            .unwrap();
        let got = store.get_host_job("host-backup").unwrap().unwrap();
        assert_eq!(got.status, TaskStatus::Active);
        assert_eq!(got.last_result.as_deref(), Some("exit 0"));
    }
}
