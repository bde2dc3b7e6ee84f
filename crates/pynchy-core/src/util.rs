//! Small helpers shared across the host process: atomic JSON writes, id
//! generation, schedule math, logged background tasks, and the resettable
//! idle timer used to close container stdin.

use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::{PynchyError, Result};
use crate::types::ScheduleType;

/// Write JSON to `path` via tmp-write + fsync + rename.
///
/// Readers watching the directory either see the old content or the
/// complete new content, never a partial file. Parent directories are
/// created as needed. The temp file uses the `.json.tmp` suffix that IPC
/// readers are taught to ignore.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(serde_json::to_string_pretty(value)?.as_bytes())?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Millisecond-timestamp message id, optionally prefixed
/// (`host-1717267200123`).
pub fn generate_message_id(prefix: &str) -> String {
    let ms = Utc::now().timestamp_millis();
    if prefix.is_empty() {
        ms.to_string()
    } else {
        format!("{prefix}-{ms}")
    }
}

/// Cryptographically random 16-hex request id for IPC correlation.
pub fn generate_request_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..16].to_string()
}

/// Current instant as ISO-8601 UTC. Lexicographic comparison of these
/// strings matches chronological order, which the cursor tables rely on.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Compute the next run for a schedule, starting strictly after `from`.
///
/// Always returns UTC ISO-8601 so SQLite lexicographic comparison against
/// `now_iso()` works in the due-task query. `Once` tasks have no recurrence
/// and return `None`. Invalid cron/interval/timezone values are rejected so
/// callers can refuse the task at registration time.
pub fn next_run_after(
    schedule_type: ScheduleType,
    schedule_value: &str,
    timezone: &str,
    from: DateTime<Utc>,
) -> Result<Option<String>> {
    match schedule_type {
        ScheduleType::Cron => {
            let tz: Tz = timezone
                .parse()
                .map_err(|_| PynchyError::InvalidSchedule(format!("unknown timezone: {timezone}")))?;
            let expr = normalize_cron(schedule_value);
            let schedule: cron::Schedule = expr
                .parse()
                .map_err(|e| PynchyError::InvalidSchedule(format!("bad cron expression: {e}")))?;
            let next = schedule.after(&from.with_timezone(&tz)).next();
            Ok(next.map(|dt| dt.with_timezone(&Utc).to_rfc3339()))
        }
        ScheduleType::Interval => {
            let ms: i64 = schedule_value
                .trim()
                .parse()
                .map_err(|_| PynchyError::InvalidSchedule(format!("bad interval: {schedule_value}")))?;
            if ms <= 0 {
                return Err(PynchyError::InvalidSchedule("interval must be positive".into()));
            }
            Ok(Some((from + chrono::Duration::milliseconds(ms)).to_rfc3339()))
        }
        ScheduleType::Once => Ok(None),
    }
}

/// [`next_run_after`] anchored at the current instant.
pub fn compute_next_run(
    schedule_type: ScheduleType,
    schedule_value: &str,
    timezone: &str,
) -> Result<Option<String>> {
    next_run_after(schedule_type, schedule_value, timezone, Utc::now())
}

/// The cron crate wants a seconds field; user-facing expressions are the
/// classic five fields. Prepend `0` when given five.
fn normalize_cron(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Spawn a fire-and-forget task that logs its error instead of swallowing
/// it. Drop-in replacement for bare `tokio::spawn` on background work
/// (worktree merges, container stops) whose result nobody awaits.
pub fn spawn_logged<F, E>(name: impl Into<String>, fut: F) -> JoinHandle<()>
where
    F: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: std::fmt::Display,
{
    let name = name.into();
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            tracing::error!(task = %name, error = %e, "background task failed");
        }
    })
}

/// Truncate to at most `max` characters, appending an ellipsis when cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}

/// Resettable idle timer. Each `reset()` cancels the pending countdown and
/// starts a fresh one; `on_fire` runs once when a full period elapses with
/// no reset. The callback must be cheap (send on a channel, set a flag).
pub struct IdleTimer {
    timeout: Duration,
    on_fire: Arc<dyn Fn() + Send + Sync>,
    handle: Option<JoinHandle<()>>,
}

impl IdleTimer {
    pub fn new(timeout: Duration, on_fire: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            timeout,
            on_fire: Arc::new(on_fire),
            handle: None,
        }
    }

    /// Cancel any pending countdown and start a fresh one.
    pub fn reset(&mut self) {
        if let Some(h) = self.handle.take() {
            h.abort();
        }
        let cb = Arc::clone(&self.on_fire);
        let timeout = self.timeout;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cb();
        }));
    }

    /// Cancel without firing.
    pub fn cancel(&mut self) {
        if let Some(h) = self.handle.take() {
            h.abort();
        }
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
