//! Due-task polling: scheduled agent prompts route through the group
//! queue (so they serialize with message processing), host jobs execute
//! their shell command directly with a timeout.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pynchy_core::types::{ScheduledTask, TaskStatus};
use pynchy_core::util::{next_run_after, now_iso};
use pynchy_queue::GroupQueue;
use pynchy_store::Store;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Invokes the agent for one scheduled task. Implemented by the host
/// orchestrator; returns a short result summary or an error string.
#[async_trait]
pub trait TaskInvoker: Send + Sync {
    async fn invoke_task(&self, task: ScheduledTask) -> Result<String, String>;
}

pub struct TaskScheduler {
    store: Arc<Store>,
    queue: GroupQueue,
    invoker: Arc<dyn TaskInvoker>,
    poll_interval: Duration,
    /// Tasks enqueued but not yet finished — prevents double-firing when
    /// a task stays queued across poll cycles.
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<Store>,
        queue: GroupQueue,
        invoker: Arc<dyn TaskInvoker>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            invoker,
            poll_interval,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Poll until `shutdown` flips true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("task scheduler started");
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("task scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One poll cycle: enqueue due agent tasks, execute due host jobs.
    pub async fn tick(&self) {
        let now = now_iso();

        match self.store.get_due_tasks(&now) {
            Ok(due) => {
                for task in due {
                    self.enqueue_agent_task(task);
                }
            }
            Err(e) => error!(error = %e, "due-task query failed"),
        }

        match self.store.get_due_host_jobs(&now) {
            Ok(due) => {
                for job in due {
                    self.run_host_job(job);
                }
            }
            Err(e) => error!(error = %e, "due-host-job query failed"),
        }
    }

    fn enqueue_agent_task(&self, task: ScheduledTask) {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(task.id.clone()) {
                return; // already queued from a prior cycle
            }
        }
        info!(task_id = %task.id, folder = %task.group_folder, "enqueuing due task");

        let store = Arc::clone(&self.store);
        let invoker = Arc::clone(&self.invoker);
        let in_flight = Arc::clone(&self.in_flight);
        let jid = task.chat_jid.clone();
        let task_id = task.id.clone();

        self.queue.enqueue_task(
            &jid,
            &task_id,
            Box::new(move || {
                Box::pin(async move {
                    let started = std::time::Instant::now();
                    let run_at = now_iso();
                    let outcome = invoker.invoke_task(task.clone()).await;
                    let duration_ms = started.elapsed().as_millis() as i64;

                    let (result_text, error) = match &outcome {
                        Ok(summary) => (summary.clone(), None),
                        Err(e) => (format!("error: {e}"), Some(e.clone())),
                    };
                    // Success or failure, the schedule rolls forward; a
                    // broken task must not fire every poll cycle.
                    let next_run = next_run_after(
                        task.schedule_type,
                        &task.schedule_value,
                        &task.timezone,
                        Utc::now(),
                    )
                    .unwrap_or(None);

                    if let Err(e) = store.record_task_run(
                        &task.id,
                        &run_at,
                        &result_text,
                        next_run.as_deref(),
                        duration_ms,
                        error.as_deref(),
                    ) {
                        error!(task_id = %task.id, error = %e, "failed to record task run");
                    }
                    in_flight.lock().unwrap().remove(&task.id);
                })
            }),
        );
    }

    fn run_host_job(&self, job: pynchy_core::types::HostJob) {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(job.id.clone()) {
                return;
            }
        }
        info!(job_id = %job.id, "executing due host job");

        let store = Arc::clone(&self.store);
        let in_flight = Arc::clone(&self.in_flight);
        pynchy_core::util::spawn_logged(format!("host-job-{}", job.id), async move {
            let run_at = now_iso();
            let result = run_shell(&job.command, job.cwd.as_deref(), job.timeout_seconds).await;
            let next_run = next_run_after(
                job.schedule_type,
                &job.schedule_value,
                &job.timezone,
                Utc::now(),
            )
            .unwrap_or(None);
            if let Err(e) =
                store.record_host_job_run(&job.id, &run_at, &result, next_run.as_deref())
            {
                error!(job_id = %job.id, error = %e, "failed to record host job run");
            }
            in_flight.lock().unwrap().remove(&job.id);
            Ok::<(), String>(())
        });
    }
}

/// Run a shell command with timeout, returning a one-line result summary.
async fn run_shell(command: &str, cwd: Option<&str>, timeout_seconds: u64) -> String {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let output = tokio::time::timeout(Duration::from_secs(timeout_seconds), cmd.output()).await;
    match output {
        Ok(Ok(out)) => {
            let code = out.status.code().unwrap_or(-1);
            let tail: String = String::from_utf8_lossy(&out.stdout)
                .chars()
                .rev()
                .take(500)
                .collect::<String>()
                .chars()
                .rev()
                .collect();
            if code == 0 {
                format!("exit 0: {}", tail.trim())
            } else {
                let stderr_tail: String = String::from_utf8_lossy(&out.stderr)
                    .chars()
                    .rev()
                    .take(500)
                    .collect::<String>()
                    .chars()
                    .rev()
                    .collect();
                warn!(code, "host job exited non-zero");
                format!("exit {code}: {}", stderr_tail.trim())
            }
        }
        Ok(Err(e)) => format!("spawn error: {e}"),
        Err(_) => {
            warn!(timeout_seconds, "host job timed out");
            format!("timed out after {timeout_seconds}s")
        }
    }
}

/// Mark tasks completed when [`TaskStatus`] bookkeeping finds them
/// exhausted at startup (next_run gone but status still active).
pub fn reconcile_task_status(store: &Store) {
    if let Ok(tasks) = store.list_tasks(None) {
        for task in tasks {
            if task.status == TaskStatus::Active && task.next_run.is_none() {
                let _ = store.set_task_status(&task.id, TaskStatus::Completed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pynchy_core::types::ScheduleType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingInvoker {
        calls: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl TaskInvoker for RecordingInvoker {
        async fn invoke_task(&self, task: ScheduledTask) -> Result<String, String> {
            self.calls.lock().unwrap().push(task.id.clone());
            if self.fail {
                Err("agent crashed".into())
            } else {
                Ok("done".into())
            }
        }
    }

    fn due_task(id: &str, schedule_type: ScheduleType, value: &str) -> ScheduledTask {
        ScheduledTask {
            id: id.into(),
            group_folder: "dev".into(),
            chat_jid: "g1@x".into(),
            prompt: "check builds".into(),
            schedule_type,
            schedule_value: value.into(),
            timezone: "UTC".into(),
            status: TaskStatus::Active,
            next_run: Some("2020-01-01T00:00:00+00:00".into()),
            last_run: None,
            last_result: None,
            created_at: "2020-01-01T00:00:00+00:00".into(),
        }
    }

    fn scheduler_with(
        store: Arc<Store>,
        fail: bool,
    ) -> (TaskScheduler, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let invoker = Arc::new(RecordingInvoker {
            calls: Arc::clone(&calls),
            fail,
        });
        (
            TaskScheduler::new(
                store,
                GroupQueue::new(2, 0.01),
                invoker,
                Duration::from_secs(60),
            ),
            calls,
        )
    }

    #[tokio::test]
    async fn due_interval_task_runs_and_rolls_forward() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.create_task(&due_task("t1", ScheduleType::Interval, "60000")).unwrap();
        let (scheduler, calls) = scheduler_with(Arc::clone(&store), false);

        scheduler.tick().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*calls.lock().unwrap(), vec!["t1".to_string()]);
        let task = store.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(task.last_result.as_deref(), Some("done"));
        assert!(task.last_run.is_some());
        // next_run moved into the future.
        assert!(task.next_run.unwrap() > now_iso());
    }

    #[tokio::test]
    async fn once_task_completes_after_run() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .create_task(&due_task("t1", ScheduleType::Once, "2020-01-01T00:00:00+00:00"))
            .unwrap();
        let (scheduler, _calls) = scheduler_with(Arc::clone(&store), false);

        scheduler.tick().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let task = store.get_task("t1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.next_run.is_none());
    }

    #[tokio::test]
    async fn failed_task_records_error_but_still_rolls_forward() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.create_task(&due_task("t1", ScheduleType::Interval, "60000")).unwrap();
        let (scheduler, _calls) = scheduler_with(Arc::clone(&store), true);

        scheduler.tick().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let task = store.get_task("t1").unwrap().unwrap();
        assert!(task.last_result.unwrap().contains("agent crashed"));
        assert!(task.next_run.is_some());
    }

    #[tokio::test]
    async fn double_tick_does_not_double_fire() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.create_task(&due_task("t1", ScheduleType::Interval, "60000")).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        struct SlowInvoker(Arc<AtomicUsize>);
        #[async_trait]
        impl TaskInvoker for SlowInvoker {
            async fn invoke_task(&self, _task: ScheduledTask) -> Result<String, String> {
                self.0.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok("done".into())
            }
        }
        let scheduler = TaskScheduler::new(
            Arc::clone(&store),
            GroupQueue::new(2, 0.01),
            Arc::new(SlowInvoker(Arc::clone(&fired))),
            Duration::from_secs(60),
        );

        scheduler.tick().await;
        scheduler.tick().await; // task still in flight
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn host_job_executes_shell_and_records() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .create_host_job(&pynchy_core::types::HostJob {
                id: "host-echo".into(),
                name: "echo".into(),
                command: "echo hello-host".into(),
                schedule_type: ScheduleType::Interval,
                schedule_value: "3600000".into(),
                timezone: "UTC".into(),
                status: TaskStatus::Active,
                next_run: Some("2020-01-01T00:00:00+00:00".into()),
                last_run: None,
                last_result: None,
                created_at: "2020-01-01T00:00:00+00:00".into(),
                created_by: "admin".into(),
                cwd: None,
                timeout_seconds: 30,
            })
            .unwrap();
        let (scheduler, calls) = scheduler_with(Arc::clone(&store), false);

        scheduler.tick().await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // No agent involvement for host jobs.
        assert!(calls.lock().unwrap().is_empty());
        let job = store.get_host_job("host-echo").unwrap().unwrap();
        let result = job.last_result.unwrap();
        assert!(result.starts_with("exit 0"), "{result}");
        assert!(result.contains("hello-host"));
    }
}
