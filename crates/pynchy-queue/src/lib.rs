//! Per-workspace work queue and scheduler.
//!
//! Three invariants hold at all times:
//!
//! 1. At most one container runs per workspace.
//! 2. At most `max_concurrent` containers run process-wide.
//! 3. Within a workspace, pending tasks drain before fresh message checks.
//!
//! Failed message processing retries with exponential backoff
//! (`base_retry_seconds * 2^attempt`, up to [`MAX_RETRIES`] attempts);
//! after that the workspace is left alone until a fresh enqueue arrives.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Invoked to process pending messages for a jid. Returns `false` to
/// request a retry with backoff.
pub type MessageProcessor = Arc<dyn Fn(String) -> BoxFuture<bool> + Send + Sync>;

/// Invoked to stop the active container for a jid, if any.
pub type StopFn = Arc<dyn Fn(String) -> BoxFuture<()> + Send + Sync>;

/// A queued ad-hoc task: invoked once during the drain, ahead of message
/// processing.
pub type TaskProducer = Box<dyn FnOnce() -> BoxFuture<()> + Send>;

/// Message-check retry ceiling (initial attempt not counted).
pub const MAX_RETRIES: u32 = 5;

struct QueuedTask {
    id: String,
    producer: TaskProducer,
}

#[derive(Default)]
struct GroupState {
    tasks: VecDeque<QueuedTask>,
    needs_message_check: bool,
    active: bool,
    /// True while the drain loop is running a queued task (not a message
    /// check); routes notices that depend on invocation kind.
    running_task: bool,
    attempt: u32,
    retry_handle: Option<JoinHandle<()>>,
}

struct Inner {
    states: Mutex<HashMap<String, GroupState>>,
    semaphore: Arc<Semaphore>,
    process_fn: Mutex<Option<MessageProcessor>>,
    stop_fn: Mutex<Option<StopFn>>,
    drains: Mutex<HashMap<String, JoinHandle<()>>>,
    base_retry_seconds: f64,
    stopped: AtomicBool,
}

/// Serializes container work per workspace under a global concurrency cap.
#[derive(Clone)]
pub struct GroupQueue {
    inner: Arc<Inner>,
}

impl GroupQueue {
    pub fn new(max_concurrent: usize, base_retry_seconds: f64) -> Self {
        Self {
            inner: Arc::new(Inner {
                states: Mutex::new(HashMap::new()),
                semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
                process_fn: Mutex::new(None),
                stop_fn: Mutex::new(None),
                drains: Mutex::new(HashMap::new()),
                base_retry_seconds,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Install the message processor. Must be called before any enqueue.
    pub fn set_process_messages_fn(&self, f: MessageProcessor) {
        *self.inner.process_fn.lock().unwrap() = Some(f);
    }

    /// Install the container stopper used by [`stop_active_process`].
    ///
    /// [`stop_active_process`]: GroupQueue::stop_active_process
    pub fn set_stop_fn(&self, f: StopFn) {
        *self.inner.stop_fn.lock().unwrap() = Some(f);
    }

    /// Flag a workspace as having unread messages and kick its drain.
    pub fn enqueue_message_check(&self, jid: &str) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            debug!(jid, "queue stopped — dropping message check");
            return;
        }
        let spawn = {
            let mut states = self.inner.states.lock().unwrap();
            let state = states.entry(jid.to_string()).or_default();
            state.needs_message_check = true;
            !state.active
        };
        if spawn {
            self.spawn_drain(jid);
        }
    }

    /// Queue an ad-hoc task. Tasks always run before the next message
    /// check of the same drain cycle.
    pub fn enqueue_task(&self, jid: &str, id: &str, producer: TaskProducer) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            debug!(jid, task = id, "queue stopped — dropping task");
            return;
        }
        let spawn = {
            let mut states = self.inner.states.lock().unwrap();
            let state = states.entry(jid.to_string()).or_default();
            state.tasks.push_back(QueuedTask {
                id: id.to_string(),
                producer,
            });
            !state.active
        };
        if spawn {
            self.spawn_drain(jid);
        }
    }

    /// Drop all queued (not yet started) tasks for a workspace.
    pub fn clear_pending_tasks(&self, jid: &str) -> usize {
        let mut states = self.inner.states.lock().unwrap();
        match states.get_mut(jid) {
            Some(state) => {
                let n = state.tasks.len();
                state.tasks.clear();
                n
            }
            None => 0,
        }
    }

    /// Whether the workspace's current drain is executing a queued task.
    pub fn is_active_task(&self, jid: &str) -> bool {
        let states = self.inner.states.lock().unwrap();
        states.get(jid).map(|s| s.running_task).unwrap_or(false)
    }

    /// Whether any work is in flight for the workspace.
    pub fn is_active(&self, jid: &str) -> bool {
        let states = self.inner.states.lock().unwrap();
        states.get(jid).map(|s| s.active).unwrap_or(false)
    }

    /// Stop the active container for a workspace via the installed stopper.
    pub async fn stop_active_process(&self, jid: &str) {
        let stop = self.inner.stop_fn.lock().unwrap().clone();
        match stop {
            Some(f) => f(jid.to_string()).await,
            None => warn!(jid, "stop requested but no stop_fn installed"),
        }
    }

    /// Stop accepting work, cancel retry timers, and wait up to `timeout`
    /// for active drains; whatever is still running is aborted.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        {
            let mut states = self.inner.states.lock().unwrap();
            for state in states.values_mut() {
                if let Some(handle) = state.retry_handle.take() {
                    handle.abort();
                }
                state.tasks.clear();
                state.needs_message_check = false;
            }
        }
        let handles: Vec<(String, JoinHandle<()>)> =
            self.inner.drains.lock().unwrap().drain().collect();
        let wait_all = async {
            for (_, handle) in &handles {
                // Abort-safe: aborted handles resolve with a JoinError.
                while !handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        };
        if tokio::time::timeout(timeout, wait_all).await.is_err() {
            for (jid, handle) in &handles {
                if !handle.is_finished() {
                    warn!(jid, "drain did not finish in time — aborting");
                    handle.abort();
                }
            }
        }
        info!("group queue shut down");
    }

    // --- drain loop --------------------------------------------------------

    fn spawn_drain(&self, jid: &str) {
        {
            let mut states = self.inner.states.lock().unwrap();
            let state = states.entry(jid.to_string()).or_default();
            if state.active {
                return;
            }
            state.active = true;
        }
        let queue = self.clone();
        let jid = jid.to_string();
        let handle = tokio::spawn({
            let jid = jid.clone();
            async move {
                queue.drain(&jid).await;
            }
        });
        self.inner.drains.lock().unwrap().insert(jid, handle);
    }

    async fn drain(&self, jid: &str) {
        let permit = match Arc::clone(&self.inner.semaphore).acquire_owned().await {
            Ok(p) => p,
            Err(_) => return, // semaphore closed — shutting down
        };

        let mut failed = false;
        loop {
            // Tasks first, strictly before any message check.
            loop {
                let task = {
                    let mut states = self.inner.states.lock().unwrap();
                    let state = states.entry(jid.to_string()).or_default();
                    let task = state.tasks.pop_front();
                    state.running_task = task.is_some();
                    task
                };
                match task {
                    Some(task) => {
                        debug!(jid, task = %task.id, "running queued task");
                        (task.producer)().await;
                    }
                    None => break,
                }
            }

            let needs_check = {
                let mut states = self.inner.states.lock().unwrap();
                let state = states.entry(jid.to_string()).or_default();
                let needs = state.needs_message_check;
                state.needs_message_check = false;
                needs
            };

            if needs_check {
                let process = self.inner.process_fn.lock().unwrap().clone();
                let ok = match process {
                    Some(f) => f(jid.to_string()).await,
                    None => {
                        error!(jid, "no message processor installed");
                        true
                    }
                };
                if !ok {
                    failed = true;
                    break;
                }
            }

            // Work that re-appeared while we were busy loops in this cycle;
            // an empty state ends it.
            let more = {
                let states = self.inner.states.lock().unwrap();
                states
                    .get(jid)
                    .map(|s| !s.tasks.is_empty() || s.needs_message_check)
                    .unwrap_or(false)
            };
            if !more {
                break;
            }
        }

        drop(permit);

        if failed {
            self.schedule_retry(jid);
        } else {
            let mut states = self.inner.states.lock().unwrap();
            if let Some(state) = states.get_mut(jid) {
                state.active = false;
                state.running_task = false;
                state.attempt = 0;
            }
        }
        self.inner.drains.lock().unwrap().remove(jid);

        // Guard against the enqueue-after-loop-check race: if work slipped
        // in between the final check and the active flip, re-kick.
        if !failed {
            let respawn = {
                let states = self.inner.states.lock().unwrap();
                states
                    .get(jid)
                    .map(|s| !s.active && (!s.tasks.is_empty() || s.needs_message_check))
                    .unwrap_or(false)
            };
            if respawn && !self.inner.stopped.load(Ordering::SeqCst) {
                self.spawn_drain(jid);
            }
        }
    }

    fn schedule_retry(&self, jid: &str) {
        let attempt = {
            let mut states = self.inner.states.lock().unwrap();
            let state = states.entry(jid.to_string()).or_default();
            state.active = false;
            state.running_task = false;
            state.attempt += 1;
            state.attempt
        };
        if attempt > MAX_RETRIES {
            warn!(jid, attempts = attempt - 1, "giving up until next enqueue");
            let mut states = self.inner.states.lock().unwrap();
            if let Some(state) = states.get_mut(jid) {
                state.attempt = 0;
            }
            return;
        }
        let delay =
            Duration::from_secs_f64(self.inner.base_retry_seconds * 2f64.powi(attempt as i32 - 1));
        info!(jid, attempt, delay_secs = delay.as_secs_f64(), "scheduling retry");
        let queue = self.clone();
        let jid_owned = jid.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut states = queue.inner.states.lock().unwrap();
                if let Some(state) = states.get_mut(&jid_owned) {
                    state.retry_handle = None;
                }
            }
            queue.enqueue_message_check(&jid_owned);
        });
        let mut states = self.inner.states.lock().unwrap();
        if let Some(state) = states.get_mut(jid) {
            if let Some(old) = state.retry_handle.replace(handle) {
                old.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn counting_processor(
        active: Arc<AtomicU32>,
        max_seen: Arc<AtomicU32>,
        hold: Duration,
        ok: bool,
    ) -> MessageProcessor {
        Arc::new(move |_jid| {
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            Box::pin(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(hold).await;
                active.fetch_sub(1, Ordering::SeqCst);
                ok
            })
        })
    }

    #[tokio::test]
    async fn one_container_per_workspace() {
        let queue = GroupQueue::new(2, 0.05);
        let active = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        queue.set_process_messages_fn(counting_processor(
            Arc::clone(&active),
            Arc::clone(&max_seen),
            Duration::from_millis(50),
            true,
        ));

        queue.enqueue_message_check("g1@x");
        queue.enqueue_message_check("g1@x");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn respects_global_concurrency_cap() {
        let queue = GroupQueue::new(2, 0.05);
        let active = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        queue.set_process_messages_fn(counting_processor(
            Arc::clone(&active),
            Arc::clone(&max_seen),
            Duration::from_millis(60),
            true,
        ));

        queue.enqueue_message_check("g1@x");
        queue.enqueue_message_check("g2@x");
        queue.enqueue_message_check("g3@x");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(active.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        // All three got a turn, never more than two at once.
        assert_eq!(max_seen.load(Ordering::SeqCst), 2);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tasks_drain_before_message_check() {
        let queue = GroupQueue::new(2, 0.05);
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let gate = Arc::new(tokio::sync::Notify::new());
        let first_call = Arc::new(AtomicBool::new(true));

        {
            let order = Arc::clone(&order);
            let gate = Arc::clone(&gate);
            let first_call = Arc::clone(&first_call);
            queue.set_process_messages_fn(Arc::new(move |_jid| {
                let order = Arc::clone(&order);
                let gate = Arc::clone(&gate);
                let first = first_call.swap(false, Ordering::SeqCst);
                Box::pin(async move {
                    if first {
                        gate.notified().await;
                    }
                    order.lock().unwrap().push("messages");
                    true
                })
            }));
        }

        // First check occupies the active slot.
        queue.enqueue_message_check("g1@x");
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Queue a task and another check while busy.
        let order_clone = Arc::clone(&order);
        queue.enqueue_task(
            "g1@x",
            "t1",
            Box::new(move || {
                let order = Arc::clone(&order_clone);
                Box::pin(async move {
                    order.lock().unwrap().push("task");
                })
            }),
        );
        queue.enqueue_message_check("g1@x");

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let recorded = order.lock().unwrap().clone();
        assert_eq!(recorded, vec!["messages", "task", "messages"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_exponential_backoff() {
        let queue = GroupQueue::new(2, 1.0);
        let calls = Arc::new(AtomicU32::new(0));
        {
            let calls = Arc::clone(&calls);
            queue.set_process_messages_fn(Arc::new(move |_jid| {
                let calls = Arc::clone(&calls);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    false
                })
            }));
        }

        queue.enqueue_message_check("g1@x");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // First retry after 1s (base * 2^0).
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Second retry after a further 2s.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_retrying_after_max_attempts() {
        let queue = GroupQueue::new(2, 0.01);
        let calls = Arc::new(AtomicU32::new(0));
        {
            let calls = Arc::clone(&calls);
            queue.set_process_messages_fn(Arc::new(move |_jid| {
                let calls = Arc::clone(&calls);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    false
                })
            }));
        }

        queue.enqueue_message_check("g1@x");
        tokio::time::sleep(Duration::from_secs(60)).await;
        // Initial call + MAX_RETRIES retries, then silence.
        assert_eq!(calls.load(Ordering::SeqCst), 1 + MAX_RETRIES);
    }

    #[tokio::test]
    async fn shutdown_drops_new_enqueues() {
        let queue = GroupQueue::new(2, 0.05);
        let calls = Arc::new(AtomicU32::new(0));
        {
            let calls = Arc::clone(&calls);
            queue.set_process_messages_fn(Arc::new(move |_jid| {
                let calls = Arc::clone(&calls);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    true
                })
            }));
        }

        queue.shutdown(Duration::from_secs(1)).await;
        queue.enqueue_message_check("g1@x");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn waiting_workspace_starts_when_slot_frees() {
        let queue = GroupQueue::new(2, 0.05);
        let processed = Arc::new(Mutex::new(Vec::<String>::new()));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        {
            let processed = Arc::clone(&processed);
            let gate = Arc::clone(&gate);
            queue.set_process_messages_fn(Arc::new(move |jid| {
                let processed = Arc::clone(&processed);
                let gate = Arc::clone(&gate);
                Box::pin(async move {
                    processed.lock().unwrap().push(jid);
                    let _ = gate.acquire().await;
                    true
                })
            }));
        }

        queue.enqueue_message_check("g1@x");
        queue.enqueue_message_check("g2@x");
        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.enqueue_message_check("g3@x");
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(processed.lock().unwrap().len(), 2);

        gate.add_permits(3);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(processed.lock().unwrap().iter().any(|j| j == "g3@x"));
    }

    #[tokio::test]
    async fn clear_pending_tasks_drops_queued_work() {
        let queue = GroupQueue::new(1, 0.05);
        let ran = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(tokio::sync::Notify::new());
        {
            let gate = Arc::clone(&gate);
            queue.set_process_messages_fn(Arc::new(move |_jid| {
                let gate = Arc::clone(&gate);
                Box::pin(async move {
                    gate.notified().await;
                    true
                })
            }));
        }

        queue.enqueue_message_check("g1@x");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ran_clone = Arc::clone(&ran);
        queue.enqueue_task(
            "g1@x",
            "t1",
            Box::new(move || {
                let ran = Arc::clone(&ran_clone);
                Box::pin(async move {
                    ran.store(true, Ordering::SeqCst);
                })
            }),
        );
        assert_eq!(queue.clear_pending_tasks("g1@x"), 1);

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }
}
