//! Spawn one container invocation and consume its event stream.
//!
//! The initial input is written to `input/initial.json` before spawn (the
//! container deletes it on first read). Stdout lines parse into
//! [`AgentEvent`]s forwarded to the caller's channel; a `result` event
//! ends the stream. A resettable idle timer closes the container's stdin
//! after a quiet period, initiating graceful shutdown.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use pynchy_core::config::PynchyConfig;
use pynchy_core::util::write_json_atomic;
use pynchy_core::{PynchyError, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{AgentEvent, ContainerInput};
use crate::mounts::{build_container_args, container_name, VolumeMount};
use crate::runtime::ContainerRuntime;

/// How one invocation ended.
#[derive(Debug, Clone, Default)]
pub struct ContainerOutcome {
    pub session_id: Option<String>,
    pub error: Option<String>,
    /// A `result` event was seen before exit.
    pub completed: bool,
}

/// Grace period between stdin close and force kill.
const STOP_GRACE: Duration = Duration::from_secs(30);

/// Write the startup payload, spawn the container, stream its events into
/// `events_tx`, and wait for exit.
///
/// Returns `Err` only for spawn-level failures; in-agent errors come back
/// in the outcome. A missing `result` event (crash, OOM kill) yields
/// `completed = false` so the caller can emit the host notice and let the
/// queue's retry backoff take over.
pub async fn run_container(
    runtime: &dyn ContainerRuntime,
    config: &PynchyConfig,
    folder: &str,
    idle_timeout: Duration,
    mounts: &[VolumeMount],
    input: &ContainerInput,
    events_tx: mpsc::Sender<AgentEvent>,
) -> Result<ContainerOutcome> {
    let name = container_name(config, folder, input.invocation_ts);

    let input_dir = config.ipc_dir(folder).join("input");
    write_json_atomic(&input_dir.join("initial.json"), input)?;

    let args = build_container_args(config, mounts, &name);
    info!(container = %name, folder, "spawning container");
    let mut child = Command::new(runtime.cli())
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PynchyError::Container(format!("spawn {name}: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PynchyError::Container("no stdout pipe".into()))?;
    let mut stdin = child.stdin.take();

    // Idle kick channel: the timer closes stdin from the stream loop so
    // the child handle stays owned here.
    let (idle_tx, mut idle_rx) = mpsc::channel::<()>(1);
    let mut idle_timer = pynchy_core::util::IdleTimer::new(idle_timeout, move || {
        let _ = idle_tx.try_send(());
    });
    idle_timer.reset();

    let mut lines = BufReader::new(stdout).lines();
    let mut outcome = ContainerOutcome::default();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        idle_timer.reset();
                        match serde_json::from_str::<AgentEvent>(line) {
                            Ok(event) => {
                                let done = event.is_result();
                                if let AgentEvent::Result { session_id, error, .. } = &event {
                                    outcome.session_id = session_id.clone();
                                    outcome.error = error.clone();
                                    outcome.completed = true;
                                }
                                if events_tx.send(event).await.is_err() {
                                    warn!(container = %name, "event consumer gone");
                                }
                                if done {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(container = %name, error = %e, line, "unparseable event line");
                            }
                        }
                    }
                    Ok(None) => break, // EOF without result event
                    Err(e) => {
                        warn!(container = %name, error = %e, "stdout read error");
                        break;
                    }
                }
            }
            _ = idle_rx.recv() => {
                info!(container = %name, "idle timeout — closing stdin");
                stdin.take(); // dropping the handle closes the pipe
                write_close_sentinel(&input_dir);
            }
        }
    }
    idle_timer.cancel();
    drop(stdin);

    // Give the container a grace period, then force-stop via the runtime.
    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(container = %name, code = status.code(), "container exited");
            if !outcome.completed && outcome.error.is_none() {
                outcome.error = Some(format!(
                    "container exited without result event (status {:?})",
                    status.code()
                ));
            }
        }
        Ok(Err(e)) => {
            outcome.error = Some(format!("wait failed: {e}"));
        }
        Err(_) => {
            warn!(container = %name, "container did not exit in grace period — killing");
            let _ = runtime.stop(&name).await;
            let _ = child.wait().await;
            if outcome.error.is_none() {
                outcome.error = Some("container force-killed after grace period".into());
            }
        }
    }

    Ok(outcome)
}

/// Ask a running container to wind down by dropping the `_close` sentinel
/// into its input directory.
pub fn write_close_sentinel(input_dir: &Path) {
    if let Err(e) = std::fs::write(input_dir.join("_close"), b"") {
        warn!(dir = %input_dir.display(), error = %e, "failed to write close sentinel");
    }
}

/// Queue a follow-up user message for a running container.
pub fn write_followup_message(input_dir: &Path, text: &str) -> Result<()> {
    let file = input_dir.join(format!("{}.json", chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()));
    write_json_atomic(&file, &serde_json::json!({ "type": "message", "text": text }))
}
