//! Filesystem watcher feeding the IPC dispatcher.
//!
//! A `notify` watcher thread observes the IPC root recursively and posts
//! paths into an mpsc channel; a consumer task on the runtime classifies
//! each path (tier request vs approval decision), parses, deletes the
//! file, and dispatches. The watcher thread itself never parses or blocks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::decisions::process_approval_decision;
use crate::deps::IpcDeps;
use crate::protocol::{parse_ipc_file, validate_signal};
use crate::registry::HandlerRegistry;

/// What a created path turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
enum IpcFileKind {
    /// `<root>/<folder>/tasks/<ns>.json` — a tier-1 signal or tier-2 request.
    Request { folder: String },
    /// `<root>/<folder>/approval_decisions/<req>.json` — a human decision.
    Decision { folder: String },
}

/// Classify a path under the IPC root. `.tmp` files and unrelated
/// directories return `None`.
fn classify(ipc_root: &Path, path: &Path) -> Option<IpcFileKind> {
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
        return None;
    }
    let rel = path.strip_prefix(ipc_root).ok()?;
    let mut parts = rel.components().filter_map(|c| c.as_os_str().to_str());
    let folder = parts.next()?.to_string();
    let dir = parts.next()?;
    let _file = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    match dir {
        "tasks" => Some(IpcFileKind::Request { folder }),
        "approval_decisions" => Some(IpcFileKind::Decision { folder }),
        _ => None,
    }
}

/// Handle to the running watcher. Dropping it stops the notify thread.
pub struct IpcWatcher {
    _watcher: RecommendedWatcher,
    consumer: tokio::task::JoinHandle<()>,
}

impl IpcWatcher {
    /// Watch `ipc_root` and dispatch through `registry`. The consumer task
    /// runs until the handle is dropped or the channel closes.
    pub fn start(
        ipc_root: PathBuf,
        registry: Arc<HandlerRegistry>,
        deps: Arc<IpcDeps>,
    ) -> pynchy_core::Result<Self> {
        std::fs::create_dir_all(&ipc_root)?;
        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();

        // The notify callback runs on the watcher thread — it must stay
        // cheap: filter to create/rename events and forward the path.
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let Ok(event) = res else { return };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            for path in event.paths {
                let _ = tx.send(path);
            }
        })
        .map_err(|e| pynchy_core::PynchyError::Internal(format!("watcher init: {e}")))?;
        watcher
            .watch(&ipc_root, RecursiveMode::Recursive)
            .map_err(|e| pynchy_core::PynchyError::Internal(format!("watch {}: {e}", ipc_root.display())))?;

        let consumer = tokio::spawn(consume(ipc_root, rx, registry, deps));
        info!("IPC watcher started");
        Ok(Self {
            _watcher: watcher,
            consumer,
        })
    }

    pub fn stop(self) {
        self.consumer.abort();
    }
}

async fn consume(
    ipc_root: PathBuf,
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    registry: Arc<HandlerRegistry>,
    deps: Arc<IpcDeps>,
) {
    while let Some(path) = rx.recv().await {
        let Some(kind) = classify(&ipc_root, &path) else {
            continue;
        };
        if !path.exists() {
            continue; // already consumed (rename storms deliver duplicates)
        }
        match kind {
            IpcFileKind::Request { folder } => {
                process_request_file(&path, &folder, &registry, &deps).await;
            }
            IpcFileKind::Decision { folder } => {
                process_approval_decision(&path, &folder, &registry, Arc::clone(&deps)).await;
            }
        }
    }
    debug!("IPC consumer channel closed");
}

/// Parse, delete, dispatch. Malformed files are logged and removed so one
/// bad payload never wedges the directory.
async fn process_request_file(
    path: &Path,
    folder: &str,
    registry: &HandlerRegistry,
    deps: &Arc<IpcDeps>,
) {
    let data = match parse_ipc_file(path) {
        Ok(data) => data,
        Err(e) => {
            error!(path = %path.display(), error = %e, "malformed IPC file — removed");
            let _ = std::fs::remove_file(path);
            return;
        }
    };
    let _ = std::fs::remove_file(path);

    let is_admin = deps
        .store
        .get_group_by_folder(folder)
        .ok()
        .flatten()
        .map(|p| p.is_admin)
        .unwrap_or(false);

    match validate_signal(&data) {
        Ok(Some(signal)) => {
            handle_signal(&signal, deps);
        }
        Ok(None) => {
            registry.dispatch(data, folder, is_admin, Arc::clone(deps)).await;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid signal — dropped");
        }
    }
}

fn handle_signal(signal: &str, deps: &Arc<IpcDeps>) {
    match signal {
        "refresh_groups" => {
            info!("refresh_groups signal received");
            (deps.on_refresh_groups)();
        }
        other => warn!(signal = other, "validated signal with no handler"),
    }
}

/// Drain request files already sitting in the tasks directories — crash
/// recovery for files written while the host was down. Processed in
/// filename-sort order per workspace (names are monotonic ns counters).
pub async fn drain_existing(
    ipc_root: &Path,
    registry: &HandlerRegistry,
    deps: &Arc<IpcDeps>,
) {
    let Ok(entries) = std::fs::read_dir(ipc_root) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let folder_path = entry.path();
        if !folder_path.is_dir() {
            continue;
        }
        let Some(folder) = folder_path.file_name().and_then(|n| n.to_str()).map(String::from)
        else {
            continue;
        };
        let tasks_dir = folder_path.join("tasks");
        let Ok(files) = std::fs::read_dir(&tasks_dir) else {
            continue;
        };
        let mut paths: Vec<PathBuf> = files
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();
        for path in paths {
            process_request_file(&path, &folder, registry, deps).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_routes_tasks_and_decisions() {
        let root = Path::new("/data/ipc");
        assert_eq!(
            classify(root, Path::new("/data/ipc/dev/tasks/123abc.json")),
            Some(IpcFileKind::Request { folder: "dev".into() })
        );
        assert_eq!(
            classify(root, Path::new("/data/ipc/dev/approval_decisions/req.json")),
            Some(IpcFileKind::Decision { folder: "dev".into() })
        );
        // tmp files, other dirs, and nested paths are ignored.
        assert_eq!(classify(root, Path::new("/data/ipc/dev/tasks/123.json.tmp")), None);
        assert_eq!(classify(root, Path::new("/data/ipc/dev/responses/r.json")), None);
        assert_eq!(classify(root, Path::new("/data/ipc/dev/tasks/sub/x.json")), None);
        assert_eq!(classify(root, Path::new("/elsewhere/dev/tasks/x.json")), None);
    }
}
