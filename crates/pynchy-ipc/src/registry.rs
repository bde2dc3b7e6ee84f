//! Typed handler registry: exact `type` values plus an ordered list of
//! `type:` prefixes. Exact matches win; unknown types are logged and
//! dropped. Dispatch happens on the async runtime, never on the watcher
//! thread.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::deps::IpcDeps;

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// `(data, source_workspace_folder, is_admin, deps)` → unit future.
pub type Handler =
    Arc<dyn Fn(Value, String, bool, Arc<IpcDeps>) -> HandlerFuture + Send + Sync>;

/// Immutable after construction; handlers register during startup.
#[derive(Default)]
pub struct HandlerRegistry {
    exact: HashMap<String, Handler>,
    prefixes: Vec<(String, Handler)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an exact `type` value.
    pub fn register(&mut self, type_name: &str, handler: Handler) {
        if self.exact.insert(type_name.to_string(), handler).is_some() {
            warn!(type_name, "handler re-registered, previous replaced");
        }
    }

    /// Register a handler for a `type:` prefix family. Prefixes are
    /// consulted in registration order after exact lookup fails.
    pub fn register_prefix(&mut self, prefix: &str, handler: Handler) {
        self.prefixes.push((prefix.to_string(), handler));
    }

    /// Route one tier-2 request. Unknown types are logged and dropped.
    pub async fn dispatch(
        &self,
        data: Value,
        source_folder: &str,
        is_admin: bool,
        deps: Arc<IpcDeps>,
    ) {
        let Some(type_name) = data.get("type").and_then(|v| v.as_str()).map(String::from) else {
            warn!(source_folder, "IPC request missing type — dropped");
            return;
        };

        let handler = self.exact.get(&type_name).cloned().or_else(|| {
            self.prefixes
                .iter()
                .find(|(prefix, _)| type_name.starts_with(prefix.as_str()))
                .map(|(_, h)| h.clone())
        });

        match handler {
            Some(handler) => {
                info!(type_name, source_folder, is_admin, "dispatching IPC request");
                handler(data, source_folder.to_string(), is_admin, deps).await;
            }
            None => {
                warn!(type_name, source_folder, "unknown IPC type — dropped");
            }
        }
    }

    pub fn has_handler(&self, type_name: &str) -> bool {
        self.exact.contains_key(type_name)
            || self
                .prefixes
                .iter()
                .any(|(prefix, _)| type_name.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::{NullBroadcaster, NullContainers, NullServices, NullWorktree};
    use pynchy_security::cop::AllowAllCop;
    use pynchy_security::gate::GateRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_deps() -> Arc<IpcDeps> {
        Arc::new(IpcDeps {
            config: Arc::new(pynchy_core::config::PynchyConfig::default()),
            store: Arc::new(pynchy_store::Store::open_in_memory().unwrap()),
            gates: Arc::new(GateRegistry::new()),
            cop: Arc::new(AllowAllCop),
            queue: pynchy_queue::GroupQueue::new(1, 0.01),
            broadcaster: Arc::new(NullBroadcaster),
            worktree: Arc::new(NullWorktree),
            services: Arc::new(NullServices),
            containers: Arc::new(NullContainers),
            on_refresh_groups: Arc::new(|| {}),
        })
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_data, _folder, _admin, _deps| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn exact_match_wins_over_prefix() {
        let mut registry = HandlerRegistry::new();
        let exact_hits = Arc::new(AtomicUsize::new(0));
        let prefix_hits = Arc::new(AtomicUsize::new(0));
        registry.register("service:special", counting_handler(Arc::clone(&exact_hits)));
        registry.register_prefix("service:", counting_handler(Arc::clone(&prefix_hits)));

        let deps = test_deps();
        registry
            .dispatch(
                serde_json::json!({"type": "service:special"}),
                "dev",
                false,
                Arc::clone(&deps),
            )
            .await;
        registry
            .dispatch(
                serde_json::json!({"type": "service:other"}),
                "dev",
                false,
                deps,
            )
            .await;

        assert_eq!(exact_hits.load(Ordering::SeqCst), 1);
        assert_eq!(prefix_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_type_is_dropped() {
        let registry = HandlerRegistry::new();
        // Nothing to assert beyond "does not panic".
        registry
            .dispatch(
                serde_json::json!({"type": "never_registered"}),
                "dev",
                false,
                test_deps(),
            )
            .await;
        registry
            .dispatch(serde_json::json!({"no_type": 1}), "dev", false, test_deps())
            .await;
    }

    #[test]
    fn has_handler_checks_both_tables() {
        let mut registry = HandlerRegistry::new();
        registry.register("reset_context", counting_handler(Arc::new(AtomicUsize::new(0))));
        registry.register_prefix("security:", counting_handler(Arc::new(AtomicUsize::new(0))));
        assert!(registry.has_handler("reset_context"));
        assert!(registry.has_handler("security:bash_check"));
        assert!(!registry.has_handler("nope"));
    }
}
