//! Per-invocation security gates and their process-wide registry.
//!
//! A gate owns the taint state for exactly one container invocation. Gates
//! are keyed by `(workspace_folder, invocation_ts)` so concurrent
//! invocations never share taint and every new invocation starts clean.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use pynchy_core::trust::WorkspaceSecurity;
use tracing::debug;

use crate::policy::{PolicyDecision, SecurityPolicy};

/// Security-evaluation object holding one invocation's sticky taint.
pub struct SecurityGate {
    pub workspace_folder: String,
    /// Invocation start, unix milliseconds. Part of the MCP proxy URL.
    pub invocation_ts: i64,
    policy: Mutex<SecurityPolicy>,
}

impl SecurityGate {
    pub fn new(workspace_folder: &str, invocation_ts: i64, security: WorkspaceSecurity) -> Self {
        Self {
            workspace_folder: workspace_folder.to_string(),
            invocation_ts,
            policy: Mutex::new(SecurityPolicy::new(security)),
        }
    }

    pub fn evaluate_read(&self, service: &str) -> PolicyDecision {
        self.policy.lock().unwrap().evaluate_read(service)
    }

    pub fn evaluate_write(&self, service: &str, payload: &serde_json::Value) -> PolicyDecision {
        self.policy.lock().unwrap().evaluate_write(service, payload)
    }

    pub fn notify_file_access(&self) {
        self.policy.lock().unwrap().notify_file_access()
    }

    pub fn corruption_tainted(&self) -> bool {
        self.policy.lock().unwrap().corruption_tainted()
    }

    pub fn secret_tainted(&self) -> bool {
        self.policy.lock().unwrap().secret_tainted()
    }
}

/// Registry of live gates. Shared across the IPC dispatcher, the MCP
/// proxy, and the container orchestrator.
#[derive(Default)]
pub struct GateRegistry {
    gates: DashMap<(String, i64), Arc<SecurityGate>>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a fresh (untainted) gate for an invocation.
    pub fn create_gate(
        &self,
        folder: &str,
        invocation_ts: i64,
        security: WorkspaceSecurity,
    ) -> Arc<SecurityGate> {
        let gate = Arc::new(SecurityGate::new(folder, invocation_ts, security));
        self.gates
            .insert((folder.to_string(), invocation_ts), Arc::clone(&gate));
        debug!(folder, invocation_ts, "security gate created");
        gate
    }

    pub fn get_gate(&self, folder: &str, invocation_ts: i64) -> Option<Arc<SecurityGate>> {
        self.gates
            .get(&(folder.to_string(), invocation_ts))
            .map(|entry| Arc::clone(&entry))
    }

    /// Latest gate for a workspace — used by handlers that know the folder
    /// but not the invocation timestamp.
    pub fn get_gate_for_group(&self, folder: &str) -> Option<Arc<SecurityGate>> {
        self.gates
            .iter()
            .filter(|entry| entry.key().0 == folder)
            .max_by_key(|entry| entry.key().1)
            .map(|entry| Arc::clone(&entry))
    }

    /// Drop a gate when its invocation exits.
    pub fn destroy_gate(&self, folder: &str, invocation_ts: i64) {
        if self.gates.remove(&(folder.to_string(), invocation_ts)).is_some() {
            debug!(folder, invocation_ts, "security gate destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gates_are_isolated_per_invocation() {
        let registry = GateRegistry::new();
        let g1 = registry.create_gate("dev", 1000, WorkspaceSecurity::default());
        let g2 = registry.create_gate("dev", 2000, WorkspaceSecurity::default());

        g1.evaluate_read("web"); // corruption taint on g1 only
        assert!(g1.corruption_tainted());
        assert!(!g2.corruption_tainted());
    }

    #[test]
    fn get_gate_for_group_returns_latest() {
        let registry = GateRegistry::new();
        registry.create_gate("dev", 1000, WorkspaceSecurity::default());
        registry.create_gate("dev", 3000, WorkspaceSecurity::default());
        registry.create_gate("ops", 2000, WorkspaceSecurity::default());

        let latest = registry.get_gate_for_group("dev").unwrap();
        assert_eq!(latest.invocation_ts, 3000);
        assert!(registry.get_gate_for_group("missing").is_none());
    }

    #[test]
    fn destroy_removes_gate() {
        let registry = GateRegistry::new();
        registry.create_gate("dev", 1000, WorkspaceSecurity::default());
        registry.destroy_gate("dev", 1000);
        assert!(registry.get_gate("dev", 1000).is_none());
    }
}
