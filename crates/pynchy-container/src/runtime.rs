//! Container runtime abstraction. Docker-style CLIs are built in; other
//! runtimes implement the same trait.

use async_trait::async_trait;
use pynchy_core::{PynchyError, Result};
use tokio::process::Command;
use tracing::{debug, warn};

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;
    /// CLI binary invoked for `run`/`ps`/`kill`.
    fn cli(&self) -> &str;
    async fn is_available(&self) -> bool;
    /// Verify the daemon responds; error is terminal at startup.
    async fn ensure_running(&self) -> Result<()>;
    /// Running container names matching `prefix` — orphan discovery.
    async fn list_running(&self, prefix: &str) -> Vec<String>;
    /// Force-stop a container by name.
    async fn stop(&self, name: &str) -> Result<()>;
}

/// Runtime backed by a docker-compatible CLI (`docker`, `podman`, …).
pub struct CliRuntime {
    cli: String,
}

impl CliRuntime {
    pub fn new(cli: &str) -> Self {
        Self { cli: cli.to_string() }
    }
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    fn name(&self) -> &str {
        &self.cli
    }

    fn cli(&self) -> &str {
        &self.cli
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.cli)
            .arg("--version")
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    async fn ensure_running(&self) -> Result<()> {
        let out = Command::new(&self.cli)
            .arg("info")
            .output()
            .await
            .map_err(|e| PynchyError::Container(format!("{} not found: {e}", self.cli)))?;
        if !out.status.success() {
            return Err(PynchyError::Container(format!(
                "{} daemon is not running",
                self.cli
            )));
        }
        debug!(runtime = %self.cli, "container daemon is running");
        Ok(())
    }

    async fn list_running(&self, prefix: &str) -> Vec<String> {
        let out = match Command::new(&self.cli)
            .args(["ps", "--format", "{{.Names}}"])
            .output()
            .await
        {
            Ok(out) => out,
            Err(e) => {
                warn!(runtime = %self.cli, error = %e, "failed to list containers");
                return Vec::new();
            }
        };
        String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty() && name.starts_with(prefix))
            .map(String::from)
            .collect()
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let out = Command::new(&self.cli)
            .args(["kill", name])
            .output()
            .await
            .map_err(|e| PynchyError::Container(e.to_string()))?;
        if !out.status.success() {
            return Err(PynchyError::Container(format!(
                "kill {name} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Kill containers left over from a prior crash. Names are deterministic
/// (`<prefix>-<folder>-<ms>`) so anything matching the prefix is ours.
pub async fn kill_orphans(runtime: &dyn ContainerRuntime, prefix: &str) -> usize {
    let orphans = runtime.list_running(prefix).await;
    let mut killed = 0;
    for name in &orphans {
        match runtime.stop(name).await {
            Ok(()) => {
                warn!(container = %name, "killed orphaned container from prior run");
                killed += 1;
            }
            Err(e) => warn!(container = %name, error = %e, "failed to kill orphan"),
        }
    }
    killed
}
