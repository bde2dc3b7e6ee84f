//! Host configuration: `pynchy.toml` plus `PYNCHY_*` env overrides.
//!
//! Security posture resolves through a 4-level cascade, most specific wins:
//!
//! 1. `[workspace_defaults]`                          (global defaults)
//! 2. `[connection.<type>.<name>.security]`           (connection overrides)
//! 3. `[connection.<type>.<name>.chat.<id>.security]` (chat overrides)
//! 4. `[sandbox.<folder>]`                            (workspace overrides)
//!
//! At each level, set fields win over the previous layer; service trust
//! tables merge per-key.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{PynchyError, Result};
use crate::trust::{ServiceTrust, WorkspaceSecurity};

/// Top-level config (pynchy.toml + PYNCHY_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PynchyConfig {
    /// Root for all mutable state: sqlite db, ipc tree, group dirs, sessions.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Checkout of the orchestrated project (worktrees hang off this).
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,
    /// Default timezone for cron schedules.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub workspace_defaults: SecurityOverlay,
    /// `[connection.<type>.<name>]` — keyed by platform, then connection name.
    #[serde(default)]
    pub connection: HashMap<String, HashMap<String, ConnectionConfig>>,
    /// `[sandbox.<folder>]` — per-workspace overrides, most specific layer.
    #[serde(default)]
    pub sandbox: HashMap<String, SandboxConfig>,
    /// Named user groups expandable in allowed_users lists.
    #[serde(default)]
    pub user_groups: HashMap<String, Vec<String>>,
    /// Owner identity per channel platform (e.g. `slack = "U04ABC"`).
    #[serde(default)]
    pub owner: HashMap<String, String>,
    /// Host path prefixes permitted for additional container mounts.
    #[serde(default)]
    pub mount_allowlist: Vec<String>,
    /// Secret material; also sourced from env by the credentials writer.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

impl Default for PynchyConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            project_root: default_project_root(),
            timezone: default_timezone(),
            container: ContainerConfig::default(),
            deploy: DeployConfig::default(),
            queue: QueueConfig::default(),
            reconcile: ReconcileConfig::default(),
            workspace_defaults: SecurityOverlay::default(),
            connection: HashMap::new(),
            sandbox: HashMap::new(),
            user_groups: HashMap::new(),
            owner: HashMap::new(),
            mount_allowlist: Vec::new(),
            secrets: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default = "default_image")]
    pub image: String,
    /// Container names are `<prefix>-<folder>-<ms>` so orphans from prior
    /// crashes can be discovered and killed on startup.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Close container stdin after this many seconds without events.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Container runtime binary (`docker`, `podman`, `container`).
    #[serde(default = "default_runtime")]
    pub runtime: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            name_prefix: default_name_prefix(),
            max_concurrent: default_max_concurrent(),
            idle_timeout_secs: default_idle_timeout(),
            runtime: default_runtime(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default = "default_deploy_port")]
    pub port: u16,
    #[serde(default = "default_main_branch")]
    pub branch: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            port: default_deploy_port(),
            branch: default_main_branch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_base_retry_secs")]
    pub base_retry_seconds: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_retry_seconds: default_base_retry_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Seed lookback for (channel, jid) pairs with no cursor yet.
    #[serde(default = "default_lookback_hours")]
    pub initial_lookback_hours: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            initial_lookback_hours: default_lookback_hours(),
        }
    }
}

/// One configured connection (e.g. `[connection.slack.main]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub security: SecurityOverlay,
    #[serde(default)]
    pub chat: HashMap<String, ChatConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub security: SecurityOverlay,
}

/// Per-workspace sandbox settings (`[sandbox.<folder>]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Owning connection as `<platform>:<name>`; gates which channel
    /// reconciles this workspace.
    #[serde(default)]
    pub connection: Option<String>,
    /// Chat id within the connection, for the chat-level cascade layer.
    #[serde(default)]
    pub chat: Option<String>,
    /// Mount the project worktree into this workspace's containers.
    #[serde(default)]
    pub project_access: bool,
    #[serde(default)]
    pub git_policy: GitPolicy,
    /// MCP servers this workspace's containers may reach.
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(flatten)]
    pub security: SecurityOverlay,
}

/// How worktree commits reach main.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GitPolicy {
    #[default]
    MergeToMain,
    PullRequest,
}

/// One cascade layer. Unset fields defer to the previous layer; the
/// services table merges per-key instead of replacing wholesale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityOverlay {
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub allowed_users: Option<Vec<String>>,
    #[serde(default)]
    pub contains_secrets: Option<bool>,
    #[serde(default)]
    pub services: HashMap<String, ServiceTrust>,
}

/// Fully-resolved posture for a workspace after walking the cascade.
#[derive(Debug, Clone)]
pub struct ResolvedWorkspaceConfig {
    pub trigger: String,
    pub allowed_users: Vec<String>,
    pub security: WorkspaceSecurity,
    pub project_access: bool,
    pub git_policy: GitPolicy,
    pub mcp_servers: Vec<String>,
}

impl PynchyConfig {
    /// Load from a TOML file with `PYNCHY_*` env var overrides
    /// (`PYNCHY_CONTAINER__MAX_CONCURRENT=4` style nesting).
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        } else {
            figment = figment.merge(Toml::file("pynchy.toml"));
        }
        figment
            .merge(Env::prefixed("PYNCHY_").split("__"))
            .extract()
            .map_err(|e| PynchyError::Config(e.to_string()))
    }

    // --- path helpers ------------------------------------------------------

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("pynchy.db")
    }

    pub fn ipc_root(&self) -> PathBuf {
        self.data_dir.join("ipc")
    }

    pub fn ipc_dir(&self, folder: &str) -> PathBuf {
        self.ipc_root().join(folder)
    }

    pub fn groups_dir(&self) -> PathBuf {
        self.data_dir.join("groups")
    }

    pub fn sessions_dir(&self, folder: &str) -> PathBuf {
        self.data_dir.join("sessions").join(folder)
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.data_dir.join("worktrees")
    }

    /// Continuation file consumed by the next start after a failed deploy.
    pub fn rollback_file(&self) -> PathBuf {
        self.data_dir.join("rollback.json")
    }

    // --- cascade resolution ------------------------------------------------

    fn sandbox_connection(&self, folder: &str) -> Option<(&ConnectionConfig, Option<&ChatConfig>)> {
        let sandbox = self.sandbox.get(folder)?;
        let conn_ref = sandbox.connection.as_deref()?;
        let (platform, name) = conn_ref.split_once(':')?;
        let conn = self.connection.get(platform)?.get(name)?;
        let chat = sandbox.chat.as_deref().and_then(|c| conn.chat.get(c));
        Some((conn, chat))
    }

    /// Owning connection name (`<platform>:<name>`) for a workspace, if
    /// configured. Channels that are not the owner skip reconciliation.
    pub fn workspace_connection_name(&self, folder: &str) -> Option<String> {
        self.sandbox.get(folder)?.connection.clone()
    }

    /// Walk the cascade and return the effective config for `folder`.
    pub fn resolve_workspace(&self, folder: &str) -> ResolvedWorkspaceConfig {
        let mut trigger: Option<String> = None;
        let mut allowed_users: Option<Vec<String>> = None;
        let mut contains_secrets = false;
        let mut services: HashMap<String, ServiceTrust> = HashMap::new();

        let mut apply = |overlay: &SecurityOverlay| {
            if let Some(t) = &overlay.trigger {
                trigger = Some(t.clone());
            }
            if let Some(u) = &overlay.allowed_users {
                allowed_users = Some(u.clone());
            }
            if let Some(c) = overlay.contains_secrets {
                contains_secrets = c;
            }
            for (name, t) in &overlay.services {
                services.insert(name.clone(), *t);
            }
        };

        apply(&self.workspace_defaults);
        if let Some((conn, chat)) = self.sandbox_connection(folder) {
            apply(&conn.security);
            if let Some(chat) = chat {
                apply(&chat.security);
            }
        }
        let sandbox = self.sandbox.get(folder);
        if let Some(sb) = sandbox {
            apply(&sb.security);
        }

        ResolvedWorkspaceConfig {
            trigger: trigger.unwrap_or_else(|| "@pynchy".to_string()),
            allowed_users: allowed_users.unwrap_or_else(|| vec!["owner".to_string()]),
            security: WorkspaceSecurity {
                services,
                contains_secrets,
            },
            project_access: sandbox.map(|s| s.project_access).unwrap_or(false),
            git_policy: sandbox.map(|s| s.git_policy).unwrap_or_default(),
            mcp_servers: sandbox.map(|s| s.mcp_servers.clone()).unwrap_or_default(),
        }
    }

    /// Expand group references and `owner` into a flat allow set.
    ///
    /// Returns `None` when `*` appears (everyone allowed). Entries with a
    /// `:` are literal platform-qualified ids; bare names are group lookups
    /// with cycle protection; `owner` resolves through `[owner]` for the
    /// given platform.
    pub fn resolve_allowed_users(
        &self,
        raw: &[String],
        platform: Option<&str>,
    ) -> Option<HashSet<String>> {
        if raw.iter().any(|e| e == "*") {
            return None;
        }
        let mut result = HashSet::new();
        let mut seen = HashSet::new();
        self.resolve_users_into(raw, platform, &mut result, &mut seen);
        Some(result)
    }

    fn resolve_users_into(
        &self,
        entries: &[String],
        platform: Option<&str>,
        result: &mut HashSet<String>,
        seen: &mut HashSet<String>,
    ) {
        for entry in entries {
            if entry == "*" {
                continue;
            }
            if entry == "owner" {
                if let Some(p) = platform {
                    if let Some(id) = self.owner.get(p) {
                        result.insert(format!("{p}:{id}"));
                    }
                }
                continue;
            }
            if entry.contains(':') {
                result.insert(entry.clone());
                continue;
            }
            if !seen.insert(entry.clone()) {
                continue;
            }
            if let Some(members) = self.user_groups.get(entry) {
                self.resolve_users_into(members, platform, result, seen);
            }
        }
    }
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".pynchy")
}
fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_image() -> String {
    "pynchy-agent:latest".to_string()
}
fn default_name_prefix() -> String {
    "pynchy".to_string()
}
fn default_max_concurrent() -> usize {
    3
}
fn default_idle_timeout() -> u64 {
    120
}
fn default_runtime() -> String {
    "docker".to_string()
}
fn default_deploy_port() -> u16 {
    8800
}
fn default_main_branch() -> String {
    "main".to_string()
}
fn default_base_retry_secs() -> f64 {
    5.0
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_lookback_hours() -> u64 {
    24
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::TrustLevel;

    fn config_from_toml(toml: &str) -> PynchyConfig {
        Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .expect("test config parses")
    }

    #[test]
    fn cascade_later_layers_override_earlier() {
        let cfg = config_from_toml(
            r#"
            [workspace_defaults]
            trigger = "@bot"
            contains_secrets = false

            [workspace_defaults.services.browser]
            public_source = true

            [connection.slack.main.security]
            contains_secrets = true

            [connection.slack.main.chat.C9.security.services.browser]
            public_source = false

            [sandbox.dev]
            connection = "slack:main"
            chat = "C9"
            trigger = "@dev"
            "#,
        );

        let resolved = cfg.resolve_workspace("dev");
        assert_eq!(resolved.trigger, "@dev");
        assert!(resolved.security.contains_secrets);
        // Chat layer flipped the browser trust off.
        assert_eq!(
            resolved.security.trust("browser").public_source,
            TrustLevel::No
        );
    }

    #[test]
    fn unknown_workspace_gets_defaults() {
        let cfg = config_from_toml("[workspace_defaults]\ntrigger = \"@bot\"\n");
        let resolved = cfg.resolve_workspace("nope");
        assert_eq!(resolved.trigger, "@bot");
        assert!(!resolved.project_access);
        assert_eq!(resolved.git_policy, GitPolicy::MergeToMain);
    }

    #[test]
    fn services_merge_per_key_across_layers() {
        let cfg = config_from_toml(
            r#"
            [workspace_defaults.services.mail]
            secret_data = true

            [sandbox.ops.services.web]
            public_source = true
            public_sink = "forbidden"
            "#,
        );
        let sec = cfg.resolve_workspace("ops").security;
        assert!(sec.trust("mail").secret_data.is_yes());
        assert!(sec.trust("web").public_sink.is_forbidden());
    }

    #[test]
    fn allowed_users_wildcard_and_groups() {
        let cfg = config_from_toml(
            r#"
            [owner]
            slack = "U1"

            [user_groups]
            team = ["slack:U2", "nested"]
            nested = ["slack:U3", "team"]
            "#,
        );

        assert!(cfg
            .resolve_allowed_users(&["*".to_string()], Some("slack"))
            .is_none());

        let users = cfg
            .resolve_allowed_users(
                &["owner".to_string(), "team".to_string()],
                Some("slack"),
            )
            .unwrap();
        assert!(users.contains("slack:U1"));
        assert!(users.contains("slack:U2"));
        assert!(users.contains("slack:U3"));
    }
}
