//! Volume mount-set construction and container CLI args.
//!
//! The mount list is deterministic and ordered; tests assert on the order
//! because the container's view of the filesystem is part of the IPC
//! contract.

use std::path::{Path, PathBuf};

use pynchy_core::config::{PynchyConfig, ResolvedWorkspaceConfig};
use pynchy_core::types::{MountSpec, WorkspaceProfile};
use pynchy_core::Result;
use tracing::warn;

use crate::session_prep;

/// One bind mount handed to the runtime CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub readonly: bool,
}

impl VolumeMount {
    fn rw(host: PathBuf, container: &str) -> Self {
        Self {
            host_path: host,
            container_path: container.to_string(),
            readonly: false,
        }
    }

    fn ro(host: PathBuf, container: &str) -> Self {
        Self {
            host_path: host,
            container_path: container.to_string(),
            readonly: true,
        }
    }
}

/// IPC subdirectories created under each workspace's namespace.
pub const IPC_SUBDIRS: &[&str] = &[
    "messages",
    "tasks",
    "input",
    "responses",
    "pending_approvals",
    "approval_decisions",
    "pending_questions",
    "merge_results",
];

/// Assemble the mount list for one invocation, in the fixed order:
/// worktree project, group dir, session dir, IPC namespace, hook scripts,
/// credentials env dir, agent-runner source, plugin MCP sources, then
/// validated additional mounts.
pub fn build_volume_mounts(
    config: &PynchyConfig,
    profile: &WorkspaceProfile,
    resolved: &ResolvedWorkspaceConfig,
    worktree_path: Option<&Path>,
    plugin_sources: &[(String, PathBuf)],
) -> Result<Vec<VolumeMount>> {
    let mut mounts: Vec<VolumeMount> = Vec::new();

    let group_dir = config.groups_dir().join(&profile.folder);
    std::fs::create_dir_all(&group_dir)?;

    if let Some(worktree) = worktree_path {
        mounts.push(VolumeMount::rw(worktree.to_path_buf(), "/workspace/project"));
        // The worktree's .git file references the main repo's .git dir by
        // absolute path; mount it at the same path so git resolves inside.
        let git_dir = config.project_root.join(".git");
        let git_dir_str = git_dir.to_string_lossy().to_string();
        mounts.push(VolumeMount::rw(git_dir, &git_dir_str));
        mounts.push(VolumeMount::rw(group_dir, "/workspace/group"));
    } else {
        mounts.push(VolumeMount::rw(group_dir, "/workspace/group"));
        let global_dir = config.groups_dir().join("global");
        if global_dir.exists() {
            mounts.push(VolumeMount::ro(global_dir, "/workspace/global"));
        }
    }

    // Per-workspace agent session dir, pre-populated with settings and
    // filtered skills.
    let session_dir = config.sessions_dir(&profile.folder).join(".claude");
    std::fs::create_dir_all(&session_dir)?;
    session_prep::write_settings_json(&session_dir)?;
    session_prep::sync_skills(&config.data_dir, &session_dir, &resolved.mcp_servers)?;
    mounts.push(VolumeMount::rw(session_dir, "/home/agent/.claude"));

    // Per-workspace IPC namespace.
    let ipc_dir = config.ipc_dir(&profile.folder);
    for sub in IPC_SUBDIRS {
        std::fs::create_dir_all(ipc_dir.join(sub))?;
    }
    mounts.push(VolumeMount::rw(ipc_dir, "/workspace/ipc"));

    // Hook scripts (read-only guard layer).
    let scripts_dir = config.project_root.join("container").join("scripts");
    if scripts_dir.exists() {
        mounts.push(VolumeMount::ro(scripts_dir, "/workspace/scripts"));
    }

    // Least-privilege credentials env file.
    let env_dir = session_prep::write_env_file(config, &profile.folder, profile.is_admin)?;
    mounts.push(VolumeMount::ro(env_dir, "/workspace/env-dir"));

    // Agent runner source.
    let runner_src = config.project_root.join("container").join("agent_runner").join("src");
    mounts.push(VolumeMount::ro(runner_src, "/app/src"));

    // Plugin MCP server sources.
    for (name, source) in plugin_sources {
        mounts.push(VolumeMount::ro(
            source.clone(),
            &format!("/workspace/plugins/{name}"),
        ));
    }

    // Admin containers may edit the host config directly.
    if profile.is_admin {
        let config_toml = config.project_root.join("pynchy.toml");
        if config_toml.exists() {
            mounts.push(VolumeMount::rw(config_toml, "/workspace/project/pynchy.toml"));
        }
    }

    // Additional mounts, allowlist-validated.
    if let Some(overrides) = &profile.container_config {
        for spec in
            validate_additional_mounts(&overrides.additional_mounts, config, profile.is_admin)
        {
            mounts.push(VolumeMount {
                host_path: PathBuf::from(&spec.host_path),
                container_path: spec.container_path.clone(),
                readonly: spec.readonly,
            });
        }
    }

    Ok(mounts)
}

/// Keep only mount requests that are absolute, traversal-free, and (for
/// non-admin workspaces) under an allowlisted host prefix.
pub fn validate_additional_mounts(
    requested: &[MountSpec],
    config: &PynchyConfig,
    is_admin: bool,
) -> Vec<MountSpec> {
    requested
        .iter()
        .filter(|spec| {
            let host = Path::new(&spec.host_path);
            if !host.is_absolute() || spec.host_path.contains("..") {
                warn!(host = %spec.host_path, "rejecting non-absolute or traversing mount");
                return false;
            }
            if is_admin {
                return true;
            }
            let allowed = config
                .mount_allowlist
                .iter()
                .any(|prefix| spec.host_path.starts_with(prefix.as_str()));
            if !allowed {
                warn!(host = %spec.host_path, "rejecting mount outside allowlist");
            }
            allowed
        })
        .cloned()
        .collect()
}

/// CLI args for `run` — `-i --rm --name <name>` plus every mount, ending
/// with the image.
pub fn build_container_args(
    config: &PynchyConfig,
    mounts: &[VolumeMount],
    container_name: &str,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "-i".into(),
        "--rm".into(),
        "--name".into(),
        container_name.into(),
    ];
    // Containers reach the host (MCP proxy, gateway) via this mapping;
    // Docker Desktop sets it up automatically, Linux needs the flag.
    if config.container.runtime == "docker" {
        args.push("--add-host".into());
        args.push("host.docker.internal:host-gateway".into());
    }
    for m in mounts {
        if m.readonly {
            args.push("--mount".into());
            args.push(format!(
                "type=bind,source={},target={},readonly",
                m.host_path.display(),
                m.container_path
            ));
        } else {
            args.push("-v".into());
            args.push(format!("{}:{}", m.host_path.display(), m.container_path));
        }
    }
    args.push(config.container.image.clone());
    args
}

/// Deterministic container name: `<prefix>-<folder>-<ms>`.
pub fn container_name(config: &PynchyConfig, folder: &str, invocation_ts: i64) -> String {
    format!("{}-{}-{}", config.container.name_prefix, folder, invocation_ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pynchy_core::types::ContainerOverrides;

    fn test_config(dir: &Path) -> PynchyConfig {
        let mut config = PynchyConfig::default();
        config.data_dir = dir.join("data");
        config.project_root = dir.join("project");
        config.mount_allowlist = vec!["/srv/shared".to_string()];
        config
    }

    fn profile(is_admin: bool, mounts: Vec<MountSpec>) -> WorkspaceProfile {
        WorkspaceProfile {
            jid: "slack:C1".into(),
            name: "dev".into(),
            folder: "dev".into(),
            trigger: "@pynchy".into(),
            is_admin,
            container_config: Some(ContainerOverrides {
                additional_mounts: mounts,
                idle_timeout_secs: None,
            }),
            added_at: Utc::now(),
        }
    }

    #[test]
    fn mount_order_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let profile = profile(false, vec![]);
        let resolved = config.resolve_workspace("dev");

        let mounts =
            build_volume_mounts(&config, &profile, &resolved, None, &[("mail".into(), dir.path().join("mail"))])
                .unwrap();

        let targets: Vec<&str> = mounts.iter().map(|m| m.container_path.as_str()).collect();
        assert_eq!(
            targets,
            vec![
                "/workspace/group",
                "/home/agent/.claude",
                "/workspace/ipc",
                "/workspace/env-dir",
                "/app/src",
                "/workspace/plugins/mail",
            ]
        );
        // IPC namespace pre-created with every subdir.
        for sub in IPC_SUBDIRS {
            assert!(config.ipc_dir("dev").join(sub).is_dir());
        }
    }

    #[test]
    fn worktree_mount_leads_when_project_access() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let profile = profile(false, vec![]);
        let resolved = config.resolve_workspace("dev");
        let worktree = dir.path().join("wt");

        let mounts =
            build_volume_mounts(&config, &profile, &resolved, Some(&worktree), &[]).unwrap();
        assert_eq!(mounts[0].container_path, "/workspace/project");
        assert!(!mounts[0].readonly);
    }

    #[test]
    fn additional_mounts_respect_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let requested = vec![
            MountSpec {
                host_path: "/srv/shared/docs".into(),
                container_path: "/workspace/docs".into(),
                readonly: true,
            },
            MountSpec {
                host_path: "/etc/passwd".into(),
                container_path: "/workspace/oops".into(),
                readonly: true,
            },
            MountSpec {
                host_path: "/srv/shared/../../etc".into(),
                container_path: "/workspace/sneaky".into(),
                readonly: true,
            },
            MountSpec {
                host_path: "relative/path".into(),
                container_path: "/workspace/rel".into(),
                readonly: true,
            },
        ];

        let validated = validate_additional_mounts(&requested, &config, false);
        assert_eq!(validated.len(), 1);
        assert_eq!(validated[0].host_path, "/srv/shared/docs");

        // Admin bypasses the allowlist but not the traversal checks.
        let validated = validate_additional_mounts(&requested, &config, true);
        assert_eq!(validated.len(), 2);
    }

    #[test]
    fn container_args_shape() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mounts = vec![
            VolumeMount::rw(PathBuf::from("/h/group"), "/workspace/group"),
            VolumeMount::ro(PathBuf::from("/h/src"), "/app/src"),
        ];
        let args = build_container_args(&config, &mounts, "pynchy-dev-123");
        assert_eq!(&args[..5], &["run", "-i", "--rm", "--name", "pynchy-dev-123"]);
        assert!(args.contains(&"-v".to_string()));
        assert!(args.contains(&"/h/group:/workspace/group".to_string()));
        assert!(args
            .iter()
            .any(|a| a.contains("source=/h/src") && a.ends_with("readonly")));
        assert_eq!(args.last().unwrap(), &config.container.image);
    }
}
