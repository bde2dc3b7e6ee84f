//! Per-workspace session preparation: the agent settings file, filtered
//! skill sync, and the least-privilege credentials env file.

use std::path::{Path, PathBuf};

use pynchy_core::config::PynchyConfig;
use pynchy_core::Result;
use tracing::debug;

/// Write the agent settings file into the session dir. Hooks route every
/// bash command through the host's `security:bash_check` before it runs.
pub fn write_settings_json(session_dir: &Path) -> Result<()> {
    let settings = serde_json::json!({
        "permissions": {
            "defaultMode": "acceptEdits",
        },
        "hooks": {
            "PreToolUse": [{
                "matcher": "Bash",
                "hooks": [{
                    "type": "command",
                    "command": "/workspace/scripts/bash_check.sh",
                }],
            }],
        },
        "env": {
            "CLAUDE_CODE_DISABLE_AUTOUPDATE": "1",
        },
    });
    let path = session_dir.join("settings.json");
    pynchy_core::util::write_json_atomic(&path, &settings)
}

/// Copy skill files from the shared skills dir into the session dir,
/// filtered to the workspace's allowed list when one is configured. A
/// skill named after an MCP server the workspace cannot reach is skipped.
pub fn sync_skills(data_dir: &Path, session_dir: &Path, allowed_servers: &[String]) -> Result<()> {
    let source = data_dir.join("skills");
    let target = session_dir.join("skills");
    std::fs::create_dir_all(&target)?;

    let Ok(entries) = std::fs::read_dir(&source) else {
        return Ok(()); // no shared skills configured
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        // Skills are namespaced `<server>.<skill>.md`; unprefixed skills
        // are always synced.
        if let Some((server, _)) = stem.split_once('.') {
            if !allowed_servers.iter().any(|s| s == server) {
                debug!(skill = %stem, "skipping skill for unreachable server");
                continue;
            }
        }
        let dest = target.join(path.file_name().unwrap_or_default());
        std::fs::copy(&path, &dest)?;
    }
    Ok(())
}

/// Env vars every workspace receives.
const AGENT_ENV_PREFIX: &str = "AGENT__";

/// Write the per-workspace env file dir. Non-admin workspaces get only
/// `AGENT__*` material; admin workspaces additionally receive host-scoped
/// secrets (GH_TOKEN, gateway master key).
pub fn write_env_file(config: &PynchyConfig, folder: &str, is_admin: bool) -> Result<PathBuf> {
    let env_dir = config.data_dir.join("env").join(folder);
    std::fs::create_dir_all(&env_dir)?;

    let mut lines: Vec<String> = Vec::new();
    let mut keys: Vec<&String> = config.secrets.keys().collect();
    keys.sort();
    for key in keys {
        let upper = key.to_uppercase();
        let include = upper.starts_with(AGENT_ENV_PREFIX)
            || (is_admin && (upper == "GH_TOKEN" || upper.starts_with("GATEWAY__")));
        if include {
            lines.push(format!("{}={}", upper, config.secrets[key]));
        }
    }
    // Env overrides also flow through, same filter.
    for (key, value) in std::env::vars() {
        if key.starts_with(AGENT_ENV_PREFIX) && !lines.iter().any(|l| l.starts_with(&key)) {
            lines.push(format!("{key}={value}"));
        }
    }

    std::fs::write(env_dir.join("agent.env"), lines.join("\n") + "\n")?;
    Ok(env_dir)
}
