//! Admin clean-room validation, run once at startup.
//!
//! An admin workspace can perform host-mutating operations, so nothing it
//! reads may come from an attacker-writable source. The validator rejects
//! any admin workspace whose reachable MCP-server set contains a service
//! with `public_source = true` — including undeclared services, which
//! default to true. Failure is terminal; the process must not start.

use pynchy_core::config::PynchyConfig;
use pynchy_core::types::WorkspaceProfile;
use pynchy_core::{PynchyError, Result};

/// Validate every admin workspace. Returns `Config` error naming all
/// violations when any admin workspace can reach a public source.
pub fn validate_admin_clean_room(
    config: &PynchyConfig,
    profiles: &[WorkspaceProfile],
) -> Result<()> {
    let mut violations: Vec<String> = Vec::new();

    for profile in profiles.iter().filter(|p| p.is_admin) {
        let resolved = config.resolve_workspace(&profile.folder);
        for instance in &resolved.mcp_servers {
            let trust = resolved.security.trust(instance);
            if trust.public_source.is_yes() {
                let declared = resolved.security.services.contains_key(instance);
                violations.push(format!(
                    "admin workspace '{}' reaches public-source service '{}'{}",
                    profile.folder,
                    instance,
                    if declared { "" } else { " (undeclared, defaults to public)" },
                ));
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(PynchyError::Config(format!(
            "admin clean-room violation: {}",
            violations.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use figment::providers::{Format, Toml};
    use figment::Figment;

    fn profile(folder: &str, is_admin: bool) -> WorkspaceProfile {
        WorkspaceProfile {
            jid: format!("slack:{folder}"),
            name: folder.into(),
            folder: folder.into(),
            trigger: "@pynchy".into(),
            is_admin,
            container_config: None,
            added_at: Utc::now(),
        }
    }

    fn config(toml: &str) -> PynchyConfig {
        Figment::new().merge(Toml::string(toml)).extract().unwrap()
    }

    #[test]
    fn admin_with_clean_services_passes() {
        let cfg = config(
            r#"
            [sandbox.admin]
            mcp_servers = ["github"]
            [sandbox.admin.services.github]
            public_source = false
            "#,
        );
        let profiles = vec![profile("admin", true)];
        assert!(validate_admin_clean_room(&cfg, &profiles).is_ok());
    }

    #[test]
    fn admin_with_public_source_fails() {
        let cfg = config(
            r#"
            [sandbox.admin]
            mcp_servers = ["browser"]
            [sandbox.admin.services.browser]
            public_source = true
            "#,
        );
        let profiles = vec![profile("admin", true)];
        let err = validate_admin_clean_room(&cfg, &profiles).unwrap_err();
        assert!(err.to_string().contains("browser"));
    }

    #[test]
    fn undeclared_service_defaults_to_public_and_fails() {
        let cfg = config(
            r#"
            [sandbox.admin]
            mcp_servers = ["mystery"]
            "#,
        );
        let profiles = vec![profile("admin", true)];
        let err = validate_admin_clean_room(&cfg, &profiles).unwrap_err();
        assert!(err.to_string().contains("undeclared"));
    }

    #[test]
    fn non_admin_workspaces_unconstrained() {
        let cfg = config(
            r#"
            [sandbox.dev]
            mcp_servers = ["browser"]
            "#,
        );
        let profiles = vec![profile("dev", false)];
        assert!(validate_admin_clean_room(&cfg, &profiles).is_ok());
    }
}
