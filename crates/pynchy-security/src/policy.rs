//! Trust-based policy engine for the lethal-trifecta defense.
//!
//! Evaluates service operations against per-service trust declarations and
//! two independent taint flags (corruption + secret). Gating decisions are
//! derived from the combination — configuration is four booleans per
//! service, not risk tiers.

use pynchy_core::trust::WorkspaceSecurity;

use crate::scanner::scan_payload_for_secrets;

/// Result of a policy evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    /// Cop must inspect before the action proceeds.
    pub needs_deputy: bool,
    /// A human must approve before the action proceeds.
    pub needs_human: bool,
}

impl PolicyDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            ..Self::default()
        }
    }

    fn deny(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            ..Self::default()
        }
    }
}

/// Single entry point for all security decisions within one container
/// invocation. Taint state is sticky — once set it stays until the
/// container exits and the policy is dropped with it.
#[derive(Debug)]
pub struct SecurityPolicy {
    security: WorkspaceSecurity,
    corruption_tainted: bool,
    secret_tainted: bool,
}

impl SecurityPolicy {
    pub fn new(security: WorkspaceSecurity) -> Self {
        Self {
            security,
            corruption_tainted: false,
            secret_tainted: false,
        }
    }

    pub fn corruption_tainted(&self) -> bool {
        self.corruption_tainted
    }

    pub fn secret_tainted(&self) -> bool {
        self.secret_tainted
    }

    /// Called when the agent uses file-access tools (Read, Edit, Bash).
    /// Sets the secret taint when the workspace declares it holds secrets.
    pub fn notify_file_access(&mut self) {
        if self.security.contains_secrets {
            self.secret_tainted = true;
        }
    }

    /// Evaluate a read from `service`.
    ///
    /// - `public_source = forbidden` → denied
    /// - `secret_data = true` → secret taint set on any read
    /// - `public_source = true` → corruption taint set, deputy scan required
    pub fn evaluate_read(&mut self, service: &str) -> PolicyDecision {
        let trust = self.security.trust(service);

        if trust.public_source.is_forbidden() {
            return PolicyDecision::deny(format!("Reading from '{service}' is forbidden"));
        }

        if trust.secret_data.is_yes() {
            self.secret_tainted = true;
        }

        if trust.public_source.is_yes() {
            self.corruption_tainted = true;
            return PolicyDecision {
                allowed: true,
                reason: Some(format!("Public source '{service}': deputy scan required")),
                needs_deputy: true,
                needs_human: false,
            };
        }

        PolicyDecision::allow()
    }

    /// Evaluate a write/action on `service` with the given payload.
    ///
    /// Forbidden sinks deny outright; otherwise:
    /// - deputy ← corruption taint (any write by a possibly-hijacked agent)
    /// - human  ← dangerous_writes, the full trifecta
    ///   (corruption + secret + public_sink), or secrets in the payload
    pub fn evaluate_write(&mut self, service: &str, payload: &serde_json::Value) -> PolicyDecision {
        let trust = self.security.trust(service);

        if trust.public_sink.is_forbidden() {
            return PolicyDecision::deny(format!(
                "Writing to '{service}' is forbidden (public_sink)"
            ));
        }
        if trust.dangerous_writes.is_forbidden() {
            return PolicyDecision::deny(format!(
                "Writing to '{service}' is forbidden (dangerous_writes)"
            ));
        }

        let needs_deputy = self.corruption_tainted;
        let mut needs_human = trust.dangerous_writes.is_yes();

        if self.corruption_tainted && self.secret_tainted && trust.public_sink.is_yes() {
            needs_human = true;
        }

        let scan = scan_payload_for_secrets(payload);
        if scan.secrets_found() {
            needs_human = true;
        }

        let mut reasons: Vec<String> = Vec::new();
        if needs_deputy {
            reasons.push("deputy (corruption taint)".into());
        }
        if needs_human {
            reasons.push("human confirmation".into());
        }
        if scan.secrets_found() {
            reasons.push(format!("secrets detected in payload ({})", scan.detected.join(", ")));
        }

        PolicyDecision {
            allowed: true,
            reason: if reasons.is_empty() {
                None
            } else {
                Some(reasons.join("; "))
            },
            needs_deputy,
            needs_human,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pynchy_core::trust::{ServiceTrust, TrustLevel};
    use serde_json::json;

    fn security_with(service: &str, trust: ServiceTrust) -> WorkspaceSecurity {
        let mut sec = WorkspaceSecurity::default();
        sec.services.insert(service.into(), trust);
        sec
    }

    #[test]
    fn forbidden_read_denied() {
        let mut policy = SecurityPolicy::new(security_with(
            "darkweb",
            ServiceTrust {
                public_source: TrustLevel::Forbidden,
                ..ServiceTrust::default()
            },
        ));
        let d = policy.evaluate_read("darkweb");
        assert!(!d.allowed);
        assert!(!policy.corruption_tainted());
    }

    #[test]
    fn public_source_read_sets_corruption_and_requires_deputy() {
        let mut policy = SecurityPolicy::new(WorkspaceSecurity::default());
        let d = policy.evaluate_read("unknown-service");
        assert!(d.allowed);
        assert!(d.needs_deputy);
        assert!(policy.corruption_tainted());
    }

    #[test]
    fn secret_data_read_sets_secret_taint() {
        let mut policy = SecurityPolicy::new(security_with(
            "vault",
            ServiceTrust {
                public_source: TrustLevel::No,
                secret_data: TrustLevel::Yes,
                public_sink: TrustLevel::No,
                dangerous_writes: TrustLevel::No,
            },
        ));
        let d = policy.evaluate_read("vault");
        assert!(d.allowed);
        assert!(!d.needs_deputy);
        assert!(policy.secret_tainted());
        assert!(!policy.corruption_tainted());
    }

    #[test]
    fn taints_are_monotonic() {
        let mut sec = WorkspaceSecurity::default();
        sec.contains_secrets = true;
        let mut policy = SecurityPolicy::new(sec);

        policy.evaluate_read("web");
        policy.notify_file_access();
        assert!(policy.corruption_tainted());
        assert!(policy.secret_tainted());

        // Reads from clean services never clear taints.
        policy.evaluate_read("clean");
        assert!(policy.corruption_tainted());
        assert!(policy.secret_tainted());
    }

    #[test]
    fn trifecta_write_needs_human() {
        let mut sec = security_with(
            "chat",
            ServiceTrust {
                public_source: TrustLevel::No,
                secret_data: TrustLevel::No,
                public_sink: TrustLevel::Yes,
                dangerous_writes: TrustLevel::No,
            },
        );
        sec.contains_secrets = true;
        let mut policy = SecurityPolicy::new(sec);

        // Without taint, a plain sink write passes unguarded.
        let d = policy.evaluate_write("chat", &json!({"text": "hi"}));
        assert!(d.allowed);
        assert!(!d.needs_human);

        // Achieve the trifecta: corruption + secret + public sink.
        policy.evaluate_read("web");
        policy.notify_file_access();
        let d = policy.evaluate_write("chat", &json!({"text": "hi"}));
        assert!(d.allowed);
        assert!(d.needs_deputy);
        assert!(d.needs_human);
    }

    #[test]
    fn dangerous_writes_always_need_human() {
        let mut policy = SecurityPolicy::new(WorkspaceSecurity::default());
        let d = policy.evaluate_write("unknown", &json!({}));
        assert!(d.allowed);
        assert!(d.needs_human);
    }

    #[test]
    fn forbidden_sink_denied() {
        let mut policy = SecurityPolicy::new(security_with(
            "mail",
            ServiceTrust {
                public_source: TrustLevel::No,
                secret_data: TrustLevel::No,
                public_sink: TrustLevel::Forbidden,
                dangerous_writes: TrustLevel::No,
            },
        ));
        let d = policy.evaluate_write("mail", &json!({}));
        assert!(!d.allowed);
    }

    #[test]
    fn payload_secrets_escalate_to_human() {
        let mut policy = SecurityPolicy::new(security_with(
            "notes",
            ServiceTrust {
                public_source: TrustLevel::No,
                secret_data: TrustLevel::No,
                public_sink: TrustLevel::No,
                dangerous_writes: TrustLevel::No,
            },
        ));
        let d = policy.evaluate_write(
            "notes",
            &json!({"body": "my key is sk-ant-REDACTED"}),
        );
        assert!(d.allowed);
        assert!(d.needs_human);
        assert!(d.reason.unwrap().contains("secrets detected"));
    }
}
