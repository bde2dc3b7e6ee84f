//! Per-service trust declarations for the lethal-trifecta defense.
//!
//! Users configure four booleans per service, not risk tiers; the policy
//! engine derives gating decisions from the combination. Each field accepts
//! `false`, `true`, or the string `"forbidden"` in TOML/JSON.

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Tri-state trust value: `false`, `true`, or `"forbidden"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustLevel {
    #[default]
    No,
    Yes,
    Forbidden,
}

impl TrustLevel {
    pub fn is_yes(self) -> bool {
        matches!(self, TrustLevel::Yes)
    }

    pub fn is_forbidden(self) -> bool {
        matches!(self, TrustLevel::Forbidden)
    }
}

impl Serialize for TrustLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TrustLevel::No => serializer.serialize_bool(false),
            TrustLevel::Yes => serializer.serialize_bool(true),
            TrustLevel::Forbidden => serializer.serialize_str("forbidden"),
        }
    }
}

impl<'de> Deserialize<'de> for TrustLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LevelVisitor;

        impl Visitor<'_> for LevelVisitor {
            type Value = TrustLevel;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a boolean or the string \"forbidden\"")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<TrustLevel, E> {
                Ok(if v { TrustLevel::Yes } else { TrustLevel::No })
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<TrustLevel, E> {
                match v {
                    "forbidden" => Ok(TrustLevel::Forbidden),
                    "true" => Ok(TrustLevel::Yes),
                    "false" => Ok(TrustLevel::No),
                    other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
                }
            }
        }

        deserializer.deserialize_any(LevelVisitor)
    }
}

/// Trust record for a single `(workspace, service)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceTrust {
    /// Service returns content an attacker could author (prompt injection risk).
    pub public_source: TrustLevel,
    /// Reads from this service expose secret data.
    pub secret_data: TrustLevel,
    /// Writes to this service are visible outside the workspace (exfil sink).
    pub public_sink: TrustLevel,
    /// Writes can mutate host or external state in hard-to-undo ways.
    pub dangerous_writes: TrustLevel,
}

impl Default for ServiceTrust {
    /// Unknown services are maximally cautious: assumed attacker-readable
    /// and dangerous to write, but not secret-bearing or a public sink.
    fn default() -> Self {
        Self {
            public_source: TrustLevel::Yes,
            secret_data: TrustLevel::No,
            public_sink: TrustLevel::No,
            dangerous_writes: TrustLevel::Yes,
        }
    }
}

/// Effective security posture for one workspace: its service trust table
/// plus the workspace-wide secrets flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceSecurity {
    #[serde(default)]
    pub services: HashMap<String, ServiceTrust>,
    /// Files in the workspace itself hold secrets; any file-access tool use
    /// sets the secret taint.
    #[serde(default)]
    pub contains_secrets: bool,
}

impl WorkspaceSecurity {
    /// Trust record for `service`, falling back to the cautious default.
    pub fn trust(&self, service: &str) -> ServiceTrust {
        self.services.get(service).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_level_roundtrip_bool_and_forbidden() {
        let parsed: TrustLevel = serde_json::from_str("true").unwrap();
        assert_eq!(parsed, TrustLevel::Yes);
        let parsed: TrustLevel = serde_json::from_str("false").unwrap();
        assert_eq!(parsed, TrustLevel::No);
        let parsed: TrustLevel = serde_json::from_str("\"forbidden\"").unwrap();
        assert_eq!(parsed, TrustLevel::Forbidden);

        assert_eq!(serde_json::to_string(&TrustLevel::Yes).unwrap(), "true");
        assert_eq!(
            serde_json::to_string(&TrustLevel::Forbidden).unwrap(),
            "\"forbidden\""
        );
    }

    #[test]
    fn unknown_service_defaults_cautious() {
        let sec = WorkspaceSecurity::default();
        let t = sec.trust("never-declared");
        assert!(t.public_source.is_yes());
        assert!(t.dangerous_writes.is_yes());
        assert!(!t.secret_data.is_yes());
        assert!(!t.public_sink.is_yes());
    }

    #[test]
    fn declared_service_wins_over_default() {
        let mut sec = WorkspaceSecurity::default();
        sec.services.insert(
            "github".into(),
            ServiceTrust {
                public_source: TrustLevel::No,
                secret_data: TrustLevel::No,
                public_sink: TrustLevel::Yes,
                dangerous_writes: TrustLevel::No,
            },
        );
        assert!(!sec.trust("github").public_source.is_yes());
        assert!(sec.trust("github").public_sink.is_yes());
    }
}
