//! Agent addresses and id generators.
//!
//! Agents are addressed network-wide as `<machine>/<project>`. Sessions,
//! threads, and missions carry short prefixed ids (`s-`, `t-`, `m-`) so
//! they are recognisable in logs and inbox files.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IntercomError;

/// A network-wide agent address: `<machine>/<project>`.
///
/// The machine id locates the daemon; the project id locates the agent on
/// that machine. The literal sender `human` (the operator) is handled by
/// callers before parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentAddr {
    pub machine: String,
    pub project: String,
}

impl AgentAddr {
    pub fn new(machine: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
            project: project.into(),
        }
    }
}

impl FromStr for AgentAddr {
    type Err = IntercomError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once('/') {
            Some((machine, project)) if !machine.is_empty() && !project.is_empty() => {
                Ok(Self::new(machine, project))
            }
            _ => Err(IntercomError::BadEnvelope(format!(
                "invalid agent address {value:?}, expected machine/project"
            ))),
        }
    }
}

impl fmt::Display for AgentAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.machine, self.project)
    }
}

impl Serialize for AgentAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AgentAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Short random hex suffix shared by the id generators.
fn hex6() -> String {
    let u = uuid::Uuid::new_v4();
    u.simple().to_string()[..6].to_string()
}

/// Generate a session id: `s-<yyyymmdd>-<6hex>`.
pub fn new_session_id() -> String {
    format!("s-{}-{}", Utc::now().format("%Y%m%d"), hex6())
}

/// Generate a thread id: `t-<6hex>`.
pub fn new_thread_id() -> String {
    format!("t-{}", hex6())
}

/// Generate a mission id: `m-<yyyymmdd>-<6hex>`.
pub fn new_mission_id() -> String {
    format!("m-{}-{}", Utc::now().format("%Y%m%d"), hex6())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_address() {
        let addr: AgentAddr = "workstation/api-server".parse().unwrap();
        assert_eq!(addr.machine, "workstation");
        assert_eq!(addr.project, "api-server");
        assert_eq!(addr.to_string(), "workstation/api-server");
    }

    #[test]
    fn parse_splits_on_first_slash_only() {
        let addr: AgentAddr = "box/nested/path".parse().unwrap();
        assert_eq!(addr.machine, "box");
        assert_eq!(addr.project, "nested/path");
    }

    #[test]
    fn parse_rejects_missing_parts() {
        assert!("no-slash".parse::<AgentAddr>().is_err());
        assert!("/project".parse::<AgentAddr>().is_err());
        assert!("machine/".parse::<AgentAddr>().is_err());
        assert!("".parse::<AgentAddr>().is_err());
    }

    #[test]
    fn serde_roundtrip_as_string() {
        let addr = AgentAddr::new("m1", "p1");
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"m1/p1\"");
        let back: AgentAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn id_generators_have_expected_shape() {
        let s = new_session_id();
        assert!(s.starts_with("s-"));
        assert_eq!(s.len(), "s-20250101-abcdef".len());

        let t = new_thread_id();
        assert!(t.starts_with("t-"));
        assert_eq!(t.len(), 8);

        let m = new_mission_id();
        assert!(m.starts_with("m-"));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_thread_id(), new_thread_id());
        assert_ne!(new_mission_id(), new_mission_id());
    }
}
