//! Machines and projects as the registry sees them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A machine is `online` if its last heartbeat is at most this old.
pub const ONLINE_WINDOW_SECS: i64 = 90;

/// Lifecycle status of a machine in the registry.
///
/// Transitions are monotonic (`pending` → `approved` or `denied`), except
/// that an approved machine may later be revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Pending,
    Approved,
    Denied,
    Revoked,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Pending => "pending",
            MachineStatus::Approved => "approved",
            MachineStatus::Denied => "denied",
            MachineStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MachineStatus::Pending),
            "approved" => Some(MachineStatus::Approved),
            "denied" => Some(MachineStatus::Denied),
            "revoked" => Some(MachineStatus::Revoked),
            _ => None,
        }
    }
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineRecord {
    pub machine_id: String,
    pub display_name: String,
    /// Address on the private overlay network.
    pub overlay_ip: String,
    /// Base URL of the machine's daemon, e.g. `http://100.x.y.z:7700`.
    pub daemon_url: String,
    /// Shared secret; non-empty iff `status == Approved`.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub token: String,
    pub status: MachineStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

impl MachineRecord {
    /// Whether the machine heartbeated within [`ONLINE_WINDOW_SECS`].
    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        self.status == MachineStatus::Approved
            && self
                .last_seen
                .is_some_and(|seen| (now - seen).num_seconds() <= ONLINE_WINDOW_SECS)
    }
}

/// A project (agent) on a machine. The synthetic `home` project always
/// exists; the rest come from discovery or explicit registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub machine_id: String,
    pub project_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// On-disk root of the project on its machine.
    #[serde(default)]
    pub path: String,
}
