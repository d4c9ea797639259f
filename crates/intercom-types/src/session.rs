//! Active agent sessions and their inbox entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Presence state of a session, as reported in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Working,
    Idle,
}

/// An active agent session registered with its local daemon.
///
/// At most one session per `(machine, project)` is authoritative for chat
/// routing; on conflict the most recently registered wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// `s-<yyyymmdd>-<6hex>`.
    pub session_id: String,
    pub project: String,
    /// OS process id of the agent's tool server, probed for liveness.
    pub pid: u32,
    /// Absolute path of the session's inbox file.
    pub inbox_path: String,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
    #[serde(default = "default_status")]
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Short rolling list of recent activity lines.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_activity: Vec<String>,
}

fn default_status() -> SessionStatus {
    SessionStatus::Active
}

/// One line of a session inbox file (`<state_dir>/inbox/<session_id>.jsonl`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEntry {
    pub thread_id: String,
    pub from_agent: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub read: bool,
}

impl InboxEntry {
    pub fn new(
        thread_id: impl Into<String>,
        from_agent: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            from_agent: from_agent.into(),
            timestamp: Utc::now(),
            message: message.into(),
            read: false,
        }
    }
}
