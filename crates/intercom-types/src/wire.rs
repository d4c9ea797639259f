//! Request/response bodies shared by the hub and daemon HTTP surfaces.
//!
//! Keeping the wire contract in one place means a field added on one side
//! cannot silently drift from the other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mission::{FeedbackItem, MissionMessage, MissionStatus};
use crate::session::SessionStatus;

/// `GET /api/discover` response, on both hub and daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub hub: bool,
    pub version: String,
    pub machine_id: String,
}

/// `POST /api/join` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub machine_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub overlay_ip: String,
    #[serde(default)]
    pub daemon_url: String,
}

/// `POST /api/join` and `GET /api/join/status/{id}` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// One active session as carried in a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPresence {
    pub session_id: String,
    pub project: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// `POST /api/heartbeat` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatBody {
    pub machine_id: String,
    #[serde(default)]
    pub overlay_ip: String,
    #[serde(default)]
    pub daemon_url: String,
    #[serde(default)]
    pub active_sessions: Vec<SessionPresence>,
}

/// One project entry of a `POST /api/register` manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectManifest {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub path: String,
}

/// `POST /api/register` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterManifest {
    pub machine_id: String,
    #[serde(default)]
    pub projects: Vec<ProjectManifest>,
}

/// `POST /api/route` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResponse {
    /// `delivered`, `queued`, `denied`, `no_active_session`,
    /// `unreachable`, or `error`.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mission_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RouteResponse {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            mission_id: None,
            thread_id: None,
            error: None,
        }
    }

    pub fn with_mission(mut self, mission_id: impl Into<String>) -> Self {
        self.mission_id = Some(mission_id.into());
        self
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// `POST /api/mission/start` request (hub -> daemon).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionStartRequest {
    pub mission_id: String,
    pub project: String,
    pub from_agent: String,
    /// The mission prompt for the child agent.
    pub mission: String,
    /// Recent conversation context for the prompt preamble.
    #[serde(default)]
    pub context_messages: Vec<MissionMessage>,
}

/// `POST /api/mission/start` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionStartResponse {
    pub status: String,
    pub mission_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /api/mission/{id}/stop` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionStopResponse {
    pub ok: bool,
    /// Whether a running child was actually killed. `false` when the
    /// mission had already reached a terminal state.
    pub stopped: bool,
}

/// `POST /api/session/deliver` request (hub -> daemon).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverRequest {
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub thread_id: String,
    pub from_agent: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// `POST /api/session/deliver` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Mission snapshot returned by `GET /api/missions/{id}` on hub and daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionSnapshot {
    pub mission_id: String,
    pub status: MissionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub feedback: Vec<FeedbackItem>,
    /// Highest cursor in the full feedback log, for the next poll.
    #[serde(default)]
    pub feedback_total: u64,
}

/// `POST /api/feedback` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSubmission {
    /// `bug`, `improvement`, or `note`.
    pub kind: String,
    pub description: String,
    pub from_agent: String,
}

/// `POST /api/session/register` request (tool server -> local daemon).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRegisterRequest {
    pub session_id: String,
    pub project: String,
    pub pid: u32,
    pub inbox_path: String,
}
