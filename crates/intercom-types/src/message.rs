//! The routed message envelope.
//!
//! Every tool verb that crosses the network becomes a [`Message`] posted to
//! the hub's `/api/route`. The type tag drives router dispatch: mission
//! messages launch a remote agent, session messages land in an inbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IntercomError;
use crate::ids::{new_mission_id, AgentAddr};

/// The kind of a routed message. Router dispatch is exhaustive on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Request/reply mission: launch the target agent, wait for its answer.
    Ask,
    /// Fire-and-forget mission.
    Send,
    /// An agent's answer flowing back into the mission log.
    Response,
    /// Explicit remote launch with a mission prompt.
    StartAgent,
    /// Mission-store status query.
    Status,
    /// Mission-store history query.
    History,
    /// Asynchronous chat into a live session's inbox.
    Chat,
    /// Chat reply citing an existing thread.
    Reply,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Ask => "ask",
            MessageType::Send => "send",
            MessageType::Response => "response",
            MessageType::StartAgent => "start_agent",
            MessageType::Status => "status",
            MessageType::History => "history",
            MessageType::Chat => "chat",
            MessageType::Reply => "reply",
        }
    }

    /// Mission messages are delivered by launching the remote agent.
    pub fn is_mission(&self) -> bool {
        matches!(
            self,
            MessageType::Ask | MessageType::Send | MessageType::StartAgent
        )
    }

    /// Session messages are deposited into a session inbox.
    pub fn is_session(&self) -> bool {
        matches!(self, MessageType::Chat | MessageType::Reply)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message envelope as posted to `POST /api/route`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id.
    #[serde(default = "default_message_id")]
    pub id: String,
    /// Mission this message belongs to; assigned by the router when absent.
    #[serde(default)]
    pub mission_id: Option<String>,
    /// Sender address (`machine/project`), or the literal `human`.
    pub from_agent: String,
    /// Recipient address. Empty for a `reply`, which resolves via the thread.
    #[serde(default)]
    pub to_agent: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Free-form payload. Known keys: `message`, `thread_id`, `mission`,
    /// `prompt`, `session_id`, `limit`, `feedback_since`.
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn default_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Message {
    pub fn new(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        kind: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: default_message_id(),
            mission_id: None,
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Validate the envelope: addresses must parse, and the payload must be
    /// a JSON object (missing fields inside it are checked by the router).
    pub fn validate(&self) -> Result<(), IntercomError> {
        if self.from_agent != "human" {
            self.from_agent.parse::<AgentAddr>()?;
        }
        // A reply may omit the recipient; the thread map resolves it.
        if !self.to_agent.is_empty() && self.to_agent != "human" {
            self.to_agent.parse::<AgentAddr>()?;
        } else if self.to_agent.is_empty() && self.kind != MessageType::Reply {
            return Err(IntercomError::BadEnvelope(format!(
                "to_agent required for {} messages",
                self.kind
            )));
        }
        if !self.payload.is_object() {
            return Err(IntercomError::BadEnvelope(
                "payload must be a JSON object".into(),
            ));
        }
        Ok(())
    }

    /// The `message` text out of the payload, empty when absent.
    pub fn text(&self) -> &str {
        self.payload
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }

    /// The `thread_id` out of the payload, if any.
    pub fn thread_id(&self) -> Option<&str> {
        self.payload.get("thread_id").and_then(|v| v.as_str())
    }

    /// Return the mission id, generating and attaching one if absent.
    pub fn ensure_mission_id(&mut self) -> String {
        if let Some(id) = &self.mission_id {
            return id.clone();
        }
        let id = new_mission_id();
        self.mission_id = Some(id.clone());
        id
    }
}
