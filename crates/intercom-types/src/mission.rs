//! Missions: the hub's bookkeeping record for a routed interaction.
//!
//! A mission carries two ordered logs: the message log (chat transcript)
//! and the feedback log (structured activity streamed from the child
//! agent). Feedback cursors are monotonically increasing from 1 and local
//! to their mission, so clients can poll incrementally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::MessageType;

/// Lifecycle of a mission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    PendingApproval,
    Approved,
    Denied,
    Running,
    Completed,
    Failed,
}

/// One entry of a mission's message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionMessage {
    pub from_agent: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// The payload of a feedback item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedbackKind {
    /// Assistant prose.
    Text { text: String },
    /// A recognised tool invocation with a one-line input summary.
    ToolUse { tool: String, summary: String },
    /// Turn counter advanced.
    Turn { turn: u32 },
}

/// One entry of a mission's feedback log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackItem {
    /// Monotonically increasing, starting at 1, local to the mission.
    pub cursor: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: FeedbackKind,
}

/// A mission record held in the hub's mission store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub mission_id: String,
    pub from_agent: String,
    pub to_agent: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub created_at: DateTime<Utc>,
    pub status: MissionStatus,
    /// Final output of the child agent, when the mission completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Short error label when the mission failed or was denied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub messages: Vec<MissionMessage>,
    #[serde(default)]
    pub feedback: Vec<FeedbackItem>,
}

impl Mission {
    pub fn new(
        mission_id: impl Into<String>,
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        kind: MessageType,
    ) -> Self {
        Self {
            mission_id: mission_id.into(),
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            kind,
            created_at: Utc::now(),
            status: MissionStatus::PendingApproval,
            output: None,
            error: None,
            messages: Vec::new(),
            feedback: Vec::new(),
        }
    }

    /// Append to the message log, preserving hub-arrival order.
    pub fn push_message(&mut self, from_agent: impl Into<String>, message: impl Into<String>) {
        self.messages.push(MissionMessage {
            from_agent: from_agent.into(),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    /// Append a feedback item with the next cursor.
    pub fn push_feedback(&mut self, kind: FeedbackKind) -> u64 {
        let cursor = self.feedback.last().map(|f| f.cursor).unwrap_or(0) + 1;
        self.feedback.push(FeedbackItem {
            cursor,
            timestamp: Utc::now(),
            kind,
        });
        cursor
    }

    /// Feedback items with a cursor strictly greater than `since`.
    pub fn feedback_since(&self, since: u64) -> &[FeedbackItem] {
        let start = self.feedback.partition_point(|f| f.cursor <= since);
        &self.feedback[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feedback_cursors_start_at_one_and_increase() {
        let mut m = Mission::new("m-1", "a/p", "b/q", MessageType::Ask);
        assert_eq!(m.push_feedback(FeedbackKind::Turn { turn: 1 }), 1);
        assert_eq!(
            m.push_feedback(FeedbackKind::ToolUse {
                tool: "Read".into(),
                summary: "src/a.md".into()
            }),
            2
        );
        assert_eq!(
            m.push_feedback(FeedbackKind::Text {
                text: "done".into()
            }),
            3
        );
        let cursors: Vec<u64> = m.feedback.iter().map(|f| f.cursor).collect();
        assert_eq!(cursors, vec![1, 2, 3]);
    }

    #[test]
    fn feedback_since_filters_by_cursor() {
        let mut m = Mission::new("m-1", "a/p", "b/q", MessageType::Ask);
        m.push_feedback(FeedbackKind::Turn { turn: 1 });
        m.push_feedback(FeedbackKind::Text { text: "one".into() });
        m.push_feedback(FeedbackKind::Text { text: "two".into() });

        assert_eq!(m.feedback_since(0).len(), 3);
        let tail = m.feedback_since(1);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].cursor, 2);
        assert!(m.feedback_since(3).is_empty());
    }

    #[test]
    fn message_log_preserves_order() {
        let mut m = Mission::new("m-1", "a/p", "b/q", MessageType::Chat);
        m.push_message("a/p", "first");
        m.push_message("b/q", "second");
        m.push_message("a/p", "third");
        let texts: Vec<&str> = m.messages.iter().map(|x| x.message.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn feedback_item_serializes_flat() {
        let item = FeedbackItem {
            cursor: 1,
            timestamp: Utc::now(),
            kind: FeedbackKind::ToolUse {
                tool: "Bash".into(),
                summary: "ls -la".into(),
            },
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["cursor"], 1);
        assert_eq!(json["kind"], "tool_use");
        assert_eq!(json["tool"], "Bash");
    }
}
