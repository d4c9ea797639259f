//! Operator console adapter.
//!
//! The routing core talks to the human operator exclusively through the
//! [`OperatorConsole`] trait: join announcements, approval prompts,
//! per-mission visibility lines, and one-shot notifications. The Telegram
//! implementation lives in [`telegram`]; tests use [`NoopConsole`].

pub mod telegram;

use async_trait::async_trait;

use intercom_policy::GrantScope;

/// The operator's answer to an approval prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalReply {
    /// Allowed, with the scope the operator picked.
    Granted(GrantScope),
    Denied,
    /// No answer within the approval timeout.
    TimedOut,
}

/// The operator's answer to a join announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDecision {
    Approved,
    Denied,
}

/// An approval prompt to put in front of the operator.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    /// Short rule label, e.g. "deploy request".
    pub label: String,
    /// Full prompt body (sender, recipient, type, payload preview).
    pub prompt: String,
    /// Scopes the operator may grant.
    pub scopes: Vec<GrantScope>,
}

/// Outbound interface to the human operator. The only place the core
/// depends on an external chat surface.
#[async_trait]
pub trait OperatorConsole: Send + Sync {
    /// Announce a join request and wait for the operator. `None` means the
    /// operator did not act within the adapter's timeout; the join stays
    /// pending.
    async fn announce_join(
        &self,
        machine_id: &str,
        display_name: &str,
        overlay_ip: &str,
    ) -> Option<JoinDecision>;

    /// Put an approval prompt in front of the operator and wait.
    async fn ask_approval(&self, request: ApprovalRequest) -> ApprovalReply;

    /// Post a visibility line to the mission's thread, creating the thread
    /// on first use. Best-effort; errors are logged, not surfaced.
    async fn post_to_mission(&self, mission_id: &str, text: &str);

    /// One-shot notification not tied to a mission.
    async fn notify_feedback(&self, kind: &str, text: &str);
}

/// A console that answers from canned replies and records what it was
/// told. Stands in for the real adapter in tests and headless setups.
pub struct NoopConsole {
    approval_reply: ApprovalReply,
    join_decision: Option<JoinDecision>,
    posts: std::sync::Mutex<Vec<(String, String)>>,
    notifications: std::sync::Mutex<Vec<(String, String)>>,
}

impl NoopConsole {
    /// A console that denies approvals and leaves joins pending.
    pub fn new() -> Self {
        Self::with_replies(ApprovalReply::Denied, None)
    }

    /// A console that grants every approval once. Useful in standalone
    /// mode, where no operator surface is configured.
    pub fn approving() -> Self {
        Self::with_replies(ApprovalReply::Granted(GrantScope::Once), Some(JoinDecision::Approved))
    }

    pub fn with_replies(approval_reply: ApprovalReply, join_decision: Option<JoinDecision>) -> Self {
        Self {
            approval_reply,
            join_decision,
            posts: std::sync::Mutex::new(Vec::new()),
            notifications: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// `(mission_id, text)` pairs seen by `post_to_mission`.
    pub fn posts(&self) -> Vec<(String, String)> {
        self.posts.lock().unwrap().clone()
    }

    /// `(kind, text)` pairs seen by `notify_feedback`.
    pub fn notifications(&self) -> Vec<(String, String)> {
        self.notifications.lock().unwrap().clone()
    }
}

impl Default for NoopConsole {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperatorConsole for NoopConsole {
    async fn announce_join(
        &self,
        machine_id: &str,
        _display_name: &str,
        _overlay_ip: &str,
    ) -> Option<JoinDecision> {
        tracing::debug!(machine = machine_id, "join announced to no-op console");
        self.join_decision
    }

    async fn ask_approval(&self, _request: ApprovalRequest) -> ApprovalReply {
        self.approval_reply.clone()
    }

    async fn post_to_mission(&self, mission_id: &str, text: &str) {
        self.posts
            .lock()
            .unwrap()
            .push((mission_id.to_string(), text.to_string()));
    }

    async fn notify_feedback(&self, kind: &str, text: &str) {
        self.notifications
            .lock()
            .unwrap()
            .push((kind.to_string(), text.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_records_posts_and_notifications() {
        let console = NoopConsole::new();
        console.post_to_mission("m-1", "a/p -> b/q: hi").await;
        console.post_to_mission("m-1", "delivered").await;
        console.notify_feedback("bug", "router hiccup").await;

        assert_eq!(console.posts().len(), 2);
        assert_eq!(console.posts()[0].0, "m-1");
        assert_eq!(console.notifications(), vec![("bug".into(), "router hiccup".into())]);
    }

    #[tokio::test]
    async fn noop_replies_are_canned() {
        let console = NoopConsole::new();
        let reply = console
            .ask_approval(ApprovalRequest {
                label: "x".into(),
                prompt: "y".into(),
                scopes: vec![GrantScope::Once],
            })
            .await;
        assert_eq!(reply, ApprovalReply::Denied);
        assert_eq!(console.announce_join("m", "M", "ip").await, None);

        let approving = NoopConsole::approving();
        let reply = approving
            .ask_approval(ApprovalRequest {
                label: "x".into(),
                prompt: "y".into(),
                scopes: vec![],
            })
            .await;
        assert_eq!(reply, ApprovalReply::Granted(GrantScope::Once));
    }
}
