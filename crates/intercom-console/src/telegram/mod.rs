//! Telegram operator console.
//!
//! One forum topic per mission in a supergroup, inline-keyboard approval
//! prompts, and join announcements with Approve/Deny buttons. Inbound
//! updates arrive over a `getUpdates` long-poll loop; operator commands
//! (`/agents`, `/machines`) are forwarded to the hub through a channel
//! since only the hub can answer them.

pub mod api;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use intercom_policy::GrantScope;

use crate::{ApprovalReply, ApprovalRequest, JoinDecision, OperatorConsole};

use self::api::TelegramApi;
use self::types::{InlineKeyboardButton, InlineKeyboardMarkup};

/// Errors from console operations.
#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned error: {0}")]
    Api(String),

    #[error("{0}")]
    Other(String),
}

/// Operator input the console cannot answer by itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    ListAgents,
    ListMachines,
    /// `/stop <mission-id>`: kill a running mission's child agent.
    StopMission { mission_id: String },
    /// Free text typed inside a mission topic.
    TopicMessage { thread_id: i64, text: String },
}

/// How long an approval prompt waits for the operator.
const APPROVAL_TIMEOUT: Duration = Duration::from_secs(600);
/// Long-poll timeout passed to `getUpdates`.
const POLL_TIMEOUT_SECS: u64 = 30;

#[derive(Default)]
struct ConsoleState {
    /// mission_id -> forum topic thread id.
    mission_topics: HashMap<String, i64>,
    /// prompt id -> waiting approval caller.
    pending_approvals: HashMap<String, oneshot::Sender<ApprovalReply>>,
    /// machine_id -> waiting join caller.
    pending_joins: HashMap<String, oneshot::Sender<JoinDecision>>,
}

/// The Telegram-backed [`OperatorConsole`].
pub struct TelegramConsole {
    api: Arc<TelegramApi>,
    supergroup_id: i64,
    allowed_users: Vec<i64>,
    state: Arc<Mutex<ConsoleState>>,
    command_tx: mpsc::Sender<OperatorCommand>,
}

impl TelegramConsole {
    /// Build the console. The returned receiver carries operator commands
    /// for the hub to answer (via [`TelegramConsole::reply`]).
    pub fn new(
        bot_token: &str,
        supergroup_id: i64,
        allowed_users: Vec<i64>,
    ) -> (Self, mpsc::Receiver<OperatorCommand>) {
        let (command_tx, command_rx) = mpsc::channel(32);
        (
            Self {
                api: Arc::new(TelegramApi::new(bot_token)),
                supergroup_id,
                allowed_users,
                state: Arc::new(Mutex::new(ConsoleState::default())),
                command_tx,
            },
            command_rx,
        )
    }

    /// Spawn the long-poll loop. Runs until `cancel` flips to true.
    pub fn start(&self, cancel: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let api = Arc::clone(&self.api);
        let state = Arc::clone(&self.state);
        let command_tx = self.command_tx.clone();
        let supergroup_id = self.supergroup_id;
        let allowed_users = self.allowed_users.clone();
        tokio::spawn(poll_loop(
            api,
            state,
            command_tx,
            supergroup_id,
            allowed_users,
            cancel,
        ))
    }

    /// Answer an operator command with plain text in the group.
    pub async fn reply(&self, text: &str) {
        if let Err(e) = self
            .api
            .send_message(self.supergroup_id, text, None, None)
            .await
        {
            warn!("failed to send command reply: {e}");
        }
    }
}

#[async_trait]
impl OperatorConsole for TelegramConsole {
    async fn announce_join(
        &self,
        machine_id: &str,
        display_name: &str,
        overlay_ip: &str,
    ) -> Option<JoinDecision> {
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .await
            .pending_joins
            .insert(machine_id.to_string(), tx);

        let text = format!(
            "🖥 Join request\n\nMachine: {machine_id}\nName: {display_name}\nOverlay IP: {overlay_ip}"
        );
        let keyboard = InlineKeyboardMarkup {
            inline_keyboard: vec![vec![
                InlineKeyboardButton {
                    text: "✅ Approve".into(),
                    callback_data: format!("join:{machine_id}:approve"),
                },
                InlineKeyboardButton {
                    text: "❌ Deny".into(),
                    callback_data: format!("join:{machine_id}:deny"),
                },
            ]],
        };
        if let Err(e) = self
            .api
            .send_message(self.supergroup_id, &text, None, Some(keyboard))
            .await
        {
            warn!(machine = machine_id, "failed to announce join: {e}");
            self.state.lock().await.pending_joins.remove(machine_id);
            return None;
        }

        let decision = tokio::time::timeout(APPROVAL_TIMEOUT, rx).await;
        self.state.lock().await.pending_joins.remove(machine_id);
        match decision {
            Ok(Ok(d)) => Some(d),
            // Timeout or dropped sender: the join stays pending.
            _ => None,
        }
    }

    async fn ask_approval(&self, request: ApprovalRequest) -> ApprovalReply {
        let prompt_id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .await
            .pending_approvals
            .insert(prompt_id.clone(), tx);

        let text = format!("🔔 Approval required — {}\n\n{}", request.label, request.prompt);
        let keyboard = approval_keyboard(&prompt_id, &request.scopes);
        if let Err(e) = self
            .api
            .send_message(self.supergroup_id, &text, None, Some(keyboard))
            .await
        {
            warn!("failed to send approval prompt: {e}");
            self.state.lock().await.pending_approvals.remove(&prompt_id);
            return ApprovalReply::TimedOut;
        }

        let reply = tokio::time::timeout(APPROVAL_TIMEOUT, rx).await;
        self.state.lock().await.pending_approvals.remove(&prompt_id);
        match reply {
            Ok(Ok(r)) => r,
            _ => {
                warn!(prompt = prompt_id.as_str(), "approval timed out");
                ApprovalReply::TimedOut
            }
        }
    }

    async fn post_to_mission(&self, mission_id: &str, text: &str) {
        let mut state = self.state.lock().await;
        let topic_id = match state.mission_topics.get(mission_id) {
            Some(&id) => Some(id),
            None => {
                let name = format!("{mission_id}: {}", truncate(text, 40));
                match self.api.create_forum_topic(self.supergroup_id, &name).await {
                    Ok(id) => {
                        state.mission_topics.insert(mission_id.to_string(), id);
                        Some(id)
                    }
                    Err(e) => {
                        // Group may not have topics enabled; fall back to
                        // plain messages.
                        debug!(mission = mission_id, "createForumTopic failed: {e}");
                        None
                    }
                }
            }
        };
        drop(state);

        if let Err(e) = self
            .api
            .send_message(self.supergroup_id, text, topic_id, None)
            .await
        {
            warn!(mission = mission_id, "failed to post mission line: {e}");
        }
    }

    async fn notify_feedback(&self, kind: &str, text: &str) {
        let line = format!("📝 [{kind}] {text}");
        if let Err(e) = self
            .api
            .send_message(self.supergroup_id, &line, None, None)
            .await
        {
            warn!("failed to send notification: {e}");
        }
    }
}

/// Build the approval keyboard for the scopes on offer, plus Deny.
fn approval_keyboard(prompt_id: &str, scopes: &[GrantScope]) -> InlineKeyboardMarkup {
    let mut row = Vec::new();
    let mut rows = Vec::new();
    for scope in scopes {
        let label = match scope {
            GrantScope::Once => "✅ Once",
            GrantScope::Mission => "✅ This mission",
            GrantScope::Session => "✅ This session",
            GrantScope::AlwaysAllow => "✅ Always",
        };
        row.push(InlineKeyboardButton {
            text: label.into(),
            callback_data: format!("approve:{prompt_id}:{}", scope.as_str()),
        });
        if row.len() == 2 {
            rows.push(std::mem::take(&mut row));
        }
    }
    row.push(InlineKeyboardButton {
        text: "❌ Deny".into(),
        callback_data: format!("approve:{prompt_id}:deny"),
    });
    rows.push(row);
    InlineKeyboardMarkup {
        inline_keyboard: rows,
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Long-poll `getUpdates` and dispatch callbacks and commands.
async fn poll_loop(
    api: Arc<TelegramApi>,
    state: Arc<Mutex<ConsoleState>>,
    command_tx: mpsc::Sender<OperatorCommand>,
    supergroup_id: i64,
    allowed_users: Vec<i64>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut offset: Option<i64> = None;
    let mut backoff_secs = 1u64;

    info!(chat_id = supergroup_id, "telegram poller started");

    loop {
        if *cancel.borrow() {
            info!("telegram poller shutting down");
            return;
        }

        let updates = tokio::select! {
            result = api.get_updates(offset, POLL_TIMEOUT_SECS) => result,
            _ = cancel.changed() => {
                info!("telegram poller cancelled");
                return;
            }
        };

        let updates = match updates {
            Ok(u) => {
                backoff_secs = 1;
                u
            }
            Err(e) => {
                warn!("getUpdates failed: {e}, retrying in {backoff_secs}s");
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(30);
                continue;
            }
        };

        for update in updates {
            offset = Some(update.update_id + 1);

            if let Some(cb) = update.callback_query {
                if !allowed_users.contains(&cb.from.id) {
                    let _ = api.answer_callback_query(&cb.id, Some("Unauthorized")).await;
                    continue;
                }
                let Some(data) = cb.data.as_deref() else {
                    continue;
                };
                let handled = handle_callback(&state, data).await;
                let _ = api
                    .answer_callback_query(&cb.id, handled.as_deref())
                    .await;
                // Strip the keyboard so the decision can't be re-sent.
                if let Some(msg) = &cb.message {
                    let _ = api.remove_reply_markup(msg.chat.id, msg.message_id).await;
                }
                continue;
            }

            if let Some(msg) = update.message {
                if msg.chat.id != supergroup_id {
                    debug!(from_chat = msg.chat.id, "ignoring message from other chat");
                    continue;
                }
                if !msg.from.as_ref().is_some_and(|u| allowed_users.contains(&u.id)) {
                    continue;
                }
                let Some(text) = msg.text else { continue };

                if let Some(command) = parse_operator_text(&text, msg.message_thread_id) {
                    if command_tx.send(command).await.is_err() {
                        warn!("command channel closed, stopping poller");
                        return;
                    }
                }
            }
        }
    }
}

/// Parse an operator text message into a command. Non-command text only
/// counts inside a mission topic.
fn parse_operator_text(text: &str, thread_id: Option<i64>) -> Option<OperatorCommand> {
    let trimmed = text.trim();
    if trimmed == "/agents" {
        return Some(OperatorCommand::ListAgents);
    }
    if trimmed == "/machines" {
        return Some(OperatorCommand::ListMachines);
    }
    if let Some(arg) = trimmed.strip_prefix("/stop") {
        if arg.is_empty() || arg.starts_with(' ') {
            return Some(OperatorCommand::StopMission {
                mission_id: arg.trim().to_string(),
            });
        }
    }
    thread_id.map(|thread_id| OperatorCommand::TopicMessage {
        thread_id,
        text: text.to_string(),
    })
}

/// Resolve a callback against pending approvals/joins. Returns the ack
/// text for the button spinner.
async fn handle_callback(state: &Mutex<ConsoleState>, data: &str) -> Option<String> {
    let mut parts = data.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("approve"), Some(prompt_id), Some(choice)) => {
            let sender = state.lock().await.pending_approvals.remove(prompt_id);
            let Some(sender) = sender else {
                debug!(prompt = prompt_id, "no pending approval for callback");
                return Some("Already decided".into());
            };
            let (reply, ack) = if choice == "deny" {
                (ApprovalReply::Denied, "Denied")
            } else {
                match GrantScope::parse(choice) {
                    Some(scope) => (ApprovalReply::Granted(scope), "Approved"),
                    None => (ApprovalReply::Denied, "Denied"),
                }
            };
            let _ = sender.send(reply);
            Some(ack.into())
        }
        (Some("join"), Some(machine_id), Some(action)) => {
            let sender = state.lock().await.pending_joins.remove(machine_id);
            let Some(sender) = sender else {
                return Some("No pending join".into());
            };
            let decision = if action == "approve" {
                JoinDecision::Approved
            } else {
                JoinDecision::Denied
            };
            let _ = sender.send(decision);
            Some(
                if decision == JoinDecision::Approved {
                    "Machine approved"
                } else {
                    "Machine denied"
                }
                .into(),
            )
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyboard_offers_all_scopes_and_deny() {
        let kb = approval_keyboard(
            "abc",
            &[
                GrantScope::Once,
                GrantScope::Mission,
                GrantScope::Session,
                GrantScope::AlwaysAllow,
            ],
        );
        let buttons: Vec<&InlineKeyboardButton> =
            kb.inline_keyboard.iter().flatten().collect();
        assert_eq!(buttons.len(), 5);
        assert_eq!(buttons[0].callback_data, "approve:abc:once");
        assert_eq!(buttons[1].callback_data, "approve:abc:mission");
        assert_eq!(buttons[4].callback_data, "approve:abc:deny");
    }

    #[tokio::test]
    async fn callback_resolves_pending_approval() {
        let state = Mutex::new(ConsoleState::default());
        let (tx, rx) = oneshot::channel();
        state
            .lock()
            .await
            .pending_approvals
            .insert("p1".into(), tx);

        let ack = handle_callback(&state, "approve:p1:mission").await;
        assert_eq!(ack.as_deref(), Some("Approved"));
        assert_eq!(
            rx.await.unwrap(),
            ApprovalReply::Granted(GrantScope::Mission)
        );
        assert!(state.lock().await.pending_approvals.is_empty());
    }

    #[tokio::test]
    async fn callback_deny_and_stale() {
        let state = Mutex::new(ConsoleState::default());
        let (tx, rx) = oneshot::channel();
        state.lock().await.pending_approvals.insert("p2".into(), tx);

        let ack = handle_callback(&state, "approve:p2:deny").await;
        assert_eq!(ack.as_deref(), Some("Denied"));
        assert_eq!(rx.await.unwrap(), ApprovalReply::Denied);

        // A second press on the same prompt is stale.
        let ack = handle_callback(&state, "approve:p2:once").await;
        assert_eq!(ack.as_deref(), Some("Already decided"));
    }

    #[tokio::test]
    async fn callback_resolves_pending_join() {
        let state = Mutex::new(ConsoleState::default());
        let (tx, rx) = oneshot::channel();
        state.lock().await.pending_joins.insert("box-a".into(), tx);

        let ack = handle_callback(&state, "join:box-a:approve").await;
        assert_eq!(ack.as_deref(), Some("Machine approved"));
        assert_eq!(rx.await.unwrap(), JoinDecision::Approved);
    }

    #[test]
    fn parse_operator_text_commands() {
        assert_eq!(
            parse_operator_text("/agents", None),
            Some(OperatorCommand::ListAgents)
        );
        assert_eq!(
            parse_operator_text(" /machines ", None),
            Some(OperatorCommand::ListMachines)
        );
        assert_eq!(
            parse_operator_text("/stop m-20250101-abc123", None),
            Some(OperatorCommand::StopMission {
                mission_id: "m-20250101-abc123".into()
            })
        );
        // Missing argument still parses; the hub answers with usage.
        assert_eq!(
            parse_operator_text("/stop", None),
            Some(OperatorCommand::StopMission {
                mission_id: String::new()
            })
        );
        // Plain text outside a topic is dropped, inside a topic it is a
        // topic message.
        assert_eq!(parse_operator_text("hello", None), None);
        assert_eq!(
            parse_operator_text("hello", Some(7)),
            Some(OperatorCommand::TopicMessage {
                thread_id: 7,
                text: "hello".into()
            })
        );
    }

    #[test]
    fn malformed_callback_is_ignored() {
        let state = Mutex::new(ConsoleState::default());
        let ack = futures_block_on(handle_callback(&state, "garbage"));
        assert!(ack.is_none());
    }

    // Tiny helper so the malformed-callback test stays sync.
    fn futures_block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }
}
