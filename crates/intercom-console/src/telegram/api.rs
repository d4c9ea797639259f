//! Raw HTTP calls to the Telegram Bot API.
//!
//! Wraps reqwest for `sendMessage`, `createForumTopic`, `getUpdates`,
//! `answerCallbackQuery`, and `editMessageReplyMarkup`.

use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use super::types::{ApiResponse, ForumTopic, InlineKeyboardMarkup, SentMessage, Update};
use super::ConsoleError;

/// Low-level Telegram Bot API client.
pub struct TelegramApi {
    client: Client,
    base_url: String,
}

impl TelegramApi {
    pub fn new(bot_token: &str) -> Self {
        Self::with_base_url(bot_token, "https://api.telegram.org")
    }

    /// Custom base URL, for tests.
    pub fn with_base_url(bot_token: &str, base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: format!("{}/bot{}", base_url.trim_end_matches('/'), bot_token),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, ConsoleError> {
        let resp = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(&body)
            .send()
            .await?;
        let api_resp: ApiResponse<T> = resp.json().await?;
        if !api_resp.ok {
            let desc = api_resp.description.unwrap_or_default();
            warn!(method, "telegram call failed: {desc}");
            return Err(ConsoleError::Api(desc));
        }
        api_resp
            .result
            .ok_or_else(|| ConsoleError::Api(format!("{method}: missing result")))
    }

    /// Send a text message, optionally into a forum topic and with an
    /// inline keyboard. Returns the sent message id.
    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        message_thread_id: Option<i64>,
        reply_markup: Option<InlineKeyboardMarkup>,
    ) -> Result<i64, ConsoleError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(thread) = message_thread_id {
            body["message_thread_id"] = json!(thread);
        }
        if let Some(markup) = reply_markup {
            body["reply_markup"] = serde_json::to_value(markup)
                .map_err(|e| ConsoleError::Other(format!("serialize markup: {e}")))?;
        }

        debug!(chat_id, "sendMessage");
        let sent: SentMessage = self.call("sendMessage", body).await?;
        Ok(sent.message_id)
    }

    /// Create a forum topic in a supergroup, returning its thread id.
    pub async fn create_forum_topic(
        &self,
        chat_id: i64,
        name: &str,
    ) -> Result<i64, ConsoleError> {
        let topic: ForumTopic = self
            .call(
                "createForumTopic",
                json!({"chat_id": chat_id, "name": name}),
            )
            .await?;
        Ok(topic.message_thread_id)
    }

    /// Long-poll for updates. `offset` is `last_update_id + 1`.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: u64,
    ) -> Result<Vec<Update>, ConsoleError> {
        let mut body = json!({
            "timeout": timeout,
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(off) = offset {
            body["offset"] = json!(off);
        }
        self.call("getUpdates", body).await
    }

    /// Acknowledge a callback query (dismisses the button spinner).
    pub async fn answer_callback_query(
        &self,
        callback_query_id: &str,
        text: Option<&str>,
    ) -> Result<(), ConsoleError> {
        let mut body = json!({"callback_query_id": callback_query_id});
        if let Some(t) = text {
            body["text"] = json!(t);
        }
        let _: bool = self.call("answerCallbackQuery", body).await?;
        Ok(())
    }

    /// Remove inline keyboard buttons from a message (prevents double-tap).
    pub async fn remove_reply_markup(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<(), ConsoleError> {
        let body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "reply_markup": {"inline_keyboard": []},
        });
        // Telegram returns the edited message object here; ignore it.
        let _: serde_json::Value = self.call("editMessageReplyMarkup", body).await?;
        Ok(())
    }
}
