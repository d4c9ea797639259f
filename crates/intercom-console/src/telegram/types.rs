//! Serde types for the Telegram Bot API.
//!
//! Only the fields the console needs are deserialized; everything else is
//! ignored.

use serde::{Deserialize, Serialize};

/// Generic Telegram API response wrapper.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub description: Option<String>,
    pub result: Option<T>,
}

/// An Update from `getUpdates`.
#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<TgMessage>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub from: Option<User>,
    pub chat: Chat,
    pub text: Option<String>,
    /// Forum topic the message was posted in, if any.
    pub message_thread_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct User {
    pub id: i64,
    pub first_name: String,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// An inline keyboard button press.
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    pub message: Option<TgMessage>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    pub callback_data: String,
}

#[derive(Debug, Deserialize)]
pub struct SentMessage {
    pub message_id: i64,
}

/// Result of `createForumTopic`.
#[derive(Debug, Deserialize)]
pub struct ForumTopic {
    pub message_thread_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_update_with_callback() {
        let json = r#"{
            "update_id": 12,
            "callback_query": {
                "id": "cb-1",
                "from": {"id": 42, "first_name": "Gilles"},
                "message": {
                    "message_id": 7,
                    "chat": {"id": -100123},
                    "date": 1700000000
                },
                "data": "approve:abc:mission"
            }
        }"#;
        let update: Update = serde_json::from_str(json).unwrap();
        let cb = update.callback_query.unwrap();
        assert_eq!(cb.from.id, 42);
        assert_eq!(cb.data.unwrap(), "approve:abc:mission");
    }

    #[test]
    fn deserialize_topic_message() {
        let json = r#"{
            "update_id": 13,
            "message": {
                "message_id": 8,
                "from": {"id": 42, "first_name": "Gilles"},
                "chat": {"id": -100123},
                "message_thread_id": 99,
                "text": "/agents"
            }
        }"#;
        let update: Update = serde_json::from_str(json).unwrap();
        let msg = update.message.unwrap();
        assert_eq!(msg.message_thread_id, Some(99));
        assert_eq!(msg.text.unwrap(), "/agents");
    }

    #[test]
    fn deserialize_api_error() {
        let json = r#"{"ok": false, "description": "Unauthorized"}"#;
        let resp: ApiResponse<SentMessage> = serde_json::from_str(json).unwrap();
        assert!(!resp.ok);
        assert_eq!(resp.description.unwrap(), "Unauthorized");
    }

    #[test]
    fn serialize_keyboard() {
        let kb = InlineKeyboardMarkup {
            inline_keyboard: vec![vec![InlineKeyboardButton {
                text: "✅ Once".into(),
                callback_data: "approve:id:once".into(),
            }]],
        };
        let json = serde_json::to_string(&kb).unwrap();
        assert!(json.contains("callback_data"));
        assert!(json.contains("approve:id:once"));
    }
}
