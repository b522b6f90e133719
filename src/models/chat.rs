use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PlayerId;

/// Longest chat message accepted, in characters.
pub const CHAT_MESSAGE_MAX: usize = 255;

/// A message posted to the global chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub sender: PlayerId,
    pub message: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChatMessage {
    pub sender: PlayerId,
    pub message: String,
    pub sent_at: DateTime<Utc>,
}

impl NewChatMessage {
    /// Trim the text and check it is neither empty nor too long.
    pub fn new(sender: PlayerId, message: &str, sent_at: DateTime<Utc>) -> Result<Self, String> {
        let message = message.trim();
        if message.is_empty() {
            return Err("chat message is empty".to_string());
        }
        let length = message.chars().count();
        if length > CHAT_MESSAGE_MAX {
            return Err(format!(
                "chat message has {} characters, at most {} are allowed",
                length, CHAT_MESSAGE_MAX
            ));
        }
        Ok(Self {
            sender,
            message: message.to_string(),
            sent_at,
        })
    }
}
