use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, MessageId, ParticipantId};

pub const LOGIN_PATH: &str = "/api/auth/login";
pub const REGISTER_PATH: &str = "/api/auth/register";
pub const SEND_DESTINATION: &str = "/app/chat.send";
pub const DEFAULT_WS_PATH: &str = "/ws-chat";

pub fn conversation_topic(conversation_id: ConversationId) -> String {
    format!("/topic/conversations/{}", conversation_id.0)
}

pub fn conversation_messages_path(conversation_id: ConversationId) -> String {
    format!("/api/conversations/{}/messages", conversation_id.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub participant_id: ParticipantId,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub participant_id: ParticipantId,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// A persisted chat message as served by history fetches and topic publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<ParticipantId>,
    pub sender_name: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    /// `sent_at` in the local timezone, formatted for a chat transcript.
    pub fn local_time(&self) -> String {
        self.sent_at
            .with_timezone(&Local)
            .format("%H:%M:%S")
            .to_string()
    }
}

/// Body published to [`SEND_DESTINATION`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<ParticipantId>,
    pub content: String,
}
