use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{FriendshipId, MessageId, UserId, UserProfile};

pub const EVENT_JOIN_ROOM: &str = "join_room";
pub const EVENT_TYPING: &str = "typing";
pub const EVENT_STOP_TYPING: &str = "stop_typing";
pub const EVENT_RECEIVE_MESSAGE: &str = "receive_message";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl ChatMessage {
    /// True when `peer` is either side of this message.
    pub fn involves(&self, peer: &UserId) -> bool {
        &self.sender_id == peer || &self.receiver_id == peer
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub sender_id: UserId,
    pub recipient_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub sender_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    JoinRoom(UserId),
    Typing(TypingPayload),
    StopTyping(TypingPayload),
}

impl ClientFrame {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => EVENT_JOIN_ROOM,
            Self::Typing(_) => EVENT_TYPING,
            Self::StopTyping(_) => EVENT_STOP_TYPING,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    ReceiveMessage(ChatMessage),
    Typing(TypingNotice),
    StopTyping(TypingNotice),
}

/// Undecoded realtime frame. The event name is inspected before the payload so
/// that unknown events can be skipped instead of failing the whole frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ServerFrame {
    /// Decodes a text frame. `Ok(None)` means the event is not one this client handles.
    pub fn decode(text: &str) -> Result<Option<Self>, serde_json::Error> {
        let raw: RawFrame = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawFrame) -> Result<Option<Self>, serde_json::Error> {
        let frame = match raw.event.as_str() {
            EVENT_RECEIVE_MESSAGE => Self::ReceiveMessage(serde_json::from_value(raw.data)?),
            EVENT_TYPING => Self::Typing(serde_json::from_value(raw.data)?),
            EVENT_STOP_TYPING => Self::StopTyping(serde_json::from_value(raw.data)?),
            _ => return Ok(None),
        };
        Ok(Some(frame))
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ReceiveMessage(_) => EVENT_RECEIVE_MESSAGE,
            Self::Typing(_) => EVENT_TYPING,
            Self::StopTyping(_) => EVENT_STOP_TYPING,
        }
    }
}

/// One long-poll batch from the polling fallback transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    pub cursor: u64,
    #[serde(default)]
    pub frames: Vec<RawFrame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub receiver_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendSummary {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub friendship_id: FriendshipId,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub unread_count: Option<u32>,
}

impl FriendSummary {
    pub fn unread(&self) -> u32 {
        self.unread_count.unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub token: String,
}

impl AuthResponse {
    pub fn into_parts(self) -> (UserProfile, String) {
        (
            UserProfile {
                id: self.id,
                username: self.username,
                email: self.email,
            },
            self.token,
        )
    }
}
