//! Conversation message model.
//!
//! A [`Message`] is owned by the conversation it belongs to and mutated in
//! place for reactions, edits and read receipts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Message id, unique within its conversation.
pub type MessageId = String;

/// Longest honoured expiry, in milliseconds. Larger wire values are capped.
pub const MAX_EXPIRY_MS: u64 = u32::MAX as u64;

/// Cap a wire expiry to [`MAX_EXPIRY_MS`].
pub fn clamp_expiry(expiry_ms: u64) -> u64 {
    expiry_ms.min(MAX_EXPIRY_MS)
}

/// Payload variants. Binary media travels as an encoded string (data URL).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Content {
    Text(String),
    Image(String),
    Audio(String),
}

impl Content {
    /// Build content from a wire `dataType` tag. Unknown tags fall back to text.
    pub fn from_data_type(data_type: Option<&str>, payload: String) -> Self {
        match data_type {
            Some("image") => Self::Image(payload),
            Some("audio") => Self::Audio(payload),
            _ => Self::Text(payload),
        }
    }

    pub fn data_type(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Image(_) => "image",
            Self::Audio(_) => "audio",
        }
    }

    pub fn payload(&self) -> &str {
        match self {
            Self::Text(s) | Self::Image(s) | Self::Audio(s) => s,
        }
    }

    /// Short text used for reply previews.
    pub fn preview(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Image(_) => "[image]".to_string(),
            Self::Audio(_) => "[audio]".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Me,
    Stranger,
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Seen,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRef {
    pub id: MessageId,
    pub text: String,
    pub sender_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reaction {
    pub emoji: String,
    pub sender: Sender,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub content: Content,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    /// Relative expiry in milliseconds, as carried on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyRef>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryStatus>,
    #[serde(default)]
    pub is_vanish: bool,
    #[serde(default)]
    pub is_edited: bool,
    /// Set once the vanish expiry has elapsed. The message stays in history.
    #[serde(default)]
    pub expired: bool,
}

impl Message {
    pub fn new(id: impl Into<MessageId>, content: Content, sender: Sender, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            content,
            sender,
            timestamp: now,
            expiry_duration: None,
            expires_at: None,
            reply_to: None,
            reactions: Vec::new(),
            status: (sender == Sender::Me).then_some(DeliveryStatus::Sent),
            is_vanish: false,
            is_edited: false,
            expired: false,
        }
    }

    pub fn system(text: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::new(
            format!("system-{}", uuid::Uuid::new_v4()),
            Content::Text(text.into()),
            Sender::System,
            now,
        )
    }

    /// Arm a relative expiry counted from the message timestamp.
    pub fn with_expiry(mut self, expiry_ms: u64) -> Self {
        self.expiry_duration = Some(expiry_ms);
        let ms = clamp_expiry(expiry_ms) as i64;
        self.expires_at = self
            .timestamp
            .checked_add_signed(Duration::milliseconds(ms));
        self
    }

    /// Whether the message is past its expiry at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expired || self.expires_at.is_some_and(|at| now >= at)
    }
}
