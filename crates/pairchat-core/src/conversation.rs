//! In-memory conversation: ordered messages plus typing/recording indicators.

use chrono::{DateTime, Utc};

use pairchat_shared::message::{Content, DeliveryStatus, Message, Reaction, Sender};

use crate::error::{EngineError, Result};
use crate::events::Indicator;

#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    typing: bool,
    recording: bool,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message. An id already present is rejected, never overwritten.
    pub fn insert(&mut self, message: Message) -> Result<&Message> {
        if self.get(&message.id).is_some() {
            return Err(EngineError::DuplicateMessage(message.id));
        }
        self.messages.push(message);
        Ok(&self.messages[self.messages.len() - 1])
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub fn react(&mut self, id: &str, reaction: Reaction) -> Option<&Message> {
        let message = self.get_mut(id)?;
        message.reactions.push(reaction);
        Some(message)
    }

    /// Replace the text of a message sent by `author`. Media messages and
    /// messages by anyone else are left untouched.
    pub fn edit(&mut self, id: &str, author: Sender, text: &str) -> Option<&Message> {
        let message = self.get_mut(id)?;
        if message.sender != author || !matches!(message.content, Content::Text(_)) {
            return None;
        }
        message.content = Content::Text(text.to_string());
        message.is_edited = true;
        Some(message)
    }

    /// Mark one of our own messages as seen by the partner.
    pub fn mark_seen(&mut self, id: &str) -> Option<&Message> {
        let message = self.get_mut(id)?;
        if message.sender != Sender::Me || message.status == Some(DeliveryStatus::Seen) {
            return None;
        }
        message.status = Some(DeliveryStatus::Seen);
        Some(message)
    }

    /// Flag a message as expired. It stays in the history.
    pub fn expire(&mut self, id: &str) -> Option<&Message> {
        let message = self.get_mut(id)?;
        if message.expired {
            return None;
        }
        message.expired = true;
        Some(message)
    }

    /// Full history, expired messages included.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages still visible at `now`.
    pub fn visible(&self, now: DateTime<Utc>) -> Vec<&Message> {
        self.messages
            .iter()
            .filter(|m| !m.is_expired_at(now))
            .collect()
    }

    /// Returns whether the indicator actually changed.
    pub fn set_indicator(&mut self, indicator: Indicator, active: bool) -> bool {
        let slot = match indicator {
            Indicator::Typing => &mut self.typing,
            Indicator::Recording => &mut self.recording,
        };
        let changed = *slot != active;
        *slot = active;
        changed
    }

    pub fn indicator(&self, indicator: Indicator) -> bool {
        match indicator {
            Indicator::Typing => self.typing,
            Indicator::Recording => self.recording,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.typing = false;
        self.recording = false;
    }
}
