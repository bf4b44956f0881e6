//! Chat history records exchanged with the inference backend.

use chrono::{DateTime, Utc};
use pk_channels::MessageId;

/// One chat utterance, either from a participant or a model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub text: String,
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
}

/// Arrival-ordered buffer of messages not yet sent to the model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageList {
    pub messages: Vec<Message>,
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Moves every buffered message out, leaving an empty list behind.
    pub fn take(&mut self) -> MessageList {
        std::mem::take(self)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }
}

/// A validated model reply: what to say and which message to thread it under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageResponse {
    pub response_to_id: MessageId,
    pub text: String,
}
