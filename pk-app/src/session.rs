//! Per-chat buffering state.
//!
//! Every operation takes one map entry lock and releases it before returning;
//! callers never hold a session across an `.await`.

use crate::messages::{Message, MessageList};
use dashmap::DashMap;
use pk_channels::ChatId;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ChatSession {
    /// Generation id; a fresh one is minted whenever the session is recreated.
    pub id: Uuid,
    pub messages: MessageList,
    pub awaiting_ai: bool,
    pub active: bool,
}

impl ChatSession {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            messages: MessageList::new(),
            awaiting_ai: false,
            active: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended { buffered: usize },
    /// A model call is in flight; the message was not recorded.
    AwaitingAi,
    Inactive,
}

/// The batch handed to the model, tagged with the session generation it came from.
#[derive(Debug)]
pub struct DispatchTicket {
    pub session_id: Uuid,
    pub batch: MessageList,
}

#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<ChatId, ChatSession>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the chat's session, creating an inactive empty one if needed.
    pub fn ensure(&self, chat_id: ChatId) -> dashmap::mapref::one::RefMut<'_, ChatId, ChatSession> {
        self.sessions.entry(chat_id).or_insert_with(ChatSession::new)
    }

    /// Returns `false` when the chat was already active; nothing changes then.
    pub fn activate(&self, chat_id: ChatId) -> bool {
        let mut session = self.ensure(chat_id);
        if session.active {
            return false;
        }
        session.active = true;
        session.messages = MessageList::new();
        session.awaiting_ai = false;
        true
    }

    /// Drops the whole session. Returns `false` when the chat was not active.
    pub fn deactivate(&self, chat_id: ChatId) -> bool {
        self.sessions
            .remove_if(&chat_id, |_, session| session.active)
            .is_some()
    }

    pub fn is_active(&self, chat_id: ChatId) -> bool {
        self.sessions
            .get(&chat_id)
            .is_some_and(|session| session.active)
    }

    pub fn append(&self, chat_id: ChatId, message: Message) -> AppendOutcome {
        let Some(mut session) = self.sessions.get_mut(&chat_id) else {
            return AppendOutcome::Inactive;
        };
        if !session.active {
            return AppendOutcome::Inactive;
        }
        if session.awaiting_ai {
            return AppendOutcome::AwaitingAi;
        }
        session.messages.push(message);
        AppendOutcome::Appended {
            buffered: session.messages.len(),
        }
    }

    /// Once more than `threshold` messages are buffered, hands the whole buffer
    /// out and marks the chat as awaiting a reply, in one step.
    pub fn begin_dispatch(&self, chat_id: ChatId, threshold: usize) -> Option<DispatchTicket> {
        let mut session = self.sessions.get_mut(&chat_id)?;
        if !session.active || session.awaiting_ai || session.messages.len() <= threshold {
            return None;
        }
        session.awaiting_ai = true;
        Some(DispatchTicket {
            session_id: session.id,
            batch: session.messages.take(),
        })
    }

    /// Clears `awaiting_ai` and records the model reply, if the session the
    /// batch was taken from still exists. Returns whether it did.
    pub fn finish_dispatch(
        &self,
        chat_id: ChatId,
        session_id: Uuid,
        reply: Option<Message>,
    ) -> bool {
        let Some(mut session) = self.sessions.get_mut(&chat_id) else {
            return false;
        };
        if session.id != session_id {
            return false;
        }
        session.awaiting_ai = false;
        if let Some(reply) = reply {
            session.messages.push(reply);
        }
        true
    }

    #[cfg(test)]
    pub fn snapshot(&self, chat_id: ChatId) -> Option<ChatSession> {
        self.sessions.get(&chat_id).map(|session| session.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
