//! Buffering and dispatch state machine.
//!
//! Per chat: messages are buffered until more than `threshold` have piled up,
//! then the whole buffer is handed to the model on a spawned task. While that
//! call is in flight new messages are dropped. The handed-off batch is never
//! restored, whatever the outcome.

use crate::codec;
use crate::commands::{self, BotCommand};
use crate::inference::{InferenceGateway, InferenceOutcome};
use crate::messages::Message;
use crate::session::{AppendOutcome, SessionManager};
use anyhow::Result;
use chrono::Utc;
use pk_channels::{ChannelAdapter, ChatId, InboundMessage, OutboundMessage};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const DEFAULT_THRESHOLD: usize = 5;

pub const START_ACK: &str = "Йоу! Я живой 🤖";
pub const ALREADY_RUNNING: &str = "Я уже запущен и готов к работе! 🤖";
pub const FAREWELL: &str = "Пока! Если что, я тут 🤖";
pub const NOT_RUNNING: &str = "Я и так не запущен. 🤖";
pub const BUSY_NOTICE: &str = "I'm a bit busy right now. Try again in a moment.";
pub const PARSE_FAILURE_NOTICE: &str = "Couldn't parse AI response. Please try again.";
pub const SERVICE_ERROR_NOTICE: &str = "AI service error. Please try again later.";
pub const GENERIC_ERROR_NOTICE: &str = "An error occurred. Please try to restart the bot.";

/// What happened to one incoming text message.
#[derive(Debug)]
pub enum TextDisposition {
    /// Inactive chat, bot sender or empty text.
    Ignored,
    /// A reply is pending for this chat; the message was not recorded.
    Dropped,
    Buffered { buffered: usize },
    /// The message tipped the buffer over the threshold. The handle resolves
    /// once the reply (or a notice) has been delivered, even if the model call
    /// panicked.
    Dispatched(JoinHandle<()>),
}

#[derive(Clone)]
pub struct Dispatcher {
    sessions: Arc<SessionManager>,
    inference: Arc<InferenceGateway>,
    channel: Arc<dyn ChannelAdapter>,
    threshold: usize,
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<SessionManager>,
        inference: Arc<InferenceGateway>,
        channel: Arc<dyn ChannelAdapter>,
        threshold: usize,
    ) -> Self {
        Self {
            sessions,
            inference,
            channel,
            threshold,
        }
    }

    #[cfg(test)]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    #[tracing::instrument(level = "info", skip_all, fields(chat_id = %inbound.chat_id))]
    pub async fn handle_command(&self, inbound: &InboundMessage) -> Result<()> {
        if inbound.sender_is_bot {
            return Ok(());
        }
        let Some(command) = commands::parse_command(&inbound.content) else {
            tracing::debug!(content = %inbound.content, "ignoring unsupported command");
            return Ok(());
        };

        let reply = match command {
            BotCommand::Start => {
                if self.sessions.activate(inbound.chat_id) {
                    tracing::info!(active_chats = self.sessions.len(), "bot activated");
                    START_ACK
                } else {
                    ALREADY_RUNNING
                }
            }
            BotCommand::End => {
                if self.sessions.deactivate(inbound.chat_id) {
                    tracing::info!(
                        active_chats = self.sessions.len(),
                        "bot deactivated; chat state cleared"
                    );
                    FAREWELL
                } else {
                    NOT_RUNNING
                }
            }
        };

        self.channel
            .send(
                inbound.chat_id,
                OutboundMessage::reply(reply, inbound.message_id),
            )
            .await
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(chat_id = %inbound.chat_id, message_id = %inbound.message_id)
    )]
    pub fn on_text(&self, inbound: &InboundMessage) -> TextDisposition {
        if inbound.sender_is_bot || inbound.content.trim().is_empty() {
            return TextDisposition::Ignored;
        }
        if !self.sessions.is_active(inbound.chat_id) {
            return TextDisposition::Ignored;
        }
        tracing::info!(
            sender_id = ?inbound.sender_id.map(|id| id.get()),
            text = %inbound.content,
            "message received"
        );

        let message = Message {
            text: inbound.content.clone(),
            message_id: inbound.message_id,
            timestamp: inbound.received_at,
        };
        let buffered = match self.sessions.append(inbound.chat_id, message) {
            AppendOutcome::Appended { buffered } => buffered,
            AppendOutcome::AwaitingAi => {
                tracing::info!("awaiting AI response; not appending new message to history");
                return TextDisposition::Dropped;
            }
            AppendOutcome::Inactive => return TextDisposition::Ignored,
        };

        let Some(ticket) = self
            .sessions
            .begin_dispatch(inbound.chat_id, self.threshold)
        else {
            return TextDisposition::Buffered { buffered };
        };

        let payload = codec::build_payload(&ticket.batch);
        tracing::info!(
            batch = ticket.batch.len(),
            threshold = self.threshold,
            inference_busy = self.inference.is_busy(),
            "message threshold exceeded; dispatching to AI"
        );

        let this = self.clone();
        let chat_id = inbound.chat_id;
        let session_id = ticket.session_id;
        let handle = tokio::spawn(async move {
            let worker = tokio::spawn({
                let this = this.clone();
                async move { this.run_dispatch(chat_id, session_id, payload).await }
            });
            if let Err(error) = worker.await {
                tracing::error!(%error, %chat_id, "dispatch task failed");
                if this.sessions.finish_dispatch(chat_id, session_id, None) {
                    this.report_error(chat_id).await;
                }
            }
        });
        TextDisposition::Dispatched(handle)
    }

    #[tracing::instrument(level = "info", skip_all, fields(%chat_id))]
    async fn run_dispatch(&self, chat_id: ChatId, session_id: Uuid, payload: String) {
        let outcome = self.inference.dispatch(payload).await;
        let (reply, outbound) = resolve_outcome(outcome);

        // Clear the pending flag before touching the network so a failed send
        // cannot leave the chat stuck.
        if !self.sessions.finish_dispatch(chat_id, session_id, reply) {
            tracing::info!("chat was deactivated while awaiting AI; discarding result");
            return;
        }

        if let Err(error) = self.channel.send(chat_id, outbound).await {
            tracing::error!(%error, "failed to deliver AI result");
            self.report_error(chat_id).await;
        }
    }

    /// Best-effort generic failure notice to a chat.
    pub async fn report_error(&self, chat_id: ChatId) {
        if let Err(error) = self
            .channel
            .send(chat_id, OutboundMessage::text(GENERIC_ERROR_NOTICE))
            .await
        {
            tracing::warn!(%error, %chat_id, "failed to send error notice");
        }
    }
}

/// Maps a gateway outcome to the message recorded in history (if any) and the
/// message sent to the chat.
fn resolve_outcome(outcome: InferenceOutcome) -> (Option<Message>, OutboundMessage) {
    match outcome {
        InferenceOutcome::Success(raw) => match codec::parse_response(&raw) {
            Some(response) => {
                let recorded = Message {
                    text: response.text.clone(),
                    message_id: response.response_to_id,
                    timestamp: Utc::now(),
                };
                (
                    Some(recorded),
                    OutboundMessage::reply(response.text, response.response_to_id),
                )
            }
            None => {
                tracing::warn!("could not parse AI response; sending notice");
                (None, OutboundMessage::text(PARSE_FAILURE_NOTICE))
            }
        },
        InferenceOutcome::Busy => {
            tracing::info!("AI client busy; not sending a reply");
            (None, OutboundMessage::text(BUSY_NOTICE))
        }
        InferenceOutcome::TransportError(error) => {
            tracing::warn!(%error, "AI service error");
            (None, OutboundMessage::text(SERVICE_ERROR_NOTICE))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingChannel, ScriptedBackend};
    use pk_channels::{InboundMessageKind, MessageId, SenderId};
    use pk_llm::LlmError;

    const CHAT: ChatId = ChatId::new(-42);
    const THRESHOLD: usize = 3;

    struct Harness {
        dispatcher: Dispatcher,
        backend: Arc<ScriptedBackend>,
        channel: Arc<RecordingChannel>,
        inference: Arc<InferenceGateway>,
    }

    impl Harness {
        fn with_backend(backend: ScriptedBackend) -> Self {
            let backend = Arc::new(backend);
            let channel = Arc::new(RecordingChannel::new());
            let inference = Arc::new(InferenceGateway::new(backend.clone()));
            let dispatcher = Dispatcher::new(
                Arc::new(SessionManager::new()),
                inference.clone(),
                channel.clone(),
                THRESHOLD,
            );
            Self {
                dispatcher,
                backend,
                channel,
                inference,
            }
        }

        fn new() -> Self {
            Self::with_backend(ScriptedBackend::new())
        }

        fn activate(&self, chat: ChatId) {
            assert!(self.dispatcher.sessions().activate(chat));
        }

        fn text(&self, chat: ChatId, id: i64) -> TextDisposition {
            self.dispatcher.on_text(&inbound(chat, id, &format!("msg {id}")))
        }

        /// Sends texts until the threshold is exceeded and returns the dispatch task.
        fn fill_and_trigger(&self, chat: ChatId, first_id: i64) -> JoinHandle<()> {
            for offset in 0..THRESHOLD as i64 {
                let disposition = self.text(chat, first_id + offset);
                assert!(matches!(disposition, TextDisposition::Buffered { .. }));
            }
            match self.text(chat, first_id + THRESHOLD as i64) {
                TextDisposition::Dispatched(handle) => handle,
                other => panic!("expected dispatch, got {other:?}"),
            }
        }

        fn buffered_ids(&self, chat: ChatId) -> Vec<i64> {
            self.dispatcher
                .sessions()
                .snapshot(chat)
                .expect("session exists")
                .messages
                .iter()
                .map(|m| m.message_id.get())
                .collect()
        }

        fn awaiting(&self, chat: ChatId) -> bool {
            self.dispatcher
                .sessions()
                .snapshot(chat)
                .expect("session exists")
                .awaiting_ai
        }
    }

    fn inbound(chat: ChatId, id: i64, content: &str) -> InboundMessage {
        InboundMessage {
            kind: InboundMessageKind::Text,
            channel_id: "recording".to_string(),
            chat_id: chat,
            message_id: MessageId::new(id),
            sender_id: Some(SenderId::new(7)),
            sender_is_bot: false,
            content: content.to_string(),
            received_at: Utc::now(),
        }
    }

    fn command(chat: ChatId, id: i64, content: &str) -> InboundMessage {
        InboundMessage {
            kind: InboundMessageKind::Command,
            ..inbound(chat, id, content)
        }
    }

    #[tokio::test]
    async fn up_to_threshold_messages_never_call_the_model() {
        let h = Harness::new();
        h.activate(CHAT);
        for id in 1..=THRESHOLD as i64 {
            assert!(matches!(
                h.text(CHAT, id),
                TextDisposition::Buffered { buffered } if buffered == id as usize
            ));
        }
        assert_eq!(h.backend.calls(), 0);
        assert_eq!(h.buffered_ids(CHAT), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn inactive_chats_and_bot_senders_are_ignored() {
        let h = Harness::new();
        assert!(matches!(h.text(CHAT, 1), TextDisposition::Ignored));
        assert!(h.dispatcher.sessions().is_empty(), "no session for silent chats");

        h.activate(CHAT);
        let mut from_bot = inbound(CHAT, 2, "beep");
        from_bot.sender_is_bot = true;
        assert!(matches!(
            h.dispatcher.on_text(&from_bot),
            TextDisposition::Ignored
        ));
        assert!(matches!(
            h.dispatcher.on_text(&inbound(CHAT, 3, "   ")),
            TextDisposition::Ignored
        ));
        assert!(h.buffered_ids(CHAT).is_empty());
    }

    #[tokio::test]
    async fn exceeding_threshold_dispatches_once_and_clears_buffer_immediately() {
        let h = Harness::with_backend(ScriptedBackend::gated());
        h.backend.push_reply("", r#"{"response_to_id": "2", "text": "ха-ха"}"#);
        h.activate(CHAT);

        let handle = h.fill_and_trigger(CHAT, 1);
        assert!(h.buffered_ids(CHAT).is_empty(), "cleared before the reply");
        assert!(h.awaiting(CHAT));

        h.backend.wait_until_entered().await;
        assert_eq!(h.backend.calls(), 1);
        let payload: serde_json::Value =
            serde_json::from_str(&h.backend.payloads()[0]).expect("payload is json");
        let ids: Vec<i64> = payload["messages"]
            .as_array()
            .expect("messages array")
            .iter()
            .map(|m| m["message_id"].as_i64().expect("numeric id"))
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);

        h.backend.release();
        handle.await.expect("dispatch task");

        assert!(!h.awaiting(CHAT));
        assert_eq!(h.buffered_ids(CHAT), vec![2], "reply recorded under response_to_id");
        let sent = h.channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, CHAT);
        assert_eq!(sent[0].1, OutboundMessage::reply("ха-ха", MessageId::new(2)));
    }

    #[tokio::test]
    async fn messages_during_flight_are_dropped_without_new_calls() {
        let h = Harness::with_backend(ScriptedBackend::gated());
        h.backend.push_reply("", r#"{"response_to_id": 1, "text": "ok"}"#);
        h.activate(CHAT);
        let handle = h.fill_and_trigger(CHAT, 1);
        h.backend.wait_until_entered().await;

        for id in 10..20 {
            assert!(matches!(h.text(CHAT, id), TextDisposition::Dropped));
        }
        assert!(h.buffered_ids(CHAT).is_empty());
        assert_eq!(h.backend.calls(), 1);

        h.backend.release();
        handle.await.expect("dispatch task");
        assert_eq!(h.buffered_ids(CHAT), vec![1]);
        assert_eq!(h.backend.calls(), 1);
    }

    #[tokio::test]
    async fn busy_gateway_sends_notice_and_loses_the_batch() {
        let h = Harness::with_backend(ScriptedBackend::gated());
        h.backend.push_reply("", r#"{"response_to_id": 100, "text": "first chat"}"#);
        let other = ChatId::new(7);
        h.activate(CHAT);
        h.activate(other);

        let first = h.fill_and_trigger(other, 100);
        h.backend.wait_until_entered().await;

        let second = h.fill_and_trigger(CHAT, 1);
        second.await.expect("busy dispatch task");
        assert_eq!(h.backend.calls(), 1, "busy path must not reach the backend");
        assert!(!h.awaiting(CHAT));
        assert!(h.buffered_ids(CHAT).is_empty(), "batch is not restored");
        assert_eq!(h.channel.sent(), vec![(CHAT, OutboundMessage::text(BUSY_NOTICE))]);

        h.backend.release();
        first.await.expect("first dispatch task");
        assert!(!h.inference.is_busy());
        assert_eq!(h.channel.sent_texts(), vec![BUSY_NOTICE, "first chat"]);
    }

    #[tokio::test]
    async fn transport_error_sends_notice_and_loses_the_batch() {
        let h = Harness::new();
        h.backend.push_error(LlmError::Http("503 service unavailable".to_string()));
        h.activate(CHAT);

        h.fill_and_trigger(CHAT, 1).await.expect("dispatch task");
        assert!(!h.awaiting(CHAT));
        assert!(h.buffered_ids(CHAT).is_empty());
        assert!(!h.inference.is_busy());
        assert_eq!(h.channel.sent_texts(), vec![SERVICE_ERROR_NOTICE]);

        // The chat keeps working afterwards.
        h.backend.push_reply("", r#"{"response_to_id": 5, "text": "back"}"#);
        h.fill_and_trigger(CHAT, 5).await.expect("dispatch task");
        assert_eq!(h.channel.sent_texts(), vec![SERVICE_ERROR_NOTICE, "back"]);
    }

    #[tokio::test]
    async fn unparseable_reply_sends_notice_without_recording() {
        let h = Harness::new();
        h.backend.push_reply("", r#"{"response_to_id": "abc", "text": "hi"}"#);
        h.activate(CHAT);

        h.fill_and_trigger(CHAT, 1).await.expect("dispatch task");
        assert!(!h.awaiting(CHAT));
        assert!(h.buffered_ids(CHAT).is_empty());
        assert_eq!(h.channel.sent_texts(), vec![PARSE_FAILURE_NOTICE]);
    }

    #[tokio::test]
    async fn failed_delivery_still_clears_pending_flag() {
        let h = Harness::new();
        h.backend.push_reply("", r#"{"response_to_id": 1, "text": "hi"}"#);
        h.activate(CHAT);
        h.channel.fail_next_sends(1);

        h.fill_and_trigger(CHAT, 1).await.expect("dispatch task");
        assert!(!h.awaiting(CHAT));
        assert_eq!(h.channel.sent_texts(), vec![GENERIC_ERROR_NOTICE]);
    }

    #[tokio::test]
    async fn panicking_dispatch_clears_pending_flag_and_reports() {
        let h = Harness::new();
        h.backend.panic_next_call();
        h.activate(CHAT);

        h.fill_and_trigger(CHAT, 1).await.expect("supervising task");
        assert!(!h.awaiting(CHAT));
        assert!(!h.inference.is_busy());
        assert_eq!(h.channel.sent_texts(), vec![GENERIC_ERROR_NOTICE]);

        h.backend.push_reply("", r#"{"response_to_id": 5, "text": "back"}"#);
        h.fill_and_trigger(CHAT, 5).await.expect("dispatch task");
        assert_eq!(h.channel.sent_texts(), vec![GENERIC_ERROR_NOTICE, "back"]);
    }

    #[tokio::test]
    async fn deactivation_during_flight_discards_the_result() {
        let h = Harness::with_backend(ScriptedBackend::gated());
        h.backend.push_reply("", r#"{"response_to_id": 1, "text": "late"}"#);
        h.activate(CHAT);
        let handle = h.fill_and_trigger(CHAT, 1);
        h.backend.wait_until_entered().await;

        h.dispatcher
            .handle_command(&command(CHAT, 50, "/end"))
            .await
            .expect("end command");
        h.dispatcher
            .handle_command(&command(CHAT, 51, "/start"))
            .await
            .expect("start command");

        h.backend.release();
        handle.await.expect("dispatch task");
        assert!(h.buffered_ids(CHAT).is_empty(), "new session untouched");
        assert!(!h.awaiting(CHAT));
        assert_eq!(h.channel.sent_texts(), vec![FAREWELL, START_ACK]);
    }

    #[tokio::test]
    async fn start_and_end_commands_reply_in_thread_and_are_idempotent() {
        let h = Harness::new();
        for (id, content) in [(1, "/end"), (2, "/start"), (3, "/start"), (4, "/stop"), (5, "/end")] {
            h.dispatcher
                .handle_command(&command(CHAT, id, content))
                .await
                .expect("command handled");
        }

        let sent = h.channel.sent();
        let texts: Vec<&str> = sent.iter().map(|(_, m)| m.content.as_str()).collect();
        assert_eq!(
            texts,
            vec![NOT_RUNNING, START_ACK, ALREADY_RUNNING, FAREWELL, NOT_RUNNING]
        );
        let threaded: Vec<Option<i64>> = sent
            .iter()
            .map(|(_, m)| m.reply_to_message_id.map(|id| id.get()))
            .collect();
        assert_eq!(threaded, vec![Some(1), Some(2), Some(3), Some(4), Some(5)]);
        assert!(h.dispatcher.sessions().is_empty());
    }

    #[tokio::test]
    async fn second_start_keeps_the_buffer() {
        let h = Harness::new();
        h.dispatcher
            .handle_command(&command(CHAT, 1, "/start"))
            .await
            .expect("start");
        h.text(CHAT, 2);
        h.dispatcher
            .handle_command(&command(CHAT, 3, "/start"))
            .await
            .expect("start again");
        assert_eq!(h.buffered_ids(CHAT), vec![2]);
    }

    #[tokio::test]
    async fn unknown_commands_are_silent() {
        let h = Harness::new();
        h.dispatcher
            .handle_command(&command(CHAT, 1, "/help"))
            .await
            .expect("unknown command");
        assert!(h.channel.sent().is_empty());
    }
}
