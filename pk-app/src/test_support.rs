//! In-process fakes for the transport and the inference backend.

use anyhow::Result;
use async_trait::async_trait;
use pk_channels::{ChannelAdapter, ChatId, InboundMessage, OutboundMessage};
use pk_llm::{GenerationParams, InferenceBackend, InferenceReply, LlmError};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Notify, mpsc};

/// Backend that replays queued results. A gated backend parks every call
/// until [`ScriptedBackend::release`] is called; `panic_next_call` makes the
/// next call panic.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<pk_llm::Result<InferenceReply>>>,
    payloads: Mutex<Vec<String>>,
    last_params: Mutex<Option<GenerationParams>>,
    calls: AtomicUsize,
    panic_next: AtomicBool,
    gated: bool,
    entered: Notify,
    released: Notify,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            gated: true,
            ..Self::default()
        }
    }

    pub fn push_reply(&self, reasoning: &str, text: &str) {
        self.replies.lock().unwrap().push_back(Ok(InferenceReply {
            reasoning: reasoning.to_string(),
            text: text.to_string(),
        }));
    }

    pub fn push_error(&self, error: LlmError) {
        self.replies.lock().unwrap().push_back(Err(error));
    }

    pub fn panic_next_call(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().unwrap().clone()
    }

    pub fn last_params(&self) -> Option<GenerationParams> {
        *self.last_params.lock().unwrap()
    }

    pub async fn wait_until_entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn respond(
        &self,
        messages_batch: &str,
        params: &GenerationParams,
    ) -> pk_llm::Result<InferenceReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads
            .lock()
            .unwrap()
            .push(messages_batch.to_string());
        *self.last_params.lock().unwrap() = Some(*params);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("scripted backend panic");
        }
        if self.gated {
            self.entered.notify_one();
            self.released.notified().await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Remote("no scripted reply".to_string())))
    }
}

/// Transport that records outgoing messages. Sends can be made to fail.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<(ChatId, OutboundMessage)>>,
    failures_left: AtomicUsize,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` sends return an error without recording them.
    pub fn fail_next_sends(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(ChatId, OutboundMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .map(|(_, message)| message.content)
            .collect()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingChannel {
    fn channel_id(&self) -> &str {
        "recording"
    }

    async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        Ok(())
    }

    async fn send(&self, chat_id: ChatId, message: OutboundMessage) -> Result<()> {
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(anyhow::anyhow!("recording channel send failure"));
        }
        self.sent.lock().unwrap().push((chat_id, message));
        Ok(())
    }
}
