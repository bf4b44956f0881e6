//! Inbound loop: channel adapters feed a single queue, handled one event at a time.

use crate::dispatch::{Dispatcher, TextDisposition};
use anyhow::Result;
use pk_channels::{InboundMessage, InboundMessageKind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Gateway {
    dispatcher: Dispatcher,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(
        dispatcher: Dispatcher,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            shutdown,
        }
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop().await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(&self) -> Result<()> {
        let mut rx = self.inbound_rx.lock().await;
        loop {
            let msg = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("gateway shutting down");
                    return Ok(());
                }
                msg = rx.recv() => msg,
            };
            let Some(inbound) = msg else {
                tracing::info!("inbound queue closed");
                return Ok(());
            };

            let chat_id = inbound.chat_id;
            if let Err(e) = self.handle_inbound(inbound).await {
                tracing::error!(%e, %chat_id, "exception while handling update");
                self.dispatcher.report_error(chat_id).await;
            }
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(chat_id = %inbound.chat_id))]
    async fn handle_inbound(&self, inbound: InboundMessage) -> Result<()> {
        match inbound.kind {
            InboundMessageKind::Command => self.dispatcher.handle_command(&inbound).await,
            InboundMessageKind::Text => {
                match self.dispatcher.on_text(&inbound) {
                    TextDisposition::Buffered { buffered } => {
                        tracing::debug!(buffered, "message buffered");
                    }
                    // Detached: the task reports its own outcome to the chat, panics included.
                    TextDisposition::Dispatched(task) => drop(task),
                    TextDisposition::Ignored | TextDisposition::Dropped => {}
                }
                Ok(())
            }
        }
    }
}
