//! Prikolist process wiring: transport, inference backend, sessions and the
//! inbound loop.

use crate::config::BotConfig;
use crate::dispatch::Dispatcher;
use crate::gateway::Gateway;
use crate::inference::InferenceGateway;
use crate::session::SessionManager;
use anyhow::Result;
use pk_channels::{ChannelAdapter, TelegramAdapter};
use pk_llm::{GradioClient, InferenceBackend};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const INBOUND_QUEUE_CAPACITY: usize = 256;

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = BotConfig::load(config_path).await?;

    let backend: Arc<dyn InferenceBackend> = Arc::new(GradioClient::new(cfg.gradio_config())?);
    let telegram: Arc<dyn ChannelAdapter> =
        Arc::new(TelegramAdapter::new(&cfg.telegram.bot_token)?);

    let dispatcher = Dispatcher::new(
        Arc::new(SessionManager::new()),
        Arc::new(InferenceGateway::new(backend)),
        telegram.clone(),
        cfg.dispatch.threshold,
    );

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    let shutdown = CancellationToken::new();
    let gateway = Arc::new(Gateway::new(dispatcher, inbound_rx, shutdown.clone()));
    let gateway_task = gateway.start();
    telegram.start(inbound_tx).await?;

    tracing::info!(
        channel = telegram.channel_id(),
        threshold = cfg.dispatch.threshold,
        space_url = %cfg.inference.space_url,
        "prikolist running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    shutdown.cancel();
    gateway_task.await?;
    Ok(())
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = BotConfig::load(config_path).await?;
    GradioClient::new(cfg.gradio_config())?;
    TelegramAdapter::new(&cfg.telegram.bot_token)?;
    tracing::info!(
        threshold = cfg.dispatch.threshold,
        space_url = %cfg.inference.space_url,
        endpoint = %cfg.inference.endpoint,
        hf_token_set = cfg.inference.hf_token.is_some(),
        "config ok"
    );
    Ok(())
}
