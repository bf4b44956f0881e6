use crate::error::Result;
use crate::types::{GenerationParams, InferenceReply};
use async_trait::async_trait;
use std::time::Duration;

/// A remote model that turns a serialized message batch into a reply.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Run one generation. Implementations must not retry.
    async fn respond(
        &self,
        messages_batch: &str,
        params: &GenerationParams,
    ) -> Result<InferenceReply>;
}

#[tracing::instrument(level = "debug", skip_all)]
pub(crate) fn build_http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(%e, "reqwest client build failed; falling back to default client");
            reqwest::Client::new()
        })
}
