use crate::client::{InferenceBackend, build_http_client};
use crate::error::{LlmError, Result};
use crate::types::{GenerationParams, InferenceReply};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_API_PREFIX: &str = "/gradio_api";
pub const DEFAULT_ENDPOINT: &str = "respond_with_reasoning";

#[derive(Debug, Clone)]
pub struct GradioConfig {
    /// Space root, e.g. `https://owner-space.hf.space`.
    pub base_url: String,
    pub api_prefix: String,
    pub endpoint: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

/// Client for a Hugging Face Gradio Space exposing a `(messages_batch, maximum_tokens,
/// temp, nucleus) -> (reasoning, text)` endpoint through the Gradio "call" API.
#[derive(Clone)]
pub struct GradioClient {
    http: reqwest::Client,
    base_url: String,
    api_prefix: String,
    endpoint: String,
    token: Option<String>,
}

impl GradioClient {
    pub fn new(cfg: GradioConfig) -> Result<Self> {
        let base_url = cfg.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(LlmError::InvalidInput(
                "gradio base_url must not be empty".to_string(),
            ));
        }
        let endpoint = cfg.endpoint.trim().trim_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(LlmError::InvalidInput(
                "gradio endpoint must not be empty".to_string(),
            ));
        }
        let api_prefix = match cfg.api_prefix.trim().trim_end_matches('/') {
            "" => String::new(),
            p if p.starts_with('/') => p.to_string(),
            p => format!("/{p}"),
        };
        Ok(Self {
            http: build_http_client(cfg.timeout),
            base_url,
            api_prefix,
            endpoint,
            token: cfg.token.filter(|t| !t.trim().is_empty()),
        })
    }

    fn call_url(&self) -> String {
        format!(
            "{}{}/call/{}",
            self.base_url, self.api_prefix, self.endpoint
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token.as_deref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn submit(&self, messages_batch: &str, params: &GenerationParams) -> Result<String> {
        let req = GradioCallRequest::new(messages_batch, params);
        let response = self
            .authorize(self.http.post(self.call_url()))
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "gradio submit status={status} body={body}"
            )));
        }

        let parsed: GradioCallResponse = serde_json::from_str(&body)?;
        if parsed.event_id.trim().is_empty() {
            return Err(LlmError::ResponseFormat(
                "gradio submit returned an empty event_id".to_string(),
            ));
        }
        Ok(parsed.event_id)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(event_id = %event_id))]
    async fn await_result(&self, event_id: &str) -> Result<InferenceReply> {
        let url = format!("{}/{}", self.call_url(), event_id);
        let response = self.authorize(self.http.get(url)).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!(
                "gradio result status={status} body={body}"
            )));
        }

        let mut events = Box::pin(decode_sse(response.bytes_stream()));
        while let Some(event) = events.next().await {
            let event = event?;
            match event.event.as_deref() {
                Some("complete") => return reply_from_complete_payload(&event.data),
                Some("error") => {
                    return Err(LlmError::Remote(
                        Some(event.data)
                            .filter(|d| !d.trim().is_empty() && d.trim() != "null")
                            .unwrap_or_else(|| "space reported an error".to_string()),
                    ));
                }
                other => {
                    tracing::trace!(event = ?other, "skipping gradio event");
                }
            }
        }

        Err(LlmError::StreamParse(
            "gradio event stream ended before completion".to_string(),
        ))
    }
}

#[async_trait]
impl InferenceBackend for GradioClient {
    fn name(&self) -> &str {
        "gradio"
    }

    #[tracing::instrument(level = "info", skip_all, fields(endpoint = %self.endpoint))]
    async fn respond(
        &self,
        messages_batch: &str,
        params: &GenerationParams,
    ) -> Result<InferenceReply> {
        let event_id = self.submit(messages_batch, params).await?;
        tracing::debug!(%event_id, "gradio call accepted");
        self.await_result(&event_id).await
    }
}

#[derive(Debug, Serialize)]
struct GradioCallRequest {
    data: (String, u32, f32, f32),
}

impl GradioCallRequest {
    fn new(messages_batch: &str, params: &GenerationParams) -> Self {
        Self {
            data: (
                messages_batch.to_string(),
                params.max_tokens,
                params.temperature,
                params.top_p,
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GradioCallResponse {
    event_id: String,
}

/// The `complete` event carries the endpoint outputs as a JSON array:
/// `[reasoning, text]`.
fn reply_from_complete_payload(data: &str) -> Result<InferenceReply> {
    let outputs: Vec<serde_json::Value> = serde_json::from_str(data)?;
    let mut outputs = outputs.into_iter();
    let reasoning = outputs.next().map(output_to_string).unwrap_or_default();
    let text = outputs.next().map(output_to_string).ok_or_else(|| {
        LlmError::ResponseFormat(format!(
            "gradio complete payload missing text output: {data}"
        ))
    })?;
    Ok(InferenceReply { reasoning, text })
}

fn output_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, PartialEq, Eq)]
struct SseEvent {
    event: Option<String>,
    data: String,
}

fn parse_sse_frame(raw: &str) -> SseEvent {
    let mut event = None;
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
    }
    SseEvent {
        event,
        data: data_lines.join("\n"),
    }
}

fn decode_sse<S>(bytes_stream: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    // Bytes stay buffered until a whole frame is in; a multi-byte character
    // may straddle two chunks.
    futures_util::stream::unfold(
        (bytes_stream, Vec::<u8>::new()),
        |(mut stream, mut buffer)| async move {
            loop {
                if let Some(idx) = buffer.windows(2).position(|w| w == b"\n\n") {
                    let mut raw: Vec<u8> = buffer.drain(..idx + 2).collect();
                    raw.truncate(idx);
                    match frame_from_bytes(raw) {
                        Ok(Some(frame)) => return Some((Ok(frame), (stream, buffer))),
                        Ok(None) => continue,
                        Err(e) => return Some((Err(e), (stream, buffer))),
                    }
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.extend_from_slice(&chunk);
                        strip_carriage_returns(&mut buffer);
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((Err(LlmError::Http(e.to_string())), (stream, buffer)));
                    }
                    None => {
                        // Trailing frame without the blank-line terminator.
                        let raw = std::mem::take(&mut buffer);
                        return match frame_from_bytes(raw) {
                            Ok(Some(frame)) => Some((Ok(frame), (stream, buffer))),
                            Ok(None) => None,
                            Err(e) => Some((Err(e), (stream, buffer))),
                        };
                    }
                }
            }
        },
    )
}

/// Blank frames decode to `None`.
fn frame_from_bytes(raw: Vec<u8>) -> Result<Option<SseEvent>> {
    let raw = String::from_utf8(raw)
        .map_err(|e| LlmError::StreamParse(format!("sse frame is not utf-8: {e}")))?;
    if raw.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(parse_sse_frame(&raw)))
}

/// Collapses `\r\n` to `\n`. A trailing `\r` is kept until its `\n` arrives.
fn strip_carriage_returns(buffer: &mut Vec<u8>) {
    if !buffer.contains(&b'\r') {
        return;
    }
    let mut out = Vec::with_capacity(buffer.len());
    let mut bytes = buffer.iter().copied().peekable();
    while let Some(b) = bytes.next() {
        if b == b'\r' && bytes.peek() == Some(&b'\n') {
            continue;
        }
        out.push(b);
    }
    *buffer = out;
}
