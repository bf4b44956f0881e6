//! Wire format between the bot and the model.
//!
//! Request: `{"messages": [{"text", "message_id", "timestamp"}, ...]}`.
//! Response: `{"response_to_id": <integer or integer string>, "text": <string>}`.
//! A reply wrapped in a Markdown code fence is accepted; the fence is stripped
//! before decoding.

use crate::messages::{Message, MessageList, MessageResponse};
use pk_channels::MessageId;
use serde_json::Value;

const LOG_PREVIEW_CHARS: usize = 200;

pub fn build_payload(list: &MessageList) -> String {
    let messages: Vec<Value> = list.iter().map(message_to_json).collect();
    serde_json::json!({ "messages": messages }).to_string()
}

fn message_to_json(message: &Message) -> Value {
    serde_json::json!({
        "text": message.text,
        "message_id": message.message_id.get(),
        "timestamp": message.timestamp.to_rfc3339(),
    })
}

/// Returns `None` for anything that is not a complete, well-typed reply.
/// The reason is logged here; callers only see the absence.
pub fn parse_response(raw: &str) -> Option<MessageResponse> {
    let body = strip_code_fence(raw);
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(error) => {
            tracing::warn!(%error, raw = %preview(raw), "AI response is not valid JSON");
            return None;
        }
    };
    let Some(fields) = value.as_object() else {
        tracing::warn!(raw = %preview(raw), "AI response is not a JSON object");
        return None;
    };

    let response_to_id = match fields.get("response_to_id") {
        None | Some(Value::Null) => None,
        Some(id) => {
            let coerced = coerce_message_id(id);
            if coerced.is_none() {
                tracing::warn!(value = %id, "response_to_id not convertible to an integer");
            }
            coerced
        }
    };
    let text = fields
        .get("text")
        .and_then(Value::as_str)
        .filter(|text| !text.trim().is_empty());

    match (response_to_id, text) {
        (Some(response_to_id), Some(text)) => Some(MessageResponse {
            response_to_id,
            text: text.to_string(),
        }),
        _ => {
            tracing::warn!(raw = %preview(raw), "AI response missing required fields");
            None
        }
    }
}

fn coerce_message_id(value: &Value) -> Option<MessageId> {
    let id = match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    id.map(MessageId::new)
}

/// Models like to wrap JSON in a Markdown fence: ```` ```json\n{...}\n``` ````.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(body) = trimmed
        .strip_prefix("```")
        .and_then(|rest| rest.strip_suffix("```"))
    else {
        return trimmed;
    };
    match body.find('\n') {
        Some(idx) if body[..idx].trim().chars().all(|c| c.is_ascii_alphanumeric()) => {
            body[idx + 1..].trim()
        }
        _ => body.trim(),
    }
}

fn preview(raw: &str) -> String {
    raw.chars().take(LOG_PREVIEW_CHARS).collect()
}
