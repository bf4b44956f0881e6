//! Single-flight wrapper around the inference backend.
//!
//! At most one backend call is in flight per gateway instance; the app builds
//! exactly one gateway and shares it across every chat.

use pk_llm::{GenerationParams, InferenceBackend, LlmError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub const GENERATION_PARAMS: GenerationParams = GenerationParams {
    max_tokens: 1024,
    temperature: 0.6,
    top_p: 0.95,
};

#[derive(Debug)]
pub enum InferenceOutcome {
    /// Raw text returned by the model, not yet validated.
    Success(String),
    /// Another call holds the slot; the backend was not contacted.
    Busy,
    TransportError(LlmError),
}

pub struct InferenceGateway {
    backend: Arc<dyn InferenceBackend>,
    in_flight: AtomicBool,
}

impl InferenceGateway {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            backend,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(backend = %self.backend.name(), payload_bytes = payload.len())
    )]
    pub async fn dispatch(&self, payload: String) -> InferenceOutcome {
        let Some(_slot) = InFlightSlot::acquire(&self.in_flight) else {
            tracing::warn!("AI client is already being called; refusing concurrent call");
            return InferenceOutcome::Busy;
        };

        tracing::info!("calling AI client");
        match self.backend.respond(&payload, &GENERATION_PARAMS).await {
            Ok(reply) => {
                tracing::debug!(reasoning = %reply.reasoning, "model reasoning");
                tracing::info!(response = %reply.text, "AI client returned");
                InferenceOutcome::Success(reply.text)
            }
            Err(error) => {
                tracing::warn!(%error, "AI client call failed");
                InferenceOutcome::TransportError(error)
            }
        }
    }
}

/// Holds the in-flight flag; dropping it releases the slot on every exit path,
/// including a panicking backend or a dropped future.
struct InFlightSlot<'a>(&'a AtomicBool);

impl<'a> InFlightSlot<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
