use serde::{Deserialize, Serialize};

/// Sampling parameters forwarded with every inference request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Nucleus sampling probability mass.
    pub top_p: f32,
}

/// What the remote model produced for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceReply {
    /// Chain-of-thought text. Never shown to chat users.
    pub reasoning: String,
    /// Text (usually JSON) the model wants delivered.
    pub text: String,
}
