//! Inference backend client for Prikolist.
//!
//! Pure HTTP client: the bot core only sees [`InferenceBackend`].

mod client;
mod error;
mod gradio;
mod types;

pub use client::InferenceBackend;
pub use error::{LlmError, Result};
pub use gradio::{DEFAULT_API_PREFIX, DEFAULT_ENDPOINT, GradioClient, GradioConfig};
pub use types::{GenerationParams, InferenceReply};
