//! LLM integration for analysis planning.
//!
//! The model receives the task plus retrieved context and answers with a JSON
//! analysis plan. OpenAI and Gemini are supported.

mod client;
mod response;

pub use client::{
    prompts, LlmBackend, LlmClient, LlmConfig, LlmError, LlmProvider, MockLlmClient,
};
pub use response::extract_json_value;
