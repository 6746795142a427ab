//! LLM Client Adapter
//!
//! The only component that talks to the model provider. Callers hand over a
//! prompt and get text back, or one of the LLM failure kinds.

pub mod client;
pub mod retry;

pub use client::HttpLlmClient;
pub use retry::RetryPolicy;

use crate::error::PipelineError;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One completion attempt bounded by `timeout`
    async fn complete(&self, prompt: &str, max_tokens: u32, timeout: Duration) -> Result<String, PipelineError>;
}
