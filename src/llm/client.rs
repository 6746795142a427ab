//! OpenAI-compatible chat completions client

use crate::config::LlmConfig;
use crate::error::PipelineError;
use crate::llm::LlmClient;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Longest slice of a provider error body kept for the logs
const MAX_ERROR_BODY_CHARS: usize = 500;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Talks to Groq by default; any compatible endpoint (OpenAI, a local Ollama)
/// works by changing `LLM_API_URL`.
pub struct HttpLlmClient {
    http: Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .user_agent(concat!("ecom-analytics-api/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    async fn send(&self, prompt: &str, max_tokens: u32) -> Result<String, PipelineError> {
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
            max_tokens,
        };

        let mut request = self.http.post(&self.api_url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(PipelineError::LlmRequestError {
                status: Some(status.as_u16()),
                message: text.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            warn!("Unreadable completion body: {}", e);
            PipelineError::LlmEmptyResponse
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(PipelineError::LlmEmptyResponse)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str, max_tokens: u32, timeout: Duration) -> Result<String, PipelineError> {
        debug!(model = %self.model, prompt_chars = prompt.len(), max_tokens, "Calling LLM");

        tokio::time::timeout(timeout, self.send(prompt, max_tokens))
            .await
            .map_err(|_| PipelineError::LlmTimeout(timeout))?
    }
}

fn transport_error(e: reqwest::Error) -> PipelineError {
    PipelineError::LlmRequestError {
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}
