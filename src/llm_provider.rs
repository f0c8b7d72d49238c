//! [`crate::traits::LlmProvider`] adapter over an OpenAI-compatible chat
//! completion endpoint: client timeouts, an HTML-response guard for
//! misconfigured endpoints, and the multi-message `chat()` contract the
//! answer assembler is built against.
//!
//! Vendors that speak the same `/chat/completions` shape (OpenAI,
//! OpenRouter, Together, Grok, Perplexity, Baseten, Ollama, and arbitrary
//! custom endpoints) are dispatched through one request path.

use crate::traits::{ChatCompletion, ChatMessage, GenerationConfig, LlmProvider, TokenUsage};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Which OpenAI-compatible vendor to talk to.
#[derive(Debug, Clone)]
pub enum ApiProvider {
    OpenAI,
    OpenRouter,
    Together,
    Grok,
    Perplexity,
    Baseten,
    Ollama,
    Custom { endpoint: String },
}

/// Chat-completion client for OpenAI-compatible HTTP APIs.
pub struct HttpLlmProvider {
    provider: ApiProvider,
    api_key: String,
    client: Client,
}

impl HttpLlmProvider {
    pub fn new(provider: ApiProvider, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(300))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;
        Ok(Self { provider, api_key, client })
    }

    fn endpoint(&self) -> String {
        match &self.provider {
            ApiProvider::OpenAI => "https://api.openai.com/v1/chat/completions".to_string(),
            ApiProvider::OpenRouter => "https://openrouter.ai/api/v1/chat/completions".to_string(),
            ApiProvider::Together => "https://api.together.xyz/v1/chat/completions".to_string(),
            ApiProvider::Grok => "https://api.x.ai/v1/chat/completions".to_string(),
            ApiProvider::Perplexity => "https://api.perplexity.ai/chat/completions".to_string(),
            ApiProvider::Baseten => "https://inference.baseten.co/v1/chat/completions".to_string(),
            ApiProvider::Ollama => "http://localhost:11434/v1/chat/completions".to_string(),
            ApiProvider::Custom { endpoint } => endpoint.clone(),
        }
    }

    async fn parse_json_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        endpoint: &str,
    ) -> Result<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to read response body from {}: {}", endpoint, e))?;
        let trimmed = body.trim_start();
        if trimmed.starts_with('<') {
            let preview: String = trimmed.chars().take(200).collect();
            return Err(anyhow!(
                "Endpoint {} returned HTML instead of JSON (HTTP {}) — service may be down. Response: {}",
                endpoint, status, preview
            ));
        }
        serde_json::from_str::<T>(&body).map_err(|e| {
            let preview: String = body.chars().take(300).collect();
            anyhow!("Failed to parse JSON from {} (HTTP {}): {}. Body: {}", endpoint, status, e, preview)
        })
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn chat(&self, messages: &[ChatMessage], config: &GenerationConfig) -> Result<ChatCompletion> {
        let endpoint = self.endpoint();
        let request = json!({
            "model": config.model,
            "messages": messages.iter().map(|m| json!({"role": m.role, "content": m.content})).collect::<Vec<_>>(),
            "max_tokens": config.max_tokens,
            "temperature": config.temperature,
            "stop": config.stop,
            "stream": false,
        });

        let response = self
            .client
            .post(&endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow!("Request to {} timed out — check network connectivity", endpoint)
                } else if e.is_connect() {
                    anyhow!("Failed to connect to {} — check network/firewall/proxy: {}", endpoint, e)
                } else {
                    anyhow!("Request to {} failed: {}", endpoint, e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response.text().await.unwrap_or_default();
            return Err(anyhow!("API error ({}): {}", status, error));
        }

        let parsed: ChatResponse = Self::parse_json_response(response, &endpoint).await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("{} returned empty choices array", endpoint))?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage { prompt_tokens: u.prompt_tokens, completion_tokens: u.completion_tokens })
            .unwrap_or_default();

        Ok(ChatCompletion { content, usage })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_endpoint_is_used_verbatim() {
        let provider = HttpLlmProvider::new(
            ApiProvider::Custom { endpoint: "https://example.internal/v1/chat/completions".to_string() },
            "key".to_string(),
        )
        .unwrap();
        assert_eq!(provider.endpoint(), "https://example.internal/v1/chat/completions");
    }

    #[test]
    fn openai_endpoint_is_well_known() {
        let provider = HttpLlmProvider::new(ApiProvider::OpenAI, "key".to_string()).unwrap();
        assert_eq!(provider.endpoint(), "https://api.openai.com/v1/chat/completions");
    }
}
