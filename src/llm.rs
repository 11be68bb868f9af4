//! Language-model provider client. Two interchangeable HTTP chat APIs are
//! supported; configured providers are tried in preference order, so a failed
//! primary falls through to the secondary before the caller's statistical
//! fallback kicks in.

use crate::http::build_client;
use crate::retry::{RetryPolicy, with_retry};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
}

impl LlmProvider {
    fn label(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("no language-model provider configured")]
    NotConfigured,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub provider: LlmProvider,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    /// Preference-ordered providers; empty means refinement always falls back
    /// to statistics.
    pub providers: Vec<ProviderConfig>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        let mut providers = Vec::new();
        let openai = std::env::var("OPENAI_API_KEY").ok().map(|api_key| ProviderConfig {
            provider: LlmProvider::OpenAi,
            api_key,
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".into()),
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
        });
        let anthropic = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .map(|api_key| ProviderConfig {
                provider: LlmProvider::Anthropic,
                api_key,
                base_url: std::env::var("ANTHROPIC_BASE_URL")
                    .unwrap_or_else(|_| "https://api.anthropic.com".into()),
                model: std::env::var("ANTHROPIC_MODEL")
                    .unwrap_or_else(|_| "claude-3-5-haiku-latest".into()),
            });

        let prefer_anthropic = std::env::var("LLM_PROVIDER")
            .map(|value| value.trim().eq_ignore_ascii_case("anthropic"))
            .unwrap_or(false);
        match (openai, anthropic) {
            (Some(o), Some(a)) if prefer_anthropic => providers.extend([a, o]),
            (Some(o), Some(a)) => providers.extend([o, a]),
            (Some(o), None) => providers.push(o),
            (None, Some(a)) => providers.push(a),
            (None, None) => {}
        }
        Self { providers }
    }

    pub fn is_configured(&self) -> bool {
        !self.providers.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

pub struct LlmClient {
    http: Client,
    config: LlmConfig,
    retry: RetryPolicy,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: build_client(),
            config,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(LlmConfig::from_env())
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    /// Send the chat to the first provider that answers. Transient failures
    /// retry per provider; a provider that still fails is skipped in favor of
    /// the next one.
    pub async fn chat(&self, messages: &[LlmMessage]) -> Result<String, LlmError> {
        if self.config.providers.is_empty() {
            return Err(LlmError::NotConfigured);
        }
        let mut last_err = LlmError::NotConfigured;
        for provider in &self.config.providers {
            let attempt = with_retry(&self.retry, "llm_chat", || {
                self.chat_once(provider, messages)
            })
            .await;
            match attempt {
                Ok(text) => return Ok(text),
                Err(err) => {
                    warn!(
                        target = "argus.llm",
                        provider = provider.provider.label(),
                        error = %err,
                        "provider failed, trying next"
                    );
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    async fn chat_once(
        &self,
        provider: &ProviderConfig,
        messages: &[LlmMessage],
    ) -> Result<String, LlmError> {
        match provider.provider {
            LlmProvider::OpenAi => self.chat_openai(provider, messages).await,
            LlmProvider::Anthropic => self.chat_anthropic(provider, messages).await,
        }
    }

    async fn chat_openai(
        &self,
        provider: &ProviderConfig,
        messages: &[LlmMessage],
    ) -> Result<String, LlmError> {
        let url = format!("{}/v1/chat/completions", provider.base_url.trim_end_matches('/'));
        let body = json!({
            "model": provider.model,
            "messages": messages,
            "temperature": 0.2,
        });
        let response = self
            .http
            .post(url)
            .bearer_auth(&provider.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }
        let payload: OpenAiResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        payload
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("empty choices".into()))
    }

    async fn chat_anthropic(
        &self,
        provider: &ProviderConfig,
        messages: &[LlmMessage],
    ) -> Result<String, LlmError> {
        let url = format!("{}/v1/messages", provider.base_url.trim_end_matches('/'));
        // The messages API takes the system prompt out of band.
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect();
        let turns: Vec<&LlmMessage> = messages.iter().filter(|m| m.role != "system").collect();
        let mut body = json!({
            "model": provider.model,
            "max_tokens": 1024,
            "messages": turns,
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n"));
        }
        let response = self
            .http
            .post(url)
            .header("x-api-key", &provider.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }
        let payload: AnthropicResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        payload
            .content
            .into_iter()
            .find(|block| block.r#type == "text")
            .map(|block| block.text)
            .ok_or_else(|| LlmError::InvalidResponse("missing text block".into()))
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    r#type: String,
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_client_reports_not_configured() {
        let client = LlmClient::new(LlmConfig::default());
        let err = client
            .chat(&[LlmMessage {
                role: "user".into(),
                content: "hello".into(),
            }])
            .await
            .expect_err("no providers");
        assert!(matches!(err, LlmError::NotConfigured));
    }

    #[test]
    fn provider_http_errors_are_classified_for_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&LlmError::Http("HTTP 429".into()).to_string()));
        assert!(!policy.is_retryable(&LlmError::InvalidResponse("truncated".into()).to_string()));
    }
}
