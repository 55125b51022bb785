use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::config::{SummarizationConfig, env_var};
use crate::error::ConfigError;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub prompt: String,
}

/// Provider failures, split by what the caller should do with them:
/// transient errors are retried with backoff, the other two abort the
/// summary for that group.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("permanent provider error: {0}")]
    Permanent(String),

    #[error("provider quota exhausted: {0}")]
    Quota(String),
}

impl CompletionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::Quota(_) => "quota",
        }
    }
}

/// A single operation: prompt in, completion text or typed error out.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

/// Resolves the configured provider. A missing credential for the required
/// provider is a configuration error and aborts the run.
pub fn from_config(config: &SummarizationConfig) -> Result<Arc<dyn Completer>, ConfigError> {
    match config.provider.as_str() {
        "openai" => {
            let api_key = require_credential("openai", "OPENAI_API_KEY")?;
            Ok(Arc::new(OpenAiCompleter {
                http: reqwest::Client::new(),
                api_base: config
                    .api_base
                    .clone()
                    .unwrap_or_else(|| OPENAI_API_BASE.to_string()),
                api_key,
            }))
        }
        "anthropic" => {
            let api_key = require_credential("anthropic", "ANTHROPIC_API_KEY")?;
            Ok(Arc::new(AnthropicCompleter {
                http: reqwest::Client::new(),
                api_key,
            }))
        }
        other => Err(ConfigError::Unsupported {
            what: "summarization provider",
            value: other.to_string(),
        }),
    }
}

fn require_credential(provider: &str, var: &str) -> Result<String, ConfigError> {
    env_var(var).ok_or_else(|| ConfigError::MissingProviderCredential {
        provider: provider.to_string(),
        var: var.to_string(),
    })
}

fn send_error(err: reqwest::Error) -> CompletionError {
    if err.is_timeout() {
        CompletionError::Transient("request timed out".to_string())
    } else {
        CompletionError::Transient(err.to_string())
    }
}

fn status_error(status: reqwest::StatusCode, body: String) -> CompletionError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::PAYMENT_REQUIRED
    {
        CompletionError::Quota(format!("{status}: {body}"))
    } else if status.is_server_error() {
        CompletionError::Transient(format!("{status}: {body}"))
    } else {
        CompletionError::Permanent(format!("{status}: {body}"))
    }
}

/// OpenAI-compatible chat completions, also covering self-hosted gateways
/// via the configurable base URL.
pub struct OpenAiCompleter {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[async_trait]
impl Completer for OpenAiCompleter {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let url = format!("{}/chat/completions", self.api_base.trim_end_matches('/'));
        let body = ChatCompletionRequest {
            model: &request.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| CompletionError::Transient(format!("undecodable response: {err}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| CompletionError::Permanent("empty completion".to_string()))
    }
}

/// Anthropic messages API.
pub struct AnthropicCompleter {
    http: reqwest::Client,
    api_key: String,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

#[async_trait]
impl Completer for AnthropicCompleter {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let body = MessagesRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .http
            .post(format!("{ANTHROPIC_API_BASE}/v1/messages"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|err| CompletionError::Transient(format!("undecodable response: {err}")))?;
        parsed
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| CompletionError::Permanent("empty completion".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_error_kinds() {
        assert!(matches!(
            status_error(reqwest::StatusCode::TOO_MANY_REQUESTS, String::new()),
            CompletionError::Quota(_)
        ));
        assert!(matches!(
            status_error(reqwest::StatusCode::BAD_GATEWAY, String::new()),
            CompletionError::Transient(_)
        ));
        assert!(matches!(
            status_error(reqwest::StatusCode::UNAUTHORIZED, String::new()),
            CompletionError::Permanent(_)
        ));
    }

    #[test]
    fn unknown_provider_is_a_config_error() {
        let config = SummarizationConfig {
            provider: "oracle".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            from_config(&config),
            Err(ConfigError::Unsupported { .. })
        ));
    }
}
