//! OpenAI-compatible chat completions backend (Groq, OpenAI, local gateways).

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{ModelResponse, Provider, ProviderError};
use crate::core::context::{ChatMessage, Role};
use crate::core::types::{TokenUsage, truncate_chars};
use crate::io::config::ProviderConfig;

/// Longest slice of an error body echoed into logs and feedback.
const MAX_ERROR_CONTENT_CHARS: usize = 200;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub struct OpenAiCompatible {
    config: ProviderConfig,
    api_key: Option<String>,
    client: Client,
}

impl OpenAiCompatible {
    pub fn new(config: ProviderConfig, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .with_context(|| format!("build HTTP client for {}", config.kind.as_str()))?;
        Ok(Self {
            config,
            api_key,
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

impl Provider for OpenAiCompatible {
    fn name(&self) -> &str {
        self.config.kind.as_str()
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn context_window(&self) -> usize {
        self.config.context_window_tokens
    }

    fn max_tokens(&self) -> usize {
        self.config.max_tokens as usize
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    #[instrument(skip_all, fields(provider = self.name(), model = %self.config.model))]
    fn complete(
        &self,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<ModelResponse, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::MissingCredentials {
                env: self.config.api_key_env.clone(),
            })?;
        let request = ChatRequest {
            model: &self.config.model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role,
                    content: &m.content,
                })
                .collect(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        let timeout = timeout.min(Duration::from_secs(self.config.request_timeout_secs));

        debug!(messages = messages.len(), timeout_ms = timeout.as_millis() as u64, "POST chat completion");
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .timeout(timeout)
            .json(&request)
            .send()
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        decode_response(&body, self.name(), &self.config.model)
    }
}

/// Map a non-success HTTP status onto the retry taxonomy.
fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let code = status.as_u16();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth { status: code },
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited,
        StatusCode::REQUEST_TIMEOUT => ProviderError::Timeout,
        s if s.is_server_error() => ProviderError::Server { status: code },
        _ => ProviderError::Rejected {
            status: code,
            message: sanitize_api_response(body),
        },
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else if err.is_decode() {
        ProviderError::InvalidResponse(err.to_string())
    } else {
        // Connect and request errors carry only transport detail, never the key.
        ProviderError::Network(err.to_string())
    }
}

fn decode_response(body: &str, provider: &str, model: &str) -> Result<ModelResponse, ProviderError> {
    let parsed: ChatResponse = serde_json::from_str(body).map_err(|e| {
        ProviderError::InvalidResponse(format!("{e}: {}", sanitize_api_response(body)))
    })?;
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| ProviderError::InvalidResponse("no choices in response".to_string()))?;
    let usage = parsed
        .usage
        .map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        })
        .unwrap_or_default();
    Ok(ModelResponse {
        text,
        usage,
        provider: provider.to_string(),
        model: parsed.model.unwrap_or_else(|| model.to_string()),
    })
}

/// Truncate an error body and redact it if it looks like it carries secrets.
fn sanitize_api_response(content: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "api_key",
        "apikey",
        "secret",
        "password",
        "credential",
        "bearer",
        "sk-",
    ];

    let truncated = truncate_chars(content.trim(), MAX_ERROR_CONTENT_CHARS);
    let lower = truncated.to_lowercase();
    if SECRET_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
        return "(response details redacted)".to_string();
    }
    truncated
}
