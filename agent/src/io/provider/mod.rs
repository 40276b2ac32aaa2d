//! Provider client: uniform access to LLM backends with retry and failover.
//!
//! Providers are tried in configured priority order. Transient failures are
//! retried on the same provider with bounded, jittered exponential backoff;
//! anything else moves on to the next provider. Providers without credentials
//! are skipped without spending attempts.

pub mod openai;

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::backoff::RetryPolicy;
use crate::core::budget::remaining_budget;
use crate::core::context::{ChatMessage, PromptContext};
use crate::core::types::TokenUsage;
use crate::io::config::{AgentConfig, EnvLookup};

pub use openai::OpenAiCompatible;

/// Text and accounting returned by a successful completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub provider: String,
    pub model: String,
}

/// One provider's contribution to an exhausted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderFailure {
    pub provider: String,
    /// Requests actually sent (zero when skipped).
    pub attempts: u32,
    pub error: String,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} attempt{}): {}",
            self.provider,
            self.attempts,
            if self.attempts == 1 { "" } else { "s" },
            self.error
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
    #[error("server error (HTTP {status})")]
    Server { status: u16 },
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication failed (HTTP {status})")]
    Auth { status: u16 },
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("missing credentials: {env} is not set")]
    MissingCredentials { env: String },
    #[error("context needs ~{needed} tokens but the model window is {window}")]
    ContextTooLarge { needed: usize, window: usize },
    #[error("run deadline exceeded")]
    DeadlineExceeded,
    #[error("all providers exhausted: {}", summarize(.failures))]
    AllProvidersExhausted { failures: Vec<ProviderFailure> },
}

impl ProviderError {
    /// Worth retrying on the same provider.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout
                | ProviderError::RateLimited
                | ProviderError::Server { .. }
                | ProviderError::Network(_)
        )
    }
}

fn summarize(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no providers configured".to_string();
    }
    failures
        .iter()
        .map(ProviderFailure::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// One LLM backend.
pub trait Provider {
    /// Stable identity used in logs (e.g. `groq`).
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    /// Total tokens the model accepts (prompt plus completion).
    fn context_window(&self) -> usize;
    /// Completion tokens requested per call.
    fn max_tokens(&self) -> usize;
    /// Whether credentials are present.
    fn is_available(&self) -> bool;
    /// Send one request. `timeout` already accounts for the run deadline.
    fn complete(
        &self,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<ModelResponse, ProviderError>;
}

/// Sleep abstraction so backoff can be observed without waiting.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Ordered providers plus the retry policy applied to each.
pub struct ProviderClient<S> {
    providers: Vec<Box<dyn Provider>>,
    policy: RetryPolicy,
    sleeper: S,
}

impl<S: Sleeper> ProviderClient<S> {
    pub fn new(providers: Vec<Box<dyn Provider>>, policy: RetryPolicy, sleeper: S) -> Self {
        Self {
            providers,
            policy,
            sleeper,
        }
    }

    pub fn providers(&self) -> &[Box<dyn Provider>] {
        &self.providers
    }

    pub fn has_available_provider(&self) -> bool {
        self.providers.iter().any(|provider| provider.is_available())
    }

    /// Complete `context` with the first provider that succeeds.
    #[instrument(skip_all, fields(providers = self.providers.len()))]
    pub fn complete(
        &self,
        context: &PromptContext,
        deadline: Instant,
    ) -> Result<ModelResponse, ProviderError> {
        let mut failures = Vec::new();
        for provider in &self.providers {
            let name = provider.name();
            if !provider.is_available() {
                debug!(provider = name, "skipping provider without credentials");
                failures.push(ProviderFailure {
                    provider: name.to_string(),
                    attempts: 0,
                    error: "credentials not configured".to_string(),
                });
                continue;
            }

            let messages = match context.fit(provider.context_window(), provider.max_tokens()) {
                Ok(messages) => messages,
                Err(overflow) => {
                    let err = ProviderError::ContextTooLarge {
                        needed: overflow.needed,
                        window: overflow.window,
                    };
                    warn!(provider = name, err = %err, "context does not fit, failing over");
                    failures.push(ProviderFailure {
                        provider: name.to_string(),
                        attempts: 0,
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            let mut attempts = 0;
            loop {
                let timeout = deadline_budget(deadline)?;
                attempts += 1;
                debug!(provider = name, attempt = attempts, "sending request");
                match provider.complete(&messages, timeout) {
                    Ok(response) => {
                        info!(
                            provider = name,
                            model = provider.model(),
                            attempts,
                            tokens = response.usage.total(),
                            "completion received"
                        );
                        return Ok(response);
                    }
                    Err(err) if err.is_transient() && self.policy.allows_retry(attempts) => {
                        let jitter = rand::thread_rng().gen_range(0.0..1.0);
                        let delay = self.policy.delay_for(attempts, jitter);
                        if delay >= deadline_budget(deadline)? {
                            return Err(ProviderError::DeadlineExceeded);
                        }
                        warn!(
                            provider = name,
                            attempt = attempts,
                            err = %err,
                            delay_ms = delay.as_millis() as u64,
                            "transient provider error, retrying"
                        );
                        self.sleeper.sleep(delay);
                    }
                    Err(err) => {
                        warn!(provider = name, attempts, err = %err, "provider failed, failing over");
                        failures.push(ProviderFailure {
                            provider: name.to_string(),
                            attempts,
                            error: err.to_string(),
                        });
                        break;
                    }
                }
            }
        }
        Err(ProviderError::AllProvidersExhausted { failures })
    }
}

fn deadline_budget(deadline: Instant) -> Result<Duration, ProviderError> {
    remaining_budget(deadline).map_err(|_| ProviderError::DeadlineExceeded)
}

/// Resolve an API key reference. Empty values and `your_..._here`
/// placeholders count as absent.
pub fn resolve_credential(env_name: &str, env: EnvLookup<'_>) -> Option<String> {
    let value = env(env_name)?;
    let value = value.trim();
    if value.is_empty() || (value.starts_with("your_") && value.ends_with("_here")) {
        return None;
    }
    Some(value.to_string())
}

/// Build the configured providers in priority order.
pub fn build_providers(config: &AgentConfig, env: EnvLookup<'_>) -> Result<Vec<Box<dyn Provider>>> {
    let mut providers: Vec<Box<dyn Provider>> = Vec::with_capacity(config.providers.len());
    for provider in &config.providers {
        let api_key = resolve_credential(&provider.api_key_env, env);
        if api_key.is_none() {
            debug!(
                provider = provider.kind.as_str(),
                env = %provider.api_key_env,
                "no credentials for provider"
            );
        }
        providers.push(Box::new(OpenAiCompatible::new(provider.clone(), api_key)?));
    }
    Ok(providers)
}
