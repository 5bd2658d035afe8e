//! Model provider gateway.
//!
//! The `ModelProvider` trait abstracts over LLM backends (chat-completions,
//! messages, local runtime, scripted replay) so the loop never sees SDK or
//! authentication details. `Gateway` wraps one provider with input
//! validation, request pacing and the retry policy:
//! at most one retry on `rate_limited` or `timeout`, after a jittered
//! 0.5–3 s backoff. Every other failure surfaces immediately.

pub mod chat_completions;
mod http;
pub mod keys;
pub mod local;
pub mod messages;
pub mod pacing;
pub mod registry;
pub mod scripted;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use keys::ApiKeys;
pub use pacing::RequestPacer;
pub use registry::{ApiStyle, ModelSelector, ProviderKind};
pub use scripted::{ScriptedProvider, ScriptedReply};

/// One generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub system_prompt: String,
    pub user_content: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerateRequest {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.system_prompt.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("system prompt is empty".into()));
        }
        if self.user_content.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("user content is empty".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(GatewayError::InvalidRequest(format!(
                "temperature {} outside [0, 2]",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(GatewayError::InvalidRequest("max_tokens must be positive".into()));
        }
        Ok(())
    }
}

/// Token accounting, when the provider reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// Provider response. `content` is exactly what the model produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
    pub raw: serde_json::Value,
}

/// Failure category of a gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayErrorKind {
    ProviderUnavailable,
    QuotaOrAuth,
    RateLimited,
    ContentFiltered,
    Timeout,
    InvalidRequest,
}

impl GatewayErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GatewayErrorKind::ProviderUnavailable => "provider_unavailable",
            GatewayErrorKind::QuotaOrAuth => "quota_or_auth",
            GatewayErrorKind::RateLimited => "rate_limited",
            GatewayErrorKind::ContentFiltered => "content_filtered",
            GatewayErrorKind::Timeout => "timeout",
            GatewayErrorKind::InvalidRequest => "invalid_request",
        }
    }
}

impl fmt::Display for GatewayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured gateway errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("provider refused the request (quota or auth): {0}")]
    QuotaOrAuth(String),

    #[error("rate limited by provider: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("provider filtered the response: {0}")]
    ContentFiltered(String),

    #[error("provider request timed out: {0}")]
    Timeout(String),

    #[error("invalid generation request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    pub fn kind(&self) -> GatewayErrorKind {
        match self {
            GatewayError::ProviderUnavailable(_) => GatewayErrorKind::ProviderUnavailable,
            GatewayError::QuotaOrAuth(_) => GatewayErrorKind::QuotaOrAuth,
            GatewayError::RateLimited { .. } => GatewayErrorKind::RateLimited,
            GatewayError::ContentFiltered(_) => GatewayErrorKind::ContentFiltered,
            GatewayError::Timeout(_) => GatewayErrorKind::Timeout,
            GatewayError::InvalidRequest(_) => GatewayErrorKind::InvalidRequest,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            GatewayErrorKind::RateLimited | GatewayErrorKind::Timeout
        )
    }

    /// Build an error of the given kind with a plain message.
    pub fn from_kind(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            GatewayErrorKind::ProviderUnavailable => GatewayError::ProviderUnavailable(message),
            GatewayErrorKind::QuotaOrAuth => GatewayError::QuotaOrAuth(message),
            GatewayErrorKind::RateLimited => GatewayError::RateLimited {
                message,
                retry_after: None,
            },
            GatewayErrorKind::ContentFiltered => GatewayError::ContentFiltered(message),
            GatewayErrorKind::Timeout => GatewayError::Timeout(message),
            GatewayErrorKind::InvalidRequest => GatewayError::InvalidRequest(message),
        }
    }
}

/// Trait for model backends.
///
/// Implementations perform exactly one request per call; pacing and
/// retries live in `Gateway`.
pub trait ModelProvider: Send + Sync {
    /// Provider family, e.g. `anthropic`.
    fn name(&self) -> &str;

    /// Model identifier sent to the provider.
    fn model(&self) -> &str;

    fn complete(&self, request: &GenerateRequest) -> Result<Completion, GatewayError>;
}

impl<P: ModelProvider + ?Sized> ModelProvider for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn model(&self) -> &str {
        (**self).model()
    }

    fn complete(&self, request: &GenerateRequest) -> Result<Completion, GatewayError> {
        (**self).complete(request)
    }
}

/// Retry behaviour for retryable gateway failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    /// One retry with no sleep.
    pub fn immediate() -> Self {
        Self {
            max_retries: 1,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Uniformly jittered delay in `[min_backoff, max_backoff]`.
    pub fn backoff(&self) -> Duration {
        let lo = self.min_backoff.as_millis() as u64;
        let hi = self.max_backoff.as_millis() as u64;
        if hi <= lo {
            return self.min_backoff;
        }
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}

/// Connection settings shared by the HTTP providers.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub request_timeout: Duration,
    pub min_request_interval: Duration,
    /// Overrides the provider's default endpoint (proxies, self-hosted runtimes).
    pub base_url: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(180),
            min_request_interval: Duration::ZERO,
            base_url: None,
        }
    }
}

/// Uniform, synchronous entry point over one provider.
pub struct Gateway {
    provider: Box<dyn ModelProvider>,
    pacer: RequestPacer,
    retry: RetryPolicy,
}

impl Gateway {
    pub fn new(provider: Box<dyn ModelProvider>) -> Self {
        Self {
            provider,
            pacer: RequestPacer::unpaced(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_pacer(mut self, pacer: RequestPacer) -> Self {
        self.pacer = pacer;
        self
    }

    /// Build a gateway for a registry-checked model selection.
    ///
    /// Unknown identifiers and missing API keys fail here, never on the
    /// first call.
    pub fn connect(
        selector: &ModelSelector,
        keys: &ApiKeys,
        settings: &GatewaySettings,
    ) -> Result<Self, GatewayError> {
        selector.ensure_known()?;

        let provider: Box<dyn ModelProvider> = match selector.provider.api_style() {
            ApiStyle::ChatCompletions => {
                let key = keys.require(selector.provider)?;
                Box::new(chat_completions::ChatCompletionsProvider::new(
                    selector.provider,
                    &selector.model,
                    key,
                    settings,
                )?)
            }
            ApiStyle::Messages => {
                let key = keys.require(selector.provider)?;
                Box::new(messages::MessagesProvider::new(&selector.model, key, settings)?)
            }
            ApiStyle::Local => Box::new(local::LocalProvider::new(&selector.model, settings)?),
        };

        Ok(Self::new(provider).with_pacer(RequestPacer::new(settings.min_request_interval)))
    }

    /// `provider:model`, for logs and reports.
    pub fn describe(&self) -> String {
        format!("{}:{}", self.provider.name(), self.provider.model())
    }

    pub fn generate(
        &self,
        system_prompt: &str,
        user_content: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Completion, GatewayError> {
        let request = GenerateRequest {
            system_prompt: system_prompt.to_string(),
            user_content: user_content.to_string(),
            temperature,
            max_tokens,
        };
        self.generate_request(&request)
    }

    pub fn generate_request(&self, request: &GenerateRequest) -> Result<Completion, GatewayError> {
        request.validate()?;

        let mut attempt = 0u32;
        loop {
            self.pacer.acquire();
            debug!(model = %self.describe(), attempt, "gateway request");

            match self.provider.complete(request) {
                Ok(completion) => return Ok(completion),
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    if let GatewayError::RateLimited {
                        retry_after: Some(wait),
                        ..
                    } = &err
                    {
                        self.pacer.defer(*wait);
                    }
                    let delay = self.retry.backoff();
                    warn!(
                        model = %self.describe(),
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "retrying gateway request"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("model", &self.describe())
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(replies: Vec<ScriptedReply>) -> (Gateway, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider::new(replies));
        let gw = Gateway::new(Box::new(provider.clone())).with_retry_policy(RetryPolicy::immediate());
        (gw, provider)
    }

    #[test]
    fn returns_content_verbatim() {
        let (gw, _) = gateway(vec![ScriptedReply::text("  ```python\nx = 1\n```  \n")]);
        let c = gw.generate("sys", "user", 0.7, 100).unwrap();
        assert_eq!(c.content, "  ```python\nx = 1\n```  \n");
    }

    #[test]
    fn retries_once_on_rate_limit() {
        let (gw, provider) = gateway(vec![
            ScriptedReply::fail(GatewayErrorKind::RateLimited, "slow down"),
            ScriptedReply::text("ok"),
        ]);
        let c = gw.generate("sys", "user", 0.7, 100).unwrap();
        assert_eq!(c.content, "ok");
        assert_eq!(provider.call_count(), 2);
    }

    #[test]
    fn gives_up_after_one_retry() {
        let (gw, provider) = gateway(vec![
            ScriptedReply::fail(GatewayErrorKind::Timeout, "t1"),
            ScriptedReply::fail(GatewayErrorKind::Timeout, "t2"),
            ScriptedReply::text("never reached"),
        ]);
        let err = gw.generate("sys", "user", 0.7, 100).unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::Timeout);
        assert_eq!(provider.call_count(), 2);
    }

    #[test]
    fn non_retryable_failures_surface_immediately() {
        let (gw, provider) = gateway(vec![
            ScriptedReply::fail(GatewayErrorKind::QuotaOrAuth, "bad key"),
            ScriptedReply::text("never reached"),
        ]);
        let err = gw.generate("sys", "user", 0.7, 100).unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::QuotaOrAuth);
        assert_eq!(provider.call_count(), 1);
    }

    #[test]
    fn rejects_invalid_input_before_calling() {
        let (gw, provider) = gateway(vec![ScriptedReply::text("ok")]);
        assert!(gw.generate("", "user", 0.7, 100).is_err());
        assert!(gw.generate("sys", "  ", 0.7, 100).is_err());
        assert!(gw.generate("sys", "user", 2.5, 100).is_err());
        assert!(gw.generate("sys", "user", 0.7, 0).is_err());
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn backoff_stays_in_range() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.backoff();
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_secs(3));
        }
    }

    #[test]
    fn connect_rejects_unknown_model() {
        let selector = ModelSelector::new(ProviderKind::OpenAi, "gpt-0-imaginary");
        let keys = ApiKeys::default().with(ProviderKind::OpenAi, "sk-test");
        let err = Gateway::connect(&selector, &keys, &GatewaySettings::default()).unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::ProviderUnavailable);
    }

    #[test]
    fn connect_requires_key_for_remote_provider() {
        let selector = ModelSelector::new(ProviderKind::Anthropic, "claude-3-5-sonnet-latest");
        let err =
            Gateway::connect(&selector, &ApiKeys::default(), &GatewaySettings::default()).unwrap_err();
        assert_eq!(err.kind(), GatewayErrorKind::ProviderUnavailable);
    }
}
