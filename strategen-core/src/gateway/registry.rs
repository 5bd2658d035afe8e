//! Provider families and the model identifiers each one serves.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::GatewayError;

/// Wire protocol spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiStyle {
    ChatCompletions,
    Messages,
    Local,
}

/// Supported provider families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Grok,
    Groq,
    DeepSeek,
    Ollama,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 6] = [
        ProviderKind::Anthropic,
        ProviderKind::OpenAi,
        ProviderKind::Grok,
        ProviderKind::Groq,
        ProviderKind::DeepSeek,
        ProviderKind::Ollama,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Grok => "grok",
            ProviderKind::Groq => "groq",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Ollama => "ollama",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|p| p.as_str() == lower)
    }

    pub fn api_style(self) -> ApiStyle {
        match self {
            ProviderKind::Anthropic => ApiStyle::Messages,
            ProviderKind::OpenAi
            | ProviderKind::Grok
            | ProviderKind::Groq
            | ProviderKind::DeepSeek => ApiStyle::ChatCompletions,
            ProviderKind::Ollama => ApiStyle::Local,
        }
    }

    /// Environment variable holding the API key; `None` for local runtimes.
    pub fn key_var(self) -> Option<&'static str> {
        match self {
            ProviderKind::Anthropic => Some("ANTHROPIC_KEY"),
            ProviderKind::OpenAi => Some("OPENAI_KEY"),
            ProviderKind::Grok => Some("GROK_API_KEY"),
            ProviderKind::Groq => Some("GROQ_API_KEY"),
            ProviderKind::DeepSeek => Some("DEEPSEEK_KEY"),
            ProviderKind::Ollama => None,
        }
    }

    pub fn requires_key(self) -> bool {
        self.key_var().is_some()
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Grok => "https://api.x.ai/v1",
            ProviderKind::Groq => "https://api.groq.com/openai/v1",
            ProviderKind::DeepSeek => "https://api.deepseek.com/v1",
            ProviderKind::Ollama => "http://localhost:11434",
        }
    }

    pub fn known_models(self) -> &'static [&'static str] {
        match self {
            ProviderKind::Anthropic => &[
                "claude-3-5-sonnet-latest",
                "claude-3-5-haiku-latest",
                "claude-3-7-sonnet-latest",
                "claude-3-opus-latest",
                "claude-sonnet-4-20250514",
                "claude-opus-4-20250514",
            ],
            ProviderKind::OpenAi => &[
                "gpt-4o",
                "gpt-4o-mini",
                "gpt-4.1",
                "gpt-4.1-mini",
                "gpt-4-turbo",
            ],
            ProviderKind::Grok => &["grok-2-latest", "grok-3", "grok-3-mini", "grok-beta"],
            ProviderKind::Groq => &[
                "llama-3.3-70b-versatile",
                "llama-3.1-8b-instant",
                "mixtral-8x7b-32768",
                "gemma2-9b-it",
            ],
            ProviderKind::DeepSeek => &["deepseek-chat", "deepseek-reasoner"],
            ProviderKind::Ollama => &[
                "llama3.2",
                "llama3.1",
                "qwen2.5-coder",
                "deepseek-r1",
                "deepseek-coder-v2",
                "codellama",
                "mistral",
                "phi4",
            ],
        }
    }

    /// Registry lookup. Local models match on the name before any `:tag`.
    pub fn serves(self, model: &str) -> bool {
        let known = self.known_models();
        if known.contains(&model) {
            return true;
        }
        if self == ProviderKind::Ollama {
            if let Some((base, tag)) = model.split_once(':') {
                return !tag.is_empty() && known.contains(&base);
            }
        }
        false
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit `(provider, model)` choice. The gateway never downgrades it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSelector {
    pub provider: ProviderKind,
    pub model: String,
}

impl ModelSelector {
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Parse `provider:model`, or a bare `model` under `default_provider`.
    ///
    /// Only the first `:` separates the provider, so local tags such as
    /// `ollama:llama3.2:3b` survive.
    pub fn parse(spec: &str, default_provider: ProviderKind) -> Result<Self, String> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err("model selector is empty".into());
        }
        if let Some((head, rest)) = spec.split_once(':') {
            if let Some(provider) = ProviderKind::parse(head) {
                if rest.is_empty() {
                    return Err(format!("model selector '{spec}' has no model name"));
                }
                return Ok(Self::new(provider, rest));
            }
        }
        Ok(Self::new(default_provider, spec))
    }

    pub fn ensure_known(&self) -> Result<(), GatewayError> {
        if self.provider.serves(&self.model) {
            Ok(())
        } else {
            Err(GatewayError::ProviderUnavailable(format!(
                "model '{}' is not served by provider '{}' (known: {})",
                self.model,
                self.provider,
                self.provider.known_models().join(", ")
            )))
        }
    }
}

impl fmt::Display for ModelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}
