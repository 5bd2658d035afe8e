//! OpenAI-compatible chat-completions providers (OpenAI, xAI, Groq, DeepSeek).

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use super::http::{build_client, send_json};
use super::registry::ProviderKind;
use super::{Completion, GatewayError, GatewaySettings, GenerateRequest, ModelProvider, Usage};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

/// Provider speaking `POST {base}/chat/completions`.
pub struct ChatCompletionsProvider {
    kind: ProviderKind,
    model: String,
    api_key: String,
    endpoint: String,
    client: Client,
}

impl ChatCompletionsProvider {
    pub fn new(
        kind: ProviderKind,
        model: &str,
        api_key: &str,
        settings: &GatewaySettings,
    ) -> Result<Self, GatewayError> {
        let base = settings
            .base_url
            .as_deref()
            .unwrap_or_else(|| kind.default_base_url())
            .trim_end_matches('/');
        Ok(Self {
            kind,
            model: model.to_string(),
            api_key: api_key.to_string(),
            endpoint: format!("{base}/chat/completions"),
            client: build_client(settings.request_timeout)?,
        })
    }

    fn parse(&self, raw: serde_json::Value) -> Result<Completion, GatewayError> {
        let resp: ChatResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            GatewayError::ProviderUnavailable(format!("{}: unexpected response shape: {e}", self.kind))
        })?;

        let choice = resp.choices.into_iter().next().ok_or_else(|| {
            GatewayError::ProviderUnavailable(format!("{}: response has no choices", self.kind))
        })?;

        if let Some(refusal) = choice.message.refusal.filter(|r| !r.is_empty()) {
            return Err(GatewayError::ContentFiltered(format!("{}: {refusal}", self.kind)));
        }
        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(GatewayError::ContentFiltered(format!(
                "{}: finish_reason=content_filter",
                self.kind
            )));
        }

        let usage = resp.usage.map_or_else(Usage::default, |u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        });

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            usage,
            raw,
        })
    }
}

impl ModelProvider for ChatCompletionsProvider {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn complete(&self, request: &GenerateRequest) -> Result<Completion, GatewayError> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_content,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let http = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body);
        let raw = send_json(http, self.kind.as_str())?;
        self.parse(raw)
    }
}
