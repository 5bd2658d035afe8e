//! Local runtime provider (Ollama `/api/chat`).

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use super::http::{build_client, send_json};
use super::registry::ProviderKind;
use super::{Completion, GatewayError, GatewaySettings, GenerateRequest, ModelProvider, Usage};

#[derive(Debug, Serialize)]
struct LocalRequest<'a> {
    model: &'a str,
    messages: [LocalMessage<'a>; 2],
    stream: bool,
    options: LocalOptions,
}

#[derive(Debug, Serialize)]
struct LocalMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct LocalOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct LocalResponse {
    message: Option<LocalReply>,
    error: Option<String>,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LocalReply {
    content: String,
}

/// Provider for a model served by a local runtime. Needs no API key; an
/// unreachable runtime is `provider_unavailable`.
pub struct LocalProvider {
    model: String,
    endpoint: String,
    client: Client,
}

impl LocalProvider {
    pub fn new(model: &str, settings: &GatewaySettings) -> Result<Self, GatewayError> {
        let base = settings
            .base_url
            .as_deref()
            .unwrap_or_else(|| ProviderKind::Ollama.default_base_url())
            .trim_end_matches('/');
        Ok(Self {
            model: model.to_string(),
            endpoint: format!("{base}/api/chat"),
            client: build_client(settings.request_timeout)?,
        })
    }

    fn parse(&self, raw: serde_json::Value) -> Result<Completion, GatewayError> {
        let resp: LocalResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            GatewayError::ProviderUnavailable(format!("ollama: unexpected response shape: {e}"))
        })?;

        if let Some(error) = resp.error {
            return Err(GatewayError::ProviderUnavailable(format!("ollama: {error}")));
        }
        let reply = resp.message.ok_or_else(|| {
            GatewayError::ProviderUnavailable("ollama: response has no message".into())
        })?;

        Ok(Completion {
            content: reply.content,
            usage: Usage {
                input_tokens: resp.prompt_eval_count,
                output_tokens: resp.eval_count,
            },
            raw,
        })
    }
}

impl ModelProvider for LocalProvider {
    fn name(&self) -> &str {
        ProviderKind::Ollama.as_str()
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn complete(&self, request: &GenerateRequest) -> Result<Completion, GatewayError> {
        let body = LocalRequest {
            model: &self.model,
            messages: [
                LocalMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                LocalMessage {
                    role: "user",
                    content: &request.user_content,
                },
            ],
            stream: false,
            options: LocalOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let raw = send_json(self.client.post(&self.endpoint).json(&body), "ollama")?;
        self.parse(raw)
    }
}
