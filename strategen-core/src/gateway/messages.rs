//! Anthropic messages API.

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use super::http::{build_client, send_json};
use super::registry::ProviderKind;
use super::{Completion, GatewayError, GatewaySettings, GenerateRequest, ModelProvider, Usage};

const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: [UserMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct UserMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

/// Provider speaking `POST {base}/messages`.
pub struct MessagesProvider {
    model: String,
    api_key: String,
    endpoint: String,
    client: Client,
}

impl MessagesProvider {
    pub fn new(model: &str, api_key: &str, settings: &GatewaySettings) -> Result<Self, GatewayError> {
        let base = settings
            .base_url
            .as_deref()
            .unwrap_or_else(|| ProviderKind::Anthropic.default_base_url())
            .trim_end_matches('/');
        Ok(Self {
            model: model.to_string(),
            api_key: api_key.to_string(),
            endpoint: format!("{base}/messages"),
            client: build_client(settings.request_timeout)?,
        })
    }

    fn parse(raw: serde_json::Value) -> Result<Completion, GatewayError> {
        let resp: MessagesResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            GatewayError::ProviderUnavailable(format!("anthropic: unexpected response shape: {e}"))
        })?;

        if resp.stop_reason.as_deref() == Some("refusal") {
            return Err(GatewayError::ContentFiltered("anthropic: stop_reason=refusal".into()));
        }

        // Text blocks are concatenated in order; other block types carry no program text.
        let content: String = resp
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect();

        let usage = resp.usage.map_or_else(Usage::default, |u| Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        });

        Ok(Completion { content, usage, raw })
    }
}

impl ModelProvider for MessagesProvider {
    fn name(&self) -> &str {
        ProviderKind::Anthropic.as_str()
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn complete(&self, request: &GenerateRequest) -> Result<Completion, GatewayError> {
        let body = MessagesRequest {
            model: &self.model,
            system: &request.system_prompt,
            messages: [UserMessage {
                role: "user",
                content: &request.user_content,
            }],
            max_tokens: request.max_tokens,
            // The messages API caps temperature at 1.0.
            temperature: request.temperature.min(1.0),
        };

        let http = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body);
        let raw = send_json(http, "anthropic")?;
        Self::parse(raw)
    }
}
