use super::{ChatBackend, ChatOptions, LlmError, LlmMessage, LlmResponse, LlmUsage};
use crate::config::LlmConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiClient {
    http: Client,
    config: LlmConfig,
}

impl OpenAiClient {
    pub fn new(http: Client, config: LlmConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl ChatBackend for OpenAiClient {
    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    async fn chat(
        &self,
        messages: &[LlmMessage],
        options: ChatOptions,
    ) -> Result<LlmResponse, LlmError> {
        let base = self.config.base_url.trim();
        let Some(model) = self.config.model.as_deref().filter(|_| !base.is_empty()) else {
            return Err(LlmError::NotConfigured);
        };

        let body = ChatRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            response_format: options.json_mode.then(|| ResponseFormat {
                r#type: "json_object".into(),
            }),
            enable_thinking: self.config.enable_thinking_switch.then_some(false),
        };

        let mut request = self.http.post(format!("{base}/chat/completions")).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }

        let payload: CompletionResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        let text = payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| match choice.message.content {
                Value::String(text) => Some(text),
                Value::Array(parts) => Some(
                    parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join(""),
                ),
                _ => None,
            })
            .ok_or_else(|| LlmError::InvalidResponse("missing message content".into()))?;

        Ok(LlmResponse {
            text,
            usage: payload.usage,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<LlmMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enable_thinking: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<LlmUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Value,
}
