//! Anthropic Messages API client (§6 collaborator). Grounded on the
//! teacher's `llm::providers::anthropic::client` header-building idiom
//! (`x-api-key` + `anthropic-version` rather than a bearer token).

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::llm::traits::{GenerateOutcome, GenerateParams, LLMError, LLMResult, ProviderClient};
use crate::llm::ApiKey;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicClient {
    http: Client,
    api_key: ApiKey,
    base_url: String,
    model_map: HashMap<String, String>,
}

impl AnthropicClient {
    pub fn new(api_key: ApiKey) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: ApiKey, base_url: String) -> Self {
        let mut model_map = HashMap::new();
        model_map.insert("fast".to_string(), "claude-3-5-haiku-latest".to_string());
        model_map.insert("smart".to_string(), "claude-3-5-sonnet-latest".to_string());
        model_map.insert("code".to_string(), "claude-3-5-sonnet-latest".to_string());
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds"),
            api_key,
            base_url,
            model_map,
        }
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn model_for(&self, alias: &str) -> Option<&str> {
        self.model_map.get(alias).map(|s| s.as_str()).or(Some(alias))
    }

    async fn generate(&self, model: &str, prompt: &str, params: &GenerateParams) -> LLMResult<GenerateOutcome> {
        let body = MessagesRequest {
            model,
            max_tokens: params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: vec![Message { role: "user", content: prompt }],
            temperature: params.temperature,
            top_p: params.top_p,
        };

        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.api_key.expose())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status_error(status, response.text().await.unwrap_or_default()));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|err| LLMError::Upstream(format!("malformed anthropic response: {err}")))?;
        let text = parsed
            .content
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(LLMError::Upstream("anthropic response had no content blocks".to_string()));
        }
        Ok(GenerateOutcome {
            text,
            token_count: parsed.usage.map(|u| u.input_tokens + u.output_tokens),
        })
    }
}

fn map_transport_error(err: reqwest::Error) -> LLMError {
    if err.is_timeout() {
        LLMError::Timeout(err.to_string())
    } else {
        LLMError::Upstream(err.to_string())
    }
}

fn map_status_error(status: StatusCode, body: String) -> LLMError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => LLMError::RateLimited(body),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => LLMError::InvalidRequest(body),
        _ => LLMError::Upstream(format!("status {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_for_resolves_known_aliases() {
        let client = AnthropicClient::new(ApiKey::new("sk-ant-test"));
        assert_eq!(client.model_for("smart"), Some("claude-3-5-sonnet-latest"));
    }
}
