//! OpenAI-compatible chat-completions client (§6 collaborator). Grounded on
//! the teacher's `llm::providers::openai::client` reqwest/HeaderMap idiom,
//! trimmed to a single non-streaming call since §1 puts streaming
//! generation out of scope.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::llm::traits::{GenerateOutcome, GenerateParams, LLMError, LLMResult, ProviderClient};
use crate::llm::ApiKey;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAIClient {
    http: Client,
    api_key: ApiKey,
    base_url: String,
    model_map: HashMap<String, String>,
}

impl OpenAIClient {
    pub fn new(api_key: ApiKey) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: ApiKey, base_url: String) -> Self {
        let mut model_map = HashMap::new();
        model_map.insert("fast".to_string(), "gpt-4o-mini".to_string());
        model_map.insert("smart".to_string(), "gpt-4o".to_string());
        model_map.insert("code".to_string(), "gpt-4o".to_string());
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
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: u32,
}

#[async_trait]
impl ProviderClient for OpenAIClient {
    fn model_for(&self, alias: &str) -> Option<&str> {
        self.model_map.get(alias).map(|s| s.as_str()).or(Some(alias))
    }

    async fn generate(&self, model: &str, prompt: &str, params: &GenerateParams) -> LLMResult<GenerateOutcome> {
        let body = ChatRequest {
            model,
            messages: vec![ChatMessage { role: "user", content: prompt }],
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            top_p: params.top_p,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key.expose()))
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status_error(status, response.text().await.unwrap_or_default()));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| LLMError::Upstream(format!("malformed openai response: {err}")))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LLMError::Upstream("openai response had no choices".to_string()))?;
        Ok(GenerateOutcome {
            text,
            token_count: parsed.usage.map(|u| u.total_tokens),
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
        let client = OpenAIClient::new(ApiKey::new("sk-test"));
        assert_eq!(client.model_for("fast"), Some("gpt-4o-mini"));
        assert_eq!(client.model_for("gpt-4-turbo"), Some("gpt-4-turbo"));
    }
}
