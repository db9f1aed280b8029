//! Local Ollama client (§6 collaborator). Grounded on the teacher's
//! `llm::providers::ollama::client` (no API key, bare `base_url` pointed at
//! a local daemon).

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::llm::traits::{GenerateOutcome, GenerateParams, LLMError, LLMResult, ProviderClient};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaClient {
    http: Client,
    base_url: String,
    model_map: HashMap<String, String>,
}

impl OllamaClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        let mut model_map = HashMap::new();
        model_map.insert("fast".to_string(), "llama3.2".to_string());
        model_map.insert("smart".to_string(), "llama3.1:70b".to_string());
        model_map.insert("code".to_string(), "codellama".to_string());
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("reqwest client builds"),
            base_url,
            model_map,
        }
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateRequestOptions,
}

#[derive(Serialize)]
struct GenerateRequestOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[async_trait]
impl ProviderClient for OllamaClient {
    fn model_for(&self, alias: &str) -> Option<&str> {
        self.model_map.get(alias).map(|s| s.as_str()).or(Some(alias))
    }

    async fn generate(&self, model: &str, prompt: &str, params: &GenerateParams) -> LLMResult<GenerateOutcome> {
        let body = GenerateRequest {
            model,
            prompt,
            stream: false,
            options: GenerateRequestOptions {
                temperature: params.temperature,
                top_p: params.top_p,
                num_predict: params.max_tokens,
            },
        };

        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status_error(status, response.text().await.unwrap_or_default()));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|err| LLMError::Upstream(format!("malformed ollama response: {err}")))?;
        Ok(GenerateOutcome {
            text: parsed.response,
            token_count: parsed.eval_count,
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
        StatusCode::BAD_REQUEST => LLMError::InvalidRequest(body),
        _ => LLMError::Upstream(format!("status {status}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_for_resolves_known_aliases() {
        let client = OllamaClient::new();
        assert_eq!(client.model_for("code"), Some("codellama"));
    }
}
