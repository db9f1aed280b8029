//! The provider seam (§6 collaborator: "LLM provider client —
//! `generate(model, prompt, params) -> text | error` with bounded
//! latency"). Concrete provider clients are out of scope as *implementations*
//! (§1), but the Gateway needs something to hold a fallback chain of, so this
//! trait plus the three provider clients in `providers/` give the Gateway
//! something real to drive in tests and at runtime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors a provider call can fail with. The Gateway maps all of these to
/// either "retry within provider" or "fail over to the next provider"
/// (§4.C).
#[derive(Debug, Clone, thiserror::Error)]
pub enum LLMError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

pub type LLMResult<T> = std::result::Result<T, LLMError>;

/// Deterministic generation parameters, part of the cache key (§4.C).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

/// A single concrete provider's text-generation call. Implementors own their
/// own HTTP client, auth, and request/response shape; the Gateway only ever
/// sees `generate`/`model_for`.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Resolve a symbolic model alias (`fast|smart|code`) to this provider's
    /// concrete model identifier (§4.C "symbolic -> concrete model map").
    fn model_for(&self, alias: &str) -> Option<&str>;

    async fn generate(&self, model: &str, prompt: &str, params: &GenerateParams) -> LLMResult<GenerateOutcome>;
}

/// What a provider call returns on success: the text plus enough metadata
/// for the `llm.request` observability span (§4.C).
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub text: String,
    pub token_count: Option<u32>,
}
