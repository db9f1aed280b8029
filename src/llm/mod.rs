//! LLM Gateway (§4.C): a provider-agnostic text-generation facade in front
//! of an ordered fallback chain of concrete providers, each behind its own
//! token-bucket rate limiter, with a singleflight content-hash cache shared
//! across the whole gateway.
//!
//! Grounded on the teacher's `llm::router::LLMRouter` and
//! `llm::providers::*` modules (the reqwest-client-per-provider idiom,
//! header building, JSON request/response conversion), generalized from
//! "pick the right provider for this model and retry within it" to an
//! ordered cross-provider fallback chain with rate limiting and caching —
//! none of which the teacher's router had standing.

pub mod gateway;
pub mod providers;
pub mod traits;

pub use gateway::{CacheKey, LLMGateway, ProviderSlot};
pub use traits::{GenerateParams, LLMError, LLMResult, ProviderClient};

use std::fmt;

/// A provider's API key, wrapped so it can never leak into a log line or a
/// `{:?}`-formatted error by accident (§4.C observability contract: "secrets
/// are never logged"). `Display`/`Debug` both print a fixed redaction.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The only way to get the raw value back out — used solely to build an
    /// `Authorization` header immediately before a request is sent.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey(<redacted>)")
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted>")
    }
}

/// Stable identifier for a configured provider (§4.C "Providers form an
/// ordered list").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderKey {
    Local,
    HostedA,
    HostedB,
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKey::Local => write!(f, "local"),
            ProviderKey::HostedA => write!(f, "hosted-a"),
            ProviderKey::HostedB => write!(f, "hosted-b"),
        }
    }
}

/// Symbolic model name an agent asks for (§4.C "symbolic names
/// `fast|smart|code` -> provider-specific identifiers").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelAlias {
    Fast,
    Smart,
    Code,
}

impl ModelAlias {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "fast" => Some(ModelAlias::Fast),
            "smart" => Some(ModelAlias::Smart),
            "code" => Some(ModelAlias::Code),
            _ => None,
        }
    }
}

impl fmt::Display for ModelAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelAlias::Fast => write!(f, "fast"),
            ModelAlias::Smart => write!(f, "smart"),
            ModelAlias::Code => write!(f, "code"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_never_prints_the_secret() {
        let key = ApiKey::new("sk-super-secret-value");
        assert_eq!(format!("{:?}", key), "ApiKey(<redacted>)");
        assert_eq!(format!("{}", key), "<redacted>");
        assert_eq!(key.expose(), "sk-super-secret-value");
    }

    #[test]
    fn model_alias_roundtrips_known_names() {
        assert_eq!(ModelAlias::parse("fast"), Some(ModelAlias::Fast));
        assert_eq!(ModelAlias::parse("bogus"), None);
    }
}
