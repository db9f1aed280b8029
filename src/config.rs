//! Typed configuration snapshot assembled at startup (§6, §9 "Shared config
//! mutability").
//!
//! Grounded on the teacher's `bin/server.rs` pattern of reading individual
//! `env::var(...)` calls with sensible fallbacks, but collected into one
//! struct built once so a running job's `ConfigSnapshot` (§3) is taken from
//! an immutable value rather than re-reading the environment mid-run.

use std::env;

/// Process-wide configuration, read once at startup from the environment
/// (§6 "Environment recognized by the core").
#[derive(Debug, Clone)]
pub struct Config {
    /// Default per-job concurrency cap (`MAX_CONCURRENCY`).
    pub max_concurrency: usize,
    /// Filesystem root for the Checkpoint Store (`CHECKPOINT_DIR`).
    pub checkpoint_dir: String,
    /// Per-subscriber bounded buffer size for the Event Bus (`EVENT_BUFFER`).
    pub event_buffer: usize,
    /// Opaque reference to the vector-store collaborator (`VECTOR_ENDPOINT`).
    pub vector_endpoint: Option<String>,
    /// HTTP/WS bind address for the control surface.
    pub bind_addr: String,
    /// Provider API keys, never logged (wrapped by `llm::ApiKey`).
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub ollama_base_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            max_concurrency: env_parsed("MAX_CONCURRENCY", 3),
            checkpoint_dir: env::var("CHECKPOINT_DIR").unwrap_or_else(|_| "./checkpoints".to_string()),
            event_buffer: env_parsed("EVENT_BUFFER", 1024),
            vector_endpoint: env::var("VECTOR_ENDPOINT").ok(),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:4500".to_string()),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            anthropic_api_key: env::var("ANTHROPIC_API_KEY").ok(),
            ollama_base_url: env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| "http://localhost:11434".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            checkpoint_dir: "./checkpoints".to_string(),
            event_buffer: 1024,
            vector_endpoint: None,
            bind_addr: "0.0.0.0:4500".to_string(),
            openai_api_key: None,
            anthropic_api_key: None,
            ollama_base_url: "http://localhost:11434".to_string(),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.max_concurrency, 3);
        assert_eq!(cfg.event_buffer, 1024);
    }
}
